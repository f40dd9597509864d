mod common;

use chrono::{DateTime, Duration, TimeZone, Utc};
use common::{MemoryStore, ScriptedFeed};
use kifu_rust_core::models::{Bubble, Horizon, PendingAlertDecision};
use reconciler_rust::outcome_scheduler::OutcomeScheduler;
use reconciler_rust::stats::ReconcilerStats;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use uuid::Uuid;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn bubble(symbol: &str, candle_time: DateTime<Utc>, price: Decimal) -> Bubble {
    Bubble {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        symbol: symbol.to_string(),
        timeframe: "1h".to_string(),
        candle_time,
        price,
        bubble_type: "manual".to_string(),
        memo: None,
        tags: Vec::new(),
        created_at: candle_time,
    }
}

fn scheduler(store: &Arc<MemoryStore>, feed: &Arc<ScriptedFeed>) -> OutcomeScheduler {
    OutcomeScheduler::new(
        store.clone(),
        store.clone(),
        feed.clone(),
        vec![Horizon::new("1h", Duration::hours(1))],
        100,
        100,
        Arc::new(ReconcilerStats::new()),
    )
}

fn add_bubble(store: &MemoryStore, bubble: Bubble) -> Uuid {
    let id = bubble.id;
    store.bubbles.lock().push(bubble);
    id
}

#[tokio::test]
async fn test_forward_return_for_journal_entries() {
    let store = Arc::new(MemoryStore::default());
    let feed = Arc::new(ScriptedFeed::default());
    let up = add_bubble(&store, bubble("BTCUSDT", t0(), dec!(100)));
    let down = add_bubble(&store, bubble("ETHUSDT", t0(), dec!(100)));
    feed.add_close("BTCUSDT", t0() + Duration::hours(1), dec!(105));
    feed.add_close("ETHUSDT", t0() + Duration::hours(1), dec!(97.5));

    let report = scheduler(&store, &feed).run_cycle(t0() + Duration::hours(2)).await;
    assert_eq!(report.outcomes_created, 2);

    let outcomes = store.outcomes.lock();
    let of = |id: Uuid| outcomes.iter().find(|o| o.bubble_id == id).unwrap().clone();
    assert_eq!(of(up).pnl_percent, dec!(5));
    assert_eq!(of(up).outcome_price, dec!(105));
    assert_eq!(of(down).pnl_percent, dec!(-2.5));
    assert_eq!(of(down).period, "1h");
}

#[tokio::test]
async fn test_repeated_cycles_write_one_outcome() {
    let store = Arc::new(MemoryStore::default());
    let feed = Arc::new(ScriptedFeed::default());
    add_bubble(&store, bubble("BTCUSDT", t0(), dec!(100)));
    feed.add_close("BTCUSDT", t0() + Duration::hours(1), dec!(101));

    let a = scheduler(&store, &feed);
    let b = scheduler(&store, &feed);
    let now = t0() + Duration::hours(2);
    let (first, second) = tokio::join!(a.run_cycle(now), b.run_cycle(now));
    assert_eq!(first.outcomes_created + second.outcomes_created, 1);

    let third = a.run_cycle(now + Duration::minutes(1)).await;
    assert_eq!(third.outcomes_created, 0);
    assert_eq!(store.outcomes.lock().len(), 1);
}

#[tokio::test]
async fn test_horizon_not_elapsed() {
    let store = Arc::new(MemoryStore::default());
    let feed = Arc::new(ScriptedFeed::default());
    add_bubble(&store, bubble("BTCUSDT", t0(), dec!(100)));
    feed.add_close("BTCUSDT", t0() + Duration::hours(1), dec!(101));

    let report = scheduler(&store, &feed).run_cycle(t0() + Duration::minutes(59)).await;
    assert_eq!(report, Default::default());
    assert!(store.outcomes.lock().is_empty());
}

#[tokio::test]
async fn test_missing_price_is_retried_later() {
    let store = Arc::new(MemoryStore::default());
    let feed = Arc::new(ScriptedFeed::default());
    add_bubble(&store, bubble("BTCUSDT", t0(), dec!(100)));
    let outcomes = scheduler(&store, &feed);

    let early = outcomes.run_cycle(t0() + Duration::hours(1)).await;
    assert_eq!(early.missing_price, 1);
    assert_eq!(early.errors, 0);
    assert!(store.outcomes.lock().is_empty());

    feed.add_close("BTCUSDT", t0() + Duration::hours(1), dec!(110));
    let later = outcomes.run_cycle(t0() + Duration::hours(1) + Duration::minutes(5)).await;
    assert_eq!(later.outcomes_created, 1);
    assert_eq!(store.outcomes.lock()[0].pnl_percent, dec!(10));
}

#[tokio::test]
async fn test_falls_back_to_earlier_close() {
    let store = Arc::new(MemoryStore::default());
    let feed = Arc::new(ScriptedFeed::default());
    add_bubble(&store, bubble("BTCUSDT", t0(), dec!(200)));
    let target = t0() + Duration::hours(1);
    feed.add_close("BTCUSDT", target - Duration::minutes(7), dec!(150));
    feed.add_close("BTCUSDT", target - Duration::minutes(3), dec!(201));

    let report = scheduler(&store, &feed).run_cycle(t0() + Duration::hours(3)).await;
    assert_eq!(report.outcomes_created, 1);

    let outcome = store.outcomes.lock()[0].clone();
    assert_eq!(outcome.outcome_price, dec!(201));
    assert_eq!(outcome.pnl_percent, dec!(0.5));
}

#[tokio::test]
async fn test_target_minute_is_floored() {
    let store = Arc::new(MemoryStore::default());
    let feed = Arc::new(ScriptedFeed::default());
    let candle_time = t0() + Duration::seconds(42);
    add_bubble(&store, bubble("BTCUSDT", candle_time, dec!(100)));
    feed.add_close("BTCUSDT", t0() + Duration::hours(1), dec!(99));

    scheduler(&store, &feed).run_cycle(t0() + Duration::hours(2)).await;
    assert_eq!(store.outcomes.lock()[0].pnl_percent, dec!(-1));
}

#[tokio::test]
async fn test_decision_outcomes() {
    let store = Arc::new(MemoryStore::default());
    let feed = Arc::new(ScriptedFeed::default());
    let alert_id = Uuid::new_v4();
    store.decisions.lock().push(PendingAlertDecision {
        alert_id,
        decision_id: Uuid::new_v4(),
        symbol: "ETHUSDT".to_string(),
        trigger_price: dec!(200),
        decision_time: t0(),
    });
    feed.add_close("ETHUSDT", t0() + Duration::hours(1), dec!(190));

    let outcomes = scheduler(&store, &feed);
    let report = outcomes.run_cycle(t0() + Duration::hours(2)).await;
    assert_eq!(report.decision_outcomes_created, 1);
    assert_eq!(report.outcomes_created, 0);

    let again = outcomes.run_cycle(t0() + Duration::hours(2)).await;
    assert_eq!(again.decision_outcomes_created, 0);

    let stored = store.alert_outcomes.lock();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].alert_id, alert_id);
    assert_eq!(stored[0].reference_price, dec!(200));
    assert_eq!(stored[0].pnl_percent, dec!(-5));
}
