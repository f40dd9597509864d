//! Direction scoring for AI opinions
//!
//! Free-text opinions (English or Korean) are reduced to BUY, SELL or HOLD by
//! counting vocabulary matches. Realized outcomes are reduced to UP, DOWN or
//! NEUTRAL around a dead zone.

use crate::models::Direction;
use regex::Regex;
use rust_decimal::Decimal;

const BUY_PATTERNS: &[&str] = &[
    r"(?i)\b(buy|long|bullish|uptrend|upward|rally|pump|up)\b",
    r"(?i)(go\s+long|enter\s+long|long\s+position|buying\s+opportunity)",
    r"(?i)(price.*increase|price.*rise|expect.*up|likely.*up)",
    r"(?i)(positive\s+outlook|optimistic|favorable)",
    r"(?i)(매수|롱|상승|불리시|긍정적|올라|오를|상방|강세)",
    r"(?i)(진입.*롱|롱.*진입|매수.*추천|추천.*매수)",
    r"(?i)(상승.*예상|상승.*전망|오를.*것)",
];

const SELL_PATTERNS: &[&str] = &[
    r"(?i)\b(sell|short|bearish|downtrend|downward|dump|crash|down)\b",
    r"(?i)(go\s+short|enter\s+short|short\s+position|selling\s+opportunity)",
    r"(?i)(price.*decrease|price.*drop|price.*fall|expect.*down|likely.*down)",
    r"(?i)(negative\s+outlook|pessimistic|unfavorable)",
    r"(?i)(매도|숏|하락|베어리시|부정적|내려|내릴|하방|약세)",
    r"(?i)(진입.*숏|숏.*진입|매도.*추천|추천.*매도)",
    r"(?i)(하락.*예상|하락.*전망|내릴.*것)",
];

const HOLD_PATTERNS: &[&str] = &[
    r"(?i)\b(hold|wait|neutral|sideways|consolidation|range)\b",
    r"(?i)(no\s+clear\s+direction|unclear|uncertain|wait\s+and\s+see)",
    r"(?i)(difficult\s+to\s+predict|hard\s+to\s+say|mixed\s+signals)",
    r"(?i)(관망|횡보|중립|대기|지켜보|기다려)",
    r"(?i)(명확하지.*않|불확실|판단.*어려|애매)",
    r"(?i)(방향.*불분명|추세.*없|박스권)",
];

/// Match counts per vocabulary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectionScores {
    pub buy: usize,
    pub sell: usize,
    pub hold: usize,
}

impl DirectionScores {
    /// Ties and silence resolve to HOLD; BUY or SELL must be strictly ahead.
    pub fn decide(&self) -> Direction {
        let DirectionScores { buy, sell, hold } = *self;
        if buy == 0 && sell == 0 && hold == 0 {
            return Direction::Hold;
        }
        if buy == sell && buy >= hold {
            return Direction::Hold;
        }
        if buy > sell && buy > hold {
            return Direction::Buy;
        }
        if sell > buy && sell > hold {
            return Direction::Sell;
        }
        Direction::Hold
    }
}

pub struct DirectionExtractor {
    buy: Vec<Regex>,
    sell: Vec<Regex>,
    hold: Vec<Regex>,
}

impl DirectionExtractor {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            buy: compile(BUY_PATTERNS)?,
            sell: compile(SELL_PATTERNS)?,
            hold: compile(HOLD_PATTERNS)?,
        })
    }

    pub fn score(&self, text: &str) -> DirectionScores {
        let text = text.to_lowercase();
        DirectionScores {
            buy: count_matches(&self.buy, &text),
            sell: count_matches(&self.sell, &text),
            hold: count_matches(&self.hold, &text),
        }
    }

    /// Predicted direction of an opinion text
    pub fn extract(&self, text: &str) -> Direction {
        self.score(text).decide()
    }
}

fn compile(patterns: &[&str]) -> Result<Vec<Regex>, regex::Error> {
    patterns.iter().map(|p| Regex::new(p)).collect()
}

fn count_matches(patterns: &[Regex], text: &str) -> usize {
    patterns.iter().map(|re| re.find_iter(text).count()).sum()
}

/// Realized direction of a PnL percentage. Moves inside `±dead_zone` are
/// NEUTRAL.
pub fn actual_direction(pnl_percent: Decimal, dead_zone: Decimal) -> Direction {
    let dead_zone = dead_zone.abs();
    if pnl_percent > dead_zone {
        Direction::Up
    } else if pnl_percent < -dead_zone {
        Direction::Down
    } else {
        Direction::Neutral
    }
}
