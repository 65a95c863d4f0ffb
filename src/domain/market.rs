use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Price/volume update pushed by the venue feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub price: Decimal,
    pub volume: u64,
    pub at: DateTime<Utc>,
}

/// Candle resolution for historical retrieval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
    OneHour,
    OneDay,
}

impl Resolution {
    pub fn as_secs(&self) -> i64 {
        match self {
            Resolution::OneMinute => 60,
            Resolution::FiveMinutes => 300,
            Resolution::FifteenMinutes => 900,
            Resolution::OneHour => 3_600,
            Resolution::OneDay => 86_400,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::OneMinute => "1m",
            Resolution::FiveMinutes => "5m",
            Resolution::FifteenMinutes => "15m",
            Resolution::OneHour => "1h",
            Resolution::OneDay => "1d",
        }
    }
}

/// OHLCV bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
    pub start: DateTime<Utc>,
}

impl Candle {
    pub fn range(&self) -> Decimal {
        self.high - self.low
    }

    /// True range against the previous close
    pub fn true_range(&self, prev_close: Option<Decimal>) -> Decimal {
        let range = self.range();
        match prev_close {
            Some(pc) => range
                .max((self.high - pc).abs())
                .max((self.low - pc).abs()),
            None => range,
        }
    }
}

/// Discrete volatility classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolatilityRegime {
    Low,
    Medium,
    High,
    Extreme,
}

impl VolatilityRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolatilityRegime::Low => "low",
            VolatilityRegime::Medium => "medium",
            VolatilityRegime::High => "high",
            VolatilityRegime::Extreme => "extreme",
        }
    }

    /// Scale applied to expected moves in this regime
    pub fn move_multiplier(&self) -> f64 {
        match self {
            VolatilityRegime::Low => 0.6,
            VolatilityRegime::Medium => 1.0,
            VolatilityRegime::High => 1.5,
            VolatilityRegime::Extreme => 2.0,
        }
    }
}

impl fmt::Display for VolatilityRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Volume relative to its moving average
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeCondition {
    VeryLow,
    Low,
    Normal,
    High,
    Extreme,
}

impl VolumeCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeCondition::VeryLow => "very_low",
            VolumeCondition::Low => "low",
            VolumeCondition::Normal => "normal",
            VolumeCondition::High => "high",
            VolumeCondition::Extreme => "extreme",
        }
    }
}

impl fmt::Display for VolumeCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Time-of-day trading phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingPhase {
    PreMarket,
    Open,
    Morning,
    Midday,
    Afternoon,
    PowerHour,
    Close,
    AfterHours,
}

impl TradingPhase {
    pub const ALL: [TradingPhase; 8] = [
        TradingPhase::PreMarket,
        TradingPhase::Open,
        TradingPhase::Morning,
        TradingPhase::Midday,
        TradingPhase::Afternoon,
        TradingPhase::PowerHour,
        TradingPhase::Close,
        TradingPhase::AfterHours,
    ];

    pub fn ordinal(&self) -> usize {
        *self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradingPhase::PreMarket => "pre_market",
            TradingPhase::Open => "open",
            TradingPhase::Morning => "morning",
            TradingPhase::Midday => "midday",
            TradingPhase::Afternoon => "afternoon",
            TradingPhase::PowerHour => "power_hour",
            TradingPhase::Close => "close",
            TradingPhase::AfterHours => "after_hours",
        }
    }

    pub fn is_regular_session(&self) -> bool {
        !matches!(self, TradingPhase::PreMarket | TradingPhase::AfterHours)
    }
}

impl fmt::Display for TradingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub const FINGERPRINT_LEN: usize = 6;

/// Compact feature vector describing the current situation.
///
/// Feature order: short ATR %, short/long ATR ratio, volume ratio, phase
/// ordinal, short-term change %, medium-term change %. Every feature is
/// scaled into roughly `[0, 1]` so weighted distances stay comparable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint(pub [f64; FINGERPRINT_LEN]);

impl Fingerprint {
    pub fn features(&self) -> &[f64; FINGERPRINT_LEN] {
        &self.0
    }
}

/// Volatility readings as percent of price
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct VolatilityMeasures {
    pub short_pct: f64,
    pub medium_pct: f64,
    pub long_pct: f64,
}

/// Immutable per-symbol view of the market for one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub at: DateTime<Utc>,
    pub price: Decimal,
    pub volatility: VolatilityMeasures,
    /// Medium-window ATR in price units
    pub atr: Decimal,
    pub regime: VolatilityRegime,
    pub volume_ratio: f64,
    pub volume_condition: VolumeCondition,
    pub phase: TradingPhase,
    pub change_short_pct: f64,
    pub change_medium_pct: f64,
    pub fingerprint: Fingerprint,
    /// Candles backing the indicators
    pub samples: usize,
    /// False when the windows were not yet filled; affected readings are neutral
    pub data_sufficient: bool,
}

impl MarketSnapshot {
    pub fn price_f64(&self) -> f64 {
        self.price.to_f64().unwrap_or(0.0)
    }

    /// Signed distance from current price to `price`, in percent of current price
    pub fn distance_pct(&self, price: Decimal) -> f64 {
        if self.price.is_zero() {
            return 0.0;
        }
        ((price - self.price) / self.price * Decimal::ONE_HUNDRED)
            .to_f64()
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_true_range_uses_gap() {
        let candle = Candle {
            symbol: "SPY".into(),
            open: dec!(10.2),
            high: dec!(10.4),
            low: dec!(10.1),
            close: dec!(10.3),
            volume: 1_000,
            start: Utc::now(),
        };
        assert_eq!(candle.true_range(None), dec!(0.3));
        assert_eq!(candle.true_range(Some(dec!(9.9))), dec!(0.5));
    }

    #[test]
    fn test_phase_ordering() {
        assert!(TradingPhase::PreMarket < TradingPhase::PowerHour);
        assert_eq!(TradingPhase::AfterHours.ordinal(), 7);
        assert!(!TradingPhase::AfterHours.is_regular_session());
    }
}
