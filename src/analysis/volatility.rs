//! True-range volatility and regime classification

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{Candle, VolatilityRegime};

/// ATR-percent thresholds separating the regimes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeBands {
    /// Below this ATR % the regime is low
    pub medium_pct: f64,
    /// Below this ATR % the regime is medium
    pub high_pct: f64,
    /// At or above this ATR % the regime is extreme
    pub extreme_pct: f64,
}

impl Default for RegimeBands {
    fn default() -> Self {
        Self {
            medium_pct: 0.5,
            high_pct: 1.5,
            extreme_pct: 3.0,
        }
    }
}

impl RegimeBands {
    pub fn classify(&self, atr_pct: f64) -> VolatilityRegime {
        if atr_pct >= self.extreme_pct {
            VolatilityRegime::Extreme
        } else if atr_pct >= self.high_pct {
            VolatilityRegime::High
        } else if atr_pct >= self.medium_pct {
            VolatilityRegime::Medium
        } else {
            VolatilityRegime::Low
        }
    }

    pub fn is_ordered(&self) -> bool {
        0.0 < self.medium_pct && self.medium_pct < self.high_pct && self.high_pct < self.extreme_pct
    }
}

/// True ranges of consecutive candles, oldest first
pub fn true_ranges(candles: &[Candle]) -> Vec<Decimal> {
    let mut prev_close = None;
    candles
        .iter()
        .map(|c| {
            let tr = c.true_range(prev_close);
            prev_close = Some(c.close);
            tr
        })
        .collect()
}

/// Average true range over the last `period` candles.
///
/// Returns `None` until `period` candles are available.
pub fn atr(candles: &[Candle], period: usize) -> Option<Decimal> {
    if period == 0 || candles.len() < period {
        return None;
    }
    let ranges = true_ranges(candles);
    let window = &ranges[ranges.len() - period..];
    let sum: Decimal = window.iter().copied().sum();
    Some(sum / Decimal::from(period))
}

/// ATR expressed as percent of `price`
pub fn atr_pct(atr: Decimal, price: Decimal) -> f64 {
    if price.is_zero() {
        return 0.0;
    }
    (atr / price * Decimal::ONE_HUNDRED).to_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn candle(high: Decimal, low: Decimal, close: Decimal) -> Candle {
        Candle {
            symbol: "SPY".into(),
            open: close,
            high,
            low,
            close,
            volume: 1_000,
            start: Utc::now(),
        }
    }

    #[test]
    fn test_atr_needs_full_window() {
        let candles = vec![candle(dec!(10.2), dec!(10.0), dec!(10.1))];
        assert!(atr(&candles, 2).is_none());
        assert_eq!(atr(&candles, 1), Some(dec!(0.2)));
    }

    #[test]
    fn test_atr_includes_gaps() {
        let candles = vec![
            candle(dec!(10.2), dec!(10.0), dec!(10.0)),
            candle(dec!(10.5), dec!(10.3), dec!(10.4)),
        ];
        // second TR = max(0.2, |10.5-10.0|, |10.3-10.0|) = 0.5
        assert_eq!(atr(&candles, 2), Some(dec!(0.35)));
    }

    #[test]
    fn test_regime_bands() {
        let bands = RegimeBands::default();
        assert_eq!(bands.classify(0.2), VolatilityRegime::Low);
        assert_eq!(bands.classify(0.9), VolatilityRegime::Medium);
        assert_eq!(bands.classify(2.0), VolatilityRegime::High);
        assert_eq!(bands.classify(4.0), VolatilityRegime::Extreme);
        assert!(bands.is_ordered());
    }
}
