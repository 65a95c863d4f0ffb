use serde::{Deserialize, Serialize};

use crate::domain::{Candle, VolumeCondition};

/// Volume-ratio thresholds (current volume / moving average)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeBands {
    pub low: f64,
    pub normal: f64,
    pub high: f64,
    pub extreme: f64,
}

impl Default for VolumeBands {
    fn default() -> Self {
        Self {
            low: 0.5,
            normal: 0.8,
            high: 1.2,
            extreme: 2.0,
        }
    }
}

impl VolumeBands {
    pub fn classify(&self, ratio: f64) -> VolumeCondition {
        if ratio >= self.extreme {
            VolumeCondition::Extreme
        } else if ratio >= self.high {
            VolumeCondition::High
        } else if ratio >= self.normal {
            VolumeCondition::Normal
        } else if ratio >= self.low {
            VolumeCondition::Low
        } else {
            VolumeCondition::VeryLow
        }
    }

    pub fn is_ordered(&self) -> bool {
        0.0 < self.low && self.low < self.normal && self.normal < self.high && self.high < self.extreme
    }
}

/// Mean volume of the `period` candles preceding the latest one
pub fn volume_ma(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }
    let end = candles.len() - 1;
    let window = &candles[end - period..end];
    let sum: u64 = window.iter().map(|c| c.volume).sum();
    Some(sum as f64 / period as f64)
}

/// Latest candle volume over its moving average; `1.0` when unknown
pub fn volume_ratio(candles: &[Candle], period: usize) -> Option<f64> {
    let ma = volume_ma(candles, period)?;
    let last = candles.last()?.volume as f64;
    if ma <= 0.0 {
        return Some(1.0);
    }
    Some(last / ma)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn candles(volumes: &[u64]) -> Vec<Candle> {
        volumes
            .iter()
            .map(|v| Candle {
                symbol: "SPY".into(),
                open: dec!(10),
                high: dec!(10),
                low: dec!(10),
                close: dec!(10),
                volume: *v,
                start: Utc::now(),
            })
            .collect()
    }

    #[test]
    fn test_ratio_excludes_current_bar() {
        let c = candles(&[100, 100, 100, 300]);
        assert_eq!(volume_ratio(&c, 3), Some(3.0));
        assert!(volume_ratio(&c, 4).is_none());
    }

    #[test]
    fn test_bands() {
        let bands = VolumeBands::default();
        assert_eq!(bands.classify(0.3), VolumeCondition::VeryLow);
        assert_eq!(bands.classify(0.6), VolumeCondition::Low);
        assert_eq!(bands.classify(1.0), VolumeCondition::Normal);
        assert_eq!(bands.classify(1.5), VolumeCondition::High);
        assert_eq!(bands.classify(2.5), VolumeCondition::Extreme);
    }
}
