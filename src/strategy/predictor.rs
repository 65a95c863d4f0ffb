//! Multi-horizon directional predictor
//!
//! Combines four independent signal sources (pattern outcomes, momentum,
//! volume confirmation, session phase) into a forecast per horizon.
//! `Predictor::predict` is a pure function of its inputs.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::pattern::PatternResult;
use crate::domain::{MarketSnapshot, TradingPhase, VolumeCondition};

/// Forecast horizons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Horizon {
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
}

impl Horizon {
    pub const ALL: [Horizon; 4] = [Horizon::M5, Horizon::M15, Horizon::M30, Horizon::H1];

    pub fn index(&self) -> usize {
        match self {
            Horizon::M5 => 0,
            Horizon::M15 => 1,
            Horizon::M30 => 2,
            Horizon::H1 => 3,
        }
    }

    pub fn minutes(&self) -> i64 {
        match self {
            Horizon::M5 => 5,
            Horizon::M15 => 15,
            Horizon::M30 => 30,
            Horizon::H1 => 60,
        }
    }

    /// Share of the ATR expected to be covered within the horizon
    fn move_factor(&self) -> f64 {
        match self {
            Horizon::M5 => 0.3,
            Horizon::M15 => 0.5,
            Horizon::M30 => 0.7,
            Horizon::H1 => 1.0,
        }
    }

    /// Momentum continues at short horizons and mean-reverts at long ones
    fn momentum_factor(&self) -> f64 {
        match self {
            Horizon::M5 => 1.0,
            Horizon::M15 => 0.6,
            Horizon::M30 => -0.2,
            Horizon::H1 => -0.5,
        }
    }
}

impl fmt::Display for Horizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}m", self.minutes())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectionBias {
    StrongDown,
    Down,
    Neutral,
    Up,
    StrongUp,
}

impl DirectionBias {
    pub fn as_str(&self) -> &'static str {
        match self {
            DirectionBias::StrongDown => "strong_down",
            DirectionBias::Down => "down",
            DirectionBias::Neutral => "neutral",
            DirectionBias::Up => "up",
            DirectionBias::StrongUp => "strong_up",
        }
    }
}

impl fmt::Display for DirectionBias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    pub pattern_weight: f64,
    pub momentum_weight: f64,
    pub volume_weight: f64,
    pub time_weight: f64,
    /// Combined signal magnitude for a strong bias
    pub strong_threshold: f64,
    /// Combined signal magnitude for any bias
    pub bias_threshold: f64,
    /// Below this confidence the bias is forced to neutral
    pub min_confidence: f64,
    /// Percent move treated as full-strength momentum, in ATR units
    pub momentum_atr_scale: f64,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            pattern_weight: 0.35,
            momentum_weight: 0.30,
            volume_weight: 0.20,
            time_weight: 0.15,
            strong_threshold: 0.5,
            bias_threshold: 0.15,
            min_confidence: 0.3,
            momentum_atr_scale: 1.0,
        }
    }
}

/// Per-source signals in `[-1, 1]`
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SignalSources {
    pub pattern: f64,
    pub momentum: f64,
    pub volume: f64,
    pub time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizonForecast {
    pub horizon: Horizon,
    pub target_price: Decimal,
    pub bias: DirectionBias,
    pub confidence: f64,
    /// Weighted combined signal in `[-1, 1]`
    pub signal: f64,
    pub sources: SignalSources,
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub symbol: String,
    pub at: DateTime<Utc>,
    pub forecasts: Vec<HorizonForecast>,
}

impl Prediction {
    pub fn forecast(&self, horizon: Horizon) -> Option<&HorizonForecast> {
        self.forecasts.iter().find(|f| f.horizon == horizon)
    }

    /// Confidence-weighted lean across horizons, in `[-1, 1]`; only
    /// horizons with a non-neutral bias contribute
    pub fn dominant_signal(&self) -> f64 {
        let (num, den) = self
            .forecasts
            .iter()
            .filter(|f| f.bias != DirectionBias::Neutral)
            .fold((0.0, 0.0), |(n, d), f| (n + f.signal * f.confidence, d + f.confidence));
        if den <= 0.0 {
            0.0
        } else {
            (num / den).clamp(-1.0, 1.0)
        }
    }

    pub fn summary(&self) -> String {
        self.forecasts
            .iter()
            .map(|f| format!("{}:{}({:.0}%)", f.horizon, f.bias, f.confidence * 100.0))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone)]
pub struct Predictor {
    config: PredictorConfig,
}

impl Predictor {
    pub fn new(config: PredictorConfig) -> Self {
        Self { config }
    }

    pub fn predict(&self, snapshot: &MarketSnapshot, pattern: &PatternResult) -> Prediction {
        let forecasts = Horizon::ALL
            .iter()
            .map(|h| self.forecast(*h, snapshot, pattern))
            .collect();
        Prediction {
            symbol: snapshot.symbol.clone(),
            at: snapshot.at,
            forecasts,
        }
    }

    fn forecast(&self, horizon: Horizon, snapshot: &MarketSnapshot, pattern: &PatternResult) -> HorizonForecast {
        let cfg = &self.config;
        let expected_move_pct =
            snapshot.volatility.medium_pct * horizon.move_factor() * snapshot.regime.move_multiplier();

        let sources = SignalSources {
            pattern: pattern_signal(pattern, horizon, expected_move_pct),
            momentum: self.momentum_signal(snapshot) * horizon.momentum_factor(),
            volume: volume_signal(snapshot),
            time: time_signal(snapshot),
        };

        let weighted = [
            (cfg.pattern_weight, sources.pattern),
            (cfg.momentum_weight, sources.momentum),
            (cfg.volume_weight, sources.volume),
            (cfg.time_weight, sources.time),
        ];
        let total_weight: f64 = weighted.iter().map(|(w, _)| w.max(0.0)).sum();
        let sum: f64 = weighted.iter().map(|(w, s)| w.max(0.0) * s).sum();
        let abs_sum: f64 = weighted.iter().map(|(w, s)| w.max(0.0) * s.abs()).sum();

        let signal = if total_weight > 0.0 {
            (sum / total_weight).clamp(-1.0, 1.0)
        } else {
            0.0
        };
        // Agreement: 1 when every active source points the same way, 0 when they cancel.
        let confidence = if abs_sum > 1e-9 {
            (sum.abs() / abs_sum).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let bias = if confidence < cfg.min_confidence {
            DirectionBias::Neutral
        } else if signal >= cfg.strong_threshold {
            DirectionBias::StrongUp
        } else if signal >= cfg.bias_threshold {
            DirectionBias::Up
        } else if signal <= -cfg.strong_threshold {
            DirectionBias::StrongDown
        } else if signal <= -cfg.bias_threshold {
            DirectionBias::Down
        } else {
            DirectionBias::Neutral
        };

        let move_pct = if bias == DirectionBias::Neutral {
            0.0
        } else {
            signal * expected_move_pct
        };
        let factor = Decimal::from_f64(1.0 + move_pct / 100.0).unwrap_or(Decimal::ONE);
        let target_price = (snapshot.price * factor).round_dp(4);

        HorizonForecast {
            horizon,
            target_price,
            bias,
            confidence,
            signal,
            sources,
            rationale: format!(
                "pattern {:+.2}, momentum {:+.2}, volume {:+.2}, time {:+.2} -> {:+.2} ({:.0}% agreement)",
                sources.pattern,
                sources.momentum,
                sources.volume,
                sources.time,
                signal,
                confidence * 100.0
            ),
        }
    }

    fn momentum_signal(&self, snapshot: &MarketSnapshot) -> f64 {
        let scale = (snapshot.volatility.short_pct * self.config.momentum_atr_scale).max(0.05);
        (snapshot.change_short_pct / scale).clamp(-1.0, 1.0)
    }
}

fn pattern_signal(pattern: &PatternResult, horizon: Horizon, expected_move_pct: f64) -> f64 {
    match pattern.summary() {
        None => 0.0,
        Some(summary) => {
            let expected = summary.expected_moves_pct[horizon.index()];
            let scale = expected_move_pct.max(0.05);
            let magnitude = (expected / scale).clamp(-1.0, 1.0);
            // Blend realized path with class lean, discounted by match confidence.
            ((0.5 * magnitude + 0.5 * summary.bias) * summary.confidence).clamp(-1.0, 1.0)
        }
    }
}

/// Volume confirms (or fails to confirm) the direction of the recent move
fn volume_signal(snapshot: &MarketSnapshot) -> f64 {
    let direction = if snapshot.change_short_pct.abs() < 0.05 {
        0.0
    } else {
        snapshot.change_short_pct.signum()
    };
    let strength = match snapshot.volume_condition {
        VolumeCondition::VeryLow => 0.0,
        VolumeCondition::Low => 0.2,
        VolumeCondition::Normal => 0.4,
        VolumeCondition::High => 0.7,
        VolumeCondition::Extreme => 1.0,
    };
    direction * strength
}

/// Session tendency: trend persistence (positive) or mean reversion (negative)
fn time_signal(snapshot: &MarketSnapshot) -> f64 {
    let direction = if snapshot.change_short_pct.abs() < 0.05 {
        0.0
    } else {
        snapshot.change_short_pct.signum()
    };
    let persistence = match snapshot.phase {
        TradingPhase::PreMarket | TradingPhase::AfterHours => 0.0,
        TradingPhase::Open => 0.6,
        TradingPhase::Morning => 0.5,
        TradingPhase::Midday => -0.3,
        TradingPhase::Afternoon => 0.3,
        TradingPhase::PowerHour => 0.5,
        TradingPhase::Close => -0.2,
    };
    direction * persistence
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Fingerprint, VolatilityMeasures, VolatilityRegime};
    use crate::strategy::pattern::PatternSummary;
    use rust_decimal_macros::dec;

    fn snapshot(change_short_pct: f64, volume: VolumeCondition, phase: TradingPhase) -> MarketSnapshot {
        MarketSnapshot {
            symbol: "SPY".into(),
            at: Utc::now(),
            price: dec!(100),
            volatility: VolatilityMeasures {
                short_pct: 1.0,
                medium_pct: 1.0,
                long_pct: 1.0,
            },
            atr: dec!(1),
            regime: VolatilityRegime::Medium,
            volume_ratio: 1.0,
            volume_condition: volume,
            phase,
            change_short_pct,
            change_medium_pct: change_short_pct,
            fingerprint: Fingerprint([0.5; 6]),
            samples: 60,
            data_sufficient: true,
        }
    }

    fn bullish_pattern() -> PatternResult {
        PatternResult::Matched(PatternSummary {
            matches: 10,
            avg_similarity: 0.9,
            outcomes: vec![],
            expected_moves_pct: [0.5, 0.8, 1.0, 1.2],
            bias: 0.8,
            confidence: 0.9,
        })
    }

    #[test]
    fn test_full_agreement_gives_high_confidence() {
        let predictor = Predictor::new(PredictorConfig::default());
        let snap = snapshot(1.0, VolumeCondition::High, TradingPhase::Morning);
        let prediction = predictor.predict(&snap, &bullish_pattern());

        let short = prediction.forecast(Horizon::M5).unwrap();
        assert!(short.confidence > 0.99);
        assert!(matches!(short.bias, DirectionBias::Up | DirectionBias::StrongUp));
        assert!(short.target_price > dec!(100));
    }

    #[test]
    fn test_conflict_forces_neutral() {
        let predictor = Predictor::new(PredictorConfig {
            pattern_weight: 0.5,
            momentum_weight: 0.5,
            volume_weight: 0.0,
            time_weight: 0.0,
            ..Default::default()
        });
        // Bearish pattern, bullish momentum of equal size
        let pattern = PatternResult::Matched(PatternSummary {
            matches: 10,
            avg_similarity: 0.9,
            outcomes: vec![],
            expected_moves_pct: [-0.3, -0.3, -0.3, -0.3],
            bias: -1.0,
            confidence: 1.0,
        });
        let snap = snapshot(1.0, VolumeCondition::Normal, TradingPhase::PreMarket);
        let short = predictor.predict(&snap, &pattern).forecasts[0].clone();
        assert!(short.confidence < 0.3, "confidence {}", short.confidence);
        assert_eq!(short.bias, DirectionBias::Neutral);
        assert_eq!(short.target_price, dec!(100));
    }

    #[test]
    fn test_no_inputs_is_neutral() {
        let predictor = Predictor::new(PredictorConfig::default());
        let snap = snapshot(0.0, VolumeCondition::Normal, TradingPhase::PreMarket);
        let prediction = predictor.predict(&snap, &PatternResult::no_pattern("empty"));
        assert!(prediction
            .forecasts
            .iter()
            .all(|f| f.bias == DirectionBias::Neutral && f.confidence == 0.0));
        assert_eq!(prediction.dominant_signal(), 0.0);
    }

    #[test]
    fn test_predict_is_deterministic() {
        let predictor = Predictor::new(PredictorConfig::default());
        let snap = snapshot(-0.6, VolumeCondition::Extreme, TradingPhase::Open);
        let a = predictor.predict(&snap, &bullish_pattern());
        let b = predictor.predict(&snap, &bullish_pattern());
        assert_eq!(a, b);
    }
}
