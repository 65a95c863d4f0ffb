//! Level Scorer
//!
//! Eight explicit sub-scores per level, each in `[0, 1]`, combined by a
//! named weight table into a 0-100 aggregate. The scorer never touches
//! the pool; it reads cloned levels and emits `ScoreRecord`s.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::pattern::PatternResult;
use super::predictor::Prediction;
use crate::domain::{
    Level, MarketSnapshot, ScoreRecord, Side, SubScores, TradingPhase, VolatilityRegime,
    VolumeCondition,
};

/// Named aggregate weights
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub price_proximity: f64,
    pub volatility_fit: f64,
    pub profit_potential: f64,
    pub risk_reward: f64,
    pub pattern_match: f64,
    pub time_suitability: f64,
    pub volume_context: f64,
    pub trend_alignment: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            price_proximity: 1.0,
            volatility_fit: 0.8,
            profit_potential: 0.9,
            risk_reward: 0.7,
            pattern_match: 0.6,
            time_suitability: 0.5,
            volume_context: 0.4,
            trend_alignment: 0.7,
        }
    }
}

impl ScoreWeights {
    pub fn total(&self) -> f64 {
        self.as_array().iter().sum()
    }

    fn as_array(&self) -> [f64; 8] {
        [
            self.price_proximity,
            self.volatility_fit,
            self.profit_potential,
            self.risk_reward,
            self.pattern_match,
            self.time_suitability,
            self.volume_context,
            self.trend_alignment,
        ]
    }

    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.as_array().iter().any(|w| !w.is_finite() || *w < 0.0) {
            problems.push("scoring weights must be finite and non-negative".to_string());
        }
        if self.total() <= 0.0 {
            problems.push("scoring weights must not all be zero".to_string());
        }
        problems
    }

    /// Weighted aggregate on a 0-100 scale
    pub fn aggregate(&self, s: &SubScores) -> f64 {
        let total = self.total();
        if total <= 0.0 {
            return 0.0;
        }
        let sum = self.price_proximity * s.price_proximity
            + self.volatility_fit * s.volatility_fit
            + self.profit_potential * s.profit_potential
            + self.risk_reward * s.risk_reward
            + self.pattern_match * s.pattern_match
            + self.time_suitability * s.time_suitability
            + self.volume_context * s.volume_context
            + self.trend_alignment * s.trend_alignment;
        (sum / total * 100.0).clamp(0.0, 100.0)
    }
}

/// Favorability of trading in each session phase
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseScores {
    pub pre_market: f64,
    pub open: f64,
    pub morning: f64,
    pub midday: f64,
    pub afternoon: f64,
    pub power_hour: f64,
    pub close: f64,
    pub after_hours: f64,
}

impl Default for PhaseScores {
    fn default() -> Self {
        Self {
            pre_market: 0.2,
            open: 0.4,
            morning: 0.8,
            midday: 0.6,
            afternoon: 0.7,
            power_hour: 0.5,
            close: 0.3,
            after_hours: 0.1,
        }
    }
}

impl PhaseScores {
    pub fn get(&self, phase: TradingPhase) -> f64 {
        match phase {
            TradingPhase::PreMarket => self.pre_market,
            TradingPhase::Open => self.open,
            TradingPhase::Morning => self.morning,
            TradingPhase::Midday => self.midday,
            TradingPhase::Afternoon => self.afternoon,
            TradingPhase::PowerHour => self.power_hour,
            TradingPhase::Close => self.close,
            TradingPhase::AfterHours => self.after_hours,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: ScoreWeights,
    pub phases: PhaseScores,
    /// Distances under this percent are treated as already at the market
    pub too_close_pct: f64,
    /// Ideal distance from price, in ATR units
    pub volfit_target_ratio: f64,
    /// Reference net gain (percent) that earns a full profit score
    pub reference_gain_pct: f64,
    /// Reward/risk ratio that earns a full score
    pub risk_reward_cap: f64,
    pub commission_per_share: Decimal,
    pub min_commission: Decimal,
    /// Pattern summaries below this confidence score neutral
    pub min_pattern_confidence: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            phases: PhaseScores::default(),
            too_close_pct: 0.05,
            volfit_target_ratio: 0.5,
            reference_gain_pct: 1.0,
            risk_reward_cap: 3.0,
            commission_per_share: Decimal::new(5, 3),
            min_commission: Decimal::ONE,
            min_pattern_confidence: 0.3,
        }
    }
}

/// Tolerance around the ideal ATR distance, wider in faster markets
fn volfit_width(regime: VolatilityRegime) -> f64 {
    match regime {
        VolatilityRegime::Low => 0.3,
        VolatilityRegime::Medium => 0.5,
        VolatilityRegime::High => 0.8,
        VolatilityRegime::Extreme => 1.0,
    }
}

const NEUTRAL: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct LevelScorer {
    config: ScoringConfig,
}

impl LevelScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Score every selectable level of the snapshot's symbol, best first
    pub fn score(
        &self,
        levels: &[Level],
        snapshot: &MarketSnapshot,
        pattern: &PatternResult,
        prediction: &Prediction,
        now: DateTime<Utc>,
    ) -> Vec<ScoreRecord> {
        let mut records: Vec<ScoreRecord> = levels
            .iter()
            .filter(|l| l.symbol == snapshot.symbol && l.status.is_selectable())
            .map(|l| self.score_level(l, snapshot, pattern, prediction, now))
            .collect();
        records.sort_by(|a, b| {
            b.aggregate
                .total_cmp(&a.aggregate)
                .then(a.distance_pct.total_cmp(&b.distance_pct))
                .then(a.level_id.cmp(&b.level_id))
        });
        records
    }

    pub fn score_level(
        &self,
        level: &Level,
        snapshot: &MarketSnapshot,
        pattern: &PatternResult,
        prediction: &Prediction,
        now: DateTime<Utc>,
    ) -> ScoreRecord {
        let mut notes = Vec::new();
        let signed_distance = snapshot.distance_pct(level.price);
        let distance = signed_distance.abs();
        let atr_pct = snapshot.volatility.medium_pct;
        let side_sign = match level.side {
            Side::Long => 1.0,
            Side::Short => -1.0,
        };

        let price_proximity = self.proximity(level.side, signed_distance, atr_pct);

        let volatility_fit = if snapshot.data_sufficient && atr_pct > 0.0 {
            let ratio = distance / atr_pct;
            let width = volfit_width(snapshot.regime);
            (-((ratio - self.config.volfit_target_ratio) / width).powi(2)).exp()
        } else {
            notes.push("volatility history insufficient".to_string());
            NEUTRAL
        };

        let profit_potential = self.profit_potential(level);
        let risk_reward = self.risk_reward(level, snapshot);

        let pattern_match = match pattern {
            PatternResult::NoPattern { reason } => {
                notes.push(format!("no pattern: {reason}"));
                NEUTRAL
            }
            PatternResult::Matched(summary) if summary.confidence < self.config.min_pattern_confidence => {
                notes.push("pattern confidence below threshold".to_string());
                NEUTRAL
            }
            PatternResult::Matched(summary) => {
                (NEUTRAL + NEUTRAL * summary.bias * summary.confidence * side_sign).clamp(0.0, 1.0)
            }
        };

        let time_suitability = self.config.phases.get(snapshot.phase).clamp(0.0, 1.0);

        let volume_context = if snapshot.data_sufficient {
            volume_score(snapshot, side_sign)
        } else {
            notes.push("volume history insufficient".to_string());
            NEUTRAL
        };

        let trend_alignment = (NEUTRAL + NEUTRAL * prediction.dominant_signal() * side_sign).clamp(0.0, 1.0);

        let sub_scores = SubScores {
            price_proximity,
            volatility_fit,
            profit_potential,
            risk_reward,
            pattern_match,
            time_suitability,
            volume_context,
            trend_alignment,
        };
        let aggregate = self.config.weights.aggregate(&sub_scores);

        debug!(
            level_id = %level.id,
            price = %level.price,
            distance_pct = distance,
            aggregate,
            "level scored"
        );

        ScoreRecord {
            level_id: level.id.clone(),
            symbol: level.symbol.clone(),
            side: level.side,
            price: level.price,
            sub_scores,
            aggregate,
            distance_pct: distance,
            scored_at: now,
            notes,
        }
    }

    /// Inverse-square falloff over the typical range. Entries on the
    /// marketable side of price (long above, short below) are halved.
    fn proximity(&self, side: Side, signed_distance: f64, atr_pct: f64) -> f64 {
        let distance = signed_distance.abs();
        if distance < self.config.too_close_pct {
            return NEUTRAL;
        }
        let typical = atr_pct.max(0.1);
        let base = 1.0 / (1.0 + (distance / typical).powi(2));
        let marketable = match side {
            Side::Long => signed_distance > 0.0,
            Side::Short => signed_distance < 0.0,
        };
        if marketable {
            base * 0.5
        } else {
            base
        }
    }

    fn commission(&self, shares: u32) -> Decimal {
        (self.config.commission_per_share * Decimal::from(shares)).max(self.config.min_commission)
    }

    fn profit_potential(&self, level: &Level) -> f64 {
        let notional = level.notional();
        if notional.is_zero() || self.config.reference_gain_pct <= 0.0 {
            return 0.0;
        }
        let gross = level.gain_per_share() * Decimal::from(level.shares);
        let net = gross - self.commission(level.shares) * Decimal::TWO;
        let net_pct = (net / notional * Decimal::ONE_HUNDRED).to_f64().unwrap_or(0.0);
        (net_pct / self.config.reference_gain_pct).clamp(0.0, 1.0)
    }

    fn risk_reward(&self, level: &Level, snapshot: &MarketSnapshot) -> f64 {
        let reward = level.gain_per_share();
        if reward <= Decimal::ZERO || self.config.risk_reward_cap <= 0.0 {
            return 0.0;
        }
        // Adverse excursion: distance to the stop, else one ATR, else 1% of price.
        let risk = match level.stop_price {
            Some(stop) => (level.price - stop).abs(),
            None if snapshot.atr > Decimal::ZERO => snapshot.atr,
            None => level.price / Decimal::ONE_HUNDRED,
        };
        if risk.is_zero() {
            return 1.0;
        }
        let ratio = (reward / risk).to_f64().unwrap_or(0.0);
        ratio.clamp(0.0, self.config.risk_reward_cap) / self.config.risk_reward_cap
    }
}

fn volume_score(snapshot: &MarketSnapshot, side_sign: f64) -> f64 {
    let base = match snapshot.volume_condition {
        VolumeCondition::VeryLow => 0.1,
        VolumeCondition::Low => 0.3,
        VolumeCondition::Normal => 0.5,
        VolumeCondition::High => 0.7,
        VolumeCondition::Extreme => 0.8,
    };
    let confirmed = matches!(
        snapshot.volume_condition,
        VolumeCondition::High | VolumeCondition::Extreme
    );
    let alignment = if confirmed && snapshot.change_short_pct.abs() >= 0.05 {
        0.2 * snapshot.change_short_pct.signum() * side_sign
    } else {
        0.0
    };
    (base + alignment).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Fingerprint, VolatilityMeasures};
    use rust_decimal_macros::dec;

    fn snapshot(price: Decimal, atr_pct: f64, regime: VolatilityRegime) -> MarketSnapshot {
        MarketSnapshot {
            symbol: "TQQQ".into(),
            at: Utc::now(),
            price,
            volatility: VolatilityMeasures {
                short_pct: atr_pct,
                medium_pct: atr_pct,
                long_pct: atr_pct,
            },
            atr: (price * Decimal::try_from(atr_pct / 100.0).unwrap()).round_dp(4),
            regime,
            volume_ratio: 1.0,
            volume_condition: VolumeCondition::Normal,
            phase: TradingPhase::Morning,
            change_short_pct: 0.0,
            change_medium_pct: 0.0,
            fingerprint: Fingerprint([0.5; 6]),
            samples: 60,
            data_sufficient: true,
        }
    }

    fn empty_prediction(snap: &MarketSnapshot) -> Prediction {
        Prediction {
            symbol: snap.symbol.clone(),
            at: snap.at,
            forecasts: vec![],
        }
    }

    fn long(id: &str, price: Decimal) -> Level {
        Level::new(id, "TQQQ", Side::Long, price, price + dec!(0.05), 100)
    }

    #[test]
    fn test_closest_long_ranks_first_in_high_volatility() {
        let scorer = LevelScorer::new(ScoringConfig::default());
        let snap = snapshot(dec!(5.20), 2.0, VolatilityRegime::High);
        let levels = vec![
            long("l3", dec!(5.05)),
            long("l1", dec!(5.15)),
            long("l2", dec!(5.10)),
        ];
        let records = scorer.score(
            &levels,
            &snap,
            &PatternResult::no_pattern("empty"),
            &empty_prediction(&snap),
            Utc::now(),
        );

        assert_eq!(records[0].level_id, "l1");
        let by_id = |id: &str| records.iter().find(|r| r.level_id == id).unwrap();
        assert!(by_id("l1").sub_scores.price_proximity > by_id("l2").sub_scores.price_proximity);
        assert!(by_id("l2").sub_scores.price_proximity > by_id("l3").sub_scores.price_proximity);
        assert!(by_id("l1").sub_scores.volatility_fit > by_id("l2").sub_scores.volatility_fit);
    }

    #[test]
    fn test_no_pattern_is_neutral_not_zero() {
        let scorer = LevelScorer::new(ScoringConfig::default());
        let snap = snapshot(dec!(5.20), 1.0, VolatilityRegime::Medium);
        let record = scorer.score_level(
            &long("l1", dec!(5.15)),
            &snap,
            &PatternResult::no_pattern("empty"),
            &empty_prediction(&snap),
            Utc::now(),
        );
        assert_eq!(record.sub_scores.pattern_match, 0.5);
        assert!(record.notes.iter().any(|n| n.contains("no pattern")));
    }

    #[test]
    fn test_insufficient_data_degrades_to_neutral() {
        let scorer = LevelScorer::new(ScoringConfig::default());
        let mut snap = snapshot(dec!(5.20), 1.0, VolatilityRegime::Medium);
        snap.data_sufficient = false;
        let record = scorer.score_level(
            &long("l1", dec!(5.15)),
            &snap,
            &PatternResult::no_pattern("empty"),
            &empty_prediction(&snap),
            Utc::now(),
        );
        assert_eq!(record.sub_scores.volatility_fit, 0.5);
        assert_eq!(record.sub_scores.volume_context, 0.5);
        assert!((0.0..=100.0).contains(&record.aggregate));
    }

    #[test]
    fn test_commission_eats_small_targets() {
        let scorer = LevelScorer::new(ScoringConfig::default());
        let snap = snapshot(dec!(5.20), 1.0, VolatilityRegime::Medium);
        // 1 cent on 100 shares = $1 gross, $2 round-trip commission
        let thin = Level::new("thin", "TQQQ", Side::Long, dec!(5.15), dec!(5.16), 100);
        let record = scorer.score_level(
            &thin,
            &snap,
            &PatternResult::no_pattern("empty"),
            &empty_prediction(&snap),
            Utc::now(),
        );
        assert_eq!(record.sub_scores.profit_potential, 0.0);
    }

    #[test]
    fn test_only_selectable_levels_scored() {
        let scorer = LevelScorer::new(ScoringConfig::default());
        let snap = snapshot(dec!(5.20), 1.0, VolatilityRegime::Medium);
        let mut filled = long("f", dec!(5.10));
        filled.status = crate::domain::LevelStatus::Filled;
        let records = scorer.score(
            &[filled, long("a", dec!(5.15))],
            &snap,
            &PatternResult::no_pattern("empty"),
            &empty_prediction(&snap),
            Utc::now(),
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].level_id, "a");
    }

    #[test]
    fn test_weights_validate() {
        let mut weights = ScoreWeights::default();
        assert!(weights.validate().is_empty());
        weights.trend_alignment = -1.0;
        assert!(!weights.validate().is_empty());
    }
}
