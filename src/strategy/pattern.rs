//! Pattern Matcher
//!
//! Looks up historical situations whose fingerprints resemble the current
//! one and summarizes what happened next. The repository learns online:
//! every cycle's fingerprint is held as a pending observation and resolved
//! into a historical pattern once its longest horizon has elapsed.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

use crate::domain::{Fingerprint, FINGERPRINT_LEN};
use crate::error::Result;

/// Outcome horizons in minutes, shared with the predictor
pub const OUTCOME_HORIZONS_MIN: [i64; 4] = [5, 15, 30, 60];

/// Realized-move thresholds (percent) for the outcome taxonomy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutcomeThresholds {
    pub breakout_5m_pct: f64,
    pub breakout_15m_pct: f64,
    pub reversal_pct: f64,
    pub trend_15m_pct: f64,
    pub trend_30m_pct: f64,
}

impl Default for OutcomeThresholds {
    fn default() -> Self {
        Self {
            breakout_5m_pct: 0.8,
            breakout_15m_pct: 1.0,
            reversal_pct: 0.3,
            trend_15m_pct: 0.3,
            trend_30m_pct: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    /// Per-feature weights for the weighted Euclidean distance
    pub weights: Vec<f64>,
    pub similarity_threshold: f64,
    pub max_matches: usize,
    pub min_matches: usize,
    /// Historical patterns retained
    pub max_samples: usize,
    pub thresholds: OutcomeThresholds,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            weights: vec![1.5, 1.0, 1.5, 0.5, 2.0, 1.0],
            similarity_threshold: 0.75,
            max_matches: 20,
            min_matches: 3,
            max_samples: 5_000,
            thresholds: OutcomeThresholds::default(),
        }
    }
}

/// Outcome taxonomy for what followed a historical situation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeClass {
    BreakoutUp,
    BreakoutDown,
    TrendUp,
    TrendDown,
    Ranging,
    Reversal,
}

impl OutcomeClass {
    pub const ALL: [OutcomeClass; 6] = [
        OutcomeClass::BreakoutUp,
        OutcomeClass::BreakoutDown,
        OutcomeClass::TrendUp,
        OutcomeClass::TrendDown,
        OutcomeClass::Ranging,
        OutcomeClass::Reversal,
    ];

    /// Directional weight of the class in `[-1, 1]`
    pub fn direction(&self) -> f64 {
        match self {
            OutcomeClass::BreakoutUp => 1.0,
            OutcomeClass::TrendUp => 0.6,
            OutcomeClass::BreakoutDown => -1.0,
            OutcomeClass::TrendDown => -0.6,
            OutcomeClass::Ranging | OutcomeClass::Reversal => 0.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeClass::BreakoutUp => "breakout_up",
            OutcomeClass::BreakoutDown => "breakout_down",
            OutcomeClass::TrendUp => "trend_up",
            OutcomeClass::TrendDown => "trend_down",
            OutcomeClass::Ranging => "ranging",
            OutcomeClass::Reversal => "reversal",
        }
    }
}

impl fmt::Display for OutcomeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Realized percent moves after a situation
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PatternOutcome {
    /// Moves at 5/15/30/60 minutes
    pub moves_pct: [f64; 4],
    pub max_up_pct: f64,
    pub max_down_pct: f64,
}

impl PatternOutcome {
    pub fn classify(&self, t: &OutcomeThresholds) -> OutcomeClass {
        let [m5, m15, m30, _] = self.moves_pct;
        let same_sign = |a: f64, b: f64| a.signum() == b.signum();

        if m5.abs() > t.breakout_5m_pct && m15.abs() > t.breakout_15m_pct && same_sign(m5, m15) {
            return if m5 > 0.0 {
                OutcomeClass::BreakoutUp
            } else {
                OutcomeClass::BreakoutDown
            };
        }
        if !same_sign(m5, m30) && m5.abs() > t.reversal_pct && m30.abs() > t.reversal_pct {
            return OutcomeClass::Reversal;
        }
        if m15.abs() > t.trend_15m_pct && m30.abs() > t.trend_30m_pct && same_sign(m15, m30) {
            return if m15 > 0.0 {
                OutcomeClass::TrendUp
            } else {
                OutcomeClass::TrendDown
            };
        }
        OutcomeClass::Ranging
    }

    /// Largest excursion, signed
    pub fn peak_excursion(&self) -> f64 {
        if self.max_up_pct >= self.max_down_pct.abs() {
            self.max_up_pct
        } else {
            self.max_down_pct
        }
    }
}

/// A resolved historical situation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalPattern {
    pub symbol: String,
    pub fingerprint: Fingerprint,
    pub recorded_at: DateTime<Utc>,
    pub outcome: PatternOutcome,
    pub class: OutcomeClass,
}

/// Per-class share of the matches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeStat {
    pub class: OutcomeClass,
    /// Similarity-weighted fraction of matches
    pub fraction: f64,
    pub avg_excursion_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSummary {
    pub matches: usize,
    pub avg_similarity: f64,
    pub outcomes: Vec<OutcomeStat>,
    /// Similarity-weighted expected move per horizon, percent
    pub expected_moves_pct: [f64; 4],
    /// Net directional lean in `[-1, 1]`
    pub bias: f64,
    pub confidence: f64,
}

impl PatternSummary {
    pub fn fraction(&self, class: OutcomeClass) -> f64 {
        self.outcomes
            .iter()
            .find(|o| o.class == class)
            .map(|o| o.fraction)
            .unwrap_or(0.0)
    }

    pub fn dominant(&self) -> Option<OutcomeClass> {
        self.outcomes
            .iter()
            .max_by(|a, b| a.fraction.total_cmp(&b.fraction))
            .map(|o| o.class)
    }
}

/// Result of a lookup; no match is a normal outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PatternResult {
    NoPattern { reason: String },
    Matched(PatternSummary),
}

impl PatternResult {
    pub fn no_pattern(reason: impl Into<String>) -> Self {
        PatternResult::NoPattern {
            reason: reason.into(),
        }
    }

    pub fn summary(&self) -> Option<&PatternSummary> {
        match self {
            PatternResult::Matched(s) => Some(s),
            PatternResult::NoPattern { .. } => None,
        }
    }

    pub fn bias(&self) -> f64 {
        self.summary().map(|s| s.bias).unwrap_or(0.0)
    }

    pub fn confidence(&self) -> f64 {
        self.summary().map(|s| s.confidence).unwrap_or(0.0)
    }
}

/// Weighted Euclidean similarity in `[0, 1]`: `1 - sqrt(Σ w·d²) / sqrt(Σ w)`
pub fn weighted_similarity(a: &Fingerprint, b: &Fingerprint, weights: &[f64]) -> f64 {
    let mut wsq = 0.0;
    let mut wsum = 0.0;
    for i in 0..FINGERPRINT_LEN {
        let w = weights.get(i).copied().unwrap_or(1.0).max(0.0);
        let d = a.0[i] - b.0[i];
        wsq += w * d * d;
        wsum += w;
    }
    if wsum <= 0.0 {
        return 0.0;
    }
    (1.0 - wsq.sqrt() / wsum.sqrt()).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingObservation {
    symbol: String,
    fingerprint: Fingerprint,
    recorded_at: DateTime<Utc>,
    base_price: Decimal,
    path: Vec<(DateTime<Utc>, Decimal)>,
}

impl PendingObservation {
    fn resolve(&self) -> Option<PatternOutcome> {
        let base = self.base_price.to_f64().filter(|b| *b > 0.0)?;
        let pct = |p: Decimal| (p.to_f64().unwrap_or(base) - base) / base * 100.0;

        let mut outcome = PatternOutcome::default();
        for (i, minutes) in OUTCOME_HORIZONS_MIN.iter().enumerate() {
            let mark = self.recorded_at + Duration::minutes(*minutes);
            let price = self
                .path
                .iter()
                .find(|(at, _)| *at >= mark)
                .or_else(|| self.path.last())
                .map(|(_, p)| *p)?;
            outcome.moves_pct[i] = pct(price);
        }
        for (_, price) in &self.path {
            let m = pct(*price);
            outcome.max_up_pct = outcome.max_up_pct.max(m);
            outcome.max_down_pct = outcome.max_down_pct.min(m);
        }
        Some(outcome)
    }
}

/// Library of resolved situations plus pending observations
pub struct PatternRepository {
    samples: VecDeque<HistoricalPattern>,
    pending: VecDeque<PendingObservation>,
    max_samples: usize,
    thresholds: OutcomeThresholds,
}

/// Pending observations retained at most
const MAX_PENDING: usize = 2_000;

impl PatternRepository {
    pub fn new(max_samples: usize, thresholds: OutcomeThresholds) -> Self {
        Self {
            samples: VecDeque::new(),
            pending: VecDeque::new(),
            max_samples: max_samples.max(1),
            thresholds,
        }
    }

    pub fn from_config(config: &PatternConfig) -> Self {
        Self::new(config.max_samples, config.thresholds.clone())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn samples(&self) -> impl Iterator<Item = &HistoricalPattern> {
        self.samples.iter()
    }

    /// Insert an already-resolved pattern
    pub fn record(&mut self, symbol: &str, fingerprint: Fingerprint, recorded_at: DateTime<Utc>, outcome: PatternOutcome) {
        let class = outcome.classify(&self.thresholds);
        self.samples.push_back(HistoricalPattern {
            symbol: symbol.to_string(),
            fingerprint,
            recorded_at,
            outcome,
            class,
        });
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    /// Start tracking what follows the current situation
    pub fn observe(&mut self, symbol: &str, fingerprint: Fingerprint, price: Decimal, at: DateTime<Utc>) {
        self.pending.push_back(PendingObservation {
            symbol: symbol.to_string(),
            fingerprint,
            recorded_at: at,
            base_price: price,
            path: Vec::new(),
        });
        while self.pending.len() > MAX_PENDING {
            self.pending.pop_front();
        }
    }

    /// Feed a price; resolves observations whose longest horizon has passed.
    /// Returns the number of newly resolved patterns.
    pub fn on_price(&mut self, symbol: &str, price: Decimal, at: DateTime<Utc>) -> usize {
        let horizon = Duration::minutes(OUTCOME_HORIZONS_MIN[3]);
        let mut ready = Vec::new();
        let mut keep = VecDeque::with_capacity(self.pending.len());

        for mut obs in self.pending.drain(..) {
            if obs.symbol == symbol && at > obs.recorded_at {
                obs.path.push((at, price));
            }
            if obs.symbol == symbol && at - obs.recorded_at >= horizon {
                ready.push(obs);
            } else {
                keep.push_back(obs);
            }
        }
        self.pending = keep;

        let mut resolved = 0;
        for obs in ready {
            if let Some(outcome) = obs.resolve() {
                self.record(&obs.symbol, obs.fingerprint, obs.recorded_at, outcome);
                resolved += 1;
            }
        }
        if resolved > 0 {
            debug!(symbol = %symbol, resolved, total = self.samples.len(), "patterns resolved");
        }
        resolved
    }

    pub async fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let samples: Vec<&HistoricalPattern> = self.samples.iter().collect();
        let body = serde_json::to_string(&samples)?;
        tokio::fs::write(path, body).await?;
        Ok(())
    }

    pub async fn load_json<P: AsRef<Path>>(&mut self, path: P) -> Result<usize> {
        let body = tokio::fs::read_to_string(path).await?;
        let samples: Vec<HistoricalPattern> = serde_json::from_str(&body)?;
        let count = samples.len();
        for sample in samples {
            self.samples.push_back(sample);
        }
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
        info!("Loaded {} historical patterns", count);
        Ok(count)
    }
}

/// Similarity lookup over a `PatternRepository`
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    config: PatternConfig,
}

impl PatternMatcher {
    pub fn new(config: PatternConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PatternConfig {
        &self.config
    }

    pub fn find(&self, fingerprint: &Fingerprint, repo: &PatternRepository) -> PatternResult {
        if repo.is_empty() {
            return PatternResult::no_pattern("pattern repository is empty");
        }

        let mut matches: Vec<(f64, &HistoricalPattern)> = repo
            .samples()
            .map(|p| (weighted_similarity(fingerprint, &p.fingerprint, &self.config.weights), p))
            .filter(|(sim, _)| *sim >= self.config.similarity_threshold)
            .collect();
        matches.sort_by(|a, b| b.0.total_cmp(&a.0));
        matches.truncate(self.config.max_matches.max(1));

        if matches.len() < self.config.min_matches.max(1) {
            return PatternResult::no_pattern(format!(
                "{} matches above similarity {:.2}, need {}",
                matches.len(),
                self.config.similarity_threshold,
                self.config.min_matches
            ));
        }

        let total_weight: f64 = matches.iter().map(|(s, _)| *s).sum();
        if total_weight <= 0.0 {
            return PatternResult::no_pattern("zero similarity weight");
        }

        let mut outcomes = Vec::new();
        for class in OutcomeClass::ALL {
            let in_class: Vec<&(f64, &HistoricalPattern)> =
                matches.iter().filter(|(_, p)| p.class == class).collect();
            if in_class.is_empty() {
                continue;
            }
            let weight: f64 = in_class.iter().map(|(s, _)| *s).sum();
            let excursion: f64 = in_class
                .iter()
                .map(|(s, p)| s * p.outcome.peak_excursion())
                .sum::<f64>()
                / weight;
            outcomes.push(OutcomeStat {
                class,
                fraction: weight / total_weight,
                avg_excursion_pct: excursion,
            });
        }

        let mut expected = [0.0; 4];
        for (i, slot) in expected.iter_mut().enumerate() {
            *slot = matches
                .iter()
                .map(|(s, p)| s * p.outcome.moves_pct[i])
                .sum::<f64>()
                / total_weight;
        }

        let bias = outcomes
            .iter()
            .map(|o| o.fraction * o.class.direction())
            .sum::<f64>()
            .clamp(-1.0, 1.0);

        let n = matches.len() as f64;
        let mean_15 = matches.iter().map(|(_, p)| p.outcome.moves_pct[1]).sum::<f64>() / n;
        let var_15 = matches
            .iter()
            .map(|(_, p)| (p.outcome.moves_pct[1] - mean_15).powi(2))
            .sum::<f64>()
            / n;
        let count_factor = (n / self.config.max_matches.max(1) as f64).min(1.0);
        let confidence = (0.6 / (1.0 + var_15.sqrt()) + 0.4 * count_factor).clamp(0.0, 1.0);

        PatternResult::Matched(PatternSummary {
            matches: matches.len(),
            avg_similarity: total_weight / n,
            outcomes,
            expected_moves_pct: expected,
            bias,
            confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn fp(v: f64) -> Fingerprint {
        Fingerprint([v; FINGERPRINT_LEN])
    }

    fn up_outcome() -> PatternOutcome {
        PatternOutcome {
            moves_pct: [1.0, 1.5, 1.8, 2.0],
            max_up_pct: 2.1,
            max_down_pct: -0.1,
        }
    }

    #[test]
    fn test_similarity_bounds() {
        let w = PatternConfig::default().weights;
        assert!((weighted_similarity(&fp(0.3), &fp(0.3), &w) - 1.0).abs() < 1e-12);
        assert_eq!(weighted_similarity(&fp(0.0), &fp(1.0), &w), 0.0);
    }

    #[test]
    fn test_classify_taxonomy() {
        let t = OutcomeThresholds::default();
        assert_eq!(up_outcome().classify(&t), OutcomeClass::BreakoutUp);

        let trend_down = PatternOutcome {
            moves_pct: [-0.2, -0.4, -0.7, -0.9],
            ..Default::default()
        };
        assert_eq!(trend_down.classify(&t), OutcomeClass::TrendDown);

        let reversal = PatternOutcome {
            moves_pct: [0.5, 0.1, -0.6, -0.4],
            ..Default::default()
        };
        assert_eq!(reversal.classify(&t), OutcomeClass::Reversal);

        assert_eq!(PatternOutcome::default().classify(&t), OutcomeClass::Ranging);
    }

    #[test]
    fn test_empty_repository_is_no_pattern() {
        let matcher = PatternMatcher::new(PatternConfig::default());
        let repo = PatternRepository::from_config(&PatternConfig::default());
        let result = matcher.find(&fp(0.5), &repo);
        assert!(matches!(result, PatternResult::NoPattern { .. }));
        assert_eq!(result.bias(), 0.0);
    }

    #[test]
    fn test_matches_summarize_outcomes() {
        let config = PatternConfig::default();
        let mut repo = PatternRepository::from_config(&config);
        let now = Utc::now();
        for _ in 0..5 {
            repo.record("SPY", fp(0.5), now, up_outcome());
        }
        // Far away, must not match
        repo.record("SPY", fp(0.0), now, PatternOutcome::default());

        let result = PatternMatcher::new(config).find(&fp(0.5), &repo);
        let summary = result.summary().expect("should match");
        assert_eq!(summary.matches, 5);
        assert_eq!(summary.dominant(), Some(OutcomeClass::BreakoutUp));
        assert!(summary.bias > 0.9);
        assert!((summary.expected_moves_pct[0] - 1.0).abs() < 1e-9);
        assert!(summary.confidence > 0.5);
    }

    #[test]
    fn test_pending_observation_resolves_after_horizon() {
        let mut repo = PatternRepository::from_config(&PatternConfig::default());
        let t0 = Utc::now();
        repo.observe("SPY", fp(0.5), dec!(100), t0);

        for minute in [5, 15, 30] {
            assert_eq!(repo.on_price("SPY", dec!(101), t0 + Duration::minutes(minute)), 0);
        }
        assert_eq!(repo.on_price("SPY", dec!(102), t0 + Duration::minutes(60)), 1);
        assert_eq!(repo.len(), 1);
        assert_eq!(repo.pending_len(), 0);

        let pattern = repo.samples().next().unwrap();
        assert!((pattern.outcome.moves_pct[3] - 2.0).abs() < 1e-9);
        assert!((pattern.outcome.max_up_pct - 2.0).abs() < 1e-9);
    }
}
