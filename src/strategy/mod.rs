//! Decision pipeline: pattern lookup, prediction, scoring, selection

pub mod optimizer;
pub mod pattern;
pub mod predictor;
pub mod scorer;

pub use optimizer::{
    EffectiveLimits, Optimizer, OptimizerConfig, OvertradingGuard, PlanInput, SelectionStrategy,
};
pub use pattern::{
    HistoricalPattern, OutcomeClass, PatternConfig, PatternMatcher, PatternOutcome,
    PatternRepository, PatternResult, PatternSummary,
};
pub use predictor::{DirectionBias, Horizon, HorizonForecast, Prediction, Predictor, PredictorConfig};
pub use scorer::{LevelScorer, PhaseScores, ScoreWeights, ScoringConfig};
