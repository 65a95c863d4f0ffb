use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::Side;

/// The eight named sub-scores, each in `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SubScores {
    pub price_proximity: f64,
    pub volatility_fit: f64,
    pub profit_potential: f64,
    pub risk_reward: f64,
    pub pattern_match: f64,
    pub time_suitability: f64,
    pub volume_context: f64,
    pub trend_alignment: f64,
}

impl SubScores {
    /// Named view used for breakdown output
    pub fn named(&self) -> [(&'static str, f64); 8] {
        [
            ("price_proximity", self.price_proximity),
            ("volatility_fit", self.volatility_fit),
            ("profit_potential", self.profit_potential),
            ("risk_reward", self.risk_reward),
            ("pattern_match", self.pattern_match),
            ("time_suitability", self.time_suitability),
            ("volume_context", self.volume_context),
            ("trend_alignment", self.trend_alignment),
        ]
    }
}

/// Score of one level for one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub level_id: String,
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub sub_scores: SubScores,
    /// Weighted aggregate on a 0-100 scale
    pub aggregate: f64,
    /// Absolute distance from current price, percent
    pub distance_pct: f64,
    pub scored_at: DateTime<Utc>,
    /// Degradations applied while scoring (missing data, no pattern)
    #[serde(default)]
    pub notes: Vec<String>,
}

/// One activation or deactivation in a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanAction {
    pub level_id: String,
    pub side: Side,
    pub price: Decimal,
    pub score: f64,
    pub rationale: String,
}

/// Optimizer output for one symbol and cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub symbol: String,
    pub created_at: DateTime<Utc>,
    pub strategy: String,
    pub activate: Vec<PlanAction>,
    pub deactivate: Vec<PlanAction>,
    /// Aggregate score of the selected set
    pub total_score: f64,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.activate.is_empty() && self.deactivate.is_empty()
    }

    pub fn change_count(&self) -> usize {
        self.activate.len() + self.deactivate.len()
    }

    /// Content identity of the plan, independent of its id and timestamp
    pub fn signature(&self) -> String {
        let mut on: Vec<&str> = self.activate.iter().map(|a| a.level_id.as_str()).collect();
        let mut off: Vec<&str> = self.deactivate.iter().map(|a| a.level_id.as_str()).collect();
        on.sort_unstable();
        off.sort_unstable();
        format!("{}|+{}|-{}", self.symbol, on.join(","), off.join(","))
    }
}

/// Risk Manager verdict on a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum RiskVerdict {
    Approved,
    /// Approved, but soft limits are close
    ApprovedWithWarnings { warnings: Vec<String> },
    Rejected { reasons: Vec<String> },
}

impl RiskVerdict {
    pub fn is_approved(&self) -> bool {
        !matches!(self, RiskVerdict::Rejected { .. })
    }
}

/// What happened to a decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DecisionOutcome {
    /// Commands were queued for the venue
    Executed,
    /// Anti-overtrading guard held the plan back
    Suppressed { reason: String },
    /// Risk Manager vetoed the plan
    Rejected { reason: String },
    /// Held for operator confirmation (alert mode)
    PendingConfirmation { expires_at: DateTime<Utc> },
    /// Operator confirmed a pending plan
    Confirmed { pending_id: Uuid },
    /// Operator rejected a pending plan
    OperatorRejected { pending_id: Uuid },
    /// Pending plan expired unconfirmed
    Expired { pending_id: Uuid },
    /// Close-everything directive issued
    Emergency { reason: String },
    /// Losing positions closed on a hard loss breach
    ForcedClose { reason: String },
    /// A command exhausted its retries
    Abandoned { command_id: Uuid, reason: String },
    /// Controller mode or pause change
    ModeChanged { reason: String },
}

impl DecisionOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            DecisionOutcome::Executed => "executed",
            DecisionOutcome::Suppressed { .. } => "suppressed",
            DecisionOutcome::Rejected { .. } => "rejected",
            DecisionOutcome::PendingConfirmation { .. } => "pending",
            DecisionOutcome::Confirmed { .. } => "confirmed",
            DecisionOutcome::OperatorRejected { .. } => "operator_rejected",
            DecisionOutcome::Expired { .. } => "expired",
            DecisionOutcome::Emergency { .. } => "emergency",
            DecisionOutcome::ForcedClose { .. } => "forced_close",
            DecisionOutcome::Abandoned { .. } => "abandoned",
            DecisionOutcome::ModeChanged { .. } => "mode_changed",
        }
    }
}

impl fmt::Display for DecisionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionOutcome::Suppressed { reason }
            | DecisionOutcome::Rejected { reason }
            | DecisionOutcome::Emergency { reason }
            | DecisionOutcome::ForcedClose { reason }
            | DecisionOutcome::ModeChanged { reason } => write!(f, "{}: {}", self.kind(), reason),
            DecisionOutcome::Abandoned { command_id, reason } => {
                write!(f, "abandoned {}: {}", command_id, reason)
            }
            _ => write!(f, "{}", self.kind()),
        }
    }
}

/// Immutable audit entry in the decision history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: Uuid,
    pub cycle: u64,
    pub at: DateTime<Utc>,
    pub symbol: Option<String>,
    pub plan: Option<Plan>,
    pub verdict: Option<RiskVerdict>,
    pub commands: Vec<Uuid>,
    pub outcome: DecisionOutcome,
}

impl DecisionRecord {
    pub fn new(cycle: u64, at: DateTime<Utc>, outcome: DecisionOutcome) -> Self {
        Self {
            id: Uuid::new_v4(),
            cycle,
            at,
            symbol: None,
            plan: None,
            verdict: None,
            commands: Vec::new(),
            outcome,
        }
    }

    pub fn for_plan(cycle: u64, at: DateTime<Utc>, plan: Plan, outcome: DecisionOutcome) -> Self {
        Self {
            symbol: Some(plan.symbol.clone()),
            plan: Some(plan),
            ..Self::new(cycle, at, outcome)
        }
    }

    pub fn with_verdict(mut self, verdict: RiskVerdict) -> Self {
        self.verdict = Some(verdict);
        self
    }

    pub fn with_commands(mut self, commands: Vec<Uuid>) -> Self {
        self.commands = commands;
        self
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn action(id: &str) -> PlanAction {
        PlanAction {
            level_id: id.into(),
            side: Side::Long,
            price: dec!(5.15),
            score: 50.0,
            rationale: "test".into(),
        }
    }

    #[test]
    fn test_plan_signature_ignores_order_and_id() {
        let now = Utc::now();
        let a = Plan {
            id: Uuid::new_v4(),
            symbol: "SPY".into(),
            created_at: now,
            strategy: "greedy".into(),
            activate: vec![action("x"), action("y")],
            deactivate: vec![],
            total_score: 100.0,
        };
        let mut b = a.clone();
        b.id = Uuid::new_v4();
        b.activate.reverse();
        assert_eq!(a.signature(), b.signature());
        assert_eq!(a.change_count(), 2);
    }
}
