use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::domain::Side;
use crate::error::CommandError;
use crate::exchange::PriceType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    ActivateLevel,
    DeactivateLevel,
    StopTrade,
    ClosePosition,
    EmergencyStop,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::ActivateLevel => "activate_level",
            CommandKind::DeactivateLevel => "deactivate_level",
            CommandKind::StopTrade => "stop_trade",
            CommandKind::ClosePosition => "close_position",
            CommandKind::EmergencyStop => "emergency_stop",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Dispatch priority; lower value dispatches first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandPriority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl fmt::Display for CommandPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommandPriority::Critical => "critical",
            CommandPriority::High => "high",
            CommandPriority::Normal => "normal",
            CommandPriority::Low => "low",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum CommandTarget {
    Level(String),
    /// Every active level and open position
    All,
}

impl fmt::Display for CommandTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandTarget::Level(id) => write!(f, "{}", id),
            CommandTarget::All => write!(f, "*"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Queued,
    InFlight,
    Acknowledged,
    Failed,
    Abandoned,
    /// Drained or interrupted by an emergency stop
    Cancelled,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Queued => "queued",
            CommandStatus::InFlight => "in_flight",
            CommandStatus::Acknowledged => "acknowledged",
            CommandStatus::Failed => "failed",
            CommandStatus::Abandoned => "abandoned",
            CommandStatus::Cancelled => "cancelled",
        }
    }

    pub fn can_transition_to(&self, target: CommandStatus) -> bool {
        use CommandStatus::*;

        matches!(
            (self, target),
            (Queued, InFlight)
                | (Queued, Cancelled)
                | (InFlight, Acknowledged)
                | (InFlight, Failed)
                | (InFlight, Abandoned)
                | (InFlight, Cancelled)
                | (Failed, Queued)
                | (Failed, Abandoned)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Acknowledged | CommandStatus::Abandoned | CommandStatus::Cancelled
        )
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Order parameters for a close command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseSpec {
    pub symbol: String,
    /// Side of the position being closed
    pub side: Side,
    pub size: u32,
    pub price_type: PriceType,
    pub limit_price: Option<Decimal>,
}

/// Unit of work for the execution worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: Uuid,
    pub kind: CommandKind,
    pub priority: CommandPriority,
    pub target: CommandTarget,
    #[serde(default)]
    pub close: Option<CloseSpec>,
    /// Abandonment is logged, not surfaced
    #[serde(default)]
    pub best_effort: bool,
    pub retries: u32,
    pub status: CommandStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub venue_id: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Originating plan, when any
    #[serde(default)]
    pub plan_id: Option<Uuid>,
}

impl Command {
    pub fn new(kind: CommandKind, priority: CommandPriority, target: CommandTarget) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            priority,
            target,
            close: None,
            best_effort: false,
            retries: 0,
            status: CommandStatus::Queued,
            created_at: now,
            updated_at: now,
            acknowledged_at: None,
            venue_id: None,
            last_error: None,
            plan_id: None,
        }
    }

    pub fn activate(level_id: impl Into<String>) -> Self {
        Self::new(
            CommandKind::ActivateLevel,
            CommandPriority::Normal,
            CommandTarget::Level(level_id.into()),
        )
    }

    pub fn deactivate(level_id: impl Into<String>) -> Self {
        Self::new(
            CommandKind::DeactivateLevel,
            CommandPriority::High,
            CommandTarget::Level(level_id.into()),
        )
    }

    pub fn stop_trade(level_id: impl Into<String>) -> Self {
        Self::new(
            CommandKind::StopTrade,
            CommandPriority::High,
            CommandTarget::Level(level_id.into()),
        )
    }

    pub fn close(level_id: impl Into<String>, priority: CommandPriority, spec: CloseSpec) -> Self {
        let mut cmd = Self::new(
            CommandKind::ClosePosition,
            priority,
            CommandTarget::Level(level_id.into()),
        );
        cmd.close = Some(spec);
        cmd
    }

    pub fn emergency_stop() -> Self {
        Self::new(
            CommandKind::EmergencyStop,
            CommandPriority::Critical,
            CommandTarget::All,
        )
    }

    pub fn with_plan(mut self, plan_id: Uuid) -> Self {
        self.plan_id = Some(plan_id);
        self
    }

    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }

    pub fn level_id(&self) -> Option<&str> {
        match &self.target {
            CommandTarget::Level(id) => Some(id),
            CommandTarget::All => None,
        }
    }

    /// Identity used to suppress duplicate submissions
    pub fn dedup_key(&self) -> (CommandKind, CommandTarget) {
        (self.kind, self.target.clone())
    }

    pub fn transition(&mut self, status: CommandStatus) -> Result<(), CommandError> {
        if !self.status.can_transition_to(status) {
            return Err(CommandError::InvalidTransition {
                from: self.status.to_string(),
                to: status.to_string(),
            });
        }
        self.status = status;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_state_machine() {
        let mut cmd = Command::activate("L1");
        assert!(cmd.transition(CommandStatus::Acknowledged).is_err());
        cmd.transition(CommandStatus::InFlight).unwrap();
        cmd.transition(CommandStatus::Failed).unwrap();
        cmd.transition(CommandStatus::Queued).unwrap();
        cmd.transition(CommandStatus::InFlight).unwrap();
        cmd.transition(CommandStatus::Acknowledged).unwrap();
        assert!(cmd.status.is_terminal());
        assert!(cmd.transition(CommandStatus::Queued).is_err());
    }

    #[test]
    fn test_priority_order() {
        assert!(CommandPriority::Critical < CommandPriority::High);
        assert!(CommandPriority::Normal < CommandPriority::Low);
        assert_eq!(Command::deactivate("L1").priority, CommandPriority::High);
        assert_eq!(Command::emergency_stop().target, CommandTarget::All);
    }
}
