//! Controller commands: control messages from the handle to the loop

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::Result;

/// How the loop treats approved plans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ControllerMode {
    /// Observe only: no plans, no orphan profit-takes
    Disabled,
    /// Plans are held for operator confirmation
    #[default]
    Alert,
    /// Approved plans are dispatched directly
    Autonomous,
}

impl ControllerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerMode::Disabled => "disabled",
            ControllerMode::Alert => "alert",
            ControllerMode::Autonomous => "autonomous",
        }
    }
}

impl fmt::Display for ControllerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ControllerMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" | "off" => Ok(ControllerMode::Disabled),
            "alert" | "manual" => Ok(ControllerMode::Alert),
            "autonomous" | "auto" => Ok(ControllerMode::Autonomous),
            other => Err(format!("unknown controller mode: {other}")),
        }
    }
}

/// Summary of one decision cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub mode: ControllerMode,
    /// Decision records written by the cycle
    pub decisions: usize,
    /// Commands queued by the cycle
    pub commands: usize,
    pub emergency: bool,
}

/// Control commands sent to the loop
#[derive(Debug)]
pub enum ControlCommand {
    /// Replies with the previous mode
    SetMode {
        mode: ControllerMode,
        reason: String,
        reply: oneshot::Sender<ControllerMode>,
    },
    /// Dispatch a pending plan; replies with the queued command ids
    ConfirmPending {
        id: Uuid,
        reply: oneshot::Sender<Result<Vec<Uuid>>>,
    },
    RejectPending {
        id: Uuid,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Run a cycle now
    TriggerCycle {
        reply: oneshot::Sender<CycleReport>,
    },
    /// Clear the emergency latch; only honoured while disabled
    ResetEmergency {
        operator: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse() {
        assert_eq!("auto".parse::<ControllerMode>().unwrap(), ControllerMode::Autonomous);
        assert_eq!("Alert".parse::<ControllerMode>().unwrap(), ControllerMode::Alert);
        assert!("paused".parse::<ControllerMode>().is_err());
        assert_eq!(ControllerMode::Disabled.to_string(), "disabled");
    }
}
