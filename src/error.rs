use thiserror::Error;
use uuid::Uuid;

/// Main error type for the control loop
#[derive(Error, Debug)]
pub enum PilotError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Scenario file error: {0}")]
    Toml(#[from] toml::de::Error),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Level pool errors
    #[error("Invalid transition for level {level_id}: from {from} to {to}")]
    InvalidTransition {
        level_id: String,
        from: String,
        to: String,
    },

    #[error("Level not found: {0}")]
    LevelNotFound(String),

    #[error("Duplicate level: {0}")]
    DuplicateLevel(String),

    // Risk errors
    #[error("Limit breach: {0}")]
    LimitBreach(String),

    #[error("Emergency stop active: {0}")]
    EmergencyActive(String),

    // Venue errors
    #[error("Adapter failure: {0}")]
    AdapterFailure(String),

    #[error("Adapter timeout: {operation} after {elapsed_ms}ms")]
    AdapterTimeout { operation: String, elapsed_ms: u64 },

    // Analysis errors
    #[error("Insufficient data: {0}")]
    DataInsufficient(String),

    // Supervision errors
    #[error("Watchdog timeout: {0}")]
    WatchdogTimeout(String),

    // Control surface errors
    #[error("Pending decision not found: {0}")]
    PendingDecisionNotFound(Uuid),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl PilotError {
    /// Errors the execution pipeline may retry against the venue
    pub fn is_adapter_failure(&self) -> bool {
        matches!(
            self,
            PilotError::AdapterFailure(_) | PilotError::AdapterTimeout { .. } | PilotError::Http(_)
        )
    }
}

/// Result type alias for PilotError
pub type Result<T> = std::result::Result<T, PilotError>;

/// Specific error types for risk evaluation
#[derive(Error, Debug, Clone)]
pub enum RiskError {
    #[error("{kind} hard limit breached: current {current}, limit {limit}")]
    HardLimit {
        kind: String,
        current: rust_decimal::Decimal,
        limit: rust_decimal::Decimal,
    },

    #[error("Black swan move on {symbol}: {move_pct:.2}% within {window_secs}s")]
    BlackSwan {
        symbol: String,
        move_pct: f64,
        window_secs: u64,
    },

    #[error("Risk level {level} blocks new exposure")]
    TradingBlocked { level: String },

    #[error("Risk evaluation failed: {0}")]
    EvaluationFailed(String),
}

/// Specific error types for command dispatch
#[derive(Error, Debug, Clone)]
pub enum CommandError {
    #[error("Command {id} not found")]
    NotFound { id: Uuid },

    #[error("Invalid command transition: from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Command queue is full ({capacity})")]
    QueueFull { capacity: usize },

    #[error("Max retries exceeded: {attempts}")]
    MaxRetriesExceeded { attempts: u32 },
}

impl From<RiskError> for PilotError {
    fn from(err: RiskError) -> Self {
        PilotError::LimitBreach(err.to_string())
    }
}

impl From<CommandError> for PilotError {
    fn from(err: CommandError) -> Self {
        PilotError::InvalidState(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_failures_are_retryable() {
        assert!(PilotError::AdapterFailure("down".into()).is_adapter_failure());
        assert!(PilotError::AdapterTimeout {
            operation: "activate_level".into(),
            elapsed_ms: 30_000
        }
        .is_adapter_failure());
        assert!(!PilotError::LimitBreach("daily loss".into()).is_adapter_failure());
    }

    #[test]
    fn risk_error_maps_to_limit_breach() {
        let err: PilotError = RiskError::TradingBlocked {
            level: "critical".into(),
        }
        .into();
        assert!(matches!(err, PilotError::LimitBreach(_)));
    }
}
