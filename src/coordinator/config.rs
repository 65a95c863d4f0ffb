//! Control loop configuration

use serde::{Deserialize, Serialize};

use super::command::ControllerMode;
use crate::domain::Resolution;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Mode the loop starts in
    pub mode: ControllerMode,
    /// Re-evaluation cadence
    pub cycle_interval_secs: u64,
    /// Alert-mode plans are discarded after this long unconfirmed
    pub pending_expiry_secs: u64,
    /// Decision records kept in memory
    pub history_size: usize,
    /// Return closed levels to the pool at the start of each cycle
    pub recycle_closed: bool,
    /// Candles fetched per symbol each cycle
    pub candle_window: usize,
    pub candle_resolution: Resolution,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            mode: ControllerMode::Alert,
            cycle_interval_secs: 30,
            pending_expiry_secs: 60,
            history_size: 5_000,
            recycle_closed: true,
            candle_window: 60,
            candle_resolution: Resolution::OneMinute,
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.cycle_interval_secs == 0 {
            problems.push("controller.cycle_interval_secs must be positive".to_string());
        }
        if self.pending_expiry_secs == 0 {
            problems.push("controller.pending_expiry_secs must be positive".to_string());
        }
        if self.history_size == 0 {
            problems.push("controller.history_size must be positive".to_string());
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ControllerConfig::default();
        assert!(config.validate().is_empty());
        assert_eq!(config.cycle_interval_secs, 30);
        assert_eq!(config.history_size, 5_000);
    }
}
