//! Emergency Stop latch
//!
//! One process-wide latch shared by the Risk Manager, the Watchdog, the
//! Execution Manager and the control loop. Triggering is idempotent and
//! cheap to check; waking subscribers is done through a `watch` channel so
//! the control loop can preempt its cadence. Only an operator reset clears
//! the latch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{watch, RwLock};
use tracing::{error, info};

/// Why the latch was tripped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", content = "detail", rename_all = "snake_case")]
pub enum EmergencyReason {
    /// Risk limit at or beyond the emergency threshold
    RiskLimit(String),
    /// Sudden price move beyond the volatility envelope
    BlackSwan(String),
    /// Control loop stopped sending heartbeats
    WatchdogTimeout(String),
    /// Health check configured to stop on failure
    HealthCheck(String),
    /// Operator request
    Manual(String),
}

impl std::fmt::Display for EmergencyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmergencyReason::RiskLimit(s) => write!(f, "RiskLimit: {}", s),
            EmergencyReason::BlackSwan(s) => write!(f, "BlackSwan: {}", s),
            EmergencyReason::WatchdogTimeout(s) => write!(f, "WatchdogTimeout: {}", s),
            EmergencyReason::HealthCheck(s) => write!(f, "HealthCheck: {}", s),
            EmergencyReason::Manual(s) => write!(f, "Manual: {}", s),
        }
    }
}

/// Emergency stop state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmergencyState {
    pub active: bool,
    pub reason: Option<EmergencyReason>,
    pub triggered_at: Option<DateTime<Utc>>,
    /// Triggers received while already latched
    pub repeat_triggers: u32,
}

pub struct EmergencyStop {
    state: RwLock<EmergencyState>,
    is_stopped: AtomicBool,
    notify: watch::Sender<bool>,
}

impl EmergencyStop {
    pub fn new() -> Self {
        let (notify, _) = watch::channel(false);
        Self {
            state: RwLock::new(EmergencyState::default()),
            is_stopped: AtomicBool::new(false),
            notify,
        }
    }

    /// Check if emergency stop is active (fast atomic check)
    pub fn is_stopped(&self) -> bool {
        self.is_stopped.load(Ordering::SeqCst)
    }

    pub async fn state(&self) -> EmergencyState {
        self.state.read().await.clone()
    }

    /// Receiver that flips to `true` when the latch trips
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.notify.subscribe()
    }

    /// Trip the latch. Returns `true` only for the call that tripped it.
    pub async fn trigger(&self, reason: EmergencyReason) -> bool {
        let mut state = self.state.write().await;
        if state.active {
            state.repeat_triggers += 1;
            info!("Emergency stop already active, ignoring: {}", reason);
            return false;
        }

        error!("🚨 EMERGENCY STOP TRIGGERED: {}", reason);
        self.is_stopped.store(true, Ordering::SeqCst);
        state.active = true;
        state.reason = Some(reason);
        state.triggered_at = Some(Utc::now());
        state.repeat_triggers = 0;
        drop(state);

        self.notify.send_replace(true);
        true
    }

    /// Clear the latch (operator action)
    pub async fn reset(&self, operator: &str) {
        info!("Resetting emergency stop (operator: {})", operator);
        let mut state = self.state.write().await;
        *state = EmergencyState::default();
        self.is_stopped.store(false, Ordering::SeqCst);
        drop(state);
        self.notify.send_replace(false);
    }

    /// Wait until the latch is tripped
    pub async fn triggered(&self) {
        let mut rx = self.subscribe();
        // Err means the sender is gone, which cannot happen while `self` lives.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for EmergencyStop {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_emergency_reason_display() {
        assert_eq!(
            EmergencyReason::Manual("test".to_string()).to_string(),
            "Manual: test"
        );
    }

    #[tokio::test]
    async fn test_trigger_is_idempotent() {
        let stop = EmergencyStop::new();
        assert!(!stop.is_stopped());
        assert!(stop.trigger(EmergencyReason::Manual("first".into())).await);
        assert!(!stop.trigger(EmergencyReason::Manual("second".into())).await);

        let state = stop.state().await;
        assert!(state.active);
        assert_eq!(state.reason, Some(EmergencyReason::Manual("first".into())));
        assert_eq!(state.repeat_triggers, 1);
    }

    #[tokio::test]
    async fn test_subscribers_wake_on_trigger() {
        let stop = Arc::new(EmergencyStop::new());
        let waiter = {
            let stop = stop.clone();
            tokio::spawn(async move { stop.triggered().await })
        };
        stop.trigger(EmergencyReason::BlackSwan("TQQQ -8%".into())).await;
        waiter.await.unwrap();

        stop.reset("ops").await;
        assert!(!stop.is_stopped());
        assert!(!*stop.subscribe().borrow());
    }
}
