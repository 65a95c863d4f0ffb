//! Pluggable health checks run by the watchdog

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::exchange::ExecutionVenue;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", content = "detail", rename_all = "lowercase")]
pub enum HealthCheckResult {
    Ok,
    Warning(String),
    Failed(String),
    Timeout,
}

impl HealthCheckResult {
    pub fn is_failure(&self) -> bool {
        matches!(self, HealthCheckResult::Failed(_) | HealthCheckResult::Timeout)
    }
}

impl fmt::Display for HealthCheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthCheckResult::Ok => write!(f, "ok"),
            HealthCheckResult::Warning(s) => write!(f, "warning: {}", s),
            HealthCheckResult::Failed(s) => write!(f, "failed: {}", s),
            HealthCheckResult::Timeout => write!(f, "timeout"),
        }
    }
}

/// What the watchdog does once a check fails past its grace period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureAction {
    /// Drop the controller to alert mode and notify the operator
    PauseAndAlert,
    EmergencyStop,
}

#[derive(Debug, Clone)]
pub struct HealthPolicy {
    /// `None` uses the watchdog's configured grace period
    pub grace: Option<Duration>,
    pub action: FailureAction,
}

impl HealthPolicy {
    pub fn pause() -> Self {
        Self {
            grace: None,
            action: FailureAction::PauseAndAlert,
        }
    }

    pub fn emergency() -> Self {
        Self {
            grace: None,
            action: FailureAction::EmergencyStop,
        }
    }
}

#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> HealthCheckResult;
}

/// Pings the execution venue
pub struct VenueHealthCheck {
    venue: Arc<dyn ExecutionVenue>,
}

impl VenueHealthCheck {
    pub fn new(venue: Arc<dyn ExecutionVenue>) -> Self {
        Self { venue }
    }
}

#[async_trait]
impl HealthCheck for VenueHealthCheck {
    fn name(&self) -> &str {
        "venue_connection"
    }

    async fn check(&self) -> HealthCheckResult {
        match self.venue.ping().await {
            Ok(()) => HealthCheckResult::Ok,
            Err(e) => HealthCheckResult::Failed(e.to_string()),
        }
    }
}

/// Timestamp of the newest market data, shared with the control loop
#[derive(Debug, Clone, Default)]
pub struct DataClock {
    last: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl DataClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn touch(&self, at: DateTime<Utc>) {
        let mut last = self.last.write().await;
        if last.map(|l| at > l).unwrap_or(true) {
            *last = Some(at);
        }
    }

    pub async fn last(&self) -> Option<DateTime<Utc>> {
        *self.last.read().await
    }
}

/// Fails when market data is older than `max_age`; warns past half of it
pub struct DataFreshnessCheck {
    clock: DataClock,
    max_age: chrono::Duration,
}

impl DataFreshnessCheck {
    pub fn new(clock: DataClock, max_age_secs: u64) -> Self {
        Self {
            clock,
            max_age: chrono::Duration::seconds(max_age_secs as i64),
        }
    }
}

#[async_trait]
impl HealthCheck for DataFreshnessCheck {
    fn name(&self) -> &str {
        "data_freshness"
    }

    async fn check(&self) -> HealthCheckResult {
        let Some(last) = self.clock.last().await else {
            return HealthCheckResult::Warning("no market data received yet".into());
        };
        let age = Utc::now() - last;
        if age > self.max_age {
            HealthCheckResult::Failed(format!("market data is {}s old", age.num_seconds()))
        } else if age > self.max_age / 2 {
            HealthCheckResult::Warning(format!("market data is {}s old", age.num_seconds()))
        } else {
            HealthCheckResult::Ok
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_data_freshness() {
        let clock = DataClock::new();
        let check = DataFreshnessCheck::new(clock.clone(), 60);
        assert!(matches!(check.check().await, HealthCheckResult::Warning(_)));

        clock.touch(Utc::now() - chrono::Duration::seconds(120)).await;
        assert!(check.check().await.is_failure());

        clock.touch(Utc::now()).await;
        assert_eq!(check.check().await, HealthCheckResult::Ok);
    }

    #[test]
    fn test_timeout_is_failure() {
        assert!(HealthCheckResult::Timeout.is_failure());
        assert!(!HealthCheckResult::Warning("slow".into()).is_failure());
    }
}
