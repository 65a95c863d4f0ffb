//! Supervision: heartbeat watchdog and health checks
//!
//! The watchdog runs on its own task, independent of the control loop it
//! supervises.

pub mod health;
pub mod watchdog;

pub use health::{
    DataClock, DataFreshnessCheck, FailureAction, HealthCheck, HealthCheckResult, HealthPolicy,
    VenueHealthCheck,
};
pub use watchdog::{
    CheckStatus, ComponentHealth, HealthStatus, RecoveryFn, Watchdog, WatchdogConfig,
    WatchdogEvent,
};
