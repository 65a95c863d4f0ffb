//! Watchdog Daemon for Control Loop Supervision
//!
//! Runs on its own task and timer, so a stalled control loop cannot hide
//! its own failure. Components send heartbeats; too many consecutive missed
//! heartbeats start a bounded recovery attempt, and a failed recovery trips
//! the emergency stop. Pluggable health checks run on the same cadence.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::health::{FailureAction, HealthCheck, HealthCheckResult, HealthPolicy};
use crate::coordination::{EmergencyReason, EmergencyStop};

/// Configuration for watchdog
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Interval between supervision passes (default: 5s)
    pub check_interval_secs: u64,
    /// Expected heartbeat cadence (default: 5s)
    pub heartbeat_interval_secs: u64,
    /// Consecutive misses tolerated before recovery (default: 2)
    pub max_missed_heartbeats: u32,
    /// Recovery attempts per incident (default: 2)
    pub recovery_attempts: u32,
    /// Recoveries allowed per window (default: 3 per 300s)
    pub max_recoveries_per_window: u32,
    pub recovery_window_secs: u64,
    /// Wait after each recovery attempt for a heartbeat (default: 1s)
    pub recovery_delay_secs: u64,
    /// Bound on one recovery hook call, at most one check interval (default: 5s)
    pub recovery_timeout_secs: u64,
    pub health_check_timeout_secs: u64,
    /// Default grace period before a failing check acts (default: 30s)
    pub health_check_grace_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 5,
            heartbeat_interval_secs: 5,
            max_missed_heartbeats: 2,
            recovery_attempts: 2,
            max_recoveries_per_window: 3,
            recovery_window_secs: 300,
            recovery_delay_secs: 1,
            recovery_timeout_secs: 5,
            health_check_timeout_secs: 5,
            health_check_grace_secs: 30,
        }
    }
}

impl WatchdogConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.check_interval_secs == 0 || self.heartbeat_interval_secs == 0 {
            problems.push("watchdog intervals must be positive".to_string());
        }
        if self.health_check_timeout_secs == 0 {
            problems.push("watchdog.health_check_timeout_secs must be positive".to_string());
        }
        if self.recovery_timeout_secs == 0 || self.recovery_timeout_secs > self.check_interval_secs {
            problems.push(format!(
                "watchdog.recovery_timeout_secs {} must be in 1..={} (check_interval_secs)",
                self.recovery_timeout_secs, self.check_interval_secs
            ));
        }
        problems
    }
}

/// Component health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Heartbeats arriving on time
    Healthy,
    /// At least one heartbeat missed, within tolerance
    Late,
    /// Recovery in progress
    Recovering,
    /// Recovery failed; emergency stop issued
    Failed,
    /// Registered, not yet started or stopped intentionally
    Stopped,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Late => write!(f, "late"),
            HealthStatus::Recovering => write!(f, "recovering"),
            HealthStatus::Failed => write!(f, "failed"),
            HealthStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Health information for a component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub missed_heartbeats: u32,
    pub recovery_count: u32,
    pub last_error: Option<String>,
}

/// Event emitted by watchdog
#[derive(Debug, Clone, PartialEq)]
pub enum WatchdogEvent {
    HeartbeatMissed { component: String, missed: u32 },
    RecoveryAttempt { component: String, attempt: u32 },
    RecoverySucceeded { component: String },
    RecoveryExhausted { component: String, attempts: u32 },
    EmergencyTriggered { component: String, reason: String },
    CheckFailed { check: String, detail: String },
    CheckRecovered { check: String },
    /// A failing check asks the controller to stop acting autonomously
    PauseRequested { check: String, reason: String },
}

/// Recovery hook; receives the component name
pub type RecoveryFn = Arc<dyn Fn(String) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

#[derive(Debug)]
struct TrackedComponent {
    health: ComponentHealth,
    last_beat: Option<Instant>,
    recovery_times: Vec<Instant>,
}

struct TrackedCheck {
    check: Arc<dyn HealthCheck>,
    policy: HealthPolicy,
    failing_since: Option<Instant>,
    escalated: bool,
    last_result: Option<HealthCheckResult>,
}

/// Snapshot of a registered health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckStatus {
    pub name: String,
    pub last_result: Option<HealthCheckResult>,
    pub escalated: bool,
}

/// Watchdog daemon for monitoring component health
pub struct Watchdog {
    config: RwLock<WatchdogConfig>,
    components: RwLock<HashMap<String, TrackedComponent>>,
    checks: RwLock<Vec<TrackedCheck>>,
    recovery: RwLock<Option<RecoveryFn>>,
    event_tx: broadcast::Sender<WatchdogEvent>,
    running: AtomicBool,
    emergency: Arc<EmergencyStop>,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig, emergency: Arc<EmergencyStop>) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            config: RwLock::new(config),
            components: RwLock::new(HashMap::new()),
            checks: RwLock::new(Vec::new()),
            recovery: RwLock::new(None),
            event_tx,
            running: AtomicBool::new(false),
            emergency,
        }
    }

    /// Subscribe to watchdog events
    pub fn subscribe(&self) -> broadcast::Receiver<WatchdogEvent> {
        self.event_tx.subscribe()
    }

    pub async fn update_config(&self, config: WatchdogConfig) {
        *self.config.write().await = config;
        info!("Watchdog thresholds updated");
    }

    pub async fn set_recovery(&self, recovery: RecoveryFn) {
        *self.recovery.write().await = Some(recovery);
    }

    /// Register a component for monitoring
    pub async fn register(&self, name: &str) {
        let mut components = self.components.write().await;
        components.insert(
            name.to_string(),
            TrackedComponent {
                health: ComponentHealth {
                    name: name.to_string(),
                    status: HealthStatus::Stopped,
                    last_heartbeat: None,
                    missed_heartbeats: 0,
                    recovery_count: 0,
                    last_error: None,
                },
                last_beat: None,
                recovery_times: Vec::new(),
            },
        );
        debug!("Registered component for monitoring: {}", name);
    }

    pub async fn register_check(&self, check: Arc<dyn HealthCheck>, policy: HealthPolicy) {
        info!(check = check.name(), action = ?policy.action, "Registered health check");
        self.checks.write().await.push(TrackedCheck {
            check,
            policy,
            failing_since: None,
            escalated: false,
            last_result: None,
        });
    }

    /// Record heartbeat from a component
    pub async fn heartbeat(&self, name: &str) {
        let mut components = self.components.write().await;
        if let Some(component) = components.get_mut(name) {
            component.last_beat = Some(Instant::now());
            component.health.last_heartbeat = Some(Utc::now());
            component.health.missed_heartbeats = 0;
            if component.health.status != HealthStatus::Healthy {
                if component.health.status != HealthStatus::Stopped {
                    info!("Component {} heartbeat resumed", name);
                }
                component.health.status = HealthStatus::Healthy;
            }
        }
    }

    /// Mark component as stopped; stopped components are not supervised
    pub async fn mark_stopped(&self, name: &str) {
        let mut components = self.components.write().await;
        if let Some(component) = components.get_mut(name) {
            component.health.status = HealthStatus::Stopped;
        }
    }

    pub async fn get_health(&self, name: &str) -> Option<ComponentHealth> {
        let components = self.components.read().await;
        components.get(name).map(|c| c.health.clone())
    }

    pub async fn get_all_health(&self) -> Vec<ComponentHealth> {
        let components = self.components.read().await;
        components.values().map(|c| c.health.clone()).collect()
    }

    pub async fn check_statuses(&self) -> Vec<CheckStatus> {
        let checks = self.checks.read().await;
        checks
            .iter()
            .map(|c| CheckStatus {
                name: c.check.name().to_string(),
                last_result: c.last_result.clone(),
                escalated: c.escalated,
            })
            .collect()
    }

    /// Start the watchdog daemon on its own task
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let watchdog = Arc::clone(self);
        tokio::spawn(async move {
            info!("Watchdog daemon started");
            let mut period = watchdog.config.read().await.check_interval_secs.max(1);
            let mut interval = tokio::time::interval(Duration::from_secs(period));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            while watchdog.running.load(Ordering::SeqCst) {
                interval.tick().await;
                if !watchdog.running.load(Ordering::SeqCst) {
                    break;
                }
                watchdog.supervise().await;

                let configured = watchdog.config.read().await.check_interval_secs.max(1);
                if configured != period {
                    period = configured;
                    interval = tokio::time::interval_at(
                        Instant::now() + Duration::from_secs(period),
                        Duration::from_secs(period),
                    );
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                }
            }
            info!("Watchdog daemon stopped");
        })
    }

    /// Stop the watchdog daemon after its current pass
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// One supervision pass: heartbeats, then health checks. Recoveries
    /// complete before it returns.
    pub async fn run_once(&self) {
        let config = self.config.read().await.clone();
        for name in self.overdue_components(&config).await {
            self.handle_incident(&name, &config).await;
        }
        self.run_health_checks(&config).await;
    }

    /// Daemon pass: incidents recover on their own tasks so health checks
    /// keep their cadence. A component in recovery is skipped by later
    /// passes until its incident resolves.
    async fn supervise(self: &Arc<Self>) {
        let config = self.config.read().await.clone();
        for name in self.overdue_components(&config).await {
            let watchdog = Arc::clone(self);
            let config = config.clone();
            tokio::spawn(async move {
                watchdog.handle_incident(&name, &config).await;
            });
        }
        self.run_health_checks(&config).await;
    }

    async fn overdue_components(&self, config: &WatchdogConfig) -> Vec<String> {
        let now = Instant::now();
        let beat = Duration::from_secs(config.heartbeat_interval_secs.max(1));
        let mut overdue = Vec::new();

        let mut components = self.components.write().await;
        for (name, component) in components.iter_mut() {
            if matches!(
                component.health.status,
                HealthStatus::Stopped | HealthStatus::Failed | HealthStatus::Recovering
            ) {
                continue;
            }
            let Some(last) = component.last_beat else {
                continue;
            };
            let missed = (now.duration_since(last).as_millis() / beat.as_millis()) as u32;
            if missed > component.health.missed_heartbeats {
                let _ = self.event_tx.send(WatchdogEvent::HeartbeatMissed {
                    component: name.clone(),
                    missed,
                });
                warn!("Component {} missed {} heartbeat(s)", name, missed);
            }
            component.health.missed_heartbeats = missed;
            if missed > config.max_missed_heartbeats {
                component.health.status = HealthStatus::Recovering;
                overdue.push(name.clone());
            } else if missed > 0 {
                component.health.status = HealthStatus::Late;
            }
        }
        overdue
    }

    async fn handle_incident(&self, name: &str, config: &WatchdogConfig) {
        let started = Instant::now();
        let window = Duration::from_secs(config.recovery_window_secs);
        let recovery = self.recovery.read().await.clone();
        let hook_timeout = Duration::from_secs(config.recovery_timeout_secs.max(1));
        let mut attempts = 0;

        if let Some(recover) = recovery {
            for attempt in 1..=config.recovery_attempts {
                {
                    let mut components = self.components.write().await;
                    let Some(component) = components.get_mut(name) else {
                        return;
                    };
                    let now = Instant::now();
                    component
                        .recovery_times
                        .retain(|t| now.duration_since(*t) < window);
                    if component.recovery_times.len() >= config.max_recoveries_per_window as usize {
                        warn!("Component {} recovery budget exhausted for this window", name);
                        break;
                    }
                    component.recovery_times.push(now);
                    component.health.recovery_count += 1;
                }
                attempts = attempt;
                let _ = self.event_tx.send(WatchdogEvent::RecoveryAttempt {
                    component: name.to_string(),
                    attempt,
                });
                info!("Recovery attempt #{} for component {}", attempt, name);

                match tokio::time::timeout(hook_timeout, recover(name.to_string())).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Component {} recovery hook failed: {}", name, e),
                    Err(_) => warn!(
                        "Component {} recovery hook timed out after {}s",
                        name,
                        hook_timeout.as_secs()
                    ),
                }
                tokio::time::sleep(Duration::from_secs(config.recovery_delay_secs)).await;

                let resumed = {
                    let components = self.components.read().await;
                    components
                        .get(name)
                        .and_then(|c| c.last_beat)
                        .map(|t| t > started)
                        .unwrap_or(false)
                };
                if resumed {
                    let _ = self.event_tx.send(WatchdogEvent::RecoverySucceeded {
                        component: name.to_string(),
                    });
                    info!("Component {} recovered", name);
                    return;
                }
            }
        }

        let reason = {
            let mut components = self.components.write().await;
            let Some(component) = components.get_mut(name) else {
                return;
            };
            let reason = format!(
                "{} missed {} heartbeats, {} recovery attempt(s) failed",
                name, component.health.missed_heartbeats, attempts
            );
            component.health.status = HealthStatus::Failed;
            component.health.last_error = Some(reason.clone());
            reason
        };

        let _ = self.event_tx.send(WatchdogEvent::RecoveryExhausted {
            component: name.to_string(),
            attempts,
        });
        error!("Component {} unresponsive: {}", name, reason);
        self.emergency
            .trigger(EmergencyReason::WatchdogTimeout(reason.clone()))
            .await;
        let _ = self.event_tx.send(WatchdogEvent::EmergencyTriggered {
            component: name.to_string(),
            reason,
        });
    }

    async fn run_health_checks(&self, config: &WatchdogConfig) {
        let timeout = Duration::from_secs(config.health_check_timeout_secs.max(1));
        let registered: Vec<Arc<dyn HealthCheck>> =
            self.checks.read().await.iter().map(|c| c.check.clone()).collect();

        // Run without holding the lock: checks may call the venue.
        let mut results = Vec::with_capacity(registered.len());
        for check in &registered {
            let result = tokio::time::timeout(timeout, check.check())
                .await
                .unwrap_or(HealthCheckResult::Timeout);
            results.push(result);
        }

        let now = Instant::now();
        let mut actions = Vec::new();
        {
            let mut checks = self.checks.write().await;
            for (tracked, result) in checks.iter_mut().zip(results) {
                let name = tracked.check.name().to_string();
                if result.is_failure() {
                    let since = *tracked.failing_since.get_or_insert(now);
                    if tracked.last_result.as_ref().map(|r| !r.is_failure()).unwrap_or(true) {
                        warn!(check = %name, "Health check failing: {}", result);
                        let _ = self.event_tx.send(WatchdogEvent::CheckFailed {
                            check: name.clone(),
                            detail: result.to_string(),
                        });
                    }
                    let grace = tracked.policy.grace.unwrap_or(Duration::from_secs(config.health_check_grace_secs));
                    if !tracked.escalated && now.duration_since(since) >= grace {
                        tracked.escalated = true;
                        actions.push((name, tracked.policy.action, result.to_string()));
                    }
                } else {
                    if matches!(result, HealthCheckResult::Warning(_)) {
                        debug!(check = %name, "Health check warning: {}", result);
                    }
                    if tracked.failing_since.take().is_some() {
                        info!(check = %name, "Health check recovered");
                        let _ = self.event_tx.send(WatchdogEvent::CheckRecovered { check: name });
                    }
                    tracked.escalated = false;
                }
                tracked.last_result = Some(result);
            }
        }

        for (check, action, detail) in actions {
            let reason = format!("health check {} failing beyond grace: {}", check, detail);
            match action {
                FailureAction::PauseAndAlert => {
                    warn!("{}; requesting pause", reason);
                    let _ = self.event_tx.send(WatchdogEvent::PauseRequested { check, reason });
                }
                FailureAction::EmergencyStop => {
                    self.emergency
                        .trigger(EmergencyReason::HealthCheck(reason.clone()))
                        .await;
                    let _ = self.event_tx.send(WatchdogEvent::EmergencyTriggered {
                        component: check,
                        reason,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct FlakyCheck {
        healthy: AtomicBool,
    }

    #[async_trait]
    impl HealthCheck for FlakyCheck {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn check(&self) -> HealthCheckResult {
            if self.healthy.load(Ordering::SeqCst) {
                HealthCheckResult::Ok
            } else {
                HealthCheckResult::Failed("down".into())
            }
        }
    }

    struct CountingCheck {
        runs: AtomicU32,
    }

    #[async_trait]
    impl HealthCheck for CountingCheck {
        fn name(&self) -> &str {
            "counting"
        }

        async fn check(&self) -> HealthCheckResult {
            self.runs.fetch_add(1, Ordering::SeqCst);
            HealthCheckResult::Ok
        }
    }

    fn watchdog() -> (Arc<Watchdog>, Arc<EmergencyStop>) {
        let stop = Arc::new(EmergencyStop::new());
        (
            Arc::new(Watchdog::new(WatchdogConfig::default(), stop.clone())),
            stop,
        )
    }

    #[tokio::test]
    async fn test_watchdog_register_and_heartbeat() {
        let (watchdog, _) = watchdog();
        watchdog.register("control_loop").await;
        assert_eq!(
            watchdog.get_health("control_loop").await.unwrap().status,
            HealthStatus::Stopped
        );
        watchdog.heartbeat("control_loop").await;
        let health = watchdog.get_health("control_loop").await.unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.last_heartbeat.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_heartbeats_trip_emergency() {
        let (watchdog, stop) = watchdog();
        watchdog.register("control_loop").await;
        watchdog.heartbeat("control_loop").await;

        tokio::time::advance(Duration::from_secs(10)).await;
        watchdog.run_once().await;
        assert!(!stop.is_stopped());
        assert_eq!(
            watchdog.get_health("control_loop").await.unwrap().status,
            HealthStatus::Late
        );

        tokio::time::advance(Duration::from_secs(5)).await;
        watchdog.run_once().await;
        assert!(stop.is_stopped());
        assert_eq!(
            watchdog.get_health("control_loop").await.unwrap().status,
            HealthStatus::Failed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_that_restores_heartbeat() {
        let (watchdog, stop) = watchdog();
        watchdog.register("control_loop").await;
        watchdog.heartbeat("control_loop").await;

        let calls = Arc::new(AtomicU32::new(0));
        let hook_watchdog = Arc::downgrade(&watchdog);
        let hook_calls = calls.clone();
        watchdog
            .set_recovery(Arc::new(move |name: String| -> BoxFuture<'static, Result<(), String>> {
                let watchdog = hook_watchdog.clone();
                let calls = hook_calls.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if let Some(watchdog) = watchdog.upgrade() {
                        watchdog.heartbeat(&name).await;
                    }
                    Ok(())
                })
            }))
            .await;

        tokio::time::advance(Duration::from_secs(15)).await;
        watchdog.run_once().await;
        assert!(!stop.is_stopped());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            watchdog.get_health("control_loop").await.unwrap().status,
            HealthStatus::Healthy
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_check_requests_pause_after_grace() {
        let (watchdog, stop) = watchdog();
        let mut events = watchdog.subscribe();
        let check = Arc::new(FlakyCheck {
            healthy: AtomicBool::new(false),
        });
        watchdog
            .register_check(
                check.clone(),
                HealthPolicy {
                    grace: Some(Duration::from_secs(10)),
                    action: FailureAction::PauseAndAlert,
                },
            )
            .await;

        watchdog.run_once().await;
        tokio::time::advance(Duration::from_secs(11)).await;
        watchdog.run_once().await;

        let mut paused = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, WatchdogEvent::PauseRequested { .. }) {
                paused = true;
            }
        }
        assert!(paused);
        assert!(!stop.is_stopped());

        check.healthy.store(true, Ordering::SeqCst);
        watchdog.run_once().await;
        assert!(matches!(events.try_recv(), Ok(WatchdogEvent::CheckRecovered { .. })));
    }

    #[test]
    fn test_recovery_timeout_must_fit_check_interval() {
        assert!(WatchdogConfig::default().validate().is_empty());
        let config = WatchdogConfig {
            recovery_timeout_secs: 15,
            ..Default::default()
        };
        assert_eq!(config.validate().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_recovery_is_bounded_and_checks_keep_running() {
        let (watchdog, stop) = watchdog();
        let config = WatchdogConfig::default();
        let check = Arc::new(CountingCheck {
            runs: AtomicU32::new(0),
        });
        watchdog
            .register_check(
                check.clone(),
                HealthPolicy {
                    grace: None,
                    action: FailureAction::PauseAndAlert,
                },
            )
            .await;
        watchdog.register("control_loop").await;
        watchdog.heartbeat("control_loop").await;
        // A hook that never answers
        watchdog
            .set_recovery(Arc::new(|_name: String| -> BoxFuture<'static, Result<(), String>> {
                Box::pin(std::future::pending())
            }))
            .await;

        let started = Instant::now();
        let daemon = watchdog.start();
        tokio::time::timeout(Duration::from_secs(120), async {
            while !stop.is_stopped() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .expect("emergency never triggered");

        // Detection after max_missed + 1 silent beats, within one pass,
        // then every attempt capped at timeout + delay.
        let bound = Duration::from_secs(
            (config.max_missed_heartbeats as u64 + 1) * config.heartbeat_interval_secs
                + config.check_interval_secs
                + config.recovery_attempts as u64
                    * (config.recovery_timeout_secs + config.recovery_delay_secs),
        );
        assert!(started.elapsed() <= bound, "took {:?}", started.elapsed());
        assert_eq!(
            watchdog.get_health("control_loop").await.unwrap().status,
            HealthStatus::Failed
        );
        // Passes at 0, 5, 10 and 15s before the incident, more while it ran.
        assert!(check.runs.load(Ordering::SeqCst) >= 5);

        watchdog.stop();
        daemon.abort();
    }
}
