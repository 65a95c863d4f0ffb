use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::analysis::AnalysisConfig;
use crate::coordination::ShutdownSignal;
use crate::coordinator::ControllerConfig;
use crate::domain::FINGERPRINT_LEN;
use crate::exchange::{BridgeConfig, PaperConfig, VenueKind};
use crate::execution::ExecutionConfig;
use crate::risk::RiskLimits;
use crate::strategy::{OptimizerConfig, PatternConfig, PredictorConfig, ScoringConfig};
use crate::supervisor::WatchdogConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub controller: ControllerConfig,
    pub levels: LevelSourceConfig,
    pub analysis: AnalysisConfig,
    pub pattern: PatternConfig,
    pub predictor: PredictorConfig,
    pub scoring: ScoringConfig,
    pub optimizer: OptimizerConfig,
    pub risk: RiskLimits,
    pub watchdog: WatchdogConfig,
    pub execution: ExecutionConfig,
    pub venue: VenueConfig,
    pub paper: PaperConfig,
    pub bridge: BridgeConfig,
    pub logging: LoggingConfig,
    pub api: ApiConfig,
}

/// Where levels come from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelSourceConfig {
    /// Scenario definitions (TOML)
    pub scenarios_path: Option<PathBuf>,
    /// Pool snapshot restored at startup and written on shutdown
    pub snapshot_path: Option<PathBuf>,
    pub reactivation_cooldown_secs: u64,
}

impl Default for LevelSourceConfig {
    fn default() -> Self {
        Self {
            scenarios_path: Some(PathBuf::from("config/scenarios.toml")),
            snapshot_path: None,
            reactivation_cooldown_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VenueConfig {
    pub kind: VenueKind,
    /// Market data older than this fails the freshness check
    pub max_data_age_secs: u64,
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            kind: VenueKind::Paper,
            max_data_age_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Enable JSON formatted logs
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
    /// Bearer token required by control endpoints; open when unset
    pub admin_token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:8787".to_string(),
            admin_token: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific overrides (e.g., config/production.toml)
            .add_source(File::from(environment_file(config_dir)).required(false))
            // Environment variables (GRIDPILOT_RISK__MAX_DAILY_LOSS, etc.)
            .add_source(
                Environment::with_prefix("GRIDPILOT")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values, collecting every problem
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        errors.extend(self.controller.validate());
        errors.extend(self.scoring.weights.validate());
        errors.extend(self.optimizer.validate());
        errors.extend(self.risk.validate());
        errors.extend(self.watchdog.validate());
        errors.extend(self.execution.validate());

        let regime = &self.analysis.regime;
        if !(regime.medium_pct < regime.high_pct && regime.high_pct < regime.extreme_pct) {
            errors.push("analysis.regime bands must be strictly increasing".to_string());
        }
        let volume = &self.analysis.volume;
        if !(volume.low < volume.normal && volume.normal < volume.high && volume.high < volume.extreme) {
            errors.push("analysis.volume bands must be strictly increasing".to_string());
        }
        if self.analysis.atr_short == 0 || self.analysis.atr_short > self.analysis.atr_long {
            errors.push("analysis ATR windows must satisfy 0 < short <= long".to_string());
        }

        if self.pattern.weights.len() != FINGERPRINT_LEN {
            errors.push(format!(
                "pattern.weights must have {} entries, got {}",
                FINGERPRINT_LEN,
                self.pattern.weights.len()
            ));
        }
        if self.pattern.weights.iter().any(|w| *w < 0.0) {
            errors.push("pattern.weights must not be negative".to_string());
        }
        if !(0.0..=1.0).contains(&self.pattern.similarity_threshold) {
            errors.push("pattern.similarity_threshold must be within [0, 1]".to_string());
        }

        let p = &self.predictor;
        if [p.pattern_weight, p.momentum_weight, p.volume_weight, p.time_weight]
            .iter()
            .any(|w| *w < 0.0)
        {
            errors.push("predictor source weights must not be negative".to_string());
        }
        if p.bias_threshold > p.strong_threshold {
            errors.push("predictor.bias_threshold exceeds strong_threshold".to_string());
        }

        if self.api.enabled && self.api.bind.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!("api.bind is not a socket address: {}", self.api.bind));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn environment_file(config_dir: &Path) -> PathBuf {
    let env = std::env::var("GRIDPILOT_ENV").unwrap_or_else(|_| "development".to_string());
    config_dir.join(format!("{env}.toml"))
}

/// Polls the config files and publishes validated reloads
pub struct ConfigWatcher {
    config_dir: PathBuf,
    poll_interval: Duration,
    tx: watch::Sender<AppConfig>,
}

impl ConfigWatcher {
    pub fn new(config_dir: impl Into<PathBuf>, initial: AppConfig, poll_interval: Duration) -> Self {
        let (tx, _) = watch::channel(initial);
        Self {
            config_dir: config_dir.into(),
            poll_interval,
            tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<AppConfig> {
        self.tx.subscribe()
    }

    fn watched_files(&self) -> Vec<PathBuf> {
        vec![
            self.config_dir.join("default.toml"),
            environment_file(&self.config_dir),
        ]
    }

    async fn fingerprint(&self) -> Vec<Option<SystemTime>> {
        let mut stamps = Vec::new();
        for path in self.watched_files() {
            let modified = tokio::fs::metadata(&path)
                .await
                .ok()
                .and_then(|m| m.modified().ok());
            stamps.push(modified);
        }
        stamps
    }

    /// Reload now; publishes only a valid configuration
    pub fn reload(&self) -> bool {
        match AppConfig::load_from(&self.config_dir) {
            Ok(config) => match config.validate() {
                Ok(()) => {
                    self.tx.send_replace(config);
                    info!(dir = %self.config_dir.display(), "configuration reloaded");
                    true
                }
                Err(problems) => {
                    warn!("ignoring invalid configuration: {}", problems.join("; "));
                    false
                }
            },
            Err(e) => {
                warn!("configuration reload failed: {}", e);
                false
            }
        }
    }

    pub fn spawn(self, mut shutdown: broadcast::Receiver<ShutdownSignal>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut last = self.fingerprint().await;
            let mut interval = tokio::time::interval(self.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let current = self.fingerprint().await;
                        if current != last {
                            debug!("configuration files changed");
                            last = current;
                            self.reload();
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.controller.cycle_interval_secs, 30);
        assert_eq!(config.levels.reactivation_cooldown_secs, 120);
    }

    #[test]
    fn test_validation_collects_every_problem() {
        let mut config = AppConfig::default();
        config.pattern.weights = vec![1.0; 4];
        config.optimizer.min_long_ratio = 0.9;
        config.controller.cycle_interval_secs = 0;
        let problems = config.validate().unwrap_err();
        assert_eq!(problems.len(), 3);
        assert!(problems.iter().any(|p| p.contains("pattern.weights")));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("default.toml")).unwrap();
        writeln!(
            file,
            "[controller]\ncycle_interval_secs = 10\nmode = \"autonomous\"\n\n[risk]\nmax_daily_loss = 250\n"
        )
        .unwrap();

        let config = AppConfig::load_from(dir.path()).unwrap();
        assert_eq!(config.controller.cycle_interval_secs, 10);
        assert_eq!(config.controller.mode, crate::coordinator::ControllerMode::Autonomous);
        assert_eq!(config.controller.pending_expiry_secs, 60);
        assert_eq!(config.risk.max_daily_loss, dec!(250));
        assert_eq!(config.optimizer.max_active_per_side, 5);
    }

    #[tokio::test]
    async fn test_watcher_ignores_invalid_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("default.toml");
        std::fs::write(&path, "[controller]\ncycle_interval_secs = 15\n").unwrap();
        let watcher = ConfigWatcher::new(dir.path(), AppConfig::default(), Duration::from_secs(1));
        let rx = watcher.subscribe();

        assert!(watcher.reload());
        assert_eq!(rx.borrow().controller.cycle_interval_secs, 15);

        std::fs::write(&path, "[controller]\ncycle_interval_secs = 0\n").unwrap();
        assert!(!watcher.reload());
        assert_eq!(rx.borrow().controller.cycle_interval_secs, 15);
    }
}
