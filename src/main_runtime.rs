use futures::FutureExt;
use gridpilot::api::{self, AppState};
use gridpilot::config::{AppConfig, ConfigWatcher, LoggingConfig};
use gridpilot::coordination::{EmergencyStop, GracefulShutdown, ShutdownSignal};
use gridpilot::coordinator::{ControlLoop, LoopParts, CONTROL_LOOP_COMPONENT};
use gridpilot::error::{PilotError, Result};
use gridpilot::exchange::build_venue;
use gridpilot::execution::ExecutionManager;
use gridpilot::levels::{load_scenarios, LevelPool};
use gridpilot::risk::RiskManager;
use gridpilot::supervisor::{
    DataClock, DataFreshnessCheck, HealthPolicy, RecoveryFn, VenueHealthCheck, Watchdog,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const CONFIG_POLL_SECS: u64 = 5;
const SHUTDOWN_GRACE_SECS: u64 = 10;

pub fn init_logging(logging: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},gridpilot=debug", logging.level)));

    // File logging only when GRIDPILOT_LOG_DIR is set
    let file_layer = std::env::var("GRIDPILOT_LOG_DIR").ok().and_then(|log_dir| {
        // `rolling::daily` panics if it cannot create the first file
        if let Err(e) = std::fs::create_dir_all(&log_dir) {
            eprintln!(
                "Warning: Could not create log directory {} ({}), file logging disabled",
                log_dir, e
            );
            return None;
        }
        let test_path = Path::new(&log_dir).join(".gridpilot_write_test");
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&test_path)
        {
            Ok(_) => {
                let _ = std::fs::remove_file(&test_path);
                let file_appender = tracing_appender::rolling::daily(&log_dir, "gridpilot.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
                // Keep the guard alive for the life of the process
                Box::leak(Box::new(guard));
                eprintln!("Logging to: {}/gridpilot.log", log_dir);
                Some(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!(
                    "Warning: Could not write to log directory {} ({}), file logging disabled",
                    log_dir, e
                );
                None
            }
        }
    });

    let (console_plain, console_json) = if logging.json {
        (None, Some(tracing_subscriber::fmt::layer().json().with_target(true)))
    } else {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
            None,
        )
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_plain)
        .with(console_json)
        .with(file_layer)
        .init();
}

pub fn init_logging_simple() {
    // Minimal logging for one-shot commands
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

/// Load and validate configuration, folding problems into one error
pub fn load_config(config_dir: &Path) -> Result<AppConfig> {
    let config = AppConfig::load_from(config_dir)?;
    config
        .validate()
        .map_err(|problems| PilotError::Validation(problems.join("; ")))?;
    Ok(config)
}

async fn load_levels(pool: &LevelPool, config: &AppConfig) -> Result<()> {
    if let Some(path) = &config.levels.snapshot_path {
        if path.exists() {
            let restored = pool.load_json(path).await?;
            info!(path = %path.display(), restored, "pool snapshot restored");
        }
    }
    if let Some(path) = &config.levels.scenarios_path {
        if path.exists() {
            let scenarios = load_scenarios(path)?;
            pool.import_scenarios(&scenarios).await;
        } else {
            warn!(path = %path.display(), "scenario file not found");
        }
    }
    if pool.stats().await.total == 0 {
        warn!("level pool is empty; the loop will only supervise");
    }
    Ok(())
}

fn control_loop_recovery(handle: gridpilot::ControllerHandle) -> RecoveryFn {
    Arc::new(move |component: String| {
        let handle = handle.clone();
        async move {
            if component != CONTROL_LOOP_COMPONENT {
                return Err(format!("no recovery action for {component}"));
            }
            // A completed cycle heartbeats, which is what the watchdog waits for.
            // The watchdog bounds this call with watchdog.recovery_timeout_secs.
            let report = handle.trigger_cycle().await.map_err(|e| e.to_string())?;
            info!(cycle = report.cycle, "control loop answered recovery cycle");
            Ok(())
        }
        .boxed()
    })
}

/// Run the full controller until a shutdown signal
pub async fn run_controller(config_dir: &Path, config: AppConfig, serve_api: bool) -> Result<()> {
    info!(
        mode = %config.controller.mode,
        venue = %config.venue.kind,
        "gridpilot starting"
    );

    let shutdown = Arc::new(GracefulShutdown::new());
    let emergency = Arc::new(EmergencyStop::new());

    let pool = Arc::new(LevelPool::new(config.levels.reactivation_cooldown_secs));
    load_levels(&pool, &config).await?;

    let (venue, paper) = build_venue(config.venue.kind, &config.bridge, &config.paper)?;
    let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();
    if let Some(paper) = &paper {
        tasks.push(("paper_feed", paper.spawn_simulator(shutdown.subscribe())));
    }

    let risk = Arc::new(RiskManager::new(config.risk.clone(), emergency.clone()));
    let execution = Arc::new(ExecutionManager::new(
        config.execution.clone(),
        venue.clone(),
        pool.clone(),
        risk.clone(),
        emergency.clone(),
    ));
    tasks.push(("execution", execution.start(shutdown.subscribe())));

    let watchdog = Arc::new(Watchdog::new(config.watchdog.clone(), emergency.clone()));
    let data_clock = DataClock::new();
    watchdog
        .register_check(Arc::new(VenueHealthCheck::new(venue.clone())), HealthPolicy::pause())
        .await;
    watchdog
        .register_check(
            Arc::new(DataFreshnessCheck::new(
                data_clock.clone(),
                config.venue.max_data_age_secs,
            )),
            HealthPolicy::pause(),
        )
        .await;

    let watcher = ConfigWatcher::new(
        config_dir,
        config.clone(),
        Duration::from_secs(CONFIG_POLL_SECS),
    );
    let mut control = ControlLoop::new(
        &config,
        LoopParts {
            pool: pool.clone(),
            risk,
            execution,
            watchdog: watchdog.clone(),
            emergency,
            data_clock,
        },
    )
    .with_config_updates(watcher.subscribe());
    control.warm_up().await;
    let handle = control.handle();

    watchdog.set_recovery(control_loop_recovery(handle.clone())).await;
    let watchdog_task = watchdog.start();
    tasks.push(("config_watcher", watcher.spawn(shutdown.subscribe())));
    tasks.push(("control_loop", tokio::spawn(control.run(shutdown.subscribe()))));

    if serve_api && config.api.enabled {
        let state = AppState::new(handle.clone(), config.api.admin_token.clone());
        let bind = config.api.bind.clone();
        let api_shutdown = shutdown.subscribe();
        let api_trigger = shutdown.clone();
        tasks.push((
            "api",
            tokio::spawn(async move {
                if let Err(e) = api::serve(&bind, state, api_shutdown).await {
                    error!("API server failed: {}", e);
                    api_trigger.trigger(ShutdownSignal::Fatal);
                }
            }),
        ));
    }

    info!("gridpilot running; Ctrl-C to stop");
    {
        let signals = shutdown.clone();
        let mut fatal = shutdown.subscribe();
        tokio::select! {
            _ = signals.listen_for_signals() => {}
            _ = fatal.recv() => {}
        }
    }

    watchdog.stop();
    for (name, task) in tasks {
        match tokio::time::timeout(Duration::from_secs(SHUTDOWN_GRACE_SECS), task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{} task ended abnormally: {}", name, e),
            Err(_) => warn!("{} task did not stop within {}s", name, SHUTDOWN_GRACE_SECS),
        }
    }
    watchdog_task.abort();

    if let Some(path) = &config.levels.snapshot_path {
        match pool.save_json(path).await {
            Ok(()) => info!(path = %path.display(), "pool snapshot saved"),
            Err(e) => warn!("pool snapshot failed: {}", e),
        }
    }
    info!("gridpilot stopped");
    Ok(())
}
