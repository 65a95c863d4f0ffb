#![allow(dead_code)]

use chrono::{DateTime, Utc};
use gridpilot::coordinator::{ControlLoop, ControllerHandle, ControllerMode, LoopParts};
use gridpilot::domain::{Level, Side, Tick};
use gridpilot::exchange::{PaperConfig, PaperVenue};
use gridpilot::supervisor::{DataClock, Watchdog};
use gridpilot::{AppConfig, EmergencyStop, ExecutionManager, LevelPool, RiskManager};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

pub struct Rig {
    pub control: ControlLoop,
    pub handle: ControllerHandle,
    pub venue: Arc<PaperVenue>,
    pub pool: Arc<LevelPool>,
    pub execution: Arc<ExecutionManager>,
    pub risk: Arc<RiskManager>,
    pub emergency: Arc<EmergencyStop>,
    pub watchdog: Arc<Watchdog>,
}

/// Defaults with the score floor removed so thin-history scores still select
pub fn app(mode: ControllerMode) -> AppConfig {
    let mut app = AppConfig::default();
    app.controller.mode = mode;
    app.optimizer.min_score = 0.0;
    app
}

pub fn rig(app: &AppConfig) -> Rig {
    let emergency = Arc::new(EmergencyStop::new());
    let pool = Arc::new(LevelPool::new(app.levels.reactivation_cooldown_secs));
    let risk = Arc::new(RiskManager::new(app.risk.clone(), emergency.clone()));
    let venue = Arc::new(PaperVenue::new(PaperConfig {
        seed: Some(11),
        ..Default::default()
    }));
    let execution = Arc::new(ExecutionManager::new(
        app.execution.clone(),
        venue.clone(),
        pool.clone(),
        risk.clone(),
        emergency.clone(),
    ));
    let watchdog = Arc::new(Watchdog::new(app.watchdog.clone(), emergency.clone()));
    let control = ControlLoop::new(
        app,
        LoopParts {
            pool: pool.clone(),
            risk: risk.clone(),
            execution: execution.clone(),
            watchdog: watchdog.clone(),
            emergency: emergency.clone(),
            data_clock: DataClock::new(),
        },
    );
    let handle = control.handle();
    Rig {
        control,
        handle,
        venue,
        pool,
        execution,
        risk,
        emergency,
        watchdog,
    }
}

pub fn long(id: &str, price: Decimal) -> Level {
    Level::new(id, "TQQQ", Side::Long, price, price + dec!(0.10), 100)
}

pub fn short(id: &str, price: Decimal) -> Level {
    Level::new(id, "TQQQ", Side::Short, price, price - dec!(0.10), 100)
}

pub fn tick(price: Decimal) -> Tick {
    tick_at(price, Utc::now())
}

pub fn tick_at(price: Decimal, at: DateTime<Utc>) -> Tick {
    Tick {
        symbol: "TQQQ".into(),
        price,
        volume: 1_000,
        at,
    }
}

/// Wait until the running loop has completed `n` cycles.
///
/// A spawned loop runs its first cycle immediately, racing any cycle the
/// test triggers, so tests settle on a count before asserting.
pub async fn wait_for_cycles(handle: &ControllerHandle, n: u64) {
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while handle.stats().await.cycles < n {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("control loop did not reach the expected cycle count");
}
