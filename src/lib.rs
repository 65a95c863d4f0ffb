pub mod analysis;
pub mod api;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod execution;
pub mod levels;
pub mod risk;
pub mod strategy;
pub mod supervisor;

pub use config::{AppConfig, ConfigWatcher};
pub use coordination::{EmergencyReason, EmergencyStop, GracefulShutdown, ShutdownSignal};
pub use coordinator::{
    ControlLoop, ControllerHandle, ControllerMode, CycleReport, LoopParts, PendingDecision,
};
pub use domain::{DecisionOutcome, DecisionRecord, Level, LevelStatus, Plan, ScoreRecord, Side};
pub use error::{PilotError, Result};
pub use exchange::{ExecutionVenue, PaperVenue, VenueKind};
pub use execution::{ExecutionConfig, ExecutionManager};
pub use levels::{LevelFilter, LevelPool, Scenario};
pub use risk::{RiskLimits, RiskManager, RiskState};
pub use supervisor::{ComponentHealth, Watchdog, WatchdogConfig};
