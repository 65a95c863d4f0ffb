//! Control Loop
//!
//! Periodic decision cycle over the level pool, the decision history and
//! the query/control surface exposed through `ControllerHandle`.

pub mod command;
pub mod config;
pub mod controller;
pub mod state;

pub use command::{ControlCommand, ControllerMode, CycleReport};
pub use config::ControllerConfig;
pub use controller::{
    ControlLoop, ControllerHandle, ControllerHealth, LoopParts, CONTROL_LOOP_COMPONENT,
};
pub use state::{ControllerStats, DecisionHistory, PendingDecision, SharedState};
