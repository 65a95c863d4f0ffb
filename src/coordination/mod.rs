//! Process-wide coordination primitives
//!
//! - Emergency stop latch shared by risk, watchdog, execution and the loop
//! - Graceful shutdown fan-out

pub mod emergency_stop;
pub mod shutdown;

pub use emergency_stop::{EmergencyReason, EmergencyState, EmergencyStop};
pub use shutdown::{GracefulShutdown, ShutdownSignal};
