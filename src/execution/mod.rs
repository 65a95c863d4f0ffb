//! Command pipeline to the venue
//!
//! Plans become prioritized commands drained by one worker with retry,
//! backoff and emergency preemption. Deactivated fills are tracked as
//! orphans until a profitable close.

pub mod command;
pub mod manager;
pub mod orphan;
pub mod queue;

pub use command::{CloseSpec, Command, CommandKind, CommandPriority, CommandStatus, CommandTarget};
pub use manager::{ExecutionConfig, ExecutionEvent, ExecutionManager, ExecutionStats};
pub use orphan::{OrphanBook, OrphanPosition};
pub use queue::{CommandQueue, QueueStats};
