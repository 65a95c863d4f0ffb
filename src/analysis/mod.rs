//! Market analysis: volatility, volume, session phase and snapshots

pub mod phase;
pub mod snapshot;
pub mod volatility;
pub mod volume;

pub use phase::TradingSchedule;
pub use snapshot::{AnalysisConfig, SnapshotBuilder};
pub use volatility::RegimeBands;
pub use volume::VolumeBands;
