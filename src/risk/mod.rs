//! Risk limits, state and the Risk Manager

pub mod limits;
pub mod manager;

pub use limits::{BlackSwanConfig, LimitBand, LimitCheck, LimitKind, RiskLevel, RiskLimits};
pub use manager::{OpenExposure, RiskManager, RiskState};
