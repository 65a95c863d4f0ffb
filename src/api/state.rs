use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::coordinator::ControllerHandle;

/// Shared application state for API handlers
#[derive(Clone)]
pub struct AppState {
    pub controller: ControllerHandle,

    /// Token control endpoints expect; `None` leaves them open
    pub admin_token: Option<Arc<str>>,

    /// Application start time
    pub start_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(controller: ControllerHandle, admin_token: Option<String>) -> Self {
        Self {
            controller,
            admin_token: admin_token
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .map(Arc::from),
            start_time: Utc::now(),
        }
    }

    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.start_time).num_seconds()
    }
}
