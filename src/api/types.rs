use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::coordinator::{ControllerHealth, ControllerMode};

// ============================================================================
// Query Types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct DecisionQuery {
    pub since: Option<DateTime<Utc>>,
    /// Keep only the newest `limit` records
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// "ok", "degraded" or "emergency"
    pub status: String,
    pub uptime_secs: i64,
    pub version: String,
    #[serde(flatten)]
    pub detail: ControllerHealth,
}

// ============================================================================
// Control Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeRequest {
    pub mode: ControllerMode,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeResponse {
    pub previous: ControllerMode,
    pub current: ControllerMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmResponse {
    pub pending_id: Uuid,
    pub command_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub success: bool,
    pub message: String,
}
