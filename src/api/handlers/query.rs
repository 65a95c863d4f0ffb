use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};

use super::ApiError;
use crate::api::{state::AppState, types::*};
use crate::coordinator::{ControllerStats, PendingDecision};
use crate::domain::{DecisionRecord, Level, ScoreRecord};
use crate::risk::{RiskLevel, RiskState};
use crate::supervisor::HealthStatus;

/// GET /health
pub async fn health_handler(
    State(state): State<AppState>,
) -> std::result::Result<Json<HealthResponse>, (StatusCode, Json<HealthResponse>)> {
    let detail = state.controller.health().await;
    let degraded = detail.components.iter().any(|c| {
        matches!(
            c.status,
            HealthStatus::Late | HealthStatus::Recovering | HealthStatus::Failed
        )
    }) || detail.checks.iter().any(|c| c.escalated);

    let status = if detail.emergency.active || detail.risk_level == RiskLevel::Emergency {
        "emergency"
    } else if degraded {
        "degraded"
    } else {
        "ok"
    };
    let resp = HealthResponse {
        status: status.to_string(),
        uptime_secs: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        detail,
    };

    if status == "emergency" {
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(resp)))
    } else {
        Ok(Json(resp))
    }
}

/// GET /api/decisions?since=&limit=
pub async fn list_decisions(
    State(state): State<AppState>,
    Query(query): Query<DecisionQuery>,
) -> Json<Vec<DecisionRecord>> {
    let mut records = state.controller.list_decisions(query.since).await;
    if let Some(limit) = query.limit {
        let skip = records.len().saturating_sub(limit);
        records.drain(..skip);
    }
    Json(records)
}

/// GET /api/risk
pub async fn get_risk_state(State(state): State<AppState>) -> Json<RiskState> {
    Json(state.controller.get_risk_state().await)
}

/// GET /api/levels/active
pub async fn get_active_levels(State(state): State<AppState>) -> Json<Vec<Level>> {
    Json(state.controller.get_active_levels().await)
}

/// GET /api/scores/:level_id
pub async fn get_score_breakdown(
    State(state): State<AppState>,
    Path(level_id): Path<String>,
) -> std::result::Result<Json<ScoreRecord>, ApiError> {
    state
        .controller
        .get_score_breakdown(&level_id)
        .map(Json)
        .ok_or((
            StatusCode::NOT_FOUND,
            format!("no score recorded for level {level_id}"),
        ))
}

/// GET /api/pending
pub async fn list_pending(State(state): State<AppState>) -> Json<Vec<PendingDecision>> {
    Json(state.controller.pending().await)
}

/// GET /api/stats
pub async fn get_stats(State(state): State<AppState>) -> Json<ControllerStats> {
    Json(state.controller.stats().await)
}
