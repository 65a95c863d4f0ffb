use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use tracing::info;
use uuid::Uuid;

use super::{api_error, ApiError};
use crate::api::{
    auth::{ensure_admin_authorized, operator_name},
    state::AppState,
    types::*,
};
use crate::coordinator::CycleReport;

/// POST /api/mode
pub async fn set_mode(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ModeRequest>,
) -> std::result::Result<Json<ModeResponse>, ApiError> {
    ensure_admin_authorized(&state, &headers)?;
    let operator = operator_name(&headers);
    let reason = req
        .reason
        .filter(|r| !r.trim().is_empty())
        .map(|r| format!("{operator}: {r}"))
        .unwrap_or_else(|| format!("{operator}: mode change via api"));

    let previous = state
        .controller
        .set_mode(req.mode, reason)
        .await
        .map_err(api_error)?;
    info!(operator = %operator, from = %previous, to = %req.mode, "mode changed via api");

    Ok(Json(ModeResponse {
        previous,
        current: req.mode,
    }))
}

/// POST /api/pending/:id/confirm
pub async fn confirm_pending(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> std::result::Result<Json<ConfirmResponse>, ApiError> {
    ensure_admin_authorized(&state, &headers)?;
    let command_ids = state
        .controller
        .confirm_pending_decision(id)
        .await
        .map_err(api_error)?;
    info!(pending_id = %id, operator = %operator_name(&headers), commands = command_ids.len(), "pending plan confirmed");

    Ok(Json(ConfirmResponse {
        pending_id: id,
        command_ids,
    }))
}

/// POST /api/pending/:id/reject
pub async fn reject_pending(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> std::result::Result<Json<ControlResponse>, ApiError> {
    ensure_admin_authorized(&state, &headers)?;
    state
        .controller
        .reject_pending_decision(id)
        .await
        .map_err(api_error)?;

    Ok(Json(ControlResponse {
        success: true,
        message: format!("pending decision {id} rejected"),
    }))
}

/// POST /api/cycle
pub async fn trigger_cycle(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<Json<CycleReport>, ApiError> {
    ensure_admin_authorized(&state, &headers)?;
    let report = state.controller.trigger_cycle().await.map_err(api_error)?;
    Ok(Json(report))
}

/// POST /api/emergency/reset
pub async fn reset_emergency(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<Json<ControlResponse>, ApiError> {
    ensure_admin_authorized(&state, &headers)?;
    let operator = operator_name(&headers);
    state
        .controller
        .reset_emergency(operator.clone())
        .await
        .map_err(api_error)?;

    Ok(Json(ControlResponse {
        success: true,
        message: format!("emergency latch cleared by {operator}"),
    }))
}
