pub mod control;
pub mod query;

pub use control::*;
pub use query::*;

use axum::http::StatusCode;

use crate::error::PilotError;

pub(crate) type ApiError = (StatusCode, String);

/// Map controller errors onto HTTP statuses
pub(crate) fn api_error(err: PilotError) -> ApiError {
    let status = match &err {
        PilotError::PendingDecisionNotFound(_) | PilotError::LevelNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        PilotError::InvalidState(_) | PilotError::EmergencyActive(_) => StatusCode::CONFLICT,
        PilotError::Validation(_) | PilotError::LimitBreach(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        PilotError::ChannelClosed(_) | PilotError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}
