use axum::{
    routing::{get, post},
    Router,
};
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api::{handlers, state::AppState};
use crate::coordination::ShutdownSignal;
use crate::error::{PilotError, Result};

pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_handler))
        // Query endpoints
        .route("/api/decisions", get(handlers::list_decisions))
        .route("/api/risk", get(handlers::get_risk_state))
        .route("/api/levels/active", get(handlers::get_active_levels))
        .route("/api/scores/:level_id", get(handlers::get_score_breakdown))
        .route("/api/pending", get(handlers::list_pending))
        .route("/api/stats", get(handlers::get_stats))
        // Control endpoints
        .route("/api/mode", post(handlers::set_mode))
        .route("/api/pending/:id/confirm", post(handlers::confirm_pending))
        .route("/api/pending/:id/reject", post(handlers::reject_pending))
        .route("/api/cycle", post(handlers::trigger_cycle))
        .route("/api/emergency/reset", post(handlers::reset_emergency))
        .with_state(state)
        .layer(cors)
}

/// Serve the API until shutdown is signalled
pub async fn serve(
    bind: &str,
    state: AppState,
    mut shutdown: broadcast::Receiver<ShutdownSignal>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("API listening on {}", listener.local_addr()?);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
        .map_err(|e| PilotError::Internal(format!("api server: {e}")))
}
