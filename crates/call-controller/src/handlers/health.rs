//! Health check handler.

use crate::models::HealthResponse;
use crate::routes::AppState;
use axum::extract::State;
use axum::Json;
use call_store::DocumentStore;
use std::sync::Arc;
use tracing::instrument;

/// Health check handler.
///
/// Reads the store clock to verify the backend is reachable. Always
/// answers 200 so liveness checks can read the body.
///
/// ```json
/// { "status": "healthy", "backend": "redis", "store": "healthy" }
/// ```
#[instrument(skip_all, name = "cc.health.check")]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let store_healthy = match state.store.server_time().await {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(target: "cc.http", error = %e, "Store health check failed");
            false
        }
    };
    let status = if store_healthy { "healthy" } else { "unhealthy" };

    Json(HealthResponse {
        status: status.to_string(),
        backend: state.config.store_backend.as_str().to_string(),
        store: Some(status.to_string()),
    })
}
