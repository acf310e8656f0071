//! Router and shared handler state.

use crate::auth::JwtValidator;
use crate::config::Config;
use crate::handlers::{end_call, health_check, metrics_handler};
use crate::middleware::{http_metrics_middleware, require_auth, AuthState};
use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use call_core::room::RoomController;
use call_store::SharedStore;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Upper bound on one request, store retries included.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// State behind every `/v1` handler.
#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,

    /// Room transitions over `store`.
    pub rooms: RoomController,

    pub config: Config,
}

impl AppState {
    #[must_use]
    pub fn new(store: SharedStore, config: Config) -> Self {
        let rooms = RoomController::new(Arc::clone(&store), config.call.clone());
        Self {
            store,
            rooms,
            config,
        }
    }
}

/// The `/v1` API. Only `POST /calls/end` needs a bearer token.
fn api_router(state: Arc<AppState>) -> Router {
    let auth = Arc::new(AuthState {
        jwt_validator: Arc::new(JwtValidator::new(
            &state.config.auth_secret,
            state.config.jwt_clock_skew_seconds,
        )),
    });

    let calls = Router::new()
        .route("/calls/end", post(end_call))
        .route_layer(from_fn_with_state(auth, require_auth));

    Router::new()
        .route("/health", get(health_check))
        .merge(calls)
        .with_state(state)
}

/// Full application router.
///
/// `/metrics` sits outside `/v1` so scrapes never touch the store. The
/// metrics middleware wraps everything, so timeouts and unknown routes are
/// counted too.
pub fn build_routes(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let scrape = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics_handle);

    Router::new()
        .nest("/v1", api_router(state))
        .merge(scrape)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(from_fn(http_metrics_middleware))
}
