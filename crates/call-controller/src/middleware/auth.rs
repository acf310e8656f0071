//! Authentication middleware for protected routes.
//!
//! Extracts the Bearer token from the Authorization header, validates it,
//! and injects the claims into request extensions.

use crate::auth::JwtValidator;
use crate::errors::ControllerError;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::IntoResponse,
};
use std::sync::Arc;
use tracing::instrument;

/// State for the authentication middleware.
#[derive(Clone)]
pub struct AuthState {
    pub jwt_validator: Arc<JwtValidator>,
}

/// Reject the request with 401 unless it carries a valid bearer token.
///
/// ```text
/// Authorization: Bearer <token>
/// ```
#[instrument(skip_all, name = "cc.middleware.auth")]
pub async fn require_auth(
    State(state): State<Arc<AuthState>>,
    mut req: Request,
    next: Next,
) -> Result<impl IntoResponse, ControllerError> {
    let auth_header = req
        .headers()
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| {
            tracing::debug!(target: "cc.auth", "Missing Authorization header");
            ControllerError::InvalidToken("Missing Authorization header".to_string())
        })?;

    let token = auth_header.strip_prefix("Bearer ").ok_or_else(|| {
        tracing::debug!(target: "cc.auth", "Invalid Authorization header format");
        ControllerError::InvalidToken("Invalid Authorization header format".to_string())
    })?;

    let claims = state.jwt_validator.validate(token.trim())?;
    req.extensions_mut().insert(claims);

    Ok(next.run(req).await)
}
