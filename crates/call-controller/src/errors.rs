//! Call Controller error types.
//!
//! All errors map to HTTP status codes via the `IntoResponse` impl.
//! Messages returned to clients are generic; store failures are logged
//! server-side only.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use call_core::CallError;
use serde::Serialize;
use thiserror::Error;

/// Call Controller error type.
///
/// Maps to HTTP status codes:
/// - InvalidToken: 401 Unauthorized
/// - InvalidArgument: 400 Bad Request
/// - NotFound: 404 Not Found
/// - PermissionDenied: 403 Forbidden
/// - Store, Internal: 500 Internal Server Error
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Internal server error")]
    Internal,
}

impl ControllerError {
    /// Returns the HTTP status code for this error.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            ControllerError::InvalidToken(_) => 401,
            ControllerError::InvalidArgument(_) => 400,
            ControllerError::NotFound(_) => 404,
            ControllerError::PermissionDenied(_) => 403,
            ControllerError::Store(_) | ControllerError::Internal => 500,
        }
    }

    /// Returns the error code placed in the response body.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            ControllerError::InvalidToken(_) => "UNAUTHENTICATED",
            ControllerError::InvalidArgument(_) => "INVALID_ARGUMENT",
            ControllerError::NotFound(_) => "NOT_FOUND",
            ControllerError::PermissionDenied(_) => "PERMISSION_DENIED",
            ControllerError::Store(_) | ControllerError::Internal => "INTERNAL",
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for ControllerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ControllerError::InvalidToken(reason) => (StatusCode::UNAUTHORIZED, reason.clone()),
            ControllerError::InvalidArgument(reason) => (StatusCode::BAD_REQUEST, reason.clone()),
            ControllerError::NotFound(resource) => (StatusCode::NOT_FOUND, resource.clone()),
            ControllerError::PermissionDenied(reason) => (StatusCode::FORBIDDEN, reason.clone()),
            ControllerError::Store(err) => {
                tracing::error!(target: "cc.http", error = %err, "Store operation failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal error occurred".to_string(),
                )
            }
            ControllerError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "An internal error occurred".to_string(),
            ),
        };

        let error_response = ErrorResponse {
            error: ErrorDetail {
                code: self.error_code().to_string(),
                message,
            },
        };

        let mut response = (status, Json(error_response)).into_response();

        if status == StatusCode::UNAUTHORIZED {
            if let Ok(header_value) =
                "Bearer realm=\"call-controller\", error=\"invalid_token\"".parse()
            {
                response
                    .headers_mut()
                    .insert("WWW-Authenticate", header_value);
            }
        }

        response
    }
}

impl From<CallError> for ControllerError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::InvalidArgument(_) => {
                ControllerError::InvalidArgument("roomId is not a valid room id".to_string())
            }
            CallError::RoomNotFound(_) | CallError::NotOffered(_) => {
                ControllerError::NotFound("Room not found".to_string())
            }
            CallError::PermissionDenied(_) => ControllerError::PermissionDenied(
                "Caller is not a participant of this room".to_string(),
            ),
            CallError::Store(e) => ControllerError::Store(e.to_string()),
            other => {
                tracing::error!(target: "cc.http", error = %other, "Call operation failed");
                ControllerError::Internal
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use call_store::StoreError;
    use http_body_util::BodyExt;

    async fn read_body_json(body: Body) -> serde_json::Value {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_status_and_code_mapping() {
        let cases = [
            (ControllerError::InvalidToken("x".to_string()), 401, "UNAUTHENTICATED"),
            (ControllerError::InvalidArgument("x".to_string()), 400, "INVALID_ARGUMENT"),
            (ControllerError::NotFound("x".to_string()), 404, "NOT_FOUND"),
            (ControllerError::PermissionDenied("x".to_string()), 403, "PERMISSION_DENIED"),
            (ControllerError::Store("x".to_string()), 500, "INTERNAL"),
            (ControllerError::Internal, 500, "INTERNAL"),
        ];
        for (error, status, code) in cases {
            assert_eq!(error.status_code(), status, "{error}");
            assert_eq!(error.error_code(), code, "{error}");
        }
    }

    #[test]
    fn test_from_call_error() {
        let mapped: ControllerError = CallError::RoomNotFound("room1".to_string()).into();
        assert!(matches!(mapped, ControllerError::NotFound(_)));

        let mapped: ControllerError = CallError::PermissionDenied("mallory".to_string()).into();
        assert!(matches!(mapped, ControllerError::PermissionDenied(_)));

        let mapped: ControllerError = CallError::InvalidArgument("bad".to_string()).into();
        assert!(matches!(mapped, ControllerError::InvalidArgument(_)));

        let mapped: ControllerError = CallError::Store(StoreError::Closed).into();
        assert!(matches!(mapped, ControllerError::Store(_)));

        let mapped: ControllerError = CallError::Contention("end room1".to_string()).into();
        assert!(matches!(mapped, ControllerError::Internal));
    }

    #[tokio::test]
    async fn test_unauthorized_response_has_www_authenticate() {
        let response =
            ControllerError::InvalidToken("The access token is invalid or expired".to_string())
                .into_response();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let header = response
            .headers()
            .get("WWW-Authenticate")
            .and_then(|v| v.to_str().ok())
            .unwrap();
        assert!(header.starts_with("Bearer"));
        assert!(header.contains("invalid_token"));

        let body = read_body_json(response.into_body()).await;
        assert_eq!(body["error"]["code"], "UNAUTHENTICATED");
        assert_eq!(body["error"]["message"], "The access token is invalid or expired");
    }

    #[tokio::test]
    async fn test_store_error_message_is_generic() {
        let response =
            ControllerError::Store("connection refused at 10.0.0.7:6379".to_string()).into_response();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().get("WWW-Authenticate").is_none());

        let body = read_body_json(response.into_body()).await;
        assert_eq!(body["error"]["code"], "INTERNAL");
        assert_eq!(body["error"]["message"], "An internal error occurred");
    }

    #[tokio::test]
    async fn test_forbidden_response_body() {
        let response =
            ControllerError::PermissionDenied("Caller is not a participant".to_string())
                .into_response();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = read_body_json(response.into_body()).await;
        assert_eq!(body["error"]["code"], "PERMISSION_DENIED");
    }
}
