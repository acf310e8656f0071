//! Request and response bodies.

use call_core::models::EndReason;
use serde::{Deserialize, Serialize};

/// Body of `POST /v1/calls/end`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndCallRequest {
    /// Validated by the handler so a malformed id maps to `INVALID_ARGUMENT`.
    pub room_id: String,

    /// Defaults to `user_ended`.
    #[serde(default)]
    pub reason: Option<EndReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndCallResponse {
    pub success: bool,
    pub message: String,
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthResponse {
    /// `healthy` or `unhealthy`.
    pub status: String,

    /// Store backend name.
    pub backend: String,

    /// Store reachability; omitted when not checked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_end_call_request_reason_is_optional() {
        let request: EndCallRequest = serde_json::from_str(r#"{"roomId":"room1"}"#).unwrap();
        assert_eq!(request.room_id, "room1");
        assert_eq!(request.reason, None);

        let request: EndCallRequest =
            serde_json::from_str(r#"{"roomId":"room1","reason":"timer_ended"}"#).unwrap();
        assert_eq!(request.reason, Some(EndReason::TimerEnded));
    }

    #[test]
    fn test_end_call_request_rejects_unknown_reason() {
        let result = serde_json::from_str::<EndCallRequest>(r#"{"roomId":"r","reason":"bored"}"#);
        assert!(result.is_err());
    }
}
