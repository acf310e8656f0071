//! End-call handler.

use crate::auth::Claims;
use crate::errors::ControllerError;
use crate::models::{EndCallRequest, EndCallResponse};
use crate::observability::metrics::record_end_call;
use crate::routes::AppState;
use axum::{extract::rejection::JsonRejection, extract::State, Extension, Json};
use call_core::models::EndReason;
use call_core::room::EndOutcome;
use common::types::RoomId;
use std::sync::Arc;
use tracing::instrument;

/// Handler for `POST /v1/calls/end`.
///
/// Ends the room on behalf of the authenticated caller. Ending an already
/// ended room succeeds without changing it.
///
/// ## Response
///
/// ```json
/// { "success": true, "message": "Call ended." }
/// ```
#[instrument(skip_all, name = "cc.calls.end")]
pub async fn end_call(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    payload: Result<Json<EndCallRequest>, JsonRejection>,
) -> Result<Json<EndCallResponse>, ControllerError> {
    let result = end_call_inner(&state, &claims, payload).await;
    match &result {
        Ok((outcome, _)) => record_end_call(outcome.as_str()),
        Err(e) => record_end_call(e.error_code()),
    }
    result.map(|(_, response)| Json(response))
}

async fn end_call_inner(
    state: &AppState,
    claims: &Claims,
    payload: Result<Json<EndCallRequest>, JsonRejection>,
) -> Result<(EndOutcome, EndCallResponse), ControllerError> {
    let user_id = claims
        .user_id()
        .map_err(|_| ControllerError::InvalidToken("The access token is invalid or expired".to_string()))?;

    let Json(request) = payload.map_err(|e| {
        tracing::debug!(target: "cc.http", error = %e, "Rejected end-call body");
        ControllerError::InvalidArgument("Request body must be {\"roomId\": string}".to_string())
    })?;

    let room_id = RoomId::parse(request.room_id)
        .map_err(|_| ControllerError::InvalidArgument("roomId is not a valid room id".to_string()))?;
    let reason = request.reason.unwrap_or(EndReason::UserEnded);

    let outcome = state.rooms.end_call(&user_id, &room_id, reason).await?;
    tracing::info!(
        target: "cc.http",
        room_id = %room_id,
        user_id = %user_id,
        outcome = outcome.as_str(),
        "End call handled"
    );

    let message = match outcome {
        EndOutcome::Ended => "Call ended.",
        EndOutcome::AlreadyEnded => "Already ended.",
    };
    Ok((
        outcome,
        EndCallResponse {
            success: true,
            message: message.to_string(),
        },
    ))
}
