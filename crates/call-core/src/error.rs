//! Call core error types.
//!
//! Precondition races never surface here: a pairing attempt that loses a
//! race reports an outcome, not an error. What remains maps onto the
//! conditions callers of `endCall` can act on, plus store and device failures.

use crate::media::MediaError;
use crate::models::RoomStatus;
use call_store::StoreError;
use common::types::InvalidId;
use thiserror::Error;

/// Call core error type.
#[derive(Debug, Error)]
pub enum CallError {
    /// Store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A user or room identifier was malformed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Room not found.
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// The user is not a participant of the room.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Callee joined before the caller wrote an offer.
    #[error("Room not found or not yet offered: {0}")]
    NotOffered(String),

    /// A room status change that would move backwards.
    #[error("Invalid room transition from {from} to {to}")]
    InvalidTransition { from: RoomStatus, to: RoomStatus },

    /// Negotiation field already written.
    #[error("Already negotiated: {0}")]
    AlreadyNegotiated(String),

    /// Local media could not be acquired.
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    /// The peer connection rejected an operation.
    #[error("Peer connection error: {0}")]
    Peer(String),

    /// Optimistic transaction kept conflicting.
    #[error("Transaction contention: {0}")]
    Contention(String),

    /// Operation not valid in the session's current phase.
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    /// The session actor is gone.
    #[error("Session closed")]
    SessionClosed,
}

impl CallError {
    /// Returns the wire error code for this error.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            CallError::InvalidArgument(_) => "invalid-argument",
            CallError::RoomNotFound(_) | CallError::NotOffered(_) => "not-found",
            CallError::PermissionDenied(_) => "permission-denied",
            CallError::InvalidTransition { .. }
            | CallError::AlreadyNegotiated(_)
            | CallError::InvalidState(_) => "failed-precondition",
            CallError::Media(_) => "media",
            CallError::Store(_)
            | CallError::Peer(_)
            | CallError::Contention(_)
            | CallError::SessionClosed => "internal",
        }
    }
}

impl From<InvalidId> for CallError {
    fn from(err: InvalidId) -> Self {
        CallError::InvalidArgument(err.to_string())
    }
}
