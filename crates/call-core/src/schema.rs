//! Collection layout in the shared store.
//!
//! - `queue/{userId}` - waiting entries
//! - `rooms/{roomId}` - rooms and their offer/answer
//! - `rooms/{roomId}/callerCandidates`, `rooms/{roomId}/calleeCandidates` - append-only candidates
//! - `ratings/{id}` - post-call ratings

use crate::models::Role;
use call_store::{CollectionPath, DocPath, StoreError};
use common::types::{RoomId, UserId};

pub const QUEUE: &str = "queue";
pub const ROOMS: &str = "rooms";
pub const RATINGS: &str = "ratings";
pub const CALLER_CANDIDATES: &str = "callerCandidates";
pub const CALLEE_CANDIDATES: &str = "calleeCandidates";

/// Waiting entry of `user_id`.
///
/// # Errors
///
/// Returns `StoreError::InvalidPath` if the id is not a valid segment.
pub fn queue_entry(user_id: &UserId) -> Result<DocPath, StoreError> {
    DocPath::new(QUEUE, user_id.as_str())
}

/// The queue collection.
///
/// # Errors
///
/// Never fails for the constant collection name; kept fallible for symmetry.
pub fn queue() -> Result<CollectionPath, StoreError> {
    CollectionPath::parse(QUEUE)
}

/// Room document.
///
/// # Errors
///
/// Returns `StoreError::InvalidPath` if the id is not a valid segment.
pub fn room(room_id: &RoomId) -> Result<DocPath, StoreError> {
    DocPath::new(ROOMS, room_id.as_str())
}

/// The rooms collection.
///
/// # Errors
///
/// Never fails for the constant collection name; kept fallible for symmetry.
pub fn rooms() -> Result<CollectionPath, StoreError> {
    CollectionPath::parse(ROOMS)
}

/// Candidate sequence written by `role` in a room.
///
/// # Errors
///
/// Returns `StoreError::InvalidPath` if the room id is not a valid segment.
pub fn candidates(room_id: &RoomId, role: Role) -> Result<CollectionPath, StoreError> {
    let name = match role {
        Role::Caller => CALLER_CANDIDATES,
        Role::Callee => CALLEE_CANDIDATES,
    };
    room(room_id)?.child(name)
}

/// A new rating document with a generated id.
///
/// # Errors
///
/// Never fails for generated ids; kept fallible for symmetry.
pub fn new_rating() -> Result<DocPath, StoreError> {
    DocPath::new(RATINGS, &uuid::Uuid::new_v4().simple().to_string())
}
