//! Post-call ratings.
//!
//! Write-only from the core's point of view. A failed write never blocks
//! the call flow.

use crate::error::CallError;
use crate::models::Rating;
use crate::schema;
use call_store::{to_fields, DocumentStore, FieldValue, SharedStore};
use common::types::{RoomId, Timestamp, UserId};
use std::ops::RangeInclusive;
use tracing::{info, warn};

/// Accepted rating values.
pub const RATING_RANGE: RangeInclusive<u8> = 1..=5;

/// Store a rating for `room_id`.
///
/// Returns `Ok(false)` if the write failed; the failure is logged only.
///
/// # Errors
///
/// Returns `CallError::InvalidArgument` for a rating outside 1..=5.
pub async fn submit_rating(
    store: &SharedStore,
    room_id: &RoomId,
    from: &UserId,
    rating: u8,
) -> Result<bool, CallError> {
    if !RATING_RANGE.contains(&rating) {
        return Err(CallError::InvalidArgument(format!(
            "rating must be between {} and {}",
            RATING_RANGE.start(),
            RATING_RANGE.end()
        )));
    }

    let record = Rating {
        room_id: room_id.clone(),
        from_user_id: from.clone(),
        rating,
        created_at: Timestamp::default(),
    };
    let write = async {
        let mut fields = to_fields(&record)?;
        fields.insert("createdAt".to_string(), FieldValue::ServerTimestamp);
        store.set(schema::new_rating()?, fields).await
    };

    match write.await {
        Ok(()) => {
            info!(target: "call.session", room_id = %room_id, user_id = %from, rating = rating, "Rating stored");
            Ok(true)
        }
        Err(e) => {
            warn!(target: "call.session", room_id = %room_id, user_id = %from, error = %e, "Rating write failed");
            Ok(false)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use call_store::{MemoryStore, Query};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_rating_is_stored() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let room_id = RoomId::parse("r1").unwrap();
        let from = UserId::parse("alice").unwrap();

        assert!(submit_rating(&store, &room_id, &from, 4).await.unwrap());

        let query = Query::collection(call_store::CollectionPath::parse(schema::RATINGS).unwrap());
        let stored = store.query(&query).await.unwrap();
        assert_eq!(stored.len(), 1);
        let rating: Rating = stored.first().unwrap().decode().unwrap();
        assert_eq!(rating.rating, 4);
        assert_eq!(rating.from_user_id, from);
    }

    #[tokio::test]
    async fn test_out_of_range_rating_is_rejected() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let room_id = RoomId::parse("r1").unwrap();
        let from = UserId::parse("alice").unwrap();

        for bad in [0, 6] {
            assert!(matches!(
                submit_rating(&store, &room_id, &from, bad).await,
                Err(CallError::InvalidArgument(_))
            ));
        }
    }
}
