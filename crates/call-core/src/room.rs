//! Room Lifecycle Controller.
//!
//! Drives a room through `waiting -> active -> ended`. Either participant
//! may issue the next legal transition; transitions are guarded
//! read-check-write transactions, so concurrent calls from both sides
//! settle on the same state. `startedAt` and `endedAt` are each written by
//! exactly one committed transition.

use crate::config::CallConfig;
use crate::error::CallError;
use crate::models::{EndReason, Role, Room, RoomStatus};
use crate::schema;
use call_store::{
    DocPath, DocumentStore, DocumentSubscription, FieldValue, Fields, SharedStore, Snapshot,
    Transaction,
};
use common::types::{RoomId, UserId};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Result of ending a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOutcome {
    /// This call performed the transition.
    Ended,
    /// The room was already ended; nothing changed.
    AlreadyEnded,
}

impl EndOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EndOutcome::Ended => "ended",
            EndOutcome::AlreadyEnded => "already_ended",
        }
    }
}

#[derive(Clone)]
pub struct RoomController {
    store: SharedStore,
    config: CallConfig,
}

impl RoomController {
    #[must_use]
    pub fn new(store: SharedStore, config: CallConfig) -> Self {
        Self { store, config }
    }

    /// Read a room.
    ///
    /// # Errors
    ///
    /// Returns `CallError::RoomNotFound` if the room does not exist.
    pub async fn fetch(&self, room_id: &RoomId) -> Result<Room, CallError> {
        let snapshot = self.store.get(&schema::room(room_id)?).await?;
        decode_room(room_id, snapshot)
    }

    /// Authoritative role of `user_id`, read from the room's `callerId`.
    ///
    /// # Errors
    ///
    /// Returns `CallError::RoomNotFound` or `CallError::PermissionDenied`.
    pub async fn resolve_role(&self, room_id: &RoomId, user_id: &UserId) -> Result<Role, CallError> {
        let room = self.fetch(room_id).await?;
        room.role_of(user_id)
            .ok_or_else(|| CallError::PermissionDenied(user_id.to_string()))
    }

    /// `waiting -> active`. Sets `startedAt` once; a room already active is
    /// returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns `CallError::InvalidTransition` if the room already ended.
    #[instrument(skip_all, name = "call.room.activate", fields(room_id = %room_id))]
    pub async fn activate(&self, room_id: &RoomId, user_id: &UserId) -> Result<Room, CallError> {
        let path = schema::room(room_id)?;
        for attempt in 1..=self.config.max_transaction_attempts {
            let mut tx = Transaction::new(self.store.as_ref());
            let room = read_for(&mut tx, &path, room_id, user_id).await?;
            match room.status {
                RoomStatus::Active => return Ok(room),
                RoomStatus::Ended => {
                    return Err(CallError::InvalidTransition {
                        from: RoomStatus::Ended,
                        to: RoomStatus::Active,
                    })
                }
                RoomStatus::Waiting => {}
            }

            tx.update(
                path.clone(),
                Fields::from([
                    (
                        "status".to_string(),
                        FieldValue::value(RoomStatus::Active.as_str()),
                    ),
                    ("startedAt".to_string(), FieldValue::ServerTimestamp),
                ]),
            );
            match tx.commit().await {
                Ok(()) => {
                    info!(target: "call.room", room_id = %room_id, user_id = %user_id, "Room active");
                    return self.fetch(room_id).await;
                }
                Err(e) if e.is_conflict() => {
                    debug!(target: "call.room", room_id = %room_id, attempt = attempt, "Activation conflicted");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(CallError::Contention(format!("activate {room_id}")))
    }

    /// Extend an active call: `baseDurationSec += extension`, `extensionsCount += 1`.
    ///
    /// The active check and the increments commit together, so a room ended
    /// in between is never extended. The writes stay increments, so a
    /// conflict retry never loses a concurrent extension.
    ///
    /// # Errors
    ///
    /// Returns `CallError::InvalidState` unless the room is active.
    #[instrument(skip_all, name = "call.room.extend", fields(room_id = %room_id))]
    pub async fn request_extension(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Result<Room, CallError> {
        let extension = i64::try_from(self.config.extension_secs)
            .map_err(|_| CallError::InvalidArgument("extension too large".to_string()))?;
        let path = schema::room(room_id)?;

        for attempt in 1..=self.config.max_transaction_attempts {
            let mut tx = Transaction::new(self.store.as_ref());
            let room = read_for(&mut tx, &path, room_id, user_id).await?;
            if room.status != RoomStatus::Active {
                return Err(CallError::InvalidState(format!(
                    "cannot extend a {} room",
                    room.status
                )));
            }

            tx.update(
                path.clone(),
                Fields::from([
                    (
                        "baseDurationSec".to_string(),
                        FieldValue::Increment(extension),
                    ),
                    ("extensionsCount".to_string(), FieldValue::Increment(1)),
                ]),
            );
            match tx.commit().await {
                Ok(()) => {
                    let room = self.fetch(room_id).await?;
                    info!(
                        target: "call.room",
                        room_id = %room_id,
                        user_id = %user_id,
                        extensions = room.extensions_count,
                        base_duration_sec = room.base_duration_sec,
                        "Call extended"
                    );
                    return Ok(room);
                }
                Err(e) if e.is_conflict() => {
                    debug!(target: "call.room", room_id = %room_id, attempt = attempt, "Extension conflicted");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(CallError::Contention(format!("extend {room_id}")))
    }

    /// `* -> ended`. Idempotent: ending an ended room succeeds without change.
    ///
    /// Checks run in order: room exists, then `user_id` participates.
    ///
    /// # Errors
    ///
    /// Returns `CallError::RoomNotFound` or `CallError::PermissionDenied`.
    #[instrument(skip_all, name = "call.room.end", fields(room_id = %room_id, reason = %reason))]
    pub async fn end_call(
        &self,
        user_id: &UserId,
        room_id: &RoomId,
        reason: EndReason,
    ) -> Result<EndOutcome, CallError> {
        let path = schema::room(room_id)?;
        for attempt in 1..=self.config.max_transaction_attempts {
            let mut tx = Transaction::new(self.store.as_ref());
            let room = read_for(&mut tx, &path, room_id, user_id).await?;
            if room.status == RoomStatus::Ended {
                debug!(target: "call.room", room_id = %room_id, "Room already ended");
                return Ok(EndOutcome::AlreadyEnded);
            }

            let now = self.store.server_time().await?;
            let total = room.started_at.map_or(0, |started| now.seconds_since(started));
            tx.update(
                path.clone(),
                Fields::from([
                    (
                        "status".to_string(),
                        FieldValue::value(RoomStatus::Ended.as_str()),
                    ),
                    ("endedAt".to_string(), FieldValue::value(now.as_millis())),
                    ("endReason".to_string(), FieldValue::value(reason.as_str())),
                    ("totalDurationSec".to_string(), FieldValue::value(total)),
                ]),
            );
            match tx.commit().await {
                Ok(()) => {
                    info!(
                        target: "call.room",
                        room_id = %room_id,
                        user_id = %user_id,
                        reason = %reason,
                        total_duration_sec = total,
                        "Room ended"
                    );
                    return Ok(EndOutcome::Ended);
                }
                Err(e) if e.is_conflict() => {
                    debug!(target: "call.room", room_id = %room_id, attempt = attempt, "End conflicted");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(CallError::Contention(format!("end {room_id}")))
    }

    /// Seconds left in an active call, by the store clock.
    ///
    /// # Errors
    ///
    /// Returns an error if the store clock cannot be read.
    pub async fn remaining_seconds(&self, room: &Room) -> Result<Option<u64>, CallError> {
        let now = self.store.server_time().await?;
        Ok(room.remaining_seconds(now))
    }

    /// Subscribe to a room's successive states.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidPath` for an unusable room id.
    pub fn watch(&self, room_id: &RoomId) -> Result<DocumentSubscription, CallError> {
        Ok(DocumentSubscription::spawn(
            Arc::clone(&self.store),
            schema::room(room_id)?,
        ))
    }
}

/// Decode a room snapshot.
///
/// # Errors
///
/// Returns `CallError::RoomNotFound` for an absent room.
pub fn decode_room(room_id: &RoomId, snapshot: Option<Snapshot>) -> Result<Room, CallError> {
    let snapshot = snapshot.ok_or_else(|| CallError::RoomNotFound(room_id.to_string()))?;
    Ok(snapshot.decode::<Room>()?)
}

async fn read_for(
    tx: &mut Transaction<'_>,
    path: &DocPath,
    room_id: &RoomId,
    user_id: &UserId,
) -> Result<Room, CallError> {
    let snapshot = tx.get(path).await?;
    let room = decode_room(room_id, snapshot)?;
    if !room.is_participant(user_id) {
        return Err(CallError::PermissionDenied(user_id.to_string()));
    }
    Ok(room)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use call_store::{to_fields, ManualClock, MemoryStore};
    use common::types::Timestamp;
    use std::time::Duration;

    const START: i64 = 1_700_000_000_000;

    struct Fixture {
        store: SharedStore,
        clock: Arc<ManualClock>,
        rooms: RoomController,
        room_id: RoomId,
        alice: UserId,
        bob: UserId,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(START)));
        let store: SharedStore = Arc::new(MemoryStore::with_clock(clock.clone()));
        let alice = UserId::parse("alice").unwrap();
        let bob = UserId::parse("bob").unwrap();
        let room_id = RoomId::parse("room-1").unwrap();
        let room = Room::new(alice.clone(), bob.clone(), 600);
        store
            .set(schema::room(&room_id).unwrap(), to_fields(&room).unwrap())
            .await
            .unwrap();
        Fixture {
            rooms: RoomController::new(Arc::clone(&store), CallConfig::default()),
            store,
            clock,
            room_id,
            alice,
            bob,
        }
    }

    #[tokio::test]
    async fn test_resolve_role_reads_caller_id() {
        let f = fixture().await;
        assert_eq!(
            f.rooms.resolve_role(&f.room_id, &f.alice).await.unwrap(),
            Role::Caller
        );
        assert_eq!(
            f.rooms.resolve_role(&f.room_id, &f.bob).await.unwrap(),
            Role::Callee
        );
        let mallory = UserId::parse("mallory").unwrap();
        assert!(matches!(
            f.rooms.resolve_role(&f.room_id, &mallory).await,
            Err(CallError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_started_at_is_set_exactly_once() {
        let f = fixture().await;
        let room = f.rooms.activate(&f.room_id, &f.bob).await.unwrap();
        assert_eq!(room.status, RoomStatus::Active);
        assert_eq!(room.started_at, Some(Timestamp::from_millis(START)));

        f.clock.advance(Duration::from_secs(3));
        let again = f.rooms.activate(&f.room_id, &f.alice).await.unwrap();
        assert_eq!(again.started_at, Some(Timestamp::from_millis(START)));
    }

    #[tokio::test]
    async fn test_end_is_idempotent_and_keeps_ended_at() {
        let f = fixture().await;
        f.rooms.activate(&f.room_id, &f.bob).await.unwrap();
        f.clock.advance(Duration::from_secs(125));

        let first = f
            .rooms
            .end_call(&f.alice, &f.room_id, EndReason::UserEnded)
            .await
            .unwrap();
        assert_eq!(first, EndOutcome::Ended);
        let ended = f.rooms.fetch(&f.room_id).await.unwrap();
        assert_eq!(ended.status, RoomStatus::Ended);
        assert_eq!(ended.end_reason, Some(EndReason::UserEnded));
        assert_eq!(ended.total_duration_sec, 125);
        assert_eq!(ended.consumed_minutes(), 3);

        f.clock.advance(Duration::from_secs(10));
        let second = f
            .rooms
            .end_call(&f.bob, &f.room_id, EndReason::TimerEnded)
            .await
            .unwrap();
        assert_eq!(second, EndOutcome::AlreadyEnded);
        let unchanged = f.rooms.fetch(&f.room_id).await.unwrap();
        assert_eq!(unchanged.ended_at, ended.ended_at);
        assert_eq!(unchanged.end_reason, Some(EndReason::UserEnded));
    }

    #[tokio::test]
    async fn test_waiting_room_can_end_directly() {
        let f = fixture().await;
        f.rooms
            .end_call(&f.bob, &f.room_id, EndReason::PartnerDisconnected)
            .await
            .unwrap();
        let room = f.rooms.fetch(&f.room_id).await.unwrap();
        assert_eq!(room.status, RoomStatus::Ended);
        assert_eq!(room.started_at, None);
        assert_eq!(room.total_duration_sec, 0);
    }

    #[tokio::test]
    async fn test_ended_room_never_reactivates() {
        let f = fixture().await;
        f.rooms
            .end_call(&f.alice, &f.room_id, EndReason::UserEnded)
            .await
            .unwrap();
        let err = f.rooms.activate(&f.room_id, &f.bob).await.unwrap_err();
        assert!(matches!(
            err,
            CallError::InvalidTransition {
                from: RoomStatus::Ended,
                to: RoomStatus::Active
            }
        ));
        assert_eq!(
            f.rooms.fetch(&f.room_id).await.unwrap().status,
            RoomStatus::Ended
        );
    }

    #[tokio::test]
    async fn test_end_call_error_ordering() {
        let f = fixture().await;
        let mallory = UserId::parse("mallory").unwrap();
        let missing = RoomId::parse("missing").unwrap();

        assert!(matches!(
            f.rooms.end_call(&mallory, &missing, EndReason::UserEnded).await,
            Err(CallError::RoomNotFound(_))
        ));
        assert!(matches!(
            f.rooms.end_call(&mallory, &f.room_id, EndReason::UserEnded).await,
            Err(CallError::PermissionDenied(_))
        ));
        assert_eq!(
            f.rooms.fetch(&f.room_id).await.unwrap().status,
            RoomStatus::Waiting
        );
    }

    #[tokio::test]
    async fn test_extension_increments_exactly_once_per_request() {
        let f = fixture().await;
        f.rooms.activate(&f.room_id, &f.bob).await.unwrap();

        let room = f.rooms.request_extension(&f.room_id, &f.alice).await.unwrap();
        assert_eq!(room.base_duration_sec, 900);
        assert_eq!(room.extensions_count, 1);

        f.clock.advance(Duration::from_secs(100));
        assert_eq!(
            f.rooms.remaining_seconds(&room).await.unwrap(),
            Some(800)
        );
    }

    #[tokio::test]
    async fn test_extension_requires_active_room() {
        let f = fixture().await;
        assert!(matches!(
            f.rooms.request_extension(&f.room_id, &f.alice).await,
            Err(CallError::InvalidState(_))
        ));

        f.rooms.activate(&f.room_id, &f.bob).await.unwrap();
        f.rooms
            .end_call(&f.bob, &f.room_id, EndReason::UserEnded)
            .await
            .unwrap();
        assert!(matches!(
            f.rooms.request_extension(&f.room_id, &f.alice).await,
            Err(CallError::InvalidState(_))
        ));
        assert_eq!(
            f.rooms.fetch(&f.room_id).await.unwrap().extensions_count,
            0
        );
    }

    /// Ends the room through `inner` right before the first extension commit.
    struct EndsBeforeExtension {
        inner: SharedStore,
        room_id: RoomId,
        ender: UserId,
        fired: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl DocumentStore for EndsBeforeExtension {
        async fn read(&self, path: &DocPath) -> Result<call_store::DocRead, call_store::StoreError> {
            self.inner.read(path).await
        }

        async fn query(
            &self,
            query: &call_store::Query,
        ) -> Result<Vec<Snapshot>, call_store::StoreError> {
            self.inner.query(query).await
        }

        async fn commit(&self, batch: call_store::WriteBatch) -> Result<(), call_store::StoreError> {
            let extends = batch.writes.iter().any(|w| {
                matches!(w, call_store::Write::Update { fields, .. } if fields.contains_key("extensionsCount"))
            });
            if extends && !self.fired.swap(true, std::sync::atomic::Ordering::SeqCst) {
                RoomController::new(Arc::clone(&self.inner), CallConfig::default())
                    .end_call(&self.ender, &self.room_id, EndReason::UserEnded)
                    .await
                    .unwrap();
            }
            self.inner.commit(batch).await
        }

        async fn read_sequence(
            &self,
            sequence: &call_store::CollectionPath,
            after: u64,
        ) -> Result<Vec<call_store::SequenceItem>, call_store::StoreError> {
            self.inner.read_sequence(sequence, after).await
        }

        async fn revision(&self, key: &str) -> Result<u64, call_store::StoreError> {
            self.inner.revision(key).await
        }

        async fn changed(&self, key: &str, seen: u64) -> Result<u64, call_store::StoreError> {
            self.inner.changed(key, seen).await
        }

        async fn server_time(&self) -> Result<Timestamp, call_store::StoreError> {
            self.inner.server_time().await
        }
    }

    #[tokio::test]
    async fn test_end_racing_an_extension_wins() {
        let f = fixture().await;
        f.rooms.activate(&f.room_id, &f.bob).await.unwrap();
        let racing: SharedStore = Arc::new(EndsBeforeExtension {
            inner: Arc::clone(&f.store),
            room_id: f.room_id.clone(),
            ender: f.bob.clone(),
            fired: std::sync::atomic::AtomicBool::new(false),
        });
        let rooms = RoomController::new(racing, CallConfig::default());

        let result = rooms.request_extension(&f.room_id, &f.alice).await;

        assert!(matches!(result, Err(CallError::InvalidState(_))));
        let room = f.rooms.fetch(&f.room_id).await.unwrap();
        assert_eq!(room.status, RoomStatus::Ended);
        assert_eq!(room.extensions_count, 0);
        assert_eq!(room.base_duration_sec, 600);
    }

    #[tokio::test]
    async fn test_store_is_untouched_by_reads() {
        let f = fixture().await;
        let path = schema::room(&f.room_id).unwrap();
        let before = f.store.revision(&path.key()).await.unwrap();
        f.rooms.resolve_role(&f.room_id, &f.alice).await.unwrap();
        assert_eq!(f.store.revision(&path.key()).await.unwrap(), before);
    }
}
