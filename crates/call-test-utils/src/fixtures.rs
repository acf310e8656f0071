//! Pre-configured test data.

use call_core::models::{Room, RoomStatus, UserProfile, WaitingEntry, WaitingStatus};
use call_core::schema;
use call_core::CallConfig;
use call_store::{to_fields, DocumentStore, ManualClock, MemoryStore, SharedStore};
use common::types::{RoomId, Timestamp, UserId};
use std::sync::Arc;
use std::time::Duration;

/// Fixed starting instant of every test store (2023-11-14T22:13:20Z).
pub const TEST_EPOCH_MILLIS: i64 = 1_700_000_000_000;

/// A memory store with a controllable clock.
#[derive(Clone)]
pub struct TestStore {
    pub store: SharedStore,
    pub clock: Arc<ManualClock>,
}

impl TestStore {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(TEST_EPOCH_MILLIS)));
        let store: SharedStore = Arc::new(MemoryStore::with_clock(clock.clone()));
        Self { store, clock }
    }

    pub fn shared(&self) -> SharedStore {
        Arc::clone(&self.store)
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// Current store time.
    pub fn now(&self) -> Timestamp {
        use call_store::Clock;
        self.clock.now()
    }

    /// The instant `by` before now.
    pub fn ago(&self, by: Duration) -> Timestamp {
        self.now().saturating_sub(by)
    }

    /// Write a waiting entry with an explicit `enqueuedAt`.
    pub async fn seed_entry(&self, id: &str, enqueued_at: Timestamp, status: WaitingStatus) {
        let user_id = user(id);
        let entry = WaitingEntry {
            user_id: user_id.clone(),
            display_name: id.to_string(),
            avatar_ref: None,
            enqueued_at,
            status,
            matched_with: None,
            room_id: None,
            partner_display_name: None,
            partner_avatar_ref: None,
        };
        self.store
            .set(schema::queue_entry(&user_id).unwrap(), to_fields(&entry).unwrap())
            .await
            .unwrap();
    }

    /// Write a room between `caller` and `callee`.
    pub async fn seed_room(&self, id: &str, caller: &str, callee: &str, status: RoomStatus) -> RoomId {
        let room_id = RoomId::parse(id).unwrap();
        let mut room = Room::new(user(caller), user(callee), 600);
        room.status = status;
        room.created_at = self.now();
        if status != RoomStatus::Waiting {
            room.started_at = Some(self.now());
        }
        if status == RoomStatus::Ended {
            room.ended_at = Some(self.now());
            room.end_reason = Some(call_core::models::EndReason::UserEnded);
        }
        self.store
            .set(schema::room(&room_id).unwrap(), to_fields(&room).unwrap())
            .await
            .unwrap();
        room_id
    }

    pub async fn entry(&self, id: &str) -> Option<WaitingEntry> {
        self.store
            .get(&schema::queue_entry(&user(id)).unwrap())
            .await
            .unwrap()
            .map(|s| s.decode().unwrap())
    }

    pub async fn room(&self, room_id: &RoomId) -> Option<Room> {
        self.store
            .get(&schema::room(room_id).unwrap())
            .await
            .unwrap()
            .map(|s| s.decode().unwrap())
    }
}

impl Default for TestStore {
    fn default() -> Self {
        Self::new()
    }
}

pub fn user(id: &str) -> UserId {
    UserId::parse(id).unwrap()
}

pub fn profile(id: &str) -> UserProfile {
    UserProfile::new(user(id)).with_display_name(id)
}

/// Defaults with a one-second grace period, so flows complete quickly.
pub fn fast_config() -> CallConfig {
    CallConfig {
        grace_period_secs: 1,
        ..CallConfig::default()
    }
}
