//! End-to-end call sessions: two clients over one memory store, with mock
//! media devices and mock peer connections.
//!
//! Tokio time is paused, so grace periods and countdowns elapse as soon as
//! every task is idle.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use call_core::error::CallError;
use call_core::media::MediaError;
use call_core::models::{EndReason, Role, RoomStatus};
use call_core::peer::{ConnectivityState, PeerEvent};
use call_core::schema;
use call_core::session::{CallSession, CallSessionHandle, SessionDeps, SessionEvent, SessionPhase};
use call_core::CallConfig;
use call_store::DocumentStore;
use call_test_utils::fixtures::{fast_config, profile, user, TestStore};
use call_test_utils::mock_media::MockMediaDevices;
use call_test_utils::mock_peer::MockPeerConnector;
use common::types::RoomId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const LOCAL_CANDIDATES: usize = 2;

struct Client {
    handle: CallSessionHandle,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    task: JoinHandle<()>,
    devices: Arc<MockMediaDevices>,
    connector: Arc<MockPeerConnector>,
}

impl Client {
    fn spawn(f: &TestStore, name: &str, config: &CallConfig) -> Self {
        Self::spawn_with_devices(f, name, config, MockMediaDevices::new())
    }

    fn spawn_with_devices(
        f: &TestStore,
        name: &str,
        config: &CallConfig,
        devices: Arc<MockMediaDevices>,
    ) -> Self {
        let connector = Arc::new(MockPeerConnector::new(name).with_local_candidates(LOCAL_CANDIDATES));
        let deps = SessionDeps {
            store: f.shared(),
            devices: devices.clone(),
            connector: connector.clone(),
            config: config.clone(),
        };
        let (handle, events, task) = CallSession::spawn(profile(name), deps);
        Self {
            handle,
            events,
            task,
            devices,
            connector,
        }
    }

    /// Skip events until one matches `predicate`.
    async fn wait_for(&mut self, what: &str, predicate: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
        let deadline = Duration::from_secs(3600);
        let result = tokio::time::timeout(deadline, async {
            while let Some(event) = self.events.recv().await {
                if predicate(&event) {
                    return Some(event);
                }
            }
            None
        })
        .await;
        match result {
            Ok(Some(event)) => event,
            Ok(None) => panic!("event stream closed while waiting for {what}"),
            Err(_) => panic!("timed out waiting for {what}"),
        }
    }

    async fn matched(&mut self) -> (RoomId, Role) {
        match self.wait_for("match", |e| matches!(e, SessionEvent::Matched { .. })).await {
            SessionEvent::Matched { room_id, role, .. } => (room_id, role),
            other => panic!("unexpected {other:?}"),
        }
    }

    async fn call_started(&mut self) -> u64 {
        match self
            .wait_for("call start", |e| matches!(e, SessionEvent::CallStarted { .. }))
            .await
        {
            SessionEvent::CallStarted { remaining } => remaining,
            other => panic!("unexpected {other:?}"),
        }
    }

    async fn call_ended(&mut self) -> (EndReason, u64) {
        match self
            .wait_for("call end", |e| matches!(e, SessionEvent::CallEnded { .. }))
            .await
        {
            SessionEvent::CallEnded {
                reason,
                duration_secs,
                ..
            } => (reason, duration_secs),
            other => panic!("unexpected {other:?}"),
        }
    }
}

/// Queue alice, then bob a second later, and wait for both calls to start.
async fn connect_pair(f: &TestStore, alice: &mut Client, bob: &mut Client) -> RoomId {
    alice.handle.join_queue().await.unwrap();
    alice.wait_for("queued", |e| *e == SessionEvent::Queued).await;
    f.advance(Duration::from_secs(1));
    bob.handle.join_queue().await.unwrap();

    let (room_id, alice_role) = alice.matched().await;
    let (bob_room, bob_role) = bob.matched().await;
    assert_eq!(room_id, bob_room);
    assert_eq!(alice_role, Role::Caller);
    assert_eq!(bob_role, Role::Callee);

    alice.call_started().await;
    bob.call_started().await;
    room_id
}

#[tokio::test(start_paused = true)]
async fn test_full_call_from_queue_to_rating() {
    let f = TestStore::new();
    let config = fast_config();
    let mut alice = Client::spawn(&f, "alice", &config);
    let mut bob = Client::spawn(&f, "bob", &config);

    alice.handle.join_queue().await.unwrap();
    assert_eq!(alice.handle.phase().await.unwrap(), SessionPhase::Queued);
    f.advance(Duration::from_secs(1));
    bob.handle.join_queue().await.unwrap();

    let (room_id, role) = alice.matched().await;
    assert_eq!(role, Role::Caller);
    let (_, role) = bob.matched().await;
    assert_eq!(role, Role::Callee);

    assert_eq!(alice.call_started().await, config.base_duration_secs);
    assert_eq!(bob.call_started().await, config.base_duration_secs);
    assert_eq!(alice.handle.phase().await.unwrap(), SessionPhase::Active);

    let room = f.room(&room_id).await.unwrap();
    assert_eq!(room.status, RoomStatus::Active);
    assert!(room.offer.is_some());
    assert!(room.answer.is_some());
    assert_eq!(room.started_at, Some(f.now()));

    // Each side published its own candidates, and the other applied them.
    tokio::time::sleep(Duration::from_millis(100)).await;
    for role in [Role::Caller, Role::Callee] {
        let items = f
            .store
            .read_sequence(&schema::candidates(&room_id, role).unwrap(), 0)
            .await
            .unwrap();
        assert_eq!(items.len(), LOCAL_CANDIDATES, "{role} candidates");
    }
    let alice_peer = alice.connector.last().unwrap();
    let bob_peer = bob.connector.last().unwrap();
    assert_eq!(bob_peer.applied_candidates().len(), LOCAL_CANDIDATES);
    assert_eq!(alice_peer.applied_candidates().len(), LOCAL_CANDIDATES);
    assert_eq!(
        alice.connector.configs().first().unwrap().ice_servers,
        config.ice_servers
    );

    // Extension from one side re-derives both countdowns.
    assert!(alice.handle.request_extension().await.unwrap());
    let expected = config.base_duration_secs + config.extension_secs;
    for client in [&mut alice, &mut bob] {
        let event = client
            .wait_for("extension", |e| matches!(e, SessionEvent::Extended { .. }))
            .await;
        assert_eq!(
            event,
            SessionEvent::Extended {
                remaining: expected,
                extensions_count: 1
            }
        );
    }

    // Track toggles report the new state.
    assert!(!bob.handle.toggle_audio().await.unwrap());
    assert!(bob.handle.toggle_audio().await.unwrap());
    assert!(!bob.handle.toggle_video().await.unwrap());

    f.advance(Duration::from_secs(30));
    bob.handle.end_call().await.unwrap();
    assert_eq!(bob.call_ended().await, (EndReason::UserEnded, 30));
    assert_eq!(alice.call_ended().await, (EndReason::UserEnded, 30));

    let room = f.room(&room_id).await.unwrap();
    assert_eq!(room.status, RoomStatus::Ended);
    assert_eq!(room.end_reason, Some(EndReason::UserEnded));
    assert!(alice_peer.is_closed());
    assert!(bob_peer.is_closed());
    assert!(alice.devices.last_stream().unwrap().is_stopped());
    assert!(bob.devices.last_stream().unwrap().is_stopped());
    assert_eq!(bob.handle.phase().await.unwrap(), SessionPhase::Ended);

    assert!(alice.handle.submit_rating(5).await.unwrap());
    assert!(matches!(
        alice.handle.submit_rating(9).await,
        Err(CallError::InvalidArgument(_))
    ));

    alice.handle.next_partner().await.unwrap();
    assert_eq!(alice.handle.phase().await.unwrap(), SessionPhase::Queued);
    let entry = f.entry("alice").await.unwrap();
    assert_eq!(entry.status, call_core::models::WaitingStatus::Waiting);
}

#[tokio::test(start_paused = true)]
async fn test_media_failure_is_retryable() {
    let f = TestStore::new();
    let config = fast_config();
    let mut alice = Client::spawn(&f, "alice", &config);
    let mut bob = Client::spawn_with_devices(
        &f,
        "bob",
        &config,
        MockMediaDevices::failing(MediaError::PermissionDenied),
    );

    alice.handle.join_queue().await.unwrap();
    f.advance(Duration::from_secs(1));
    bob.handle.join_queue().await.unwrap();
    let (room_id, _) = bob.matched().await;

    let event = bob
        .wait_for("media error", |e| matches!(e, SessionEvent::MediaError { .. }))
        .await;
    let SessionEvent::MediaError { error, message } = event else {
        panic!("unexpected {event:?}");
    };
    assert_eq!(error, MediaError::PermissionDenied);
    assert_eq!(message, MediaError::PermissionDenied.user_message());
    assert_eq!(bob.handle.phase().await.unwrap(), SessionPhase::MediaFailed);

    // The room is left alone so the retry can resume.
    let room = f.room(&room_id).await.unwrap();
    assert_eq!(room.status, RoomStatus::Waiting);

    bob.devices.set_failure(None);
    bob.handle.retry_media().await.unwrap();

    bob.call_started().await;
    alice.call_started().await;
    assert_eq!(f.room(&room_id).await.unwrap().status, RoomStatus::Active);
}

#[tokio::test(start_paused = true)]
async fn test_countdown_alerts_then_ends_the_call() {
    let f = TestStore::new();
    let config = CallConfig {
        base_duration_secs: 3,
        extension_alert_secs: 2,
        ..fast_config()
    };
    let mut alice = Client::spawn(&f, "alice", &config);
    let mut bob = Client::spawn(&f, "bob", &config);
    let room_id = connect_pair(&f, &mut alice, &mut bob).await;

    let alert = alice
        .wait_for("alert", |e| matches!(e, SessionEvent::ExtensionAvailable { .. }))
        .await;
    assert_eq!(alert, SessionEvent::ExtensionAvailable { remaining: 2 });

    let mut alerts = 0;
    loop {
        let event = alice.wait_for("any event", |_| true).await;
        match event {
            SessionEvent::ExtensionAvailable { .. } => alerts += 1,
            SessionEvent::CallEnded { reason, .. } => {
                assert_eq!(reason, EndReason::TimerEnded);
                break;
            }
            _ => {}
        }
    }
    assert_eq!(alerts, 0, "alert is emitted once per countdown");

    let (reason, _) = bob.call_ended().await;
    assert_eq!(reason, EndReason::TimerEnded);
    assert_eq!(f.room(&room_id).await.unwrap().status, RoomStatus::Ended);
}

#[tokio::test(start_paused = true)]
async fn test_connectivity_failure_ends_as_partner_disconnected() {
    let f = TestStore::new();
    let config = fast_config();
    let mut alice = Client::spawn(&f, "alice", &config);
    let mut bob = Client::spawn(&f, "bob", &config);
    let room_id = connect_pair(&f, &mut alice, &mut bob).await;

    let peer = alice.connector.last().unwrap();
    peer.emit(PeerEvent::Connectivity(ConnectivityState::Disconnected));
    alice
        .wait_for("reconnecting", |e| *e == SessionEvent::Reconnecting)
        .await;
    peer.emit(PeerEvent::Connectivity(ConnectivityState::Connected));
    alice
        .wait_for("reconnected", |e| *e == SessionEvent::Reconnected)
        .await;

    peer.emit(PeerEvent::Connectivity(ConnectivityState::Failed));
    assert_eq!(alice.call_ended().await.0, EndReason::PartnerDisconnected);
    assert_eq!(bob.call_ended().await.0, EndReason::PartnerDisconnected);

    let room = f.room(&room_id).await.unwrap();
    assert_eq!(room.end_reason, Some(EndReason::PartnerDisconnected));
}

#[tokio::test(start_paused = true)]
async fn test_start_now_skips_the_grace_period() {
    let f = TestStore::new();
    let config = CallConfig {
        grace_period_secs: 3600,
        ..fast_config()
    };
    let mut alice = Client::spawn(&f, "alice", &config);
    let mut bob = Client::spawn(&f, "bob", &config);

    alice.handle.join_queue().await.unwrap();
    bob.handle.join_queue().await.unwrap();
    alice.matched().await;
    bob.matched().await;

    alice.handle.start_now().await.unwrap();
    bob.handle.start_now().await.unwrap();
    alice.call_started().await;
    bob.call_started().await;
    assert!(matches!(
        alice.handle.start_now().await,
        Err(CallError::InvalidState(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_ends_the_call_and_leaves_nothing_behind() {
    let f = TestStore::new();
    let config = fast_config();
    let mut alice = Client::spawn(&f, "alice", &config);
    let mut bob = Client::spawn(&f, "bob", &config);
    let room_id = connect_pair(&f, &mut alice, &mut bob).await;

    alice.handle.shutdown();
    alice.task.await.unwrap();
    assert!(alice.handle.is_shut_down());
    assert!(matches!(
        alice.handle.phase().await,
        Err(CallError::SessionClosed)
    ));

    assert_eq!(bob.call_ended().await.0, EndReason::UserEnded);
    assert_eq!(f.room(&room_id).await.unwrap().status, RoomStatus::Ended);
    assert!(alice.connector.last().unwrap().is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_queue_leave_and_removal() {
    let f = TestStore::new();
    let config = fast_config();
    let mut alice = Client::spawn(&f, "alice", &config);

    alice.handle.join_queue().await.unwrap();
    assert!(f.entry("alice").await.is_some());
    alice.handle.leave_queue().await.unwrap();
    assert!(f.entry("alice").await.is_none());
    assert_eq!(alice.handle.phase().await.unwrap(), SessionPhase::Idle);
    // Leaving twice is fine.
    alice.handle.leave_queue().await.unwrap();

    // An entry swept from under a queued session.
    alice.handle.join_queue().await.unwrap();
    f.store
        .delete(schema::queue_entry(&user("alice")).unwrap())
        .await
        .unwrap();
    alice
        .wait_for("removal", |e| *e == SessionEvent::RemovedFromQueue)
        .await;
    assert_eq!(alice.handle.phase().await.unwrap(), SessionPhase::Idle);

    // Shutting down while queued removes the entry.
    alice.handle.join_queue().await.unwrap();
    alice.handle.shutdown();
    alice.task.await.unwrap();
    assert!(f.entry("alice").await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_commands_outside_their_phase_are_rejected() {
    let f = TestStore::new();
    let alice = Client::spawn(&f, "alice", &fast_config());

    for result in [
        alice.handle.start_now().await,
        alice.handle.retry_media().await,
        alice.handle.end_call().await,
    ] {
        assert!(matches!(result, Err(CallError::InvalidState(_))));
    }
    assert!(matches!(
        alice.handle.submit_rating(4).await,
        Err(CallError::InvalidState(_))
    ));
    assert!(!alice.handle.request_extension().await.unwrap());
    assert!(!alice.handle.toggle_audio().await.unwrap());

    alice.handle.join_queue().await.unwrap();
    assert!(matches!(
        alice.handle.join_queue().await,
        Err(CallError::InvalidState(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_extension_after_partner_end_keeps_call_over() {
    let f = TestStore::new();
    let config = fast_config();
    let mut alice = Client::spawn(&f, "alice", &config);
    let mut bob = Client::spawn(&f, "bob", &config);
    let room_id = connect_pair(&f, &mut alice, &mut bob).await;

    // Bob's end commits before alice's extension reaches the store.
    call_core::room::RoomController::new(f.shared(), config.clone())
        .end_call(&user("bob"), &room_id, EndReason::UserEnded)
        .await
        .unwrap();
    assert!(!alice.handle.request_extension().await.unwrap());

    let mut seen = Vec::new();
    loop {
        let event = alice
            .wait_for("any event", |_| true)
            .await;
        let ended = matches!(event, SessionEvent::CallEnded { .. });
        seen.push(event);
        if ended {
            break;
        }
    }
    assert!(
        !seen.iter().any(|e| matches!(e, SessionEvent::Extended { .. })),
        "{seen:?}"
    );

    let room = f.room(&room_id).await.unwrap();
    assert_eq!(room.status, RoomStatus::Ended);
    assert_eq!(room.extensions_count, 0);
    assert_eq!(room.base_duration_sec, config.base_duration_secs);
    assert_eq!(alice.handle.phase().await.unwrap(), SessionPhase::Ended);
}
