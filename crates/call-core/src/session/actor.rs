//! `CallSessionActor` - the per-client call-session context.
//!
//! All session state lives here and is only touched from the actor task.
//! Helper tasks (queue watch, room watch, peer event forwarding, timers)
//! report back through one internal channel, tagged with the generation
//! they were started for; anything tagged with an older generation is
//! dropped, so a late tick or room update from a finished call can never
//! leak into the next one.

use super::{SessionCommand, SessionDeps, SessionEvent, SessionPhase};
use crate::error::CallError;
use crate::matcher::{MatchWatch, QueueEvent, QueueMatcher};
use crate::media::LocalMedia;
use crate::models::{EndReason, IceCandidate, MatchInfo, Role, Room, RoomStatus, UserProfile};
use crate::peer::{ConnectivityState, PeerConfig, PeerConnection, PeerEvent};
use crate::ratings;
use crate::room::RoomController;
use crate::signaling::SignalingRelay;
use crate::timer::CallTimer;
use common::types::RoomId;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Something a helper task observed.
#[derive(Debug)]
enum Signal {
    Queue(QueueEvent),
    GraceTick(u64),
    GraceExpired,
    CallTick(u64),
    CallExpired,
    Room(Option<Room>),
    Peer(PeerEvent),
}

#[derive(Debug)]
struct Internal {
    generation: u64,
    signal: Signal,
}

/// Sends signals tagged with a fixed generation.
#[derive(Clone)]
struct Notifier {
    sender: mpsc::UnboundedSender<Internal>,
    generation: u64,
}

impl Notifier {
    fn send(&self, signal: Signal) {
        let _ = self.sender.send(Internal {
            generation: self.generation,
            signal,
        });
    }
}

/// Everything held for one room, from match to end.
struct ActiveCall {
    room_id: RoomId,
    role: Role,
    partner_display_name: String,
    /// Cancels the helper tasks of this call.
    token: CancellationToken,
    grace: CallTimer,
    timer: CallTimer,
    media: LocalMedia,
    peer: Option<Arc<dyn PeerConnection>>,
    relay: Option<SignalingRelay>,
    /// Local candidates produced before the relay existed.
    pending_candidates: Vec<IceCandidate>,
    /// Callee connected before the caller's offer was written.
    awaiting_offer: bool,
    started: bool,
    base_duration_sec: u64,
    alerted: bool,
    reconnecting: bool,
}

impl ActiveCall {
    fn teardown(&mut self) {
        self.grace.stop();
        self.timer.stop();
        if let Some(relay) = self.relay.take() {
            relay.cleanup();
        }
        if let Some(peer) = self.peer.take() {
            peer.close();
        }
        self.media.release();
        self.pending_candidates.clear();
        self.token.cancel();
    }
}

pub(crate) struct CallSessionActor {
    profile: UserProfile,
    deps: SessionDeps,
    matcher: QueueMatcher,
    rooms: RoomController,
    receiver: mpsc::Receiver<SessionCommand>,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel_token: CancellationToken,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    generation: u64,
    phase: SessionPhase,
    queue_token: Option<CancellationToken>,
    call: Option<ActiveCall>,
    /// Room of the most recently ended call, for rating.
    last_room: Option<RoomId>,
}

impl CallSessionActor {
    pub(crate) fn new(
        profile: UserProfile,
        deps: SessionDeps,
        receiver: mpsc::Receiver<SessionCommand>,
        events: mpsc::UnboundedSender<SessionEvent>,
        cancel_token: CancellationToken,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let matcher = QueueMatcher::new(Arc::clone(&deps.store), deps.config.clone());
        let rooms = RoomController::new(Arc::clone(&deps.store), deps.config.clone());
        Self {
            profile,
            deps,
            matcher,
            rooms,
            receiver,
            events,
            cancel_token,
            internal_tx,
            internal_rx,
            generation: 0,
            phase: SessionPhase::Idle,
            queue_token: None,
            call: None,
            last_room: None,
        }
    }

    /// Run the actor loop until shutdown or every handle is dropped.
    #[instrument(skip_all, name = "call.session", fields(user_id = %self.profile.user_id))]
    pub(crate) async fn run(mut self) {
        info!(target: "call.session", user_id = %self.profile.user_id, "Session started");

        loop {
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    debug!(target: "call.session", user_id = %self.profile.user_id, "Session received cancellation signal");
                    break;
                }

                Some(internal) = self.internal_rx.recv() => {
                    self.handle_internal(internal).await;
                }

                command = self.receiver.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => {
                            debug!(target: "call.session", user_id = %self.profile.user_id, "All session handles dropped");
                            break;
                        }
                    }
                }
            }
        }

        self.teardown().await;
        info!(
            target: "call.session",
            user_id = %self.profile.user_id,
            phase = %self.phase,
            "Session stopped"
        );
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn emit_error(&self, error: &CallError) {
        self.emit(SessionEvent::Error {
            code: error.error_code(),
            message: error.to_string(),
        });
    }

    fn notifier(&self) -> Notifier {
        Notifier {
            sender: self.internal_tx.clone(),
            generation: self.generation,
        }
    }

    fn invalid_state(&self, action: &str) -> CallError {
        CallError::InvalidState(format!("cannot {action} while {}", self.phase))
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::JoinQueue { respond_to } => {
                let result = self.join_queue().await;
                let _ = respond_to.send(result);
            }
            SessionCommand::LeaveQueue { respond_to } => {
                let result = self.leave_queue().await;
                let _ = respond_to.send(result);
            }
            SessionCommand::StartNow { respond_to } => {
                let result = if self.phase == SessionPhase::Matched {
                    self.start_call().await;
                    Ok(())
                } else {
                    Err(self.invalid_state("start the call"))
                };
                let _ = respond_to.send(result);
            }
            SessionCommand::RetryMedia { respond_to } => {
                let result = if self.phase == SessionPhase::MediaFailed {
                    self.start_call().await;
                    Ok(())
                } else {
                    Err(self.invalid_state("retry media"))
                };
                let _ = respond_to.send(result);
            }
            SessionCommand::ToggleAudio { respond_to } => {
                let enabled = self.call.as_ref().is_some_and(|c| c.media.toggle_audio());
                let _ = respond_to.send(enabled);
            }
            SessionCommand::ToggleVideo { respond_to } => {
                let enabled = self.call.as_ref().is_some_and(|c| c.media.toggle_video());
                let _ = respond_to.send(enabled);
            }
            SessionCommand::RequestExtension { respond_to } => {
                let result = self.request_extension().await;
                let _ = respond_to.send(result);
            }
            SessionCommand::EndCall { respond_to } => {
                let result = if self.call.is_some() {
                    self.end_call_flow(EndReason::UserEnded).await;
                    Ok(())
                } else {
                    Err(self.invalid_state("end a call"))
                };
                let _ = respond_to.send(result);
            }
            SessionCommand::SubmitRating { rating, respond_to } => {
                let result = match &self.last_room {
                    Some(room_id) => {
                        ratings::submit_rating(
                            &self.deps.store,
                            room_id,
                            &self.profile.user_id,
                            rating,
                        )
                        .await
                    }
                    None => Err(self.invalid_state("rate")),
                };
                let _ = respond_to.send(result);
            }
            SessionCommand::NextPartner { respond_to } => {
                let result = self.next_partner().await;
                let _ = respond_to.send(result);
            }
            SessionCommand::GetPhase { respond_to } => {
                let _ = respond_to.send(self.phase);
            }
        }
    }

    async fn handle_internal(&mut self, internal: Internal) {
        if internal.generation != self.generation {
            debug!(
                target: "call.session",
                user_id = %self.profile.user_id,
                generation = internal.generation,
                current = self.generation,
                "Dropping stale signal"
            );
            return;
        }

        match internal.signal {
            Signal::Queue(QueueEvent::Matched(info)) => self.on_matched(info).await,
            Signal::Queue(QueueEvent::Removed) => {
                if self.phase == SessionPhase::Queued {
                    self.cancel_queue_watch();
                    self.phase = SessionPhase::Idle;
                    info!(target: "call.session", user_id = %self.profile.user_id, "Removed from queue");
                    self.emit(SessionEvent::RemovedFromQueue);
                }
            }
            Signal::GraceTick(remaining) => {
                if self.phase == SessionPhase::Matched {
                    self.emit(SessionEvent::GraceTick { remaining });
                }
            }
            Signal::GraceExpired => {
                if self.phase == SessionPhase::Matched {
                    self.start_call().await;
                }
            }
            Signal::CallTick(remaining) => self.on_call_tick(remaining),
            Signal::CallExpired => {
                if self.phase == SessionPhase::Active {
                    self.end_call_flow(EndReason::TimerEnded).await;
                }
            }
            Signal::Room(Some(room)) => self.on_room_update(room).await,
            Signal::Room(None) => {
                debug!(target: "call.session", user_id = %self.profile.user_id, "Room document absent");
            }
            Signal::Peer(event) => self.on_peer_event(event).await,
        }
    }

    // ------------------------------------------------------------------
    // Queue
    // ------------------------------------------------------------------

    async fn join_queue(&mut self) -> Result<(), CallError> {
        if !matches!(self.phase, SessionPhase::Idle | SessionPhase::Ended) {
            return Err(self.invalid_state("join the queue"));
        }

        self.generation += 1;
        let watch = self.matcher.join_queue(&self.profile).await?;
        let token = self.cancel_token.child_token();
        self.spawn_queue_watch(watch, token.clone());
        self.queue_token = Some(token);
        self.phase = SessionPhase::Queued;
        self.emit(SessionEvent::Queued);
        Ok(())
    }

    async fn leave_queue(&mut self) -> Result<(), CallError> {
        if self.phase.in_call() {
            return Err(self.invalid_state("leave the queue"));
        }
        self.cancel_queue_watch();
        self.matcher
            .leave_queue(&self.profile.user_id, None)
            .await?;
        if self.phase == SessionPhase::Queued {
            self.phase = SessionPhase::Idle;
        }
        Ok(())
    }

    async fn next_partner(&mut self) -> Result<(), CallError> {
        match self.phase {
            SessionPhase::Queued => Ok(()),
            phase if phase.in_call() => Err(self.invalid_state("find a new partner")),
            _ => {
                self.last_room = None;
                self.phase = SessionPhase::Idle;
                self.join_queue().await
            }
        }
    }

    fn cancel_queue_watch(&mut self) {
        if let Some(token) = self.queue_token.take() {
            token.cancel();
        }
    }

    fn spawn_queue_watch(&self, mut watch: MatchWatch, token: CancellationToken) {
        let notifier = self.notifier();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                event = watch.next() => {
                    if let Some(event) = event {
                        notifier.send(Signal::Queue(event));
                    }
                }
            }
            watch.cancel();
        });
    }

    // ------------------------------------------------------------------
    // Match and grace period
    // ------------------------------------------------------------------

    #[instrument(skip_all, fields(user_id = %self.profile.user_id, room_id = %info.room_id))]
    async fn on_matched(&mut self, info: MatchInfo) {
        if self.phase != SessionPhase::Queued {
            return;
        }
        self.cancel_queue_watch();

        // The queue entry only carries a provisional view; the room decides.
        let role = match self
            .rooms
            .resolve_role(&info.room_id, &self.profile.user_id)
            .await
        {
            Ok(role) => role,
            Err(e) => {
                warn!(
                    target: "call.session",
                    user_id = %self.profile.user_id,
                    room_id = %info.room_id,
                    error = %e,
                    "Role resolution failed"
                );
                self.phase = SessionPhase::Idle;
                self.emit_error(&e);
                return;
            }
        };

        self.generation += 1;
        let token = self.cancel_token.child_token();
        if let Err(e) = self.spawn_room_watch(&info.room_id, token.clone()) {
            self.phase = SessionPhase::Idle;
            self.emit_error(&e);
            return;
        }

        let call = ActiveCall {
            room_id: info.room_id.clone(),
            role,
            partner_display_name: info.partner_display_name.clone(),
            token,
            grace: CallTimer::new(),
            timer: CallTimer::new(),
            media: LocalMedia::new(Arc::clone(&self.deps.devices)),
            peer: None,
            relay: None,
            pending_candidates: Vec::new(),
            awaiting_offer: false,
            started: false,
            base_duration_sec: 0,
            alerted: false,
            reconnecting: false,
        };

        let tick = self.notifier();
        let expire = tick.clone();
        call.grace.start(
            self.deps.config.grace_period_secs,
            move |remaining| tick.send(Signal::GraceTick(remaining)),
            move || expire.send(Signal::GraceExpired),
        );
        self.call = Some(call);
        self.phase = SessionPhase::Matched;

        info!(
            target: "call.session",
            user_id = %self.profile.user_id,
            room_id = %info.room_id,
            role = %role,
            "Matched"
        );
        self.emit(SessionEvent::Matched {
            room_id: info.room_id,
            role,
            partner_display_name: info.partner_display_name,
            partner_avatar_ref: info.partner_avatar_ref,
        });
    }

    fn spawn_room_watch(&self, room_id: &RoomId, token: CancellationToken) -> Result<(), CallError> {
        let mut subscription = self.rooms.watch(room_id)?;
        let notifier = self.notifier();
        let room_id = room_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    change = subscription.next() => {
                        let Some(change) = change else { break };
                        match change.snapshot.map(|s| s.decode::<Room>()).transpose() {
                            Ok(room) => notifier.send(Signal::Room(room)),
                            Err(e) => {
                                warn!(target: "call.session", room_id = %room_id, error = %e, "Ignoring malformed room");
                            }
                        }
                    }
                }
            }
            subscription.cancel();
        });
        Ok(())
    }

    fn spawn_peer_events(&self, mut events: mpsc::Receiver<PeerEvent>, token: CancellationToken) {
        let notifier = self.notifier();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        notifier.send(Signal::Peer(event));
                    }
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Connecting
    // ------------------------------------------------------------------

    /// Acquire media, connect the peer and start signaling.
    async fn start_call(&mut self) {
        let Some(mut call) = self.call.take() else {
            return;
        };
        let result = self.connect(&mut call).await;
        self.call = Some(call);

        match result {
            Ok(()) => {}
            Err(CallError::Media(error)) => {
                self.phase = SessionPhase::MediaFailed;
                self.emit(SessionEvent::MediaError {
                    message: error.user_message().to_string(),
                    error,
                });
            }
            Err(e) => {
                warn!(target: "call.session", user_id = %self.profile.user_id, error = %e, "Call setup failed");
                self.emit_error(&e);
                self.end_call_flow(EndReason::PartnerDisconnected).await;
            }
        }
    }

    async fn connect(&mut self, call: &mut ActiveCall) -> Result<(), CallError> {
        call.grace.stop();
        self.phase = SessionPhase::Connecting;

        let stream = call.media.acquire().await?;
        self.emit(SessionEvent::LocalStream {
            stream_id: stream.id(),
        });

        if call.peer.is_none() {
            let config = PeerConfig {
                ice_servers: self.deps.config.ice_servers.clone(),
            };
            let handle = self.deps.connector.connect(&config, stream)?;
            self.spawn_peer_events(handle.events, call.token.clone());
            call.peer = Some(handle.connection);
        }

        self.start_signaling(call).await
    }

    async fn start_signaling(&mut self, call: &mut ActiveCall) -> Result<(), CallError> {
        if call.relay.is_some() {
            return Ok(());
        }
        let Some(peer) = call.peer.clone() else {
            return Ok(());
        };

        let store = Arc::clone(&self.deps.store);
        let relay = match call.role {
            Role::Caller => SignalingRelay::start_as_caller(store, call.room_id.clone(), peer).await?,
            Role::Callee => {
                match SignalingRelay::start_as_callee(store, call.room_id.clone(), peer).await {
                    Ok(relay) => relay,
                    Err(CallError::NotOffered(_)) => {
                        debug!(target: "call.session", room_id = %call.room_id, "Waiting for the caller's offer");
                        call.awaiting_offer = true;
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
            }
        };
        call.awaiting_offer = false;

        for candidate in call.pending_candidates.drain(..) {
            if let Err(e) = relay.send_candidate(&candidate).await {
                warn!(target: "call.session", room_id = %call.room_id, error = %e, "Failed to send local candidate");
            }
        }
        call.relay = Some(relay);

        if call.role == Role::Callee {
            self.rooms
                .activate(&call.room_id, &self.profile.user_id)
                .await?;
        }
        Ok(())
    }

    async fn retry_signaling(&mut self) {
        let Some(mut call) = self.call.take() else {
            return;
        };
        let result = self.start_signaling(&mut call).await;
        self.call = Some(call);
        if let Err(e) = result {
            warn!(target: "call.session", user_id = %self.profile.user_id, error = %e, "Signaling failed");
            self.emit_error(&e);
            self.end_call_flow(EndReason::PartnerDisconnected).await;
        }
    }

    // ------------------------------------------------------------------
    // Room updates and countdown
    // ------------------------------------------------------------------

    async fn on_room_update(&mut self, room: Room) {
        let Some(call) = self.call.as_ref() else {
            return;
        };

        match room.status {
            RoomStatus::Ended => {
                info!(
                    target: "call.session",
                    user_id = %self.profile.user_id,
                    room_id = %call.room_id,
                    "Room ended remotely"
                );
                let reason = room.end_reason.unwrap_or(EndReason::PartnerDisconnected);
                self.finish_call(reason).await;
            }
            RoomStatus::Active => self.on_room_active(&room).await,
            RoomStatus::Waiting => {
                if call.awaiting_offer && room.offer.is_some() {
                    self.retry_signaling().await;
                }
            }
        }
    }

    /// Start or re-derive the countdown from `startedAt + baseDurationSec`.
    async fn on_room_active(&mut self, room: &Room) {
        if room.status != RoomStatus::Active {
            return;
        }
        let Some(call) = self.call.as_ref() else {
            return;
        };
        let first = !call.started;
        if !first && room.base_duration_sec == call.base_duration_sec {
            return;
        }

        let remaining = match self.rooms.remaining_seconds(room).await {
            Ok(Some(remaining)) => remaining,
            Ok(None) => return,
            Err(e) => {
                warn!(target: "call.session", user_id = %self.profile.user_id, error = %e, "Could not read store time");
                return;
            }
        };

        let tick = self.notifier();
        let expire = tick.clone();
        let Some(call) = self.call.as_mut() else {
            return;
        };
        call.timer.start(
            remaining,
            move |left| tick.send(Signal::CallTick(left)),
            move || expire.send(Signal::CallExpired),
        );
        call.started = true;
        call.base_duration_sec = room.base_duration_sec;
        call.alerted = false;
        self.phase = SessionPhase::Active;

        if first {
            info!(target: "call.session", user_id = %self.profile.user_id, remaining = remaining, "Call started");
            self.emit(SessionEvent::CallStarted { remaining });
        } else {
            self.emit(SessionEvent::Extended {
                remaining,
                extensions_count: room.extensions_count,
            });
        }
    }

    fn on_call_tick(&mut self, remaining: u64) {
        if self.phase != SessionPhase::Active {
            return;
        }
        let alert_at = self.deps.config.extension_alert_secs;
        let alert = match self.call.as_mut() {
            Some(call) if remaining <= alert_at && !call.alerted => {
                call.alerted = true;
                true
            }
            _ => false,
        };
        self.emit(SessionEvent::Tick { remaining });
        if alert {
            self.emit(SessionEvent::ExtensionAvailable { remaining });
        }
    }

    async fn request_extension(&mut self) -> Result<bool, CallError> {
        if self.phase != SessionPhase::Active {
            return Ok(false);
        }
        let Some(room_id) = self.call.as_ref().map(|c| c.room_id.clone()) else {
            return Ok(false);
        };
        match self
            .rooms
            .request_extension(&room_id, &self.profile.user_id)
            .await
        {
            Ok(room) => {
                self.on_room_active(&room).await;
                Ok(true)
            }
            Err(CallError::InvalidState(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // Peer events
    // ------------------------------------------------------------------

    async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let Some(call) = self.call.as_mut() else {
                    return;
                };
                match &call.relay {
                    Some(relay) => {
                        if let Err(e) = relay.send_candidate(&candidate).await {
                            warn!(target: "call.session", room_id = %call.room_id, error = %e, "Failed to send local candidate");
                        }
                    }
                    None => call.pending_candidates.push(candidate),
                }
            }
            PeerEvent::RemoteStream { stream_id } => {
                self.emit(SessionEvent::RemoteStream { stream_id });
            }
            PeerEvent::Connectivity(state) => self.on_connectivity(state).await,
        }
    }

    async fn on_connectivity(&mut self, state: ConnectivityState) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        debug!(target: "call.session", room_id = %call.room_id, state = ?state, "Connectivity changed");

        match state {
            ConnectivityState::Disconnected if !call.reconnecting => {
                call.reconnecting = true;
                self.emit(SessionEvent::Reconnecting);
            }
            ConnectivityState::Connected | ConnectivityState::Completed if call.reconnecting => {
                call.reconnecting = false;
                self.emit(SessionEvent::Reconnected);
            }
            ConnectivityState::Failed => {
                self.end_call_flow(EndReason::PartnerDisconnected).await;
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Ending
    // ------------------------------------------------------------------

    /// End the room in the store, then tear the call down locally.
    async fn end_call_flow(&mut self, reason: EndReason) {
        let Some(room_id) = self.call.as_ref().map(|c| c.room_id.clone()) else {
            return;
        };
        if let Err(e) = self
            .rooms
            .end_call(&self.profile.user_id, &room_id, reason)
            .await
        {
            warn!(
                target: "call.session",
                user_id = %self.profile.user_id,
                room_id = %room_id,
                error = %e,
                "Failed to end room"
            );
        }
        self.finish_call(reason).await;
    }

    /// Local teardown of the current call. Never writes the room.
    async fn finish_call(&mut self, reason: EndReason) {
        let Some(mut call) = self.call.take() else {
            return;
        };
        call.teardown();

        let (reason, duration_secs) = match self.rooms.fetch(&call.room_id).await {
            Ok(room) => (room.end_reason.unwrap_or(reason), room.total_duration_sec),
            Err(e) => {
                debug!(target: "call.session", room_id = %call.room_id, error = %e, "Ended room unavailable");
                (reason, 0)
            }
        };

        self.phase = SessionPhase::Ended;
        info!(
            target: "call.session",
            user_id = %self.profile.user_id,
            room_id = %call.room_id,
            reason = %reason,
            duration_secs = duration_secs,
            "Call ended"
        );
        self.last_room = Some(call.room_id.clone());
        self.emit(SessionEvent::CallEnded {
            room_id: call.room_id,
            reason,
            duration_secs,
            partner_display_name: call.partner_display_name,
        });
    }

    async fn teardown(&mut self) {
        if self.call.is_some() {
            self.end_call_flow(EndReason::UserEnded).await;
        }
        if self.phase == SessionPhase::Queued {
            self.cancel_queue_watch();
            if let Err(e) = self.matcher.leave_queue(&self.profile.user_id, None).await {
                warn!(target: "call.session", user_id = %self.profile.user_id, error = %e, "Failed to leave queue on shutdown");
            }
            self.phase = SessionPhase::Idle;
        }
    }
}
