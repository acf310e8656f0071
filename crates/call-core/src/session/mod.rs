//! Call session.
//!
//! One [`CallSession`] per client. It owns everything a client holds
//! during a call (queue watch, room watch, signaling relay, timers, local
//! media, peer connection) and tears all of it down on every terminal
//! transition. It runs as an actor: commands go in over an mpsc channel
//! with oneshot replies, [`SessionEvent`]s come out on another.
//!
//! # Phases
//!
//! ```text
//! Idle -> Queued -> Matched (grace) -> Connecting -> Active -> Ended
//!                                          |  ^
//!                                          v  |
//!                                      MediaFailed
//! ```
//!
//! The role from the match notification is only provisional; the session
//! confirms it from the room's `callerId` before any signaling.

mod actor;

use crate::config::CallConfig;
use crate::error::CallError;
use crate::media::{MediaDevices, MediaError};
use crate::models::{EndReason, Role, UserProfile};
use crate::peer::PeerConnector;
use call_store::SharedStore;
use common::types::RoomId;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Command mailbox size.
const SESSION_CHANNEL_BUFFER: usize = 32;

/// Where the session is in the call flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Queued,
    /// Paired; the grace countdown is running.
    Matched,
    Connecting,
    Active,
    /// Local media failed; `retry_media` resumes.
    MediaFailed,
    Ended,
}

impl SessionPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Queued => "queued",
            SessionPhase::Matched => "matched",
            SessionPhase::Connecting => "connecting",
            SessionPhase::Active => "active",
            SessionPhase::MediaFailed => "media_failed",
            SessionPhase::Ended => "ended",
        }
    }

    /// Whether a room is held (matched through media failure).
    #[must_use]
    pub fn in_call(self) -> bool {
        matches!(
            self,
            SessionPhase::Matched
                | SessionPhase::Connecting
                | SessionPhase::Active
                | SessionPhase::MediaFailed
        )
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notifications for the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Queued,
    /// The waiting entry disappeared before a match (swept or left elsewhere).
    RemovedFromQueue,
    Matched {
        room_id: RoomId,
        role: Role,
        partner_display_name: String,
        partner_avatar_ref: Option<String>,
    },
    GraceTick {
        remaining: u64,
    },
    /// Local media could not be acquired; `retry_media` tries again.
    MediaError {
        error: MediaError,
        message: String,
    },
    LocalStream {
        stream_id: String,
    },
    RemoteStream {
        stream_id: String,
    },
    CallStarted {
        remaining: u64,
    },
    Tick {
        remaining: u64,
    },
    /// Emitted once per countdown when little time is left.
    ExtensionAvailable {
        remaining: u64,
    },
    Extended {
        remaining: u64,
        extensions_count: u64,
    },
    Reconnecting,
    Reconnected,
    CallEnded {
        room_id: RoomId,
        reason: EndReason,
        duration_secs: u64,
        partner_display_name: String,
    },
    /// Something failed that the user may want to know about.
    Error {
        code: &'static str,
        message: String,
    },
}

/// Collaborators a session needs.
#[derive(Clone)]
pub struct SessionDeps {
    pub store: SharedStore,
    pub devices: Arc<dyn MediaDevices>,
    pub connector: Arc<dyn PeerConnector>,
    pub config: CallConfig,
}

pub(crate) enum SessionCommand {
    JoinQueue {
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },
    LeaveQueue {
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },
    StartNow {
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },
    RetryMedia {
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },
    ToggleAudio {
        respond_to: oneshot::Sender<bool>,
    },
    ToggleVideo {
        respond_to: oneshot::Sender<bool>,
    },
    RequestExtension {
        respond_to: oneshot::Sender<Result<bool, CallError>>,
    },
    EndCall {
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },
    SubmitRating {
        rating: u8,
        respond_to: oneshot::Sender<Result<bool, CallError>>,
    },
    NextPartner {
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },
    GetPhase {
        respond_to: oneshot::Sender<SessionPhase>,
    },
}

/// Entry point for creating sessions.
pub struct CallSession;

impl CallSession {
    /// Spawn a session for `profile`.
    ///
    /// Returns the handle, the event stream and the actor's join handle.
    #[must_use]
    pub fn spawn(
        profile: UserProfile,
        deps: SessionDeps,
    ) -> (
        CallSessionHandle,
        mpsc::UnboundedReceiver<SessionEvent>,
        JoinHandle<()>,
    ) {
        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_BUFFER);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel_token = CancellationToken::new();

        let actor = actor::CallSessionActor::new(
            profile,
            deps,
            receiver,
            events_tx,
            cancel_token.clone(),
        );
        let task_handle = tokio::spawn(actor.run());

        (
            CallSessionHandle {
                sender,
                cancel_token,
            },
            events_rx,
            task_handle,
        )
    }
}

/// Handle to a running session.
#[derive(Clone, Debug)]
pub struct CallSessionHandle {
    sender: mpsc::Sender<SessionCommand>,
    cancel_token: CancellationToken,
}

impl CallSessionHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| CallError::SessionClosed)?;
        rx.await.map_err(|_| CallError::SessionClosed)
    }

    /// Enter the queue.
    ///
    /// # Errors
    ///
    /// Returns `CallError::InvalidState` unless idle or ended.
    pub async fn join_queue(&self) -> Result<(), CallError> {
        self.request(|respond_to| SessionCommand::JoinQueue { respond_to })
            .await?
    }

    /// Leave the queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry could not be deleted.
    pub async fn leave_queue(&self) -> Result<(), CallError> {
        self.request(|respond_to| SessionCommand::LeaveQueue { respond_to })
            .await?
    }

    /// Skip the rest of the grace countdown.
    ///
    /// # Errors
    ///
    /// Returns `CallError::InvalidState` unless matched.
    pub async fn start_now(&self) -> Result<(), CallError> {
        self.request(|respond_to| SessionCommand::StartNow { respond_to })
            .await?
    }

    /// Try acquiring local media again after a failure.
    ///
    /// # Errors
    ///
    /// Returns `CallError::InvalidState` unless media failed.
    pub async fn retry_media(&self) -> Result<(), CallError> {
        self.request(|respond_to| SessionCommand::RetryMedia { respond_to })
            .await?
    }

    /// Flip the microphone. Returns the new state.
    ///
    /// # Errors
    ///
    /// Returns `CallError::SessionClosed` if the session is gone.
    pub async fn toggle_audio(&self) -> Result<bool, CallError> {
        self.request(|respond_to| SessionCommand::ToggleAudio { respond_to })
            .await
    }

    /// Flip the camera. Returns the new state.
    ///
    /// # Errors
    ///
    /// Returns `CallError::SessionClosed` if the session is gone.
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        self.request(|respond_to| SessionCommand::ToggleVideo { respond_to })
            .await
    }

    /// Extend the running call. `Ok(false)` if there is no active call.
    ///
    /// # Errors
    ///
    /// Returns an error if the room update failed.
    pub async fn request_extension(&self) -> Result<bool, CallError> {
        self.request(|respond_to| SessionCommand::RequestExtension { respond_to })
            .await?
    }

    /// End the call as `user_ended`.
    ///
    /// # Errors
    ///
    /// Returns `CallError::InvalidState` if there is no call.
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|respond_to| SessionCommand::EndCall { respond_to })
            .await?
    }

    /// Rate the last call.
    ///
    /// # Errors
    ///
    /// Returns `CallError::InvalidState` if no call has ended yet, or
    /// `CallError::InvalidArgument` for a rating outside 1..=5.
    pub async fn submit_rating(&self, rating: u8) -> Result<bool, CallError> {
        self.request(|respond_to| SessionCommand::SubmitRating { rating, respond_to })
            .await?
    }

    /// Reset after a call and queue again.
    ///
    /// # Errors
    ///
    /// Returns `CallError::InvalidState` during a call.
    pub async fn next_partner(&self) -> Result<(), CallError> {
        self.request(|respond_to| SessionCommand::NextPartner { respond_to })
            .await?
    }

    /// # Errors
    ///
    /// Returns `CallError::SessionClosed` if the session is gone.
    pub async fn phase(&self) -> Result<SessionPhase, CallError> {
        self.request(|respond_to| SessionCommand::GetPhase { respond_to })
            .await
    }

    /// Tear the session down. An in-progress call ends as `user_ended`.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}
