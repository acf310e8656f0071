//! Mock peer connections.
//!
//! A [`MockPeerConnection`] behaves like a browser peer connection as far
//! as signaling is concerned:
//! - setting the local description emits the configured number of local
//!   candidates
//! - adding a remote candidate before the remote description fails
//! - once both descriptions are set it reports `Connected` and a remote stream

use async_trait::async_trait;
use call_core::error::CallError;
use call_core::media::MediaStream;
use call_core::models::{IceCandidate, SessionDescription};
use call_core::peer::{
    ConnectivityState, PeerConfig, PeerConnection, PeerConnector, PeerEvent, PeerHandle,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Default)]
struct PeerState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    connected: bool,
}

pub struct MockPeerConnection {
    label: String,
    local_candidates: usize,
    state: Mutex<PeerState>,
    events: mpsc::Sender<PeerEvent>,
    closed: AtomicBool,
}

impl MockPeerConnection {
    /// Build a connection and the receiver of its events.
    pub fn new(label: impl Into<String>, local_candidates: usize) -> (Arc<Self>, mpsc::Receiver<PeerEvent>) {
        let (events, receiver) = mpsc::channel(EVENT_BUFFER);
        let peer = Arc::new(Self {
            label: label.into(),
            local_candidates,
            state: Mutex::new(PeerState::default()),
            events,
            closed: AtomicBool::new(false),
        });
        (peer, receiver)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().unwrap().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().unwrap().remote.clone()
    }

    /// Remote candidates applied so far, in order.
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().unwrap().applied.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Inject an event, e.g. a connectivity change.
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.try_send(event);
    }

    fn maybe_connect(&self, state: &mut PeerState) {
        if state.local.is_some() && state.remote.is_some() && !state.connected {
            state.connected = true;
            self.emit(PeerEvent::RemoteStream {
                stream_id: format!("remote-of-{}", self.label),
            });
            self.emit(PeerEvent::Connectivity(ConnectivityState::Connected));
        }
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        Ok(SessionDescription::offer(format!("v=0 offer {}", self.label)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        if self.state.lock().unwrap().remote.is_none() {
            return Err(CallError::Peer("no remote offer".to_string()));
        }
        Ok(SessionDescription::answer(format!("v=0 answer {}", self.label)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), CallError> {
        let mut state = self.state.lock().unwrap();
        state.local = Some(description);
        for i in 0..self.local_candidates {
            self.emit(PeerEvent::LocalCandidate(IceCandidate::new(format!(
                "candidate:{}-{i}",
                self.label
            ))));
        }
        self.maybe_connect(&mut state);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), CallError> {
        let mut state = self.state.lock().unwrap();
        state.remote = Some(description);
        self.maybe_connect(&mut state);
        Ok(())
    }

    fn has_remote_description(&self) -> bool {
        self.state.lock().unwrap().remote.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        let mut state = self.state.lock().unwrap();
        if state.remote.is_none() {
            return Err(CallError::Peer(
                "candidate added before remote description".to_string(),
            ));
        }
        state.applied.push(candidate);
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.emit(PeerEvent::Connectivity(ConnectivityState::Closed));
        }
    }
}

/// Connector that records every connection it creates.
#[derive(Default)]
pub struct MockPeerConnector {
    label: String,
    local_candidates: usize,
    connections: Mutex<Vec<Arc<MockPeerConnection>>>,
    configs: Mutex<Vec<PeerConfig>>,
}

impl MockPeerConnector {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    /// Local candidates each connection emits on `set_local_description`.
    pub fn with_local_candidates(mut self, count: usize) -> Self {
        self.local_candidates = count;
        self
    }

    pub fn connections(&self) -> Vec<Arc<MockPeerConnection>> {
        self.connections.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<Arc<MockPeerConnection>> {
        self.connections.lock().unwrap().last().cloned()
    }

    pub fn configs(&self) -> Vec<PeerConfig> {
        self.configs.lock().unwrap().clone()
    }
}

impl PeerConnector for MockPeerConnector {
    fn connect(
        &self,
        config: &PeerConfig,
        _local_stream: Arc<dyn MediaStream>,
    ) -> Result<PeerHandle, CallError> {
        let (peer, events) = MockPeerConnection::new(self.label.clone(), self.local_candidates);
        self.connections.lock().unwrap().push(Arc::clone(&peer));
        self.configs.lock().unwrap().push(config.clone());
        Ok(PeerHandle {
            connection: peer,
            events,
        })
    }
}
