//! Peer-to-peer media transport capability.
//!
//! The transport (ICE, DTLS, codecs) is external. The core drives it
//! through [`PeerConnection`] and consumes its [`PeerEvent`]s.

use crate::error::CallError;
use crate::media::MediaStream;
use crate::models::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Connectivity reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Event emitted by a peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A local candidate to send to the other side.
    LocalCandidate(IceCandidate),
    /// The remote side's media arrived.
    RemoteStream { stream_id: String },
    Connectivity(ConnectivityState),
}

/// Peer connection configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub ice_servers: Vec<String>,
}

/// One peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, CallError>;
    async fn create_answer(&self) -> Result<SessionDescription, CallError>;
    async fn set_local_description(&self, description: SessionDescription)
        -> Result<(), CallError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), CallError>;
    fn has_remote_description(&self) -> bool;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError>;
    fn close(&self);
}

/// A connection with the receiving end of its events.
pub struct PeerHandle {
    pub connection: Arc<dyn PeerConnection>,
    pub events: mpsc::Receiver<PeerEvent>,
}

/// Creates peer connections carrying a local stream.
pub trait PeerConnector: Send + Sync {
    /// # Errors
    ///
    /// Returns `CallError::Peer` if the transport cannot be created.
    fn connect(
        &self,
        config: &PeerConfig,
        local_stream: Arc<dyn MediaStream>,
    ) -> Result<PeerHandle, CallError>;
}
