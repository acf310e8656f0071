//! Signaling Relay.
//!
//! Exchanges the offer/answer and connectivity candidates of one room
//! through the store.
//!
//! # Protocol
//!
//! - Caller writes `offer` to the room, then watches the room for `answer`
//!   and the `calleeCandidates` sequence.
//! - Callee reads the room once, applies `offer`, writes `answer`, then
//!   watches `callerCandidates`.
//! - Each side appends its own local candidates to its own sequence.
//!
//! The answer is applied at most once. Candidates are applied in append
//! order; on the caller they are held back until the answer is applied,
//! since a candidate cannot be added before the remote description.
//!
//! After [`SignalingRelay::cleanup`] every subscription is cancelled and no
//! further writes are attempted.

use crate::error::CallError;
use crate::models::{IceCandidate, Role, Room, SessionDescription};
use crate::peer::PeerConnection;
use crate::room::decode_room;
use crate::schema;
use call_store::{
    to_fields, CollectionPath, DocumentStore, DocumentSubscription, FieldValue, Fields,
    SequenceSubscription, SharedStore, Transaction, DEFAULT_MAX_ATTEMPTS,
};
use common::types::RoomId;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Signaling for one side of one room.
pub struct SignalingRelay {
    store: SharedStore,
    room_id: RoomId,
    role: Role,
    outbound: CollectionPath,
    cancel_token: CancellationToken,
}

impl SignalingRelay {
    fn new(store: SharedStore, room_id: RoomId, role: Role) -> Result<Self, CallError> {
        let outbound = schema::candidates(&room_id, role)?;
        Ok(Self {
            store,
            room_id,
            role,
            outbound,
            cancel_token: CancellationToken::new(),
        })
    }

    /// Start as the caller: create and publish the offer, then listen for
    /// the answer and the callee's candidates.
    ///
    /// # Errors
    ///
    /// Returns an error if the offer cannot be created or written, or
    /// `CallError::AlreadyNegotiated` if the room already carries an offer.
    #[instrument(skip_all, name = "call.signaling.caller", fields(room_id = %room_id))]
    pub async fn start_as_caller(
        store: SharedStore,
        room_id: RoomId,
        peer: Arc<dyn PeerConnection>,
    ) -> Result<Self, CallError> {
        let relay = Self::new(Arc::clone(&store), room_id.clone(), Role::Caller)?;

        let offer = peer.create_offer().await?;
        peer.set_local_description(offer.clone()).await?;
        write_offer(&store, &room_id, &offer).await?;
        info!(target: "call.signaling", room_id = %room_id, "Offer written");

        let room_updates = DocumentSubscription::spawn(Arc::clone(&store), schema::room(&room_id)?);
        let remote_candidates =
            SequenceSubscription::spawn(store, schema::candidates(&room_id, Role::Callee)?);
        tokio::spawn(run_caller(
            room_id,
            peer,
            room_updates,
            remote_candidates,
            relay.cancel_token.clone(),
        ));
        Ok(relay)
    }

    /// Start as the callee: apply the offer, publish the answer, then
    /// listen for the caller's candidates.
    ///
    /// # Errors
    ///
    /// Returns `CallError::NotOffered` if the room is missing or has no offer yet.
    #[instrument(skip_all, name = "call.signaling.callee", fields(room_id = %room_id))]
    pub async fn start_as_callee(
        store: SharedStore,
        room_id: RoomId,
        peer: Arc<dyn PeerConnection>,
    ) -> Result<Self, CallError> {
        let relay = Self::new(Arc::clone(&store), room_id.clone(), Role::Callee)?;

        let snapshot = store.get(&schema::room(&room_id)?).await?;
        let offer = snapshot
            .map(|s| s.decode::<Room>())
            .transpose()?
            .and_then(|room| room.offer)
            .ok_or_else(|| CallError::NotOffered(room_id.to_string()))?;

        peer.set_remote_description(offer).await?;
        let answer = peer.create_answer().await?;
        peer.set_local_description(answer.clone()).await?;
        write_answer(&store, &room_id, &answer).await?;
        info!(target: "call.signaling", room_id = %room_id, "Answer written");

        let remote_candidates =
            SequenceSubscription::spawn(store, schema::candidates(&room_id, Role::Caller)?);
        tokio::spawn(run_callee(
            room_id,
            peer,
            remote_candidates,
            relay.cancel_token.clone(),
        ));
        Ok(relay)
    }

    /// Append a local candidate to this side's sequence.
    ///
    /// Silently dropped after cleanup.
    ///
    /// # Errors
    ///
    /// Returns an error if the append fails.
    pub async fn send_candidate(&self, candidate: &IceCandidate) -> Result<(), CallError> {
        if self.cancel_token.is_cancelled() {
            debug!(target: "call.signaling", room_id = %self.room_id, "Dropping candidate after cleanup");
            return Ok(());
        }
        self.store
            .append(self.outbound.clone(), to_fields(candidate)?)
            .await?;
        Ok(())
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Cancel all subscriptions and stop writing. Idempotent.
    pub fn cleanup(&self) {
        if !self.cancel_token.is_cancelled() {
            debug!(target: "call.signaling", room_id = %self.room_id, role = %self.role, "Signaling cleaned up");
        }
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

impl Drop for SignalingRelay {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn write_offer(
    store: &SharedStore,
    room_id: &RoomId,
    offer: &SessionDescription,
) -> Result<(), CallError> {
    write_description(store, room_id, "offer", offer, |room| {
        if room.offer.is_some() {
            Err(CallError::AlreadyNegotiated("offer".to_string()))
        } else {
            Ok(())
        }
    })
    .await
}

async fn write_answer(
    store: &SharedStore,
    room_id: &RoomId,
    answer: &SessionDescription,
) -> Result<(), CallError> {
    write_description(store, room_id, "answer", answer, |room| {
        if room.offer.is_none() {
            Err(CallError::NotOffered(room_id.to_string()))
        } else if room.answer.is_some() {
            Err(CallError::AlreadyNegotiated("answer".to_string()))
        } else {
            Ok(())
        }
    })
    .await
}

/// Write one negotiation field if `check` accepts the current room.
async fn write_description<F>(
    store: &SharedStore,
    room_id: &RoomId,
    field: &str,
    description: &SessionDescription,
    check: F,
) -> Result<(), CallError>
where
    F: Fn(&Room) -> Result<(), CallError>,
{
    let path = schema::room(room_id)?;
    let value = serde_json::to_value(description).map_err(call_store::StoreError::from)?;
    for attempt in 1..=DEFAULT_MAX_ATTEMPTS {
        let mut tx = Transaction::new(store.as_ref());
        let room = decode_room(room_id, tx.get(&path).await?)?;
        check(&room)?;
        tx.update(
            path.clone(),
            Fields::from([(field.to_string(), FieldValue::Value(value.clone()))]),
        );
        match tx.commit().await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_conflict() => {
                debug!(target: "call.signaling", room_id = %room_id, field = field, attempt = attempt, "Negotiation write conflicted");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(CallError::Contention(format!("write {field} for {room_id}")))
}

async fn apply_candidate(room_id: &RoomId, peer: &dyn PeerConnection, candidate: IceCandidate) {
    if let Err(e) = peer.add_ice_candidate(candidate).await {
        warn!(target: "call.signaling", room_id = %room_id, error = %e, "Failed to apply remote candidate");
    }
}

async fn run_caller(
    room_id: RoomId,
    peer: Arc<dyn PeerConnection>,
    mut room_updates: DocumentSubscription,
    mut remote_candidates: SequenceSubscription,
    cancel_token: CancellationToken,
) {
    let mut pending: Vec<IceCandidate> = Vec::new();
    let mut answered = false;

    loop {
        tokio::select! {
            biased;
            () = cancel_token.cancelled() => break,

            change = room_updates.next(), if !answered => {
                let Some(change) = change else { break };
                let Some(snapshot) = change.snapshot else { continue };
                let answer = match snapshot.decode::<Room>() {
                    Ok(room) => room.answer,
                    Err(e) => {
                        warn!(target: "call.signaling", room_id = %room_id, error = %e, "Ignoring malformed room");
                        continue;
                    }
                };
                let Some(answer) = answer else { continue };

                if !peer.has_remote_description() {
                    if let Err(e) = peer.set_remote_description(answer).await {
                        warn!(target: "call.signaling", room_id = %room_id, error = %e, "Failed to apply answer");
                        continue;
                    }
                    info!(target: "call.signaling", room_id = %room_id, "Answer applied");
                }
                answered = true;
                room_updates.cancel();
                for candidate in pending.drain(..) {
                    apply_candidate(&room_id, peer.as_ref(), candidate).await;
                }
            }

            item = remote_candidates.next() => {
                let Some(item) = item else { break };
                match item.decode::<IceCandidate>() {
                    Ok(candidate) if answered => {
                        apply_candidate(&room_id, peer.as_ref(), candidate).await;
                    }
                    Ok(candidate) => pending.push(candidate),
                    Err(e) => {
                        warn!(target: "call.signaling", room_id = %room_id, seq = item.seq, error = %e, "Ignoring malformed candidate");
                    }
                }
            }
        }
    }

    room_updates.cancel();
    remote_candidates.cancel();
}

async fn run_callee(
    room_id: RoomId,
    peer: Arc<dyn PeerConnection>,
    mut remote_candidates: SequenceSubscription,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel_token.cancelled() => break,

            item = remote_candidates.next() => {
                let Some(item) = item else { break };
                match item.decode::<IceCandidate>() {
                    Ok(candidate) => apply_candidate(&room_id, peer.as_ref(), candidate).await,
                    Err(e) => {
                        warn!(target: "call.signaling", room_id = %room_id, seq = item.seq, error = %e, "Ignoring malformed candidate");
                    }
                }
            }
        }
    }

    remote_candidates.cancel();
}
