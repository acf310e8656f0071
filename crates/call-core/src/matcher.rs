//! Queue Matcher.
//!
//! Maintains the waiting pool and performs the pairing transaction.
//!
//! # Pairing
//!
//! A pairing pass can be started by any number of producers at once (every
//! client right after joining, plus the controller reacting to new entries).
//! Safety comes from a single guarded commit: both entries are re-read inside
//! a [`Transaction`], and the room is only created if both are still
//! `waiting`. The store rejects the commit if either entry changed after it
//! was read, so each entry moves to `matched` at most once.

use crate::config::CallConfig;
use crate::error::CallError;
use crate::models::{MatchInfo, Room, UserProfile, WaitingEntry, WaitingStatus};
use crate::schema;
use call_store::{
    to_fields, DocumentStore, DocumentSubscription, FieldValue, Fields, Query, SharedStore,
    Snapshot, Transaction,
};
use common::types::{RoomId, Timestamp, UserId};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Result of one pairing pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingOutcome {
    /// A room was created and both entries now reference it.
    Paired {
        room_id: RoomId,
        caller_id: UserId,
        callee_id: UserId,
    },
    /// Nobody else is waiting.
    NoCandidate,
    /// The initiator or the candidate was claimed or removed first.
    Aborted,
}

impl PairingOutcome {
    /// Label for logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PairingOutcome::Paired { .. } => "paired",
            PairingOutcome::NoCandidate => "no_candidate",
            PairingOutcome::Aborted => "aborted",
        }
    }
}

/// Something that happened to a watched waiting entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Matched(MatchInfo),
    /// The entry was deleted (left the queue or swept as stale).
    Removed,
}

/// Watches the caller's own waiting entry until it is matched.
///
/// Delivers at most one [`QueueEvent`]; the underlying subscription is
/// cancelled as soon as the match (or removal) is observed.
pub struct MatchWatch {
    user_id: UserId,
    subscription: DocumentSubscription,
}

impl MatchWatch {
    fn spawn(store: SharedStore, user_id: UserId) -> Result<Self, CallError> {
        let path = schema::queue_entry(&user_id)?;
        Ok(Self {
            user_id,
            subscription: DocumentSubscription::spawn(store, path),
        })
    }

    /// Wait for the entry to be matched or removed.
    ///
    /// Returns `None` once cancelled or after the single event was delivered.
    pub async fn next(&mut self) -> Option<QueueEvent> {
        while let Some(change) = self.subscription.next().await {
            let Some(snapshot) = change.snapshot else {
                self.subscription.cancel();
                return Some(QueueEvent::Removed);
            };
            match snapshot.decode::<WaitingEntry>() {
                Ok(entry) => {
                    if let Some(info) = entry.match_info() {
                        self.subscription.cancel();
                        info!(
                            target: "call.matcher",
                            user_id = %self.user_id,
                            room_id = %info.room_id,
                            "Match observed"
                        );
                        return Some(QueueEvent::Matched(info));
                    }
                }
                Err(e) => {
                    warn!(
                        target: "call.matcher",
                        user_id = %self.user_id,
                        error = %e,
                        "Ignoring malformed waiting entry"
                    );
                }
            }
        }
        None
    }

    /// Stop watching. Calling this more than once is a no-op.
    pub fn cancel(&self) {
        self.subscription.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.subscription.is_cancelled()
    }
}

/// Queue operations for one client.
#[derive(Clone)]
pub struct QueueMatcher {
    store: SharedStore,
    config: CallConfig,
}

impl QueueMatcher {
    #[must_use]
    pub fn new(store: SharedStore, config: CallConfig) -> Self {
        Self { store, config }
    }

    /// Enter the waiting pool, then try to pair immediately.
    ///
    /// Re-joining overwrites any earlier entry for the same user. A failed
    /// pairing pass is logged and does not fail the join: the background
    /// reaction gets another chance at it.
    ///
    /// # Errors
    ///
    /// Returns an error if the waiting entry could not be written.
    #[instrument(skip_all, name = "call.matcher.join", fields(user_id = %profile.user_id))]
    pub async fn join_queue(&self, profile: &UserProfile) -> Result<MatchWatch, CallError> {
        let path = schema::queue_entry(&profile.user_id)?;
        let entry = WaitingEntry {
            user_id: profile.user_id.clone(),
            display_name: profile.display_name_or_default(),
            avatar_ref: profile.avatar_ref.clone(),
            enqueued_at: Timestamp::default(),
            status: WaitingStatus::Waiting,
            matched_with: None,
            room_id: None,
            partner_display_name: None,
            partner_avatar_ref: None,
        };
        let mut fields = to_fields(&entry)?;
        fields.insert("enqueuedAt".to_string(), FieldValue::ServerTimestamp);
        self.store.set(path, fields).await?;

        info!(target: "call.matcher", user_id = %profile.user_id, "Joined queue");

        let watch = MatchWatch::spawn(Arc::clone(&self.store), profile.user_id.clone())?;

        match run_pairing_pass(&self.store, &profile.user_id, &self.config).await {
            Ok(outcome) => {
                debug!(
                    target: "call.matcher",
                    user_id = %profile.user_id,
                    outcome = outcome.as_str(),
                    "Client pairing pass finished"
                );
            }
            Err(e) => {
                warn!(
                    target: "call.matcher",
                    user_id = %profile.user_id,
                    error = %e,
                    "Client pairing pass failed"
                );
            }
        }

        Ok(watch)
    }

    /// Leave the waiting pool. No error if the entry is already gone.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete could not be committed.
    #[instrument(skip_all, name = "call.matcher.leave", fields(user_id = %user_id))]
    pub async fn leave_queue(
        &self,
        user_id: &UserId,
        watch: Option<MatchWatch>,
    ) -> Result<(), CallError> {
        if let Some(watch) = watch {
            watch.cancel();
        }
        self.store.delete(schema::queue_entry(user_id)?).await?;
        info!(target: "call.matcher", user_id = %user_id, "Left queue");
        Ok(())
    }

    /// Run one pairing pass with `initiator` as the newcomer.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub async fn pair(&self, initiator: &UserId) -> Result<PairingOutcome, CallError> {
        run_pairing_pass(&self.store, initiator, &self.config).await
    }
}

/// One pairing pass for `initiator`.
///
/// Picks the earliest-enqueued waiting entry other than the initiator and
/// runs the guarded pairing transaction, retrying on store conflicts. Losing
/// a race is [`PairingOutcome::Aborted`], never an error.
///
/// # Errors
///
/// Returns an error on store failure other than a conflict.
#[instrument(skip_all, name = "call.matcher.pairing_pass", fields(initiator = %initiator))]
pub async fn run_pairing_pass(
    store: &SharedStore,
    initiator: &UserId,
    config: &CallConfig,
) -> Result<PairingOutcome, CallError> {
    let query = Query::collection(schema::queue()?)
        .where_eq("status", WaitingStatus::Waiting.as_str())
        .order_by("enqueuedAt")
        .limit(config.pairing_page_size);
    let waiting = store.query(&query).await?;

    let Some(candidate) = waiting
        .iter()
        .find(|snapshot| snapshot.path.id() != initiator.as_str())
    else {
        return Ok(PairingOutcome::NoCandidate);
    };
    let candidate_id = UserId::parse(candidate.path.id())?;

    for attempt in 1..=config.max_transaction_attempts {
        match try_pair(store, initiator, &candidate_id, config).await {
            Err(CallError::Store(e)) if e.is_conflict() => {
                debug!(
                    target: "call.matcher",
                    initiator = %initiator,
                    candidate = %candidate_id,
                    attempt = attempt,
                    "Pairing transaction conflicted"
                );
            }
            Ok(outcome) => {
                if let PairingOutcome::Paired { room_id, .. } = &outcome {
                    info!(
                        target: "call.matcher",
                        room_id = %room_id,
                        caller_id = %candidate_id,
                        callee_id = %initiator,
                        "Paired users"
                    );
                }
                return Ok(outcome);
            }
            Err(e) => return Err(e),
        }
    }

    Ok(PairingOutcome::Aborted)
}

/// The guarded pairing transaction. `candidate` becomes the caller.
async fn try_pair(
    store: &SharedStore,
    initiator: &UserId,
    candidate: &UserId,
    config: &CallConfig,
) -> Result<PairingOutcome, CallError> {
    let initiator_path = schema::queue_entry(initiator)?;
    let candidate_path = schema::queue_entry(candidate)?;

    let mut tx = Transaction::new(store.as_ref());
    let Some(initiator_entry) = still_waiting(tx.get(&initiator_path).await?) else {
        return Ok(PairingOutcome::Aborted);
    };
    let Some(candidate_entry) = still_waiting(tx.get(&candidate_path).await?) else {
        return Ok(PairingOutcome::Aborted);
    };

    let room_id = RoomId::new();
    let room = Room::new(candidate.clone(), initiator.clone(), config.base_duration_secs);
    let mut room_fields = to_fields(&room)?;
    room_fields.insert("createdAt".to_string(), FieldValue::ServerTimestamp);

    tx.set(schema::room(&room_id)?, room_fields);
    tx.update(initiator_path, matched_fields(&candidate_entry, &room_id));
    tx.update(candidate_path, matched_fields(&initiator_entry, &room_id));
    tx.commit().await?;

    Ok(PairingOutcome::Paired {
        room_id,
        caller_id: candidate.clone(),
        callee_id: initiator.clone(),
    })
}

/// Decode a waiting entry, keeping it only if it is still `waiting`.
fn still_waiting(snapshot: Option<Snapshot>) -> Option<WaitingEntry> {
    let snapshot = snapshot?;
    match snapshot.decode::<WaitingEntry>() {
        Ok(entry) if entry.status == WaitingStatus::Waiting => Some(entry),
        Ok(_) => None,
        Err(e) => {
            warn!(
                target: "call.matcher",
                key = %snapshot.path,
                error = %e,
                "Skipping malformed waiting entry"
            );
            None
        }
    }
}

/// Fields flipping an entry to `matched` with `partner`.
fn matched_fields(partner: &WaitingEntry, room_id: &RoomId) -> Fields {
    Fields::from([
        (
            "status".to_string(),
            FieldValue::value(WaitingStatus::Matched.as_str()),
        ),
        (
            "matchedWith".to_string(),
            FieldValue::value(partner.user_id.as_str()),
        ),
        ("roomId".to_string(), FieldValue::value(room_id.as_str())),
        (
            "partnerDisplayName".to_string(),
            FieldValue::value(partner.display_name.as_str()),
        ),
        (
            "partnerAvatarRef".to_string(),
            FieldValue::value(partner.avatar_ref.clone()),
        ),
    ])
}
