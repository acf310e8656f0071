//! Pairing reaction background task.
//!
//! Watches the `queue` collection and runs a pairing pass on behalf of
//! every waiting entry it has not seen at its current revision. Clients
//! run the same pass right after joining, so this task and any number of
//! clients may race on one pair; the guarded pairing transaction lets
//! exactly one of them win.
//!
//! A rejoining user rewrites their entry, which bumps its revision and
//! makes the entry eligible again.

use crate::observability::metrics::record_pairing_attempt;
use call_core::matcher::{run_pairing_pass, PairingOutcome};
use call_core::models::WaitingStatus;
use call_core::{schema, CallConfig, CallError};
use call_store::{DocumentStore, Query, SharedStore, StoreError};
use common::types::UserId;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Waiting entries examined per reaction.
pub const REACTION_PAGE_SIZE: usize = 100;

/// Delay before watching again after a store error.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// What one reaction did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReactionReport {
    pub passes: usize,
    pub paired: usize,
}

/// Remembers which entry revisions already had a pass.
pub struct PairingReaction {
    store: SharedStore,
    config: CallConfig,
    processed: HashMap<UserId, u64>,
}

impl PairingReaction {
    #[must_use]
    pub fn new(store: SharedStore, config: CallConfig) -> Self {
        Self {
            store,
            config,
            processed: HashMap::new(),
        }
    }

    /// Run a pass for each unprocessed waiting entry, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the waiting entries cannot be listed. A failed
    /// pass is logged and does not stop the others.
    pub async fn react(&mut self) -> Result<ReactionReport, CallError> {
        let query = Query::collection(schema::queue()?)
            .where_eq("status", WaitingStatus::Waiting.as_str())
            .order_by("enqueuedAt")
            .limit(REACTION_PAGE_SIZE);
        let waiting = self.store.query(&query).await?;

        let mut report = ReactionReport::default();
        let mut claimed: HashSet<UserId> = HashSet::new();
        let mut still_waiting: HashSet<UserId> = HashSet::new();

        for snapshot in &waiting {
            let Ok(user_id) = UserId::parse(snapshot.path.id()) else {
                warn!(target: "cc.task.pairing", path = %snapshot.path, "Skipping unusable queue entry");
                continue;
            };
            still_waiting.insert(user_id.clone());

            if self.processed.get(&user_id) == Some(&snapshot.revision) || claimed.contains(&user_id)
            {
                continue;
            }
            self.processed.insert(user_id.clone(), snapshot.revision);

            report.passes += 1;
            match run_pairing_pass(&self.store, &user_id, &self.config).await {
                Ok(outcome) => {
                    record_pairing_attempt(outcome.as_str());
                    if let PairingOutcome::Paired {
                        room_id,
                        caller_id,
                        callee_id,
                    } = outcome
                    {
                        info!(
                            target: "cc.task.pairing",
                            room_id = %room_id,
                            caller_id = %caller_id,
                            callee_id = %callee_id,
                            "Paired waiting users"
                        );
                        report.paired += 1;
                        claimed.insert(caller_id);
                        claimed.insert(callee_id);
                    }
                }
                Err(e) => {
                    record_pairing_attempt("error");
                    error!(target: "cc.task.pairing", user_id = %user_id, error = %e, "Pairing pass failed");
                    // Retry this entry on the next change.
                    self.processed.remove(&user_id);
                }
            }
        }

        // Matched and removed entries will not come back at the same revision.
        self.processed.retain(|user_id, _| still_waiting.contains(user_id));

        debug!(
            target: "cc.task.pairing",
            waiting = waiting.len(),
            passes = report.passes,
            paired = report.paired,
            "Reaction complete"
        );
        Ok(report)
    }
}

/// React to every change of the `queue` collection until cancelled.
#[instrument(skip_all, name = "cc.task.pairing")]
pub async fn start_pairing_reaction(
    store: SharedStore,
    config: CallConfig,
    cancel_token: CancellationToken,
) {
    info!(target: "cc.task.pairing", "Starting pairing reaction task");

    let queue_key = match schema::queue() {
        Ok(path) => path.as_str().to_string(),
        Err(e) => {
            error!(target: "cc.task.pairing", error = %e, "Invalid queue collection path");
            return;
        }
    };
    let mut reaction = PairingReaction::new(std::sync::Arc::clone(&store), config);
    let mut seen = 0;

    loop {
        tokio::select! {
            changed = store.changed(&queue_key, seen) => match changed {
                Ok(revision) => {
                    seen = revision;
                    if let Err(e) = reaction.react().await {
                        error!(target: "cc.task.pairing", error = %e, "Failed to list waiting entries");
                    }
                }
                Err(StoreError::Closed) => {
                    warn!(target: "cc.task.pairing", "Store closed, stopping pairing reaction");
                    break;
                }
                Err(e) => {
                    warn!(target: "cc.task.pairing", error = %e, "Queue watch failed, backing off");
                    tokio::select! {
                        () = tokio::time::sleep(ERROR_BACKOFF) => {}
                        () = cancel_token.cancelled() => break,
                    }
                }
            },
            () = cancel_token.cancelled() => {
                info!(target: "cc.task.pairing", "Pairing reaction received shutdown signal, exiting");
                break;
            }
        }
    }

    info!(target: "cc.task.pairing", "Pairing reaction task stopped");
}
