//! Reconciliation Sweeper passes.
//!
//! Two independent passes, each bounded to one batch per run:
//! - waiting entries still `waiting` after the staleness threshold
//! - rooms `ended` longer than the retention window
//!
//! Each pass deletes its batch in one commit, guarded by the revisions it
//! read. An entry that was matched between the query and the commit makes
//! the commit conflict; the pass then re-queries. Scheduling lives with
//! the caller.

use crate::config::CallConfig;
use crate::error::CallError;
use crate::models::{RoomStatus, WaitingStatus};
use crate::schema;
use call_store::{DocumentStore, Query, SharedStore, WriteBatch};
use tracing::{debug, info, instrument};

/// Deletions performed by one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub stale_waiting_deleted: usize,
    pub ended_rooms_deleted: usize,
}

#[derive(Clone)]
pub struct Sweeper {
    store: SharedStore,
    config: CallConfig,
}

impl Sweeper {
    #[must_use]
    pub fn new(store: SharedStore, config: CallConfig) -> Self {
        Self { store, config }
    }

    /// Run both passes. The second runs even if the first fails.
    ///
    /// # Errors
    ///
    /// Returns the first pass error, after both passes were attempted.
    pub async fn sweep(&self) -> Result<SweepReport, CallError> {
        let waiting = self.sweep_stale_waiting().await;
        let rooms = self.sweep_ended_rooms().await;
        Ok(SweepReport {
            stale_waiting_deleted: waiting?,
            ended_rooms_deleted: rooms?,
        })
    }

    /// Delete abandoned waiting entries.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    #[instrument(skip_all, name = "call.sweeper.waiting")]
    pub async fn sweep_stale_waiting(&self) -> Result<usize, CallError> {
        let now = self.store.server_time().await?;
        let cutoff = now.saturating_sub(self.config.waiting_stale_after);
        let query = Query::collection(schema::queue()?)
            .where_eq("status", WaitingStatus::Waiting.as_str())
            .where_lt("enqueuedAt", cutoff.as_millis())
            .order_by("enqueuedAt")
            .limit(self.config.sweep_batch_size);
        self.delete_matching(&query, "waiting").await
    }

    /// Delete rooms past their post-call retention.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    #[instrument(skip_all, name = "call.sweeper.rooms")]
    pub async fn sweep_ended_rooms(&self) -> Result<usize, CallError> {
        let now = self.store.server_time().await?;
        let cutoff = now.saturating_sub(self.config.ended_retention);
        let query = Query::collection(schema::rooms()?)
            .where_eq("status", RoomStatus::Ended.as_str())
            .where_lt("endedAt", cutoff.as_millis())
            .order_by("endedAt")
            .limit(self.config.sweep_batch_size);
        self.delete_matching(&query, "rooms").await
    }

    async fn delete_matching(&self, query: &Query, kind: &str) -> Result<usize, CallError> {
        for attempt in 1..=self.config.max_transaction_attempts {
            let found = self.store.query(query).await?;
            if found.is_empty() {
                debug!(target: "call.sweeper", kind = kind, "Nothing to sweep");
                return Ok(0);
            }

            let mut batch = WriteBatch::new();
            for snapshot in &found {
                batch.require(snapshot.path.key(), snapshot.revision);
                batch.delete(snapshot.path.clone());
            }

            match self.store.commit(batch).await {
                Ok(()) => {
                    info!(target: "call.sweeper", kind = kind, deleted = found.len(), "Swept stale documents");
                    return Ok(found.len());
                }
                Err(e) if e.is_conflict() => {
                    debug!(target: "call.sweeper", kind = kind, attempt = attempt, "Sweep batch conflicted");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(CallError::Contention(format!("sweep {kind}")))
    }
}
