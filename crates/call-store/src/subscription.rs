//! Change subscriptions.
//!
//! Each subscription runs a background task that re-reads its key whenever
//! the store reports a newer revision and forwards what it finds over a
//! bounded channel. The channel applies backpressure instead of dropping.
//!
//! - `DocumentSubscription`: successive states of one document, starting
//!   with its current state. Revisions are strictly increasing, so a
//!   consumer never observes a rollback.
//! - `SequenceSubscription`: every entry of an append-only sequence exactly
//!   once, in append order.
//!
//! Cancellation is explicit and idempotent. Dropping a subscription
//! cancels it.

use crate::document::{SequenceItem, Snapshot};
use crate::error::StoreError;
use crate::path::{CollectionPath, DocPath};
use crate::store::SharedStore;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Buffered deliveries per subscription.
const CHANNEL_CAPACITY: usize = 64;

/// Delay before retrying after a backend error.
const ERROR_RETRY_DELAY: Duration = Duration::from_secs(1);

/// One observed state of a watched document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub revision: u64,
    /// `None` when the document does not exist (yet, or any more).
    pub snapshot: Option<Snapshot>,
}

/// Subscription to one document.
pub struct DocumentSubscription {
    receiver: mpsc::Receiver<DocumentChange>,
    cancel_token: CancellationToken,
}

impl DocumentSubscription {
    /// Start watching `path`. The current state is delivered first.
    #[must_use]
    pub fn spawn(store: SharedStore, path: DocPath) -> Self {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel_token = CancellationToken::new();
        tokio::spawn(watch_document(store, path, sender, cancel_token.clone()));
        Self {
            receiver,
            cancel_token,
        }
    }

    /// Next observed state, or `None` once cancelled.
    pub async fn next(&mut self) -> Option<DocumentChange> {
        if self.cancel_token.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            () = self.cancel_token.cancelled() => None,
            change = self.receiver.recv() => change,
        }
    }

    /// Stop delivery. Calling this more than once is a no-op.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

impl Drop for DocumentSubscription {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Subscription to an append-only sequence.
pub struct SequenceSubscription {
    receiver: mpsc::Receiver<SequenceItem>,
    cancel_token: CancellationToken,
}

impl SequenceSubscription {
    /// Start watching `sequence` from its first entry.
    #[must_use]
    pub fn spawn(store: SharedStore, sequence: CollectionPath) -> Self {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel_token = CancellationToken::new();
        tokio::spawn(watch_sequence(store, sequence, sender, cancel_token.clone()));
        Self {
            receiver,
            cancel_token,
        }
    }

    /// Next appended entry, or `None` once cancelled.
    pub async fn next(&mut self) -> Option<SequenceItem> {
        if self.cancel_token.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            () = self.cancel_token.cancelled() => None,
            item = self.receiver.recv() => item,
        }
    }

    /// Stop delivery. Calling this more than once is a no-op.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

impl Drop for SequenceSubscription {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Outcome of one cancellable wait.
enum Step<T> {
    Done(T),
    Cancelled,
}

async fn cancellable<F, T>(cancel_token: &CancellationToken, fut: F) -> Step<T>
where
    F: std::future::Future<Output = T>,
{
    tokio::select! {
        biased;
        () = cancel_token.cancelled() => Step::Cancelled,
        value = fut => Step::Done(value),
    }
}

/// Log a backend error and back off. Returns false if the loop should stop.
async fn back_off(cancel_token: &CancellationToken, key: &str, error: &StoreError) -> bool {
    if matches!(error, StoreError::Closed) {
        debug!(target: "store.subscription", key = %key, "Store closed, ending subscription");
        return false;
    }
    warn!(
        target: "store.subscription",
        key = %key,
        error = %error,
        "Subscription read failed, retrying"
    );
    matches!(
        cancellable(cancel_token, tokio::time::sleep(ERROR_RETRY_DELAY)).await,
        Step::Done(())
    )
}

async fn watch_document(
    store: SharedStore,
    path: DocPath,
    sender: mpsc::Sender<DocumentChange>,
    cancel_token: CancellationToken,
) {
    let key = path.key();
    let mut delivered: Option<u64> = None;

    loop {
        let read = match cancellable(&cancel_token, store.read(&path)).await {
            Step::Cancelled => break,
            Step::Done(Ok(read)) => read,
            Step::Done(Err(e)) => {
                if back_off(&cancel_token, &key, &e).await {
                    continue;
                }
                break;
            }
        };

        let seen = read.revision;
        if delivered.map_or(true, |last| seen > last) {
            delivered = Some(seen);
            let change = DocumentChange {
                revision: seen,
                snapshot: read.snapshot,
            };
            match cancellable(&cancel_token, sender.send(change)).await {
                Step::Done(Ok(())) => {}
                Step::Done(Err(_)) | Step::Cancelled => break,
            }
        }

        match cancellable(&cancel_token, store.changed(&key, seen)).await {
            Step::Cancelled => break,
            Step::Done(Ok(_)) => {}
            Step::Done(Err(e)) => {
                if !back_off(&cancel_token, &key, &e).await {
                    break;
                }
            }
        }
    }

    debug!(target: "store.subscription", key = %key, "Document subscription stopped");
}

async fn watch_sequence(
    store: SharedStore,
    sequence: CollectionPath,
    sender: mpsc::Sender<SequenceItem>,
    cancel_token: CancellationToken,
) {
    let key = sequence.as_str().to_string();
    let mut cursor = 0u64;

    'outer: loop {
        let seen = match cancellable(&cancel_token, store.revision(&key)).await {
            Step::Cancelled => break,
            Step::Done(Ok(revision)) => revision,
            Step::Done(Err(e)) => {
                if back_off(&cancel_token, &key, &e).await {
                    continue;
                }
                break;
            }
        };

        let items = match cancellable(&cancel_token, store.read_sequence(&sequence, cursor)).await
        {
            Step::Cancelled => break,
            Step::Done(Ok(items)) => items,
            Step::Done(Err(e)) => {
                if back_off(&cancel_token, &key, &e).await {
                    continue;
                }
                break;
            }
        };

        for item in items {
            let seq = item.seq;
            match cancellable(&cancel_token, sender.send(item)).await {
                Step::Done(Ok(())) => cursor = seq,
                Step::Done(Err(_)) | Step::Cancelled => break 'outer,
            }
        }

        match cancellable(&cancel_token, store.changed(&key, seen)).await {
            Step::Cancelled => break,
            Step::Done(Ok(_)) => {}
            Step::Done(Err(e)) => {
                if !back_off(&cancel_token, &key, &e).await {
                    break;
                }
            }
        }
    }

    debug!(target: "store.subscription", key = %key, "Sequence subscription stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::document::{FieldValue, Fields};
    use crate::memory::MemoryStore;
    use crate::store::DocumentStore;
    use serde_json::json;
    use std::sync::Arc;

    fn status(value: &str) -> Fields {
        Fields::from([("status".to_string(), FieldValue::value(value))])
    }

    async fn next_within<T>(fut: impl std::future::Future<Output = Option<T>>) -> Option<T> {
        tokio::time::timeout(Duration::from_secs(1), fut)
            .await
            .expect("subscription delivered in time")
    }

    #[tokio::test]
    async fn test_document_subscription_delivers_initial_and_updates() {
        let store = Arc::new(MemoryStore::new());
        let path = DocPath::new("queue", "u1").unwrap();
        let mut sub = DocumentSubscription::spawn(store.clone(), path.clone());

        let initial = next_within(sub.next()).await.unwrap();
        assert_eq!(initial.revision, 0);
        assert!(initial.snapshot.is_none());

        store.set(path.clone(), status("waiting")).await.unwrap();
        let change = next_within(sub.next()).await.unwrap();
        assert_eq!(
            change.snapshot.unwrap().field("status"),
            Some(&json!("waiting"))
        );

        store.delete(path).await.unwrap();
        let deleted = next_within(sub.next()).await.unwrap();
        assert!(deleted.snapshot.is_none());
        assert!(deleted.revision > change.revision);
    }

    #[tokio::test]
    async fn test_document_revisions_never_go_backwards() {
        let store = Arc::new(MemoryStore::new());
        let path = DocPath::new("rooms", "r1").unwrap();
        let mut sub = DocumentSubscription::spawn(store.clone(), path.clone());

        for s in ["waiting", "active", "ended"] {
            store.set(path.clone(), status(s)).await.unwrap();
        }

        let mut last = 0;
        let mut last_status = None;
        while let Some(change) = next_within(sub.next()).await {
            assert!(change.revision >= last);
            last = change.revision;
            last_status = change
                .snapshot
                .and_then(|s| s.field("status").cloned());
            if last_status == Some(json!("ended")) {
                break;
            }
        }
        assert_eq!(last_status, Some(json!("ended")));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_stops_delivery() {
        let store = Arc::new(MemoryStore::new());
        let path = DocPath::new("queue", "u1").unwrap();
        let mut sub = DocumentSubscription::spawn(store.clone(), path.clone());

        sub.cancel();
        sub.cancel();
        assert!(sub.is_cancelled());

        store.set(path, status("waiting")).await.unwrap();
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_sequence_subscription_preserves_order_across_batches() {
        let store = Arc::new(MemoryStore::new());
        let seq = CollectionPath::parse("rooms/r1/calleeCandidates").unwrap();
        let mut sub = SequenceSubscription::spawn(store.clone(), seq.clone());

        let mut expected = 0;
        let mut received = Vec::new();
        for batch in 0..3 {
            for _ in 0..4 {
                store
                    .append(
                        seq.clone(),
                        Fields::from([("n".to_string(), FieldValue::value(expected))]),
                    )
                    .await
                    .unwrap();
                expected += 1;
            }
            // Drain part of the stream between batches to interleave reads and writes.
            for _ in 0..(batch + 2) {
                let item = next_within(sub.next()).await.unwrap();
                received.push(item.data.get("n").and_then(serde_json::Value::as_i64).unwrap());
            }
        }
        while received.len() < 12 {
            let item = next_within(sub.next()).await.unwrap();
            received.push(item.data.get("n").and_then(serde_json::Value::as_i64).unwrap());
        }

        assert_eq!(received, (0..12).collect::<Vec<i64>>());
    }
}
