//! In-process store backend.
//!
//! All state lives behind one mutex, so a commit is trivially atomic: the
//! preconditions are checked and the writes staged and applied under the
//! same lock acquisition. The lock is never held across an await point.
//!
//! Change notification uses one `tokio::sync::watch` channel per watched
//! key, carrying the key's latest revision. Watch channels coalesce, which
//! is fine: subscribers re-read the key after every wake-up.

use crate::clock::{Clock, SystemClock};
use crate::document::{
    apply_fields, DocRead, Document, Query, SequenceItem, Snapshot, Write, WriteBatch,
};
use crate::error::StoreError;
use crate::path::{CollectionPath, DocPath};
use crate::store::DocumentStore;
use common::types::Timestamp;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Default)]
struct Inner {
    /// collection -> id -> document
    docs: HashMap<String, BTreeMap<String, (u64, Document)>>,
    sequences: HashMap<String, Vec<Document>>,
    revisions: HashMap<String, u64>,
    watchers: HashMap<String, watch::Sender<u64>>,
    /// Store-wide revision counter.
    last_revision: u64,
}

impl Inner {
    fn revision_of(&self, key: &str) -> u64 {
        self.revisions.get(key).copied().unwrap_or(0)
    }

    fn document(&self, path: &DocPath) -> Option<&(u64, Document)> {
        self.docs
            .get(path.collection().as_str())
            .and_then(|c| c.get(path.id()))
    }
}

/// One pending `changed` wait. Dropping the last one for a key removes
/// the key's sender, also when the wait is cancelled mid-flight.
struct Watch {
    inner: Arc<Mutex<Inner>>,
    key: String,
    receiver: watch::Receiver<u64>,
}

impl Drop for Watch {
    fn drop(&mut self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        // `self.receiver` is still alive here and counts as one.
        if inner
            .watchers
            .get(&self.key)
            .is_some_and(|sender| sender.receiver_count() <= 1)
        {
            inner.watchers.remove(&self.key);
        }
    }
}

/// In-memory [`DocumentStore`].
///
/// Cheaply cloneable; clones share state.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store using wall-clock time.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store resolving server timestamps from `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            clock,
        }
    }

    /// Number of documents currently in `collection`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the store lock is poisoned.
    pub fn count(&self, collection: &str) -> Result<usize, StoreError> {
        let inner = self.lock()?;
        Ok(inner.docs.get(collection).map_or(0, BTreeMap::len))
    }

    /// Number of keys with a pending `changed` wait.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the store lock is poisoned.
    pub fn watched_keys(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.watchers.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }
}

/// Current document for `path`, looking through writes staged earlier in the batch.
fn staged_or_current(
    inner: &Inner,
    staged: &BTreeMap<DocPath, Option<Document>>,
    path: &DocPath,
) -> Option<Document> {
    match staged.get(path) {
        Some(doc) => doc.clone(),
        None => inner.document(path).map(|(_, doc)| doc.clone()),
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryStore {
    async fn read(&self, path: &DocPath) -> Result<DocRead, StoreError> {
        let inner = self.lock()?;
        let revision = inner.revision_of(&path.key());
        let snapshot = inner.document(path).map(|(rev, data)| Snapshot {
            path: path.clone(),
            revision: *rev,
            data: data.clone(),
        });
        Ok(DocRead { revision, snapshot })
    }

    async fn query(&self, query: &Query) -> Result<Vec<Snapshot>, StoreError> {
        let inner = self.lock()?;
        let Some(collection) = inner.docs.get(query.collection.as_str()) else {
            return Ok(Vec::new());
        };
        let snapshots = collection
            .iter()
            .map(|(id, (rev, data))| {
                Ok(Snapshot {
                    path: query.collection.doc(id)?,
                    revision: *rev,
                    data: data.clone(),
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        Ok(query.apply(snapshots))
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let now = self.clock.now();
        let mut inner = self.lock()?;

        for pre in &batch.preconditions {
            let current = inner.revision_of(&pre.key);
            if current != pre.revision {
                debug!(
                    target: "store.memory",
                    key = %pre.key,
                    expected = pre.revision,
                    actual = current,
                    "Commit precondition failed"
                );
                return Err(StoreError::Conflict(pre.key.clone()));
            }
        }

        // Stage everything first so a failing write leaves no partial effect.
        let mut staged: BTreeMap<DocPath, Option<Document>> = BTreeMap::new();
        let mut appends: Vec<(CollectionPath, Document)> = Vec::new();
        for write in &batch.writes {
            match write {
                Write::Set { path, fields } => {
                    let mut doc = Document::new();
                    apply_fields(&mut doc, fields, now);
                    staged.insert(path.clone(), Some(doc));
                }
                Write::Merge { path, fields } => {
                    let mut doc = staged_or_current(&inner, &staged, path).unwrap_or_default();
                    apply_fields(&mut doc, fields, now);
                    staged.insert(path.clone(), Some(doc));
                }
                Write::Update { path, fields } => {
                    let Some(mut doc) = staged_or_current(&inner, &staged, path) else {
                        return Err(StoreError::NotFound(path.key()));
                    };
                    apply_fields(&mut doc, fields, now);
                    staged.insert(path.clone(), Some(doc));
                }
                Write::Delete { path } => {
                    staged.insert(path.clone(), None);
                }
                Write::Append { sequence, fields } => {
                    let mut doc = Document::new();
                    apply_fields(&mut doc, fields, now);
                    appends.push((sequence.clone(), doc));
                }
            }
        }

        inner.last_revision += 1;
        let revision = inner.last_revision;
        let mut touched = BTreeSet::new();

        for (path, doc) in staged {
            let collection = inner
                .docs
                .entry(path.collection().as_str().to_string())
                .or_default();
            match doc {
                Some(doc) => {
                    collection.insert(path.id().to_string(), (revision, doc));
                }
                None => {
                    collection.remove(path.id());
                }
            }
            touched.insert(path.key());
            touched.insert(path.collection().as_str().to_string());
        }
        for (sequence, doc) in appends {
            inner
                .sequences
                .entry(sequence.as_str().to_string())
                .or_default()
                .push(doc);
            touched.insert(sequence.as_str().to_string());
        }

        for key in touched {
            if let Some(sender) = inner.watchers.get(&key) {
                sender.send_replace(revision);
            }
            inner.revisions.insert(key, revision);
        }

        Ok(())
    }

    async fn read_sequence(
        &self,
        sequence: &CollectionPath,
        after: u64,
    ) -> Result<Vec<SequenceItem>, StoreError> {
        let inner = self.lock()?;
        let Some(items) = inner.sequences.get(sequence.as_str()) else {
            return Ok(Vec::new());
        };
        let skip = usize::try_from(after).unwrap_or(usize::MAX);
        Ok(items
            .iter()
            .zip(1u64..)
            .skip(skip)
            .map(|(data, seq)| SequenceItem {
                seq,
                data: data.clone(),
            })
            .collect())
    }

    async fn revision(&self, key: &str) -> Result<u64, StoreError> {
        Ok(self.lock()?.revision_of(key))
    }

    async fn changed(&self, key: &str, seen: u64) -> Result<u64, StoreError> {
        let mut pending = {
            let mut inner = self.lock()?;
            let current = inner.revision_of(key);
            if current > seen {
                return Ok(current);
            }
            let receiver = inner
                .watchers
                .entry(key.to_string())
                .or_insert_with(|| watch::channel(current).0)
                .subscribe();
            Watch {
                inner: Arc::clone(&self.inner),
                key: key.to_string(),
                receiver,
            }
        };

        let revision = *pending
            .receiver
            .wait_for(|revision| *revision > seen)
            .await
            .map_err(|_| StoreError::Closed)?;
        Ok(revision)
    }

    async fn server_time(&self) -> Result<Timestamp, StoreError> {
        Ok(self.clock.now())
    }
}
