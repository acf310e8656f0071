//! Optimistic read-modify-write transactions.
//!
//! A `Transaction` remembers the revision of every document it reads and
//! commits its buffered writes with those revisions as preconditions. If
//! any read document changed in the meantime the commit fails with
//! `StoreError::Conflict` and writes nothing. Callers are expected to
//! start a fresh transaction and re-check their preconditions:
//!
//! ```rust,ignore
//! for _ in 0..DEFAULT_MAX_ATTEMPTS {
//!     let mut tx = Transaction::new(store.as_ref());
//!     let entry = tx.get(&path).await?;
//!     // ... decide, buffer writes ...
//!     match tx.commit().await {
//!         Err(e) if e.is_conflict() => continue,
//!         other => return other,
//!     }
//! }
//! ```

use crate::document::{Fields, Snapshot, WriteBatch};
use crate::error::StoreError;
use crate::path::{CollectionPath, DocPath};
use crate::store::DocumentStore;
use std::collections::HashSet;

/// Default number of attempts for a conflicting transaction.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Buffered transaction over a [`DocumentStore`].
pub struct Transaction<'a> {
    store: &'a dyn DocumentStore,
    read_keys: HashSet<String>,
    batch: WriteBatch,
}

impl<'a> Transaction<'a> {
    #[must_use]
    pub fn new(store: &'a dyn DocumentStore) -> Self {
        Self {
            store,
            read_keys: HashSet::new(),
            batch: WriteBatch::new(),
        }
    }

    /// Read a document and add its revision to the read set.
    ///
    /// Absent documents are tracked too: if one appears before commit,
    /// the commit conflicts.
    pub async fn get(&mut self, path: &DocPath) -> Result<Option<Snapshot>, StoreError> {
        let read = self.store.read(path).await?;
        let key = path.key();
        if self.read_keys.insert(key.clone()) {
            self.batch.require(key, read.revision);
        }
        Ok(read.snapshot)
    }

    pub fn set(&mut self, path: DocPath, fields: Fields) -> &mut Self {
        self.batch.set(path, fields);
        self
    }

    pub fn merge(&mut self, path: DocPath, fields: Fields) -> &mut Self {
        self.batch.merge(path, fields);
        self
    }

    pub fn update(&mut self, path: DocPath, fields: Fields) -> &mut Self {
        self.batch.update(path, fields);
        self
    }

    pub fn delete(&mut self, path: DocPath) -> &mut Self {
        self.batch.delete(path);
        self
    }

    pub fn append(&mut self, sequence: CollectionPath, fields: Fields) -> &mut Self {
        self.batch.append(sequence, fields);
        self
    }

    /// Commit buffered writes. A transaction with no writes commits nothing.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` if any document read by this transaction changed.
    pub async fn commit(self) -> Result<(), StoreError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        self.store.commit(self.batch).await
    }
}
