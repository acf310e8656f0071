//! The `DocumentStore` trait.

use crate::document::{DocRead, Fields, Query, SequenceItem, Snapshot, WriteBatch};
use crate::error::StoreError;
use crate::path::{CollectionPath, DocPath};
use common::types::Timestamp;
use std::sync::Arc;

/// Shared handle to a store backend.
pub type SharedStore = Arc<dyn DocumentStore>;

/// Shared transactional document store.
///
/// Backends implement the required methods; the provided methods are
/// single-write conveniences over [`DocumentStore::commit`].
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Read a document together with the current revision of its key.
    async fn read(&self, path: &DocPath) -> Result<DocRead, StoreError>;

    /// Run a query against one collection.
    async fn query(&self, query: &Query) -> Result<Vec<Snapshot>, StoreError>;

    /// Atomically check all preconditions and apply all writes.
    ///
    /// # Errors
    ///
    /// - `StoreError::Conflict` if any precondition fails (nothing is written)
    /// - `StoreError::NotFound` if an `Update` targets an absent document
    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;

    /// Entries of `sequence` with position greater than `after`, in append order.
    async fn read_sequence(
        &self,
        sequence: &CollectionPath,
        after: u64,
    ) -> Result<Vec<SequenceItem>, StoreError>;

    /// Current revision of a document, collection or sequence key.
    async fn revision(&self, key: &str) -> Result<u64, StoreError>;

    /// Wait until the revision of `key` exceeds `seen`, returning the new revision.
    async fn changed(&self, key: &str, seen: u64) -> Result<u64, StoreError>;

    /// Current store time, as used for server timestamps.
    async fn server_time(&self) -> Result<Timestamp, StoreError>;

    async fn get(&self, path: &DocPath) -> Result<Option<Snapshot>, StoreError> {
        Ok(self.read(path).await?.snapshot)
    }

    async fn set(&self, path: DocPath, fields: Fields) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.set(path, fields);
        self.commit(batch).await
    }

    async fn merge(&self, path: DocPath, fields: Fields) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.merge(path, fields);
        self.commit(batch).await
    }

    async fn update(&self, path: DocPath, fields: Fields) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.update(path, fields);
        self.commit(batch).await
    }

    async fn delete(&self, path: DocPath) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.delete(path);
        self.commit(batch).await
    }

    async fn append(&self, sequence: CollectionPath, fields: Fields) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.append(sequence, fields);
        self.commit(batch).await
    }
}
