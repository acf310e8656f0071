//! Shared Transactional Store
//!
//! A document database abstraction offering exactly the primitives the
//! call-matching core depends on:
//!
//! - Single-document reads and writes
//! - Multi-document atomic commits guarded by revision preconditions
//! - Change notification per document, collection or append-only sequence
//! - Server-side timestamps
//! - Atomic numeric increment
//!
//! # Revisions
//!
//! Every key (document, collection, sequence) carries a revision. A commit
//! stamps every key it touches, and the parent collection of every written
//! document, with one store-wide revision. Revisions never decrease, so an
//! optimistic transaction only has to compare the revisions it read.
//!
//! # Backends
//!
//! - [`MemoryStore`] - in-process, with an injectable [`Clock`]
//! - [`RedisStore`] - Redis, with commits executed as a single Lua script

pub mod clock;
pub mod document;
pub mod error;
pub mod memory;
pub mod path;
pub mod redis;
pub mod store;
pub mod subscription;
pub mod transaction;

pub use clock::{Clock, ManualClock, SystemClock};
pub use document::{
    to_fields, DocRead, Document, FieldValue, Fields, Filter, Precondition, Query, SequenceItem,
    Snapshot, Write, WriteBatch,
};
pub use error::StoreError;
pub use memory::MemoryStore;
pub use path::{CollectionPath, DocPath};
pub use crate::redis::RedisStore;
pub use store::{DocumentStore, SharedStore};
pub use subscription::{DocumentChange, DocumentSubscription, SequenceSubscription};
pub use transaction::{Transaction, DEFAULT_MAX_ATTEMPTS};
