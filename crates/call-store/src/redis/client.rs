//! Redis-backed [`DocumentStore`].
//!
//! Commits, document reads and collection listings each run as one Lua
//! script (see [`lua_scripts`](super::lua_scripts)), so they are atomic with
//! respect to every other client. Queries list the collection and filter
//! client-side with the same `Query::apply` the memory backend uses.
//!
//! Change notification polls revision keys: `changed` re-reads
//! `rev:{key}` every `poll_interval` until it moves past the caller's
//! revision.
//!
//! # Connection Pattern
//!
//! The redis-rs `MultiplexedConnection` is cheap to clone and safe to use
//! concurrently, so every operation clones it instead of locking.

use super::lua_scripts;
use crate::document::{
    DocRead, Document, FieldValue, Fields, Query, SequenceItem, Snapshot, Write, WriteBatch,
};
use crate::error::StoreError;
use crate::path::{CollectionPath, DocPath};
use crate::store::DocumentStore;
use common::types::Timestamp;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

/// Default key prefix for all store keys.
pub const DEFAULT_KEY_PREFIX: &str = "callstore:";

/// Default interval between revision polls in `changed`.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Wire form of one field write, as decoded by the commit script.
#[derive(Debug, Serialize)]
struct WireField {
    #[serde(skip_serializing_if = "Option::is_none")]
    v: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ts: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inc: Option<i64>,
}

impl From<&FieldValue> for WireField {
    fn from(value: &FieldValue) -> Self {
        match value {
            FieldValue::Value(v) => Self {
                v: Some(v.clone()),
                ts: None,
                inc: None,
            },
            FieldValue::ServerTimestamp => Self {
                v: None,
                ts: Some(true),
                inc: None,
            },
            FieldValue::Increment(n) => Self {
                v: None,
                ts: None,
                inc: Some(*n),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct WireWrite {
    op: &'static str,
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    collection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    fields: BTreeMap<String, WireField>,
}

impl WireWrite {
    fn document(op: &'static str, path: &DocPath, fields: &Fields) -> Self {
        Self {
            op,
            key: path.key(),
            collection: Some(path.collection().as_str().to_string()),
            id: Some(path.id().to_string()),
            fields: fields
                .iter()
                .map(|(k, v)| (k.clone(), WireField::from(v)))
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct WirePrecondition<'a> {
    key: &'a str,
    rev: u64,
}

#[derive(Debug, Serialize)]
struct WireCommit<'a> {
    pre: Vec<WirePrecondition<'a>>,
    writes: Vec<WireWrite>,
}

fn encode_batch(batch: &WriteBatch) -> Result<String, StoreError> {
    let empty = Fields::new();
    let writes = batch
        .writes
        .iter()
        .map(|write| match write {
            Write::Set { path, fields } => WireWrite::document("set", path, fields),
            Write::Merge { path, fields } => WireWrite::document("merge", path, fields),
            Write::Update { path, fields } => WireWrite::document("update", path, fields),
            Write::Delete { path } => WireWrite::document("delete", path, &empty),
            Write::Append { sequence, fields } => WireWrite {
                op: "append",
                key: sequence.as_str().to_string(),
                collection: None,
                id: None,
                fields: fields
                    .iter()
                    .map(|(k, v)| (k.clone(), WireField::from(v)))
                    .collect(),
            },
        })
        .collect();

    let request = WireCommit {
        pre: batch
            .preconditions
            .iter()
            .map(|p| WirePrecondition {
                key: &p.key,
                rev: p.revision,
            })
            .collect(),
        writes,
    };
    Ok(serde_json::to_string(&request)?)
}

/// Map the commit script's `{code, detail}` reply.
fn commit_result(code: i64, detail: String) -> Result<(), StoreError> {
    match code {
        1 => {
            debug!(target: "store.redis", revision = %detail, "Committed batch");
            Ok(())
        }
        0 => {
            debug!(target: "store.redis", key = %detail, "Commit precondition failed");
            Err(StoreError::Conflict(detail))
        }
        -2 => Err(StoreError::NotFound(detail)),
        other => Err(StoreError::Backend(format!(
            "Unexpected commit result {other}"
        ))),
    }
}

fn decode_document(body: &str) -> Result<Document, StoreError> {
    match serde_json::from_str::<Value>(body)? {
        Value::Object(map) => Ok(map),
        // cjson encodes an empty table as `{}`, but be lenient about `[]`.
        Value::Array(items) if items.is_empty() => Ok(Document::new()),
        other => Err(StoreError::Serialization(format!(
            "stored document is not an object: {other}"
        ))),
    }
}

fn parse_revision(raw: &str) -> u64 {
    raw.parse().unwrap_or(0)
}

fn backend_error(operation: &str, e: &redis::RedisError) -> StoreError {
    warn!(target: "store.redis", error = %e, operation, "Redis operation failed");
    StoreError::Backend(format!("Failed to {operation}: {e}"))
}

/// Redis [`DocumentStore`].
///
/// Cheaply cloneable; clones share the multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
    key_prefix: String,
    poll_interval: Duration,
    commit_script: Script,
    read_doc_script: Script,
    list_collection_script: Script,
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the client cannot be opened or connected.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Do NOT log redis_url: it may contain credentials
            error!(target: "store.redis", error = %e, "Failed to open Redis client");
            StoreError::Backend(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(target: "store.redis", error = %e, "Failed to connect to Redis");
                StoreError::Backend(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self {
            connection,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            commit_script: Script::new(lua_scripts::COMMIT),
            read_doc_script: Script::new(lua_scripts::READ_DOC),
            list_collection_script: Script::new(lua_scripts::LIST_COLLECTION),
        })
    }

    /// Override the revision poll interval used by `changed`.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Override the key prefix (isolates several stores in one database).
    #[must_use]
    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = key_prefix.into();
        self
    }

    fn rev_key(&self, key: &str) -> String {
        format!("{}rev:{key}", self.key_prefix)
    }

    fn seq_key(&self, key: &str) -> String {
        format!("{}seq:{key}", self.key_prefix)
    }
}

#[async_trait::async_trait]
impl DocumentStore for RedisStore {
    #[instrument(skip_all, fields(path = %path))]
    async fn read(&self, path: &DocPath) -> Result<DocRead, StoreError> {
        let mut conn = self.connection.clone();
        let (revision, body): (String, String) = self
            .read_doc_script
            .arg(&self.key_prefix)
            .arg(path.key())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| backend_error("read document", &e))?;

        let revision = parse_revision(&revision);
        let snapshot = if body.is_empty() {
            None
        } else {
            Some(Snapshot {
                path: path.clone(),
                revision,
                data: decode_document(&body)?,
            })
        };
        Ok(DocRead { revision, snapshot })
    }

    #[instrument(skip_all, fields(collection = %query.collection))]
    async fn query(&self, query: &Query) -> Result<Vec<Snapshot>, StoreError> {
        let mut conn = self.connection.clone();
        let flat: Vec<String> = self
            .list_collection_script
            .arg(&self.key_prefix)
            .arg(query.collection.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| backend_error("list collection", &e))?;

        let mut snapshots = Vec::with_capacity(flat.len() / 3);
        let mut parts = flat.into_iter();
        while let (Some(id), Some(revision), Some(body)) = (parts.next(), parts.next(), parts.next())
        {
            snapshots.push(Snapshot {
                path: query.collection.doc(&id)?,
                revision: parse_revision(&revision),
                data: decode_document(&body)?,
            });
        }
        Ok(query.apply(snapshots))
    }

    #[instrument(skip_all, fields(writes = batch.len()))]
    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let request = encode_batch(&batch)?;
        let mut conn = self.connection.clone();
        let (code, detail): (i64, String) = self
            .commit_script
            .arg(&self.key_prefix)
            .arg(request)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| backend_error("commit batch", &e))?;

        commit_result(code, detail)
    }

    #[instrument(skip_all, fields(sequence = %sequence, after = after))]
    async fn read_sequence(
        &self,
        sequence: &CollectionPath,
        after: u64,
    ) -> Result<Vec<SequenceItem>, StoreError> {
        let mut conn = self.connection.clone();
        let start = isize::try_from(after).unwrap_or(isize::MAX);
        let bodies: Vec<String> = conn
            .lrange(self.seq_key(sequence.as_str()), start, -1)
            .await
            .map_err(|e| backend_error("read sequence", &e))?;

        bodies
            .iter()
            .zip((after + 1)..)
            .map(|(body, seq)| {
                Ok(SequenceItem {
                    seq,
                    data: decode_document(body)?,
                })
            })
            .collect()
    }

    async fn revision(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn
            .get(self.rev_key(key))
            .await
            .map_err(|e| backend_error("read revision", &e))?;
        Ok(raw.as_deref().map_or(0, parse_revision))
    }

    async fn changed(&self, key: &str, seen: u64) -> Result<u64, StoreError> {
        loop {
            let current = self.revision(key).await?;
            if current > seen {
                return Ok(current);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn server_time(&self) -> Result<Timestamp, StoreError> {
        let mut conn = self.connection.clone();
        let (secs, micros): (i64, i64) = redis::cmd("TIME")
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_error("read server time", &e))?;
        Ok(Timestamp::from_millis(
            secs.saturating_mul(1000).saturating_add(micros / 1000),
        ))
    }
}
