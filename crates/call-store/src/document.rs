//! Document values, write batches and queries.

use crate::error::StoreError;
use crate::path::{CollectionPath, DocPath};
use common::types::Timestamp;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// A stored document: a JSON object.
pub type Document = serde_json::Map<String, Value>;

/// Field writes keyed by field name.
pub type Fields = BTreeMap<String, FieldValue>;

/// The value written to one field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Value(Value),
    /// Resolved to the store clock at commit time.
    ServerTimestamp,
    /// Added to the current integer value (missing counts as 0).
    Increment(i64),
}

impl FieldValue {
    pub fn value(value: impl Into<Value>) -> Self {
        FieldValue::Value(value.into())
    }

    /// Resolve against the field's current value.
    pub(crate) fn resolve(&self, current: Option<&Value>, now: Timestamp) -> Value {
        match self {
            FieldValue::Value(v) => v.clone(),
            FieldValue::ServerTimestamp => Value::from(now.as_millis()),
            FieldValue::Increment(delta) => {
                let base = current.and_then(Value::as_i64).unwrap_or(0);
                Value::from(base.saturating_add(*delta))
            }
        }
    }
}

/// Serialize a struct into plain field writes.
///
/// # Errors
///
/// Returns `StoreError::Serialization` if `value` does not serialize to a JSON object.
pub fn to_fields<T: Serialize>(value: &T) -> Result<Fields, StoreError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map
            .into_iter()
            .map(|(k, v)| (k, FieldValue::Value(v)))
            .collect()),
        other => Err(StoreError::Serialization(format!(
            "expected an object, got {other}"
        ))),
    }
}

/// Apply field writes to a document in place.
pub(crate) fn apply_fields(doc: &mut Document, fields: &Fields, now: Timestamp) {
    for (name, field) in fields {
        let resolved = field.resolve(doc.get(name), now);
        doc.insert(name.clone(), resolved);
    }
}

/// A document as read at one revision.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub path: DocPath,
    pub revision: u64,
    pub data: Document,
}

impl Snapshot {
    /// Deserialize the document body.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Serialization` if the document does not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        Ok(serde_json::from_value(Value::Object(self.data.clone()))?)
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }
}

/// Result of reading a document key, including the revision of an absent document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocRead {
    pub revision: u64,
    pub snapshot: Option<Snapshot>,
}

/// One entry of an append-only sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceItem {
    /// 1-based position in append order.
    pub seq: u64,
    pub data: Document,
}

impl SequenceItem {
    /// Deserialize the entry body.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Serialization` if the entry does not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        Ok(serde_json::from_value(Value::Object(self.data.clone()))?)
    }
}

/// Commit precondition: the key must still be at `revision`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Precondition {
    pub key: String,
    pub revision: u64,
}

/// A single write inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    /// Replace the document.
    Set { path: DocPath, fields: Fields },
    /// Create the document or merge fields into it.
    Merge { path: DocPath, fields: Fields },
    /// Merge fields into an existing document; fails if absent.
    Update { path: DocPath, fields: Fields },
    Delete { path: DocPath },
    /// Add an entry to the end of an append-only sequence.
    Append {
        sequence: CollectionPath,
        fields: Fields,
    },
}

/// Writes applied atomically, after all preconditions are checked.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    pub preconditions: Vec<Precondition>,
    pub writes: Vec<Write>,
}

impl WriteBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key` to still be at `revision` when the batch commits.
    pub fn require(&mut self, key: impl Into<String>, revision: u64) -> &mut Self {
        self.preconditions.push(Precondition {
            key: key.into(),
            revision,
        });
        self
    }

    pub fn set(&mut self, path: DocPath, fields: Fields) -> &mut Self {
        self.writes.push(Write::Set { path, fields });
        self
    }

    pub fn merge(&mut self, path: DocPath, fields: Fields) -> &mut Self {
        self.writes.push(Write::Merge { path, fields });
        self
    }

    pub fn update(&mut self, path: DocPath, fields: Fields) -> &mut Self {
        self.writes.push(Write::Update { path, fields });
        self
    }

    pub fn delete(&mut self, path: DocPath) -> &mut Self {
        self.writes.push(Write::Delete { path });
        self
    }

    pub fn append(&mut self, sequence: CollectionPath, fields: Fields) -> &mut Self {
        self.writes.push(Write::Append { sequence, fields });
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.writes.len()
    }
}

/// Query filter on a top-level field.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    Lt(String, Value),
}

impl Filter {
    fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::Eq(field, expected) => doc.get(field) == Some(expected),
            Filter::Lt(field, bound) => doc.get(field).is_some_and(|v| {
                same_kind(v, bound) && compare_values(v, bound) == Ordering::Less
            }),
        }
    }
}

fn same_kind(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Number(_), Value::Number(_))
            | (Value::String(_), Value::String(_))
            | (Value::Bool(_), Value::Bool(_))
    )
}

/// Total order over JSON scalars used for filters and sorting.
///
/// Null and missing sort first, then booleans, numbers, strings; containers last.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) | Value::Object(_) => 4,
        }
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .unwrap_or(0.0)
                .total_cmp(&y.as_f64().unwrap_or(0.0)),
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Query over one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: CollectionPath,
    pub filters: Vec<Filter>,
    pub order_by: Option<String>,
    pub limit: Option<usize>,
}

impl Query {
    #[must_use]
    pub fn collection(collection: CollectionPath) -> Self {
        Self {
            collection,
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    #[must_use]
    pub fn where_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(field.to_string(), value.into()));
        self
    }

    #[must_use]
    pub fn where_lt(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Lt(field.to_string(), value.into()));
        self
    }

    /// Ascending order by `field`; ties are broken by document id.
    #[must_use]
    pub fn order_by(mut self, field: &str) -> Self {
        self.order_by = Some(field.to_string());
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Filter, sort and truncate snapshots of this query's collection.
    ///
    /// Shared by every backend so ordering is identical everywhere.
    #[must_use]
    pub fn apply(&self, snapshots: Vec<Snapshot>) -> Vec<Snapshot> {
        let mut matched: Vec<Snapshot> = snapshots
            .into_iter()
            .filter(|s| self.filters.iter().all(|f| f.matches(&s.data)))
            .collect();

        let null = Value::Null;
        matched.sort_by(|a, b| {
            let by_field = match &self.order_by {
                Some(field) => compare_values(
                    a.data.get(field).unwrap_or(&null),
                    b.data.get(field).unwrap_or(&null),
                ),
                None => Ordering::Equal,
            };
            by_field.then_with(|| a.path.id().cmp(b.path.id()))
        });

        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }
        matched
    }
}
