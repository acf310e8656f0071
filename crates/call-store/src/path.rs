//! Document and collection paths.
//!
//! Paths alternate collection and document segments, e.g.
//! `rooms` (collection), `rooms/{id}` (document),
//! `rooms/{id}/callerCandidates` (sub-collection).

use crate::error::StoreError;
use std::fmt;

fn validate_segment(segment: &str, full: &str) -> Result<(), StoreError> {
    if segment.is_empty() || segment.contains('/') || segment.chars().any(char::is_control) {
        return Err(StoreError::InvalidPath(full.to_string()));
    }
    Ok(())
}

/// Path to a collection (odd number of segments).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionPath(String);

impl CollectionPath {
    /// Parse a collection path such as `queue` or `rooms/r1/callerCandidates`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidPath` for empty segments or an even segment count.
    pub fn parse(path: &str) -> Result<Self, StoreError> {
        let segments: Vec<&str> = path.split('/').collect();
        if segments.len() % 2 == 0 {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        for segment in &segments {
            validate_segment(segment, path)?;
        }
        Ok(Self(path.to_string()))
    }

    /// Document with the given id inside this collection.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidPath` if `id` is not a single segment.
    pub fn doc(&self, id: &str) -> Result<DocPath, StoreError> {
        validate_segment(id, id)?;
        Ok(DocPath {
            collection: self.clone(),
            id: id.to_string(),
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Path to a single document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocPath {
    collection: CollectionPath,
    id: String,
}

impl DocPath {
    /// Shorthand for `CollectionPath::parse(collection)?.doc(id)`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidPath` if either part is malformed.
    pub fn new(collection: &str, id: &str) -> Result<Self, StoreError> {
        CollectionPath::parse(collection)?.doc(id)
    }

    #[must_use]
    pub fn collection(&self) -> &CollectionPath {
        &self.collection
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Full key, `collection/id`.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.collection.0, self.id)
    }

    /// Sub-collection nested under this document.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidPath` if `name` is not a single segment.
    pub fn child(&self, name: &str) -> Result<CollectionPath, StoreError> {
        validate_segment(name, name)?;
        Ok(CollectionPath(format!("{}/{name}", self.key())))
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection.0, self.id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_paths() {
        assert!(CollectionPath::parse("queue").is_ok());
        assert!(CollectionPath::parse("rooms/r1/calleeCandidates").is_ok());
        assert!(CollectionPath::parse("rooms/r1").is_err());
        assert!(CollectionPath::parse("").is_err());
        assert!(CollectionPath::parse("rooms//x").is_err());
    }

    #[test]
    fn test_doc_path_key_and_child() {
        let doc = DocPath::new("rooms", "r1").unwrap();
        assert_eq!(doc.key(), "rooms/r1");
        assert_eq!(doc.id(), "r1");
        assert_eq!(doc.collection().as_str(), "rooms");

        let child = doc.child("callerCandidates").unwrap();
        assert_eq!(child.as_str(), "rooms/r1/callerCandidates");
    }

    #[test]
    fn test_doc_id_must_be_single_segment() {
        assert!(DocPath::new("queue", "a/b").is_err());
        assert!(DocPath::new("queue", "").is_err());
    }
}
