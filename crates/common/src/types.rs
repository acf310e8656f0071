//! Common data types for the call-matching components.
//!
//! Identifiers travel through document paths (`queue/{user}`, `rooms/{room}`),
//! so every identifier is validated to be a single non-empty path segment.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Maximum accepted identifier length in bytes.
pub const MAX_ID_LENGTH: usize = 128;

/// Error returned when an identifier cannot be used as a path segment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidId {
    #[error("identifier is empty")]
    Empty,

    #[error("identifier exceeds {MAX_ID_LENGTH} bytes")]
    TooLong,

    #[error("identifier contains a forbidden character")]
    ForbiddenCharacter,
}

fn validate_segment(value: &str) -> Result<(), InvalidId> {
    if value.trim().is_empty() {
        return Err(InvalidId::Empty);
    }
    if value.len() > MAX_ID_LENGTH {
        return Err(InvalidId::TooLong);
    }
    if value.chars().any(|c| c == '/' || c.is_control()) {
        return Err(InvalidId::ForbiddenCharacter);
    }
    Ok(())
}

/// Identity of an authenticated user.
///
/// Assigned by the external identity provider; the core never generates one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Validate and wrap a user identifier.
    ///
    /// # Errors
    ///
    /// Returns `InvalidId` if the value is not a usable path segment.
    pub fn parse(value: impl Into<String>) -> Result<Self, InvalidId> {
        let value = value.into();
        validate_segment(&value)?;
        Ok(Self(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for a room
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Create a new random room ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Validate a room identifier received from a client.
    ///
    /// # Errors
    ///
    /// Returns `InvalidId` if the value is not a usable path segment.
    pub fn parse(value: impl Into<String>) -> Result<Self, InvalidId> {
        let value = value.into();
        validate_segment(&value)?;
        Ok(Self(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RoomId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store-assigned wall-clock instant, in milliseconds since the Unix epoch.
///
/// Stored as a plain integer so range filters compare numerically.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    #[must_use]
    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// Current system time.
    #[must_use]
    pub fn now() -> Self {
        Self::from(Utc::now())
    }

    /// The instant `duration` before this one.
    #[must_use]
    pub fn saturating_sub(self, duration: Duration) -> Self {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_sub(millis))
    }

    /// The instant `duration` after this one.
    #[must_use]
    pub fn saturating_add(self, duration: Duration) -> Self {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(millis))
    }

    /// Whole seconds elapsed from `earlier` to `self`, clamped at zero.
    #[must_use]
    pub fn seconds_since(self, earlier: Timestamp) -> u64 {
        u64::try_from(self.0.saturating_sub(earlier.0) / 1000).unwrap_or(0)
    }

    /// Convert to a `chrono` UTC datetime (for logging).
    #[must_use]
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.0).single()
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Self(value.timestamp_millis())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.to_rfc3339()),
            None => write!(f, "{}ms", self.0),
        }
    }
}
