//! JWT claims structure.
//!
//! The `sub` field is redacted in Debug output so a logged request
//! extension never carries the caller's identity.

use common::types::{InvalidId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (the user id), redacted in Debug output.
    pub sub: String,

    /// Expiration timestamp (Unix epoch seconds).
    pub exp: i64,

    /// Issued-at timestamp (Unix epoch seconds).
    pub iat: i64,
}

impl fmt::Debug for Claims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Claims")
            .field("sub", &"[REDACTED]")
            .field("exp", &self.exp)
            .field("iat", &self.iat)
            .finish()
    }
}

impl Claims {
    /// The authenticated caller.
    ///
    /// # Errors
    ///
    /// Returns `InvalidId` if `sub` is not a usable user id.
    pub fn user_id(&self) -> Result<UserId, InvalidId> {
        UserId::parse(self.sub.clone())
    }
}
