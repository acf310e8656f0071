//! Secret types for credentials that must never reach logs.
//!
//! Re-exports [`secrecy`] so every crate uses the same wrapper for the
//! token-signing secret and store connection URLs (which may embed a
//! password, e.g. `redis://:password@host:6379`).
//!
//! `SecretString` implements `Debug` with redaction, so a config struct
//! holding one can derive or hand-write `Debug` without leaking the value.
//! The inner value is only reachable through `expose_secret()`.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! let secret = SecretString::from("signing-key");
//! assert!(!format!("{secret:?}").contains("signing-key"));
//! assert_eq!(secret.expose_secret(), "signing-key");
//! ```

pub use secrecy::{ExposeSecret, SecretString};
