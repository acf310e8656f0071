//! Call Core
//!
//! Matching and call lifecycle for anonymous one-to-one timed video calls.
//!
//! # Components
//!
//! - [`matcher`] - waiting pool and the guarded pairing transaction
//! - [`room`] - room state machine (`waiting -> active -> ended`) and extensions
//! - [`signaling`] - offer/answer and candidate exchange through the store
//! - [`sweeper`] - removal of abandoned waiting entries and old ended rooms
//! - [`timer`] - one-second countdown for the grace period and the call
//! - [`session`] - per-client actor tying the above together
//!
//! Everything shares a [`call_store::DocumentStore`]; the only concurrency
//! control is the store's optimistic transaction.

#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod matcher;
pub mod media;
pub mod models;
pub mod peer;
pub mod ratings;
pub mod room;
pub mod schema;
pub mod session;
pub mod signaling;
pub mod sweeper;
pub mod timer;

pub use config::CallConfig;
pub use error::CallError;
