//! Call Controller service library.
//!
//! The server half of the call matcher. Clients do most of the work
//! against the shared store themselves; this process hosts what must not
//! depend on a client staying online:
//!
//! - the authenticated end-call operation
//! - the pairing reaction, which pairs newly waiting users
//! - the reconciliation sweeper
//! - health and Prometheus metrics
//!
//! # Layout
//!
//! ```text
//! routes/mod.rs -> middleware/*.rs -> handlers/*.rs -> call_core
//! tasks/*.rs    -> call_core
//! ```

pub mod auth;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod observability;
pub mod routes;
pub mod tasks;
