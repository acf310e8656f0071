//! Common utilities and types shared across the call-matching components.

#![warn(clippy::pedantic)]

/// Module for identifier and timestamp types
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;
