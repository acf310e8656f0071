//! Background tasks.
//!
//! Both tasks take a `CancellationToken` for graceful shutdown.

pub mod pairing_reaction;
pub mod sweeper;

pub use pairing_reaction::{start_pairing_reaction, PairingReaction};
pub use sweeper::start_sweeper;
