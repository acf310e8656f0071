//! Tunables for matching and call lifecycle.

use std::time::Duration;

/// Default base call duration in seconds.
pub const DEFAULT_BASE_DURATION_SECS: u64 = 600;

/// Default extension increment in seconds.
pub const DEFAULT_EXTENSION_SECS: u64 = 300;

/// Default number of candidates fetched per pairing pass.
pub const DEFAULT_PAIRING_PAGE_SIZE: usize = 10;

/// Default age after which a waiting entry is abandoned.
pub const DEFAULT_WAITING_STALE_AFTER: Duration = Duration::from_secs(5 * 60);

/// Default retention of ended rooms.
pub const DEFAULT_ENDED_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Default maximum deletes per sweep pass.
pub const DEFAULT_SWEEP_BATCH_SIZE: usize = 200;

/// Default post-match countdown before the call starts.
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 5;

/// Remaining seconds at which the extension alert fires.
pub const DEFAULT_EXTENSION_ALERT_SECS: u64 = 60;

/// Default ICE servers handed to the peer connection.
pub const DEFAULT_ICE_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Core configuration shared by the matcher, room controller, sweeper and session.
#[derive(Debug, Clone, PartialEq)]
pub struct CallConfig {
    pub base_duration_secs: u64,
    pub extension_secs: u64,
    pub pairing_page_size: usize,
    pub waiting_stale_after: Duration,
    pub ended_retention: Duration,
    pub sweep_batch_size: usize,
    pub grace_period_secs: u64,
    pub extension_alert_secs: u64,
    /// Attempts per optimistic transaction before giving up.
    pub max_transaction_attempts: u32,
    pub ice_servers: Vec<String>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            base_duration_secs: DEFAULT_BASE_DURATION_SECS,
            extension_secs: DEFAULT_EXTENSION_SECS,
            pairing_page_size: DEFAULT_PAIRING_PAGE_SIZE,
            waiting_stale_after: DEFAULT_WAITING_STALE_AFTER,
            ended_retention: DEFAULT_ENDED_RETENTION,
            sweep_batch_size: DEFAULT_SWEEP_BATCH_SIZE,
            grace_period_secs: DEFAULT_GRACE_PERIOD_SECS,
            extension_alert_secs: DEFAULT_EXTENSION_ALERT_SECS,
            max_transaction_attempts: call_store::DEFAULT_MAX_ATTEMPTS,
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(ToString::to_string).collect(),
        }
    }
}
