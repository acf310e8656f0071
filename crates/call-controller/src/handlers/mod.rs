//! HTTP request handlers.

pub mod calls;
pub mod health;
pub mod metrics;

pub use calls::end_call;
pub use health::health_check;
pub use metrics::metrics_handler;
