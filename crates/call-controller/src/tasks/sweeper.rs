//! Reconciliation sweeper background task.
//!
//! Periodically runs both sweeper passes:
//! 1. Deletes waiting entries nobody paired within the staleness threshold
//! 2. Deletes ended rooms older than the retention window
//!
//! A failed pass is logged and retried on the next tick; the loop itself
//! never exits on a store error.
//!
//! # Graceful Shutdown
//!
//! When the cancellation token is cancelled the task finishes its current
//! iteration and exits.

use crate::observability::metrics::{record_sweep_deleted, record_sweep_duration};
use call_core::sweeper::{SweepReport, Sweeper};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

/// Run the sweeper every `interval` until cancelled.
#[instrument(skip_all, name = "cc.task.sweeper")]
pub async fn start_sweeper(sweeper: Sweeper, interval: Duration, cancel_token: CancellationToken) {
    info!(
        target: "cc.task.sweeper",
        interval_seconds = interval.as_secs(),
        "Starting sweeper task"
    );

    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_sweep(&sweeper).await;
            }
            () = cancel_token.cancelled() => {
                info!(target: "cc.task.sweeper", "Sweeper task received shutdown signal, exiting");
                break;
            }
        }
    }

    info!(target: "cc.task.sweeper", "Sweeper task stopped");
}

/// Run both passes once.
pub(crate) async fn run_sweep(sweeper: &Sweeper) -> SweepReport {
    let start = Instant::now();
    let mut report = SweepReport::default();

    match sweeper.sweep_stale_waiting().await {
        Ok(count) => {
            report.stale_waiting_deleted = count;
            record_sweep_deleted("waiting", count);
        }
        Err(e) => {
            error!(target: "cc.task.sweeper", error = %e, "Failed to sweep stale waiting entries");
        }
    }

    match sweeper.sweep_ended_rooms().await {
        Ok(count) => {
            report.ended_rooms_deleted = count;
            record_sweep_deleted("rooms", count);
        }
        Err(e) => {
            error!(target: "cc.task.sweeper", error = %e, "Failed to sweep ended rooms");
        }
    }

    record_sweep_duration(start.elapsed());
    if report != SweepReport::default() {
        info!(
            target: "cc.task.sweeper",
            stale_waiting_deleted = report.stale_waiting_deleted,
            ended_rooms_deleted = report.ended_rooms_deleted,
            "Sweep deleted documents"
        );
    }
    report
}
