use std::sync::Arc;
use std::time::Duration;

use keystone_core::approvals::ApprovalEngine;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Runs an escalation pass every `interval_secs` until `shutdown` flips to true.
pub fn spawn(
    engine: Arc<ApprovalEngine>,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<u32> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut passes = 0;

        info!(
            event_name = "approval.scheduler.started",
            interval_secs,
            "escalation scheduler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    run_pass(&engine).await;
                    passes += 1;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(event_name = "approval.scheduler.stopped", passes, "escalation scheduler stopped");
        passes
    })
}

async fn run_pass(engine: &ApprovalEngine) {
    match engine.check_approval_escalations().await {
        Ok(stats) if stats.processed > 0 => info!(
            event_name = "approval.scheduler.pass",
            processed = stats.processed,
            escalated = stats.escalated,
            skipped = stats.skipped,
            no_candidate = stats.no_candidate,
            conflicts = stats.conflicts,
            failed = stats.failed,
            "escalation pass finished"
        ),
        Ok(_) => debug!(event_name = "approval.scheduler.idle", "no overdue approval requests"),
        Err(error) => warn!(
            event_name = "approval.scheduler.failed",
            error = %error,
            "escalation pass failed; retrying on next tick"
        ),
    }
}
