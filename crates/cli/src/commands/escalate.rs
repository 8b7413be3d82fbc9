use std::sync::Arc;

use chrono::{DateTime, Utc};
use keystone_core::approvals::notify::TracingNotifier;
use keystone_core::approvals::{run_notification_worker, ApprovalEngine, NotificationOutbox};
use keystone_core::audit::TracingAuditSink;
use keystone_core::config::LoadOptions;
use keystone_db::approval_ports;

use crate::commands::{exit, open_pool, prepare, CommandFailure, CommandResult};

/// One escalation pass, for cron setups that do not run the server's scheduler.
///
/// `at` replaces the wall clock, which lets operators replay a pass for a past instant.
pub fn run(options: &LoadOptions, at: Option<DateTime<Utc>>) -> CommandResult {
    let (config, runtime) = match prepare("escalate", options) {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = open_pool(&config).await?;
        let (outbox, receiver) = NotificationOutbox::channel();
        let worker = tokio::spawn(run_notification_worker(Arc::new(TracingNotifier), receiver));
        let engine = ApprovalEngine::new(
            approval_ports(&pool),
            outbox,
            Arc::new(TracingAuditSink),
            config.approvals,
        );

        let stats = engine
            .check_approval_escalations_at(at.unwrap_or_else(Utc::now))
            .await
            .map_err(|error| ("escalation", error.to_string(), exit::ENGINE));

        // Dropping the engine closes the outbox so the worker drains and exits.
        drop(engine);
        let delivered = worker.await.unwrap_or_default();
        pool.close().await;
        Ok::<_, CommandFailure>((stats?, delivered))
    });

    match result {
        Ok((stats, delivered)) => {
            let details = serde_json::json!({ "stats": stats, "notifications": delivered });
            CommandResult::success_with(
                "escalate",
                format!(
                    "processed {} overdue request(s), escalated {}",
                    stats.processed, stats.escalated
                ),
                Some(details),
            )
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("escalate", error_class, message, exit_code)
        }
    }
}
