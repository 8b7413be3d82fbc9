use std::sync::Arc;
use std::time::Duration;

use keystone_core::approvals::notify::TracingNotifier;
use keystone_core::approvals::{
    run_notification_worker, ApprovalEngine, Notifier, NotificationOutbox,
};
use keystone_core::audit::TracingAuditSink;
use keystone_core::config::{AppConfig, ConfigError, LoadOptions};
use keystone_db::{approval_ports, connect_with_config, migrations, DbPool};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::notifier::WebhookNotifier;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub engine: Arc<ApprovalEngine>,
    pub notification_worker: JoinHandle<usize>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("notification client setup failed: {0}")]
    Notifier(#[source] reqwest::Error),
}

impl Application {
    /// Waits for the scheduler, then drops the engine so the notification worker can drain the
    /// queue. Bounded by `server.graceful_shutdown_secs`. Returns the number of notifications the
    /// worker delivered, or `None` when the grace period ran out first.
    pub async fn shutdown(self, scheduler: JoinHandle<u32>) -> Option<usize> {
        let Self { config, db_pool, engine, notification_worker } = self;
        let grace = Duration::from_secs(config.server.graceful_shutdown_secs);
        let drained = tokio::time::timeout(grace, async move {
            let _ = scheduler.await;
            drop(engine);
            notification_worker.await
        })
        .await;

        let delivered = match drained {
            Ok(Ok(delivered)) => {
                info!(
                    event_name = "system.server.notifications_drained",
                    correlation_id = "shutdown",
                    delivered,
                    "notification queue drained"
                );
                Some(delivered)
            }
            Ok(Err(error)) => {
                warn!(
                    event_name = "system.server.notification_worker_failed",
                    correlation_id = "shutdown",
                    error = %error,
                    "notification worker ended abnormally"
                );
                None
            }
            Err(_) => {
                warn!(
                    event_name = "system.server.shutdown_timeout",
                    correlation_id = "shutdown",
                    "scheduler or notification queue did not finish within the grace period"
                );
                None
            }
        };
        db_pool.close().await;
        delivered
    }
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool =
        connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let notifier: Arc<dyn Notifier> = match &config.notifications.webhook_url {
        Some(url) => Arc::new(
            WebhookNotifier::new(
                url.clone(),
                config.notifications.webhook_token.clone(),
                config.notifications.timeout_secs,
            )
            .map_err(BootstrapError::Notifier)?,
        ),
        None => Arc::new(TracingNotifier),
    };
    info!(
        event_name = "system.bootstrap.notifier_ready",
        correlation_id = "bootstrap",
        transport = if config.notifications.webhook_url.is_some() { "webhook" } else { "log" },
        "notification transport selected"
    );

    let (outbox, receiver) = NotificationOutbox::channel();
    let notification_worker = tokio::spawn(run_notification_worker(notifier, receiver));
    let engine = Arc::new(ApprovalEngine::new(
        approval_ports(&db_pool),
        outbox,
        Arc::new(TracingAuditSink),
        config.approvals,
    ));

    Ok(Application { config, db_pool, engine, notification_worker })
}
