use std::sync::Arc;

use keystone_core::approvals::ApprovalPorts;

pub mod connection;
pub mod migrations;
pub mod repositories;

pub use connection::{connect, connect_with_config, connect_with_settings, DbPool};
pub use repositories::{
    OutboxEntry, RepositoryError, SqlApprovalRequestStore, SqlDirectory, SqlEntityOutbox,
    SqlPolicyStore, SqlTaskTracker, TaskBoardEntry,
};

/// Every engine collaborator backed by the same pool.
pub fn approval_ports(pool: &DbPool) -> ApprovalPorts {
    ApprovalPorts {
        policies: Arc::new(SqlPolicyStore::new(pool.clone())),
        requests: Arc::new(SqlApprovalRequestStore::new(pool.clone())),
        directory: Arc::new(SqlDirectory::new(pool.clone())),
        entities: Arc::new(SqlEntityOutbox::new(pool.clone())),
        tasks: Arc::new(SqlTaskTracker::new(pool.clone())),
    }
}
