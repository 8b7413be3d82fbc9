use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::request::{ApprovalRequestId, ApprovalStatus, Priority};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

/// Task-board item mirroring one approval request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    pub org_id: String,
    pub approval_request_id: ApprovalRequestId,
    pub title: String,
    pub description: Option<String>,
    pub assignee: String,
    pub watchers: Vec<String>,
    pub due_at: DateTime<Utc>,
    pub priority: Priority,
    pub created_by: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedTask {
    pub id: TaskId,
    pub assignee: String,
    pub priority: Priority,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResolution {
    pub outcome: ApprovalStatus,
    pub resolved_by: String,
    pub comment: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEscalation {
    pub new_assignee: String,
    pub level: u8,
    pub priority: Priority,
    pub reason: String,
}
