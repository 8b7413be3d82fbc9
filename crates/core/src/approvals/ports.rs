//! Collaborator contracts the approval engine depends on.
//!
//! Storage, the user directory, the downstream CRM entities, the task board and
//! notification delivery all live outside the engine. `keystone-db` provides SQLite
//! implementations, [`crate::approvals::memory`] provides in-memory ones.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::approvals::notify::ApprovalNotification;
use crate::approvals::propagation::MutationEnvelope;
use crate::domain::policy::{ApprovalPolicy, ApprovalType, PolicyId};
use crate::domain::request::{ApprovalRequest, ApprovalRequestId, ApprovalStatus};
use crate::domain::task::{NewTask, TaskEscalation, TaskId, TaskResolution, TrackedTask};
use crate::errors::ApplicationError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("approval request `{request_id}` changed since version {expected_version}")]
    VersionConflict { request_id: String, expected_version: u32 },
    #[error("record not found: {0}")]
    Missing(String),
    #[error("duplicate record: {0}")]
    Duplicate(String),
    #[error("backend failure: {0}")]
    Backend(String),
}

/// Keyset position for paging through [`ApprovalRequestStore::list_overdue`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OverdueCursor {
    pub sla_deadline: DateTime<Utc>,
    pub id: ApprovalRequestId,
}

impl From<&ApprovalRequest> for OverdueCursor {
    fn from(request: &ApprovalRequest) -> Self {
        Self { sla_deadline: request.sla_deadline, id: request.id.clone() }
    }
}

impl From<PortError> for ApplicationError {
    fn from(value: PortError) -> Self {
        match value {
            PortError::VersionConflict { request_id, .. } => {
                Self::ConcurrentModification { request_id }
            }
            PortError::Missing(message) => Self::NotFound(message),
            PortError::Duplicate(message) => Self::StateConflict(message),
            PortError::Backend(message) => Self::Persistence(message),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryUser {
    pub user_id: String,
    pub role_slug: String,
    pub role_level: u8,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeStatusCount {
    pub approval_type: ApprovalType,
    pub status: ApprovalStatus,
    pub count: u64,
}

#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Exact match on `(org, type, project)`; `project_id = None` addresses the org-wide policy.
    async fn get_policy(
        &self,
        org_id: &str,
        approval_type: ApprovalType,
        project_id: Option<&str>,
    ) -> Result<Option<ApprovalPolicy>, PortError>;

    async fn find_by_id(&self, id: &PolicyId) -> Result<Option<ApprovalPolicy>, PortError>;

    /// Upserts on `(org, type, project)`, keeping one policy per tuple. A replaced policy keeps
    /// its stored id so existing requests still resolve it.
    async fn save_policy(&self, policy: ApprovalPolicy) -> Result<(), PortError>;
}

#[async_trait]
pub trait ApprovalRequestStore: Send + Sync {
    async fn insert(&self, request: ApprovalRequest) -> Result<(), PortError>;

    async fn find_by_id(
        &self,
        id: &ApprovalRequestId,
    ) -> Result<Option<ApprovalRequest>, PortError>;

    /// Writes `request` only when the stored version still equals `expected_version`.
    /// Returns the stored copy carrying the bumped version.
    async fn update(
        &self,
        request: ApprovalRequest,
        expected_version: u32,
    ) -> Result<ApprovalRequest, PortError>;

    /// Pending requests whose SLA deadline is before `now` and whose escalation level is below
    /// [`crate::domain::policy::MAX_ESCALATION_LEVEL`]. Ordered by `(sla_deadline, id)` and
    /// starting strictly after `after` when given.
    async fn list_overdue(
        &self,
        now: DateTime<Utc>,
        after: Option<&OverdueCursor>,
        limit: u32,
    ) -> Result<Vec<ApprovalRequest>, PortError>;

    async fn list_pending_for_approver(
        &self,
        org_id: &str,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<ApprovalRequest>, PortError>;

    async fn list_by_requester(
        &self,
        org_id: &str,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<ApprovalRequest>, PortError>;

    async fn list_recently_resolved(
        &self,
        org_id: &str,
        limit: u32,
    ) -> Result<Vec<ApprovalRequest>, PortError>;

    async fn count_by_type_and_status(
        &self,
        org_id: &str,
    ) -> Result<Vec<TypeStatusCount>, PortError>;
}

/// Role/user directory. Every query returns active users only, ordered most senior first.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn users_by_level(
        &self,
        org_id: &str,
        max_level: u8,
    ) -> Result<Vec<DirectoryUser>, PortError>;

    async fn users_by_role_slug(
        &self,
        org_id: &str,
        role_slug: &str,
    ) -> Result<Vec<DirectoryUser>, PortError>;

    async fn find_user(
        &self,
        org_id: &str,
        user_id: &str,
    ) -> Result<Option<DirectoryUser>, PortError>;
}

/// Applies approve/reject effects onto CRM entities. Implementations must treat a repeated
/// `idempotency_key` as already applied.
#[async_trait]
pub trait EntityGateway: Send + Sync {
    async fn apply(&self, envelope: &MutationEnvelope) -> Result<(), PortError>;
}

#[async_trait]
pub trait TaskTracker: Send + Sync {
    async fn create_task(&self, task: &NewTask) -> Result<TrackedTask, PortError>;

    async fn complete_task(
        &self,
        task_id: &TaskId,
        resolution: &TaskResolution,
    ) -> Result<(), PortError>;

    async fn escalate_task(
        &self,
        task_id: &TaskId,
        escalation: &TaskEscalation,
    ) -> Result<(), PortError>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, notification: &ApprovalNotification) -> Result<(), PortError>;
}
