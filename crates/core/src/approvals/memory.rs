//! In-memory port implementations for tests and local runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::approvals::notify::ApprovalNotification;
use crate::approvals::ports::{
    ApprovalRequestStore, Directory, DirectoryUser, EntityGateway, Notifier, OverdueCursor,
    PolicyStore, PortError, TaskTracker, TypeStatusCount,
};
use crate::approvals::propagation::MutationEnvelope;
use crate::domain::policy::{ApprovalPolicy, ApprovalType, PolicyId, MAX_ESCALATION_LEVEL};
use crate::domain::request::{ApprovalRequest, ApprovalRequestId, ApprovalStatus, Priority};
use crate::domain::task::{NewTask, TaskEscalation, TaskId, TaskResolution, TrackedTask};

fn policy_key(org_id: &str, approval_type: ApprovalType, project_id: Option<&str>) -> String {
    format!("{org_id}|{}|{}", approval_type.as_str(), project_id.unwrap_or(""))
}

#[derive(Default)]
pub struct InMemoryPolicyStore {
    policies: RwLock<HashMap<String, ApprovalPolicy>>,
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn get_policy(
        &self,
        org_id: &str,
        approval_type: ApprovalType,
        project_id: Option<&str>,
    ) -> Result<Option<ApprovalPolicy>, PortError> {
        let policies = self.policies.read().await;
        Ok(policies.get(&policy_key(org_id, approval_type, project_id)).cloned())
    }

    async fn find_by_id(&self, id: &PolicyId) -> Result<Option<ApprovalPolicy>, PortError> {
        let policies = self.policies.read().await;
        Ok(policies.values().find(|policy| policy.id == *id).cloned())
    }

    async fn save_policy(&self, mut policy: ApprovalPolicy) -> Result<(), PortError> {
        let key = policy_key(&policy.org_id, policy.approval_type, policy.project_id.as_deref());
        let mut policies = self.policies.write().await;
        if let Some(existing) = policies.get(&key) {
            policy.id = existing.id.clone();
        }
        policies.insert(key, policy);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryApprovalRequestStore {
    requests: RwLock<HashMap<String, ApprovalRequest>>,
    injected_conflicts: AtomicU32,
}

impl InMemoryApprovalRequestStore {
    /// Makes the next `count` updates fail as if another writer got there first.
    pub fn inject_conflicts(&self, count: u32) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.requests.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.requests.read().await.is_empty()
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    async fn select<F, K>(&self, limit: u32, filter: F, sort_key: K) -> Vec<ApprovalRequest>
    where
        F: Fn(&ApprovalRequest) -> bool,
        K: Fn(&ApprovalRequest) -> DateTime<Utc>,
    {
        let requests = self.requests.read().await;
        let mut selected: Vec<ApprovalRequest> =
            requests.values().filter(|request| filter(request)).cloned().collect();
        selected.sort_by(|left, right| sort_key(right).cmp(&sort_key(left)));
        selected.truncate(limit as usize);
        selected
    }
}

#[async_trait]
impl ApprovalRequestStore for InMemoryApprovalRequestStore {
    async fn insert(&self, request: ApprovalRequest) -> Result<(), PortError> {
        let mut requests = self.requests.write().await;
        if requests.contains_key(&request.id.0) {
            return Err(PortError::Duplicate(format!("approval request `{}`", request.id.0)));
        }
        requests.insert(request.id.0.clone(), request);
        Ok(())
    }

    async fn find_by_id(
        &self,
        id: &ApprovalRequestId,
    ) -> Result<Option<ApprovalRequest>, PortError> {
        let requests = self.requests.read().await;
        Ok(requests.get(&id.0).cloned())
    }

    async fn update(
        &self,
        mut request: ApprovalRequest,
        expected_version: u32,
    ) -> Result<ApprovalRequest, PortError> {
        let mut requests = self.requests.write().await;
        let Some(stored) = requests.get_mut(&request.id.0) else {
            return Err(PortError::Missing(format!("approval request `{}`", request.id.0)));
        };
        if stored.version != expected_version || self.take_injected_conflict() {
            return Err(PortError::VersionConflict {
                request_id: request.id.0.clone(),
                expected_version,
            });
        }

        request.version = expected_version + 1;
        *stored = request.clone();
        Ok(request)
    }

    async fn list_overdue(
        &self,
        now: DateTime<Utc>,
        after: Option<&OverdueCursor>,
        limit: u32,
    ) -> Result<Vec<ApprovalRequest>, PortError> {
        let requests = self.requests.read().await;
        let mut overdue: Vec<ApprovalRequest> = requests
            .values()
            .filter(|request| {
                request.status == ApprovalStatus::Pending
                    && request.sla_deadline < now
                    && request.current_escalation_level < MAX_ESCALATION_LEVEL
                    && after.map_or(true, |cursor| {
                        (request.sla_deadline, &request.id.0) > (cursor.sla_deadline, &cursor.id.0)
                    })
            })
            .cloned()
            .collect();
        overdue.sort_by(|left, right| {
            (left.sla_deadline, &left.id.0).cmp(&(right.sla_deadline, &right.id.0))
        });
        overdue.truncate(limit as usize);
        Ok(overdue)
    }

    async fn list_pending_for_approver(
        &self,
        org_id: &str,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<ApprovalRequest>, PortError> {
        Ok(self
            .select(
                limit,
                |request| {
                    request.org_id == org_id
                        && request.status == ApprovalStatus::Pending
                        && request.has_pending_action_for(user_id)
                },
                |request| request.created_at,
            )
            .await)
    }

    async fn list_by_requester(
        &self,
        org_id: &str,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<ApprovalRequest>, PortError> {
        Ok(self
            .select(
                limit,
                |request| request.org_id == org_id && request.requested_by == user_id,
                |request| request.created_at,
            )
            .await)
    }

    async fn list_recently_resolved(
        &self,
        org_id: &str,
        limit: u32,
    ) -> Result<Vec<ApprovalRequest>, PortError> {
        Ok(self
            .select(
                limit,
                |request| request.org_id == org_id && request.status.is_terminal(),
                |request| request.resolved_at.unwrap_or(request.updated_at),
            )
            .await)
    }

    async fn count_by_type_and_status(
        &self,
        org_id: &str,
    ) -> Result<Vec<TypeStatusCount>, PortError> {
        let requests = self.requests.read().await;
        let mut counts: BTreeMap<(ApprovalType, &'static str), (ApprovalStatus, u64)> =
            BTreeMap::new();
        for request in requests.values().filter(|request| request.org_id == org_id) {
            let entry = counts
                .entry((request.approval_type, request.status.as_str()))
                .or_insert((request.status, 0));
            entry.1 += 1;
        }
        Ok(counts
            .into_iter()
            .map(|((approval_type, _), (status, count))| TypeStatusCount {
                approval_type,
                status,
                count,
            })
            .collect())
    }
}

#[derive(Clone, Debug)]
struct DirectoryEntry {
    org_id: String,
    user: DirectoryUser,
    active: bool,
}

#[derive(Default)]
pub struct InMemoryDirectory {
    entries: RwLock<Vec<DirectoryEntry>>,
}

impl InMemoryDirectory {
    pub async fn add_user(&self, org_id: &str, user_id: &str, role_slug: &str, role_level: u8) {
        let mut entries = self.entries.write().await;
        entries.push(DirectoryEntry {
            org_id: org_id.to_string(),
            user: DirectoryUser {
                user_id: user_id.to_string(),
                role_slug: role_slug.to_string(),
                role_level,
            },
            active: true,
        });
    }

    pub async fn deactivate(&self, org_id: &str, user_id: &str) {
        let mut entries = self.entries.write().await;
        for entry in entries
            .iter_mut()
            .filter(|entry| entry.org_id == org_id && entry.user.user_id == user_id)
        {
            entry.active = false;
        }
    }

    async fn active_where<F>(&self, org_id: &str, filter: F) -> Vec<DirectoryUser>
    where
        F: Fn(&DirectoryUser) -> bool,
    {
        let entries = self.entries.read().await;
        let mut users: Vec<DirectoryUser> = entries
            .iter()
            .filter(|entry| entry.active && entry.org_id == org_id && filter(&entry.user))
            .map(|entry| entry.user.clone())
            .collect();
        users.sort_by(|left, right| {
            left.role_level.cmp(&right.role_level).then_with(|| left.user_id.cmp(&right.user_id))
        });
        users
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn users_by_level(
        &self,
        org_id: &str,
        max_level: u8,
    ) -> Result<Vec<DirectoryUser>, PortError> {
        Ok(self.active_where(org_id, |user| user.role_level <= max_level).await)
    }

    async fn users_by_role_slug(
        &self,
        org_id: &str,
        role_slug: &str,
    ) -> Result<Vec<DirectoryUser>, PortError> {
        Ok(self.active_where(org_id, |user| user.role_slug == role_slug).await)
    }

    async fn find_user(
        &self,
        org_id: &str,
        user_id: &str,
    ) -> Result<Option<DirectoryUser>, PortError> {
        Ok(self.active_where(org_id, |user| user.user_id == user_id).await.into_iter().next())
    }
}

#[derive(Default)]
pub struct InMemoryEntityGateway {
    applied: RwLock<Vec<MutationEnvelope>>,
    failing_kinds: RwLock<HashSet<String>>,
}

impl InMemoryEntityGateway {
    pub async fn fail_on(&self, kind: &str) {
        self.failing_kinds.write().await.insert(kind.to_string());
    }

    pub async fn applied(&self) -> Vec<MutationEnvelope> {
        self.applied.read().await.clone()
    }
}

#[async_trait]
impl EntityGateway for InMemoryEntityGateway {
    async fn apply(&self, envelope: &MutationEnvelope) -> Result<(), PortError> {
        if self.failing_kinds.read().await.contains(envelope.mutation.kind()) {
            return Err(PortError::Backend(format!(
                "{} rejected by entity store",
                envelope.mutation.kind()
            )));
        }

        let mut applied = self.applied.write().await;
        if applied.iter().any(|existing| existing.idempotency_key == envelope.idempotency_key) {
            return Ok(());
        }
        applied.push(envelope.clone());
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskRecord {
    pub id: TaskId,
    pub task: NewTask,
    pub assignee: String,
    pub priority: Priority,
    pub resolution: Option<TaskResolution>,
    pub escalations: Vec<TaskEscalation>,
}

#[derive(Default)]
pub struct InMemoryTaskTracker {
    tasks: RwLock<Vec<TaskRecord>>,
    unavailable: AtomicBool,
}

impl InMemoryTaskTracker {
    /// Simulates the task board being down; every call fails until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn task(&self, id: &TaskId) -> Option<TaskRecord> {
        self.tasks.read().await.iter().find(|record| record.id == *id).cloned()
    }

    pub async fn tasks(&self) -> Vec<TaskRecord> {
        self.tasks.read().await.clone()
    }

    fn check_available(&self) -> Result<(), PortError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PortError::Backend("task board unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskTracker for InMemoryTaskTracker {
    async fn create_task(&self, task: &NewTask) -> Result<TrackedTask, PortError> {
        self.check_available()?;
        let mut tasks = self.tasks.write().await;
        let id = TaskId(format!("TASK-{}", tasks.len() + 1));
        tasks.push(TaskRecord {
            id: id.clone(),
            task: task.clone(),
            assignee: task.assignee.clone(),
            priority: task.priority,
            resolution: None,
            escalations: Vec::new(),
        });
        Ok(TrackedTask { id, assignee: task.assignee.clone(), priority: task.priority })
    }

    async fn complete_task(
        &self,
        task_id: &TaskId,
        resolution: &TaskResolution,
    ) -> Result<(), PortError> {
        self.check_available()?;
        let mut tasks = self.tasks.write().await;
        let record = tasks
            .iter_mut()
            .find(|record| record.id == *task_id)
            .ok_or_else(|| PortError::Missing(format!("task `{}`", task_id.0)))?;
        record.resolution = Some(resolution.clone());
        Ok(())
    }

    async fn escalate_task(
        &self,
        task_id: &TaskId,
        escalation: &TaskEscalation,
    ) -> Result<(), PortError> {
        self.check_available()?;
        let mut tasks = self.tasks.write().await;
        let record = tasks
            .iter_mut()
            .find(|record| record.id == *task_id)
            .ok_or_else(|| PortError::Missing(format!("task `{}`", task_id.0)))?;
        record.assignee = escalation.new_assignee.clone();
        record.priority = escalation.priority;
        record.escalations.push(escalation.clone());
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct RecordingNotifier {
    delivered: Arc<RwLock<Vec<ApprovalNotification>>>,
    attempts: Arc<AtomicUsize>,
    failing: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self { failing: true, ..Self::default() }
    }

    pub async fn delivered(&self) -> Vec<ApprovalNotification> {
        self.delivered.read().await.clone()
    }

    pub async fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn deliver(&self, notification: &ApprovalNotification) -> Result<(), PortError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(PortError::Backend("mail relay refused connection".to_string()));
        }
        self.delivered.write().await.push(notification.clone());
        Ok(())
    }
}
