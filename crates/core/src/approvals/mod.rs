//! The approval workflow engine.
//!
//! [`ApprovalEngine`] wires the threshold evaluator, approver resolver, propagation dispatcher,
//! escalation scheduler and dashboard aggregator over the collaborator ports in [`ports`].

pub mod context;
pub mod dashboard;
pub mod escalation;
pub mod memory;
pub mod notify;
pub mod ports;
pub mod propagation;
pub mod resolver;
pub mod strategy;
pub mod threshold;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use crate::config::ApprovalsConfig;
use crate::domain::policy::{ApprovalPolicy, ApprovalType};
use crate::domain::request::{
    ActionOutcome, ApprovalDecision, ApprovalRequest, ApprovalRequestId, ApprovalStatus,
    ApproverAction, AuditAction, Priority,
};
use crate::domain::task::{NewTask, TrackedTask};
use crate::errors::ApplicationError;

pub use context::ApprovalContext;
pub use dashboard::{ApprovalDashboard, DashboardAggregator};
pub use escalation::{EscalationScheduler, EscalationStats};
pub use notify::{run_notification_worker, ApprovalNotification, NotificationOutbox};
pub use ports::{
    ApprovalRequestStore, Directory, DirectoryUser, EntityGateway, Notifier, OverdueCursor,
    PolicyStore, PortError, TaskTracker, TypeStatusCount,
};
pub use propagation::{
    EntityMutation, MutationEnvelope, PropagationDispatcher, PropagationPath, PropagationReport,
};
pub use resolver::ApproverResolver;
pub use threshold::{ThresholdEvaluator, ThresholdOutcome};

/// The collaborators an engine runs against.
#[derive(Clone)]
pub struct ApprovalPorts {
    pub policies: Arc<dyn PolicyStore>,
    pub requests: Arc<dyn ApprovalRequestStore>,
    pub directory: Arc<dyn Directory>,
    pub entities: Arc<dyn EntityGateway>,
    pub tasks: Arc<dyn TaskTracker>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewApprovalRequest {
    pub org_id: String,
    #[serde(default)]
    pub project_id: Option<String>,
    pub approval_type: ApprovalType,
    pub entity_type: String,
    pub entity_id: String,
    pub requested_by: String,
    #[serde(default)]
    pub request_data: serde_json::Value,
    #[serde(default)]
    pub priority: Priority,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateApprovalOutcome {
    pub approved: bool,
    pub auto_approved: bool,
    pub approval_request: Option<ApprovalRequest>,
    pub task: Option<TrackedTask>,
}

impl CreateApprovalOutcome {
    fn auto_approved() -> Self {
        Self { approved: true, auto_approved: true, approval_request: None, task: None }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalCheck {
    pub required: bool,
    pub policy: Option<ApprovalPolicy>,
    pub approvers: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalActionInput {
    pub request_id: ApprovalRequestId,
    pub user_id: String,
    pub action: ApprovalDecision,
    #[serde(default)]
    pub comment: Option<String>,
}

pub struct ApprovalEngine {
    threshold: ThresholdEvaluator,
    resolver: ApproverResolver,
    propagation: PropagationDispatcher,
    escalation: EscalationScheduler,
    dashboard: DashboardAggregator,
    requests: Arc<dyn ApprovalRequestStore>,
    tasks: Arc<dyn TaskTracker>,
    outbox: NotificationOutbox,
    audit: Arc<dyn AuditSink>,
    settings: ApprovalsConfig,
}

impl ApprovalEngine {
    pub fn new(
        ports: ApprovalPorts,
        outbox: NotificationOutbox,
        audit: Arc<dyn AuditSink>,
        settings: ApprovalsConfig,
    ) -> Self {
        Self {
            threshold: ThresholdEvaluator::new(ports.policies.clone(), ports.directory.clone()),
            resolver: ApproverResolver::new(ports.directory.clone()),
            propagation: PropagationDispatcher::new(ports.entities, ports.tasks.clone()),
            escalation: EscalationScheduler::new(
                ports.requests.clone(),
                ports.policies,
                ports.directory,
                ports.tasks.clone(),
                outbox.clone(),
                settings.escalation_batch_size,
            ),
            dashboard: DashboardAggregator::new(ports.requests.clone(), settings.dashboard_limit),
            requests: ports.requests,
            tasks: ports.tasks,
            outbox,
            audit,
            settings,
        }
    }

    /// Read-only: evaluates thresholds and resolves who would approve, persisting nothing.
    pub async fn check_approval_required(
        &self,
        org_id: &str,
        approval_type: ApprovalType,
        context: &ApprovalContext,
        project_id: Option<&str>,
    ) -> Result<ApprovalCheck, ApplicationError> {
        let outcome =
            self.threshold.is_approval_required(org_id, approval_type, context, project_id).await?;
        let approvers = match (&outcome.policy, outcome.required) {
            (Some(policy), true) => {
                self.resolver
                    .resolve_approvers(
                        policy,
                        org_id,
                        &context.requester_id,
                        outcome.override_approver_level,
                    )
                    .await?
            }
            _ => Vec::new(),
        };

        Ok(ApprovalCheck { required: outcome.required, policy: outcome.policy, approvers })
    }

    pub async fn create_approval_request(
        &self,
        input: NewApprovalRequest,
    ) -> Result<CreateApprovalOutcome, ApplicationError> {
        let correlation_id = Uuid::new_v4().to_string();
        let context = ApprovalContext::from_request_data(&input.requested_by, &input.request_data)?;
        let outcome = self
            .threshold
            .is_approval_required(
                &input.org_id,
                input.approval_type,
                &context,
                input.project_id.as_deref(),
            )
            .await?;

        let policy = match outcome.policy {
            Some(policy) if outcome.required => policy,
            _ => {
                debug!(
                    event_name = "approval.request.not_required",
                    correlation_id = %correlation_id,
                    org_id = %input.org_id,
                    approval_type = input.approval_type.as_str(),
                    "approval not required; auto-approved"
                );
                return Ok(CreateApprovalOutcome::auto_approved());
            }
        };
        strategy::strategy_for(input.approval_type).validate_request_data(&input.request_data)?;

        let approvers = self
            .resolver
            .resolve_approvers(
                &policy,
                &input.org_id,
                &input.requested_by,
                outcome.override_approver_level,
            )
            .await?;
        if approvers.is_empty() {
            info!(
                event_name = "approval.request.no_approvers",
                correlation_id = %correlation_id,
                org_id = %input.org_id,
                approval_type = input.approval_type.as_str(),
                "no approver resolved; auto-approved"
            );
            return Ok(CreateApprovalOutcome::auto_approved());
        }
        if (approvers.len() as u32) < policy.required_approvals {
            warn!(
                event_name = "approval.request.understaffed",
                correlation_id = %correlation_id,
                org_id = %input.org_id,
                approvers = approvers.len(),
                required_approvals = policy.required_approvals,
                "fewer approvers resolved than approvals required; request relies on escalation"
            );
        }

        let request = build_request(input, &policy, approvers, Utc::now());
        self.requests.insert(request.clone()).await?;
        info!(
            event_name = "approval.request.created",
            correlation_id = %correlation_id,
            approval_request_id = %request.id.0,
            org_id = %request.org_id,
            approval_type = request.approval_type.as_str(),
            approvers = request.approver_actions.len(),
            required_approvals = request.required_approvals,
            "approval request created"
        );
        self.audit.emit(
            self.audit_event(&request, &correlation_id, "approval.request_created")
                .with_metadata("approvers", request.approver_ids().join(",")),
        );

        let (request, task) = self.attach_task(request, &correlation_id).await;
        self.outbox.publish(ApprovalNotification::requested(&request));

        Ok(CreateApprovalOutcome {
            approved: false,
            auto_approved: false,
            approval_request: Some(request),
            task,
        })
    }

    pub async fn process_approval_action(
        &self,
        input: ApprovalActionInput,
    ) -> Result<ApprovalRequest, ApplicationError> {
        let correlation_id = Uuid::new_v4().to_string();
        let mut attempt = 0;
        let (saved, outcome) = loop {
            let mut request = self.load(&input.request_id).await?;
            let expected_version = request.version;
            let outcome = request.record_action(
                &input.user_id,
                input.action,
                input.comment.clone(),
                Utc::now(),
            )?;

            match self.requests.update(request, expected_version).await {
                Ok(saved) => break (saved, outcome),
                Err(PortError::VersionConflict { .. })
                    if attempt < self.settings.max_conflict_retries =>
                {
                    attempt += 1;
                    debug!(
                        event_name = "approval.action.version_conflict",
                        correlation_id = %correlation_id,
                        approval_request_id = %input.request_id.0,
                        attempt,
                        "request changed concurrently; reloading"
                    );
                }
                Err(error) => return Err(error.into()),
            }
        };

        info!(
            event_name = "approval.action.recorded",
            correlation_id = %correlation_id,
            approval_request_id = %saved.id.0,
            user_id = %input.user_id,
            status = saved.status.as_str(),
            approvals = saved.current_approval_count,
            required_approvals = saved.required_approvals,
            "approver action recorded"
        );
        let event_type = match outcome {
            ActionOutcome::PartiallyApproved { .. } => "approval.partially_approved",
            ActionOutcome::Approved => "approval.approved",
            ActionOutcome::Rejected => "approval.rejected",
        };
        self.audit.emit(
            self.audit_event(&saved, &correlation_id, event_type)
                .with_metadata("actor", input.user_id.clone())
                .with_metadata("status", saved.status.as_str()),
        );

        match outcome {
            ActionOutcome::PartiallyApproved { .. } => {}
            ActionOutcome::Approved => {
                self.finalize(&saved, PropagationPath::Approve, &correlation_id).await;
                self.outbox.publish(ApprovalNotification::approved(&saved));
            }
            ActionOutcome::Rejected => {
                self.finalize(&saved, PropagationPath::Reject, &correlation_id).await;
                self.outbox.publish(ApprovalNotification::rejected(&saved));
            }
        }

        Ok(saved)
    }

    pub async fn cancel_approval_request(
        &self,
        request_id: &ApprovalRequestId,
        user_id: &str,
        reason: Option<String>,
    ) -> Result<ApprovalRequest, ApplicationError> {
        let correlation_id = Uuid::new_v4().to_string();
        let mut attempt = 0;
        let saved = loop {
            let mut request = self.load(request_id).await?;
            let expected_version = request.version;
            request.cancel(user_id, reason.clone(), Utc::now())?;

            match self.requests.update(request, expected_version).await {
                Ok(saved) => break saved,
                Err(PortError::VersionConflict { .. })
                    if attempt < self.settings.max_conflict_retries =>
                {
                    attempt += 1;
                }
                Err(error) => return Err(error.into()),
            }
        };

        info!(
            event_name = "approval.request.cancelled",
            correlation_id = %correlation_id,
            approval_request_id = %saved.id.0,
            user_id,
            "approval request cancelled by requester"
        );
        self.audit.emit(self.audit_event(&saved, &correlation_id, "approval.cancelled"));
        self.finalize(&saved, PropagationPath::Reject, &correlation_id).await;

        Ok(saved)
    }

    pub async fn check_approval_escalations(&self) -> Result<EscalationStats, ApplicationError> {
        self.check_approval_escalations_at(Utc::now()).await
    }

    /// Same as [`Self::check_approval_escalations`] with an explicit clock.
    pub async fn check_approval_escalations_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<EscalationStats, ApplicationError> {
        let stats = self.escalation.run_at(now).await?;
        if stats.escalated > 0 {
            self.audit.emit(
                AuditEvent::new(
                    None,
                    None,
                    Uuid::new_v4().to_string(),
                    "approval.escalation_pass",
                    AuditCategory::Escalation,
                    "escalation-scheduler",
                    AuditOutcome::Success,
                )
                .with_metadata("processed", stats.processed.to_string())
                .with_metadata("escalated", stats.escalated.to_string()),
            );
        }
        Ok(stats)
    }

    pub async fn get_approval_dashboard(
        &self,
        user_id: &str,
        org_id: &str,
    ) -> Result<ApprovalDashboard, ApplicationError> {
        self.dashboard.dashboard(user_id, org_id).await
    }

    async fn load(&self, id: &ApprovalRequestId) -> Result<ApprovalRequest, ApplicationError> {
        self.requests
            .find_by_id(id)
            .await?
            .ok_or_else(|| ApplicationError::NotFound(format!("approval request `{}`", id.0)))
    }

    /// Creates the task-board mirror. Any failure leaves the request without a task link.
    async fn attach_task(
        &self,
        request: ApprovalRequest,
        correlation_id: &str,
    ) -> (ApprovalRequest, Option<TrackedTask>) {
        let approvers = request.approver_ids();
        let Some((assignee, watchers)) = approvers.split_first() else {
            return (request, None);
        };
        let new_task = NewTask {
            org_id: request.org_id.clone(),
            approval_request_id: request.id.clone(),
            title: request.title.clone(),
            description: request.description.clone(),
            assignee: assignee.clone(),
            watchers: watchers.to_vec(),
            due_at: request.sla_deadline,
            priority: request.priority,
            created_by: request.requested_by.clone(),
        };

        let task = match self.tasks.create_task(&new_task).await {
            Ok(task) => task,
            Err(error) => {
                warn!(
                    event_name = "approval.task.create_failed",
                    correlation_id,
                    approval_request_id = %request.id.0,
                    error = %error,
                    "linked task could not be created"
                );
                return (request, None);
            }
        };

        let mut current = request;
        let mut attempt = 0;
        let failure = loop {
            let mut linked = current.clone();
            linked.task_id = Some(task.id.clone());
            match self.requests.update(linked, current.version).await {
                Ok(saved) => return (saved, Some(task)),
                Err(PortError::VersionConflict { .. })
                    if attempt < self.settings.max_conflict_retries =>
                {
                    attempt += 1;
                    match self.requests.find_by_id(&current.id).await {
                        Ok(Some(fresh)) => current = fresh,
                        Ok(None) => break PortError::Missing(current.id.0.clone()),
                        Err(error) => break error,
                    }
                }
                Err(error) => break error,
            }
        };

        warn!(
            event_name = "approval.task.link_failed",
            correlation_id,
            approval_request_id = %current.id.0,
            orphaned_task_id = %task.id.0,
            error = %failure,
            "task created but could not be linked to the request; task is orphaned"
        );
        (current, Some(task))
    }

    async fn finalize(&self, request: &ApprovalRequest, path: PropagationPath, correlation_id: &str) {
        let report = self.propagation.finalize(request, path).await;
        let outcome = if report.is_complete() { AuditOutcome::Success } else { AuditOutcome::Failed };
        let mut event = AuditEvent::new(
            Some(request.id.clone()),
            Some(request.org_id.clone()),
            correlation_id,
            "approval.propagated",
            AuditCategory::Propagation,
            "propagation-dispatcher",
            outcome,
        )
        .with_metadata("path", path.as_str())
        .with_metadata("applied", report.applied.to_string())
        .with_metadata("planned", report.planned.to_string());
        if let Some(failure) = report.failure {
            event = event.with_metadata("failure", failure);
        }
        self.audit.emit(event);
    }

    fn audit_event(
        &self,
        request: &ApprovalRequest,
        correlation_id: &str,
        event_type: &str,
    ) -> AuditEvent {
        let outcome = match request.status {
            ApprovalStatus::Rejected => AuditOutcome::Rejected,
            _ => AuditOutcome::Success,
        };
        AuditEvent::new(
            Some(request.id.clone()),
            Some(request.org_id.clone()),
            correlation_id,
            event_type,
            AuditCategory::Approval,
            request.resolved_by.clone().unwrap_or_else(|| request.requested_by.clone()),
            outcome,
        )
        .with_metadata("approval_type", request.approval_type.as_str())
    }
}

fn build_request(
    input: NewApprovalRequest,
    policy: &ApprovalPolicy,
    approvers: Vec<String>,
    now: DateTime<Utc>,
) -> ApprovalRequest {
    let mut request = ApprovalRequest {
        id: ApprovalRequestId(format!("APR-{}", Uuid::new_v4())),
        org_id: input.org_id,
        project_id: input.project_id,
        approval_type: input.approval_type,
        policy_id: policy.id.clone(),
        entity_type: input.entity_type,
        entity_id: input.entity_id,
        requested_by: input.requested_by,
        request_data: input.request_data,
        priority: input.priority,
        title: input.title,
        description: input.description,
        status: ApprovalStatus::Pending,
        approver_actions: approvers.into_iter().map(ApproverAction::pending).collect(),
        current_approval_count: 0,
        required_approvals: policy.required_approvals,
        sla_deadline: now + Duration::hours(i64::from(policy.sla_hours)),
        current_escalation_level: 0,
        escalation_history: Vec::new(),
        audit_trail: Vec::new(),
        task_id: None,
        resolved_by: None,
        resolved_at: None,
        resolution_comment: None,
        version: 1,
        created_at: now,
        updated_at: now,
    };
    let requester = request.requested_by.clone();
    let details = format!(
        "{} approver(s), {} approval(s) required",
        request.approver_actions.len(),
        request.required_approvals
    );
    request.push_audit(AuditAction::Created, &requester, now, details);
    request
}
