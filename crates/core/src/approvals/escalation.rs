use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::approvals::notify::{ApprovalNotification, NotificationOutbox};
use crate::approvals::ports::{
    ApprovalRequestStore, Directory, OverdueCursor, PolicyStore, PortError, TaskTracker,
};
use crate::domain::request::{ApprovalRequest, Priority};
use crate::domain::task::TaskEscalation;
use crate::errors::ApplicationError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationStats {
    pub processed: u32,
    pub escalated: u32,
    pub skipped: u32,
    pub no_candidate: u32,
    pub conflicts: u32,
    pub failed: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EscalationStep {
    Escalated,
    NotDue,
    NoCandidate,
}

/// Widens the approver pool of requests that blew through their SLA.
///
/// Holds no timer. Something outside calls [`EscalationScheduler::run_at`] periodically.
/// Each pass pages through every overdue request, `batch_size` at a time.
#[derive(Clone)]
pub struct EscalationScheduler {
    requests: Arc<dyn ApprovalRequestStore>,
    policies: Arc<dyn PolicyStore>,
    directory: Arc<dyn Directory>,
    tasks: Arc<dyn TaskTracker>,
    outbox: NotificationOutbox,
    batch_size: u32,
}

impl EscalationScheduler {
    pub fn new(
        requests: Arc<dyn ApprovalRequestStore>,
        policies: Arc<dyn PolicyStore>,
        directory: Arc<dyn Directory>,
        tasks: Arc<dyn TaskTracker>,
        outbox: NotificationOutbox,
        batch_size: u32,
    ) -> Self {
        Self { requests, policies, directory, tasks, outbox, batch_size }
    }

    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<EscalationStats, ApplicationError> {
        let batch_size = self.batch_size.max(1);
        let mut stats = EscalationStats::default();
        let mut cursor: Option<OverdueCursor> = None;

        loop {
            let page = self.requests.list_overdue(now, cursor.as_ref(), batch_size).await?;
            let full_page = page.len() >= batch_size as usize;
            cursor = page.last().map(OverdueCursor::from);

            for request in page {
                stats.processed += 1;
                self.record_step(&mut stats, request, now).await;
            }
            if !full_page {
                break;
            }
        }

        info!(
            event_name = "approval.escalation.pass_completed",
            processed = stats.processed,
            escalated = stats.escalated,
            skipped = stats.skipped,
            no_candidate = stats.no_candidate,
            conflicts = stats.conflicts,
            failed = stats.failed,
            "escalation pass finished"
        );
        Ok(stats)
    }

    async fn record_step(
        &self,
        stats: &mut EscalationStats,
        request: ApprovalRequest,
        now: DateTime<Utc>,
    ) {
        let request_id = request.id.0.clone();
        match self.escalate_one(request, now).await {
            Ok(EscalationStep::Escalated) => stats.escalated += 1,
            Ok(EscalationStep::NotDue) => stats.skipped += 1,
            Ok(EscalationStep::NoCandidate) => stats.no_candidate += 1,
            Err(ApplicationError::ConcurrentModification { .. }) => {
                stats.conflicts += 1;
                info!(
                    event_name = "approval.escalation.conflict",
                    approval_request_id = %request_id,
                    "request changed during escalation; retrying next pass"
                );
            }
            Err(error) => {
                stats.failed += 1;
                warn!(
                    event_name = "approval.escalation.failed",
                    approval_request_id = %request_id,
                    error = %error,
                    "escalation failed for request"
                );
            }
        }
    }

    async fn escalate_one(
        &self,
        mut request: ApprovalRequest,
        now: DateTime<Utc>,
    ) -> Result<EscalationStep, ApplicationError> {
        let policy = self.policies.find_by_id(&request.policy_id).await?.ok_or_else(|| {
            ApplicationError::NotFound(format!(
                "policy `{}` referenced by approval request `{}`",
                request.policy_id.0, request.id.0
            ))
        })?;

        let elapsed_hours = (now - request.created_at).num_hours();
        let target = policy.escalation.level_for_elapsed(elapsed_hours);
        if target <= request.current_escalation_level {
            return Ok(EscalationStep::NotDue);
        }

        let Some(candidate) = self.pick_candidate(&request).await? else {
            warn!(
                event_name = "approval.escalation.no_candidate",
                approval_request_id = %request.id.0,
                org_id = %request.org_id,
                target_level = target,
                "no eligible user left to escalate to"
            );
            return Ok(EscalationStep::NoCandidate);
        };

        let reason = format!(
            "SLA breached: {elapsed_hours}h elapsed since creation, escalated to level {target}"
        );
        let expected_version = request.version;
        request.escalate(&candidate, target, reason.clone(), now)?;
        let saved = self.requests.update(request, expected_version).await?;

        info!(
            event_name = "approval.escalation.escalated",
            approval_request_id = %saved.id.0,
            org_id = %saved.org_id,
            level = target,
            escalated_to = %candidate,
            "approval request escalated"
        );

        if let Some(task_id) = saved.task_id.as_ref() {
            let escalation = TaskEscalation {
                new_assignee: candidate.clone(),
                level: target,
                priority: Priority::Urgent,
                reason: reason.clone(),
            };
            if let Err(error) = self.tasks.escalate_task(task_id, &escalation).await {
                warn!(
                    event_name = "approval.task.escalate_failed",
                    approval_request_id = %saved.id.0,
                    task_id = %task_id.0,
                    error = %error,
                    "linked task could not be escalated"
                );
            }
        }
        self.outbox.publish(ApprovalNotification::escalated(&saved, &candidate, target, &reason));

        Ok(EscalationStep::Escalated)
    }

    /// Most senior active user who is neither an approver already nor the requester.
    async fn pick_candidate(
        &self,
        request: &ApprovalRequest,
    ) -> Result<Option<String>, ApplicationError> {
        let mut users = self
            .directory
            .users_by_level(&request.org_id, u8::MAX)
            .await
            .map_err(|error: PortError| {
                ApplicationError::Dependency(format!("directory query failed: {error}"))
            })?;
        users.sort_by(|left, right| {
            left.role_level.cmp(&right.role_level).then_with(|| left.user_id.cmp(&right.user_id))
        });
        Ok(users
            .into_iter()
            .map(|user| user.user_id)
            .find(|user_id| *user_id != request.requested_by && !request.is_approver(user_id)))
    }
}
