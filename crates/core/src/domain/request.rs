use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::policy::{ApprovalType, PolicyId};
use crate::domain::task::TaskId;
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApprovalRequestId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApproverActionState {
    Pending,
    Approved,
    Rejected,
}

/// What an approver decides when acting on a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "urgent" => Some(Self::Urgent),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproverAction {
    pub user_id: String,
    pub action: ApproverActionState,
    pub comment: Option<String>,
    pub acted_at: Option<DateTime<Utc>>,
}

impl ApproverAction {
    pub fn pending(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            action: ApproverActionState::Pending,
            comment: None,
            acted_at: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub level: u8,
    pub escalated_to: String,
    pub reason: String,
    pub escalated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Created,
    Approved,
    Rejected,
    Escalated,
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditTrailEntry {
    pub action: AuditAction,
    pub actor: String,
    pub at: DateTime<Utc>,
    pub details: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: ApprovalRequestId,
    pub org_id: String,
    pub project_id: Option<String>,
    pub approval_type: ApprovalType,
    pub policy_id: PolicyId,
    pub entity_type: String,
    pub entity_id: String,
    pub requested_by: String,
    pub request_data: serde_json::Value,
    pub priority: Priority,
    pub title: String,
    pub description: Option<String>,
    pub status: ApprovalStatus,
    pub approver_actions: Vec<ApproverAction>,
    pub current_approval_count: u32,
    pub required_approvals: u32,
    pub sla_deadline: DateTime<Utc>,
    pub current_escalation_level: u8,
    pub escalation_history: Vec<EscalationRecord>,
    pub audit_trail: Vec<AuditTrailEntry>,
    pub task_id: Option<TaskId>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_comment: Option<String>,
    /// Optimistic concurrency token, bumped by the store on every successful update.
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of recording one approver's decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionOutcome {
    PartiallyApproved { approvals: u32, required: u32 },
    Approved,
    Rejected,
}

impl ActionOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::PartiallyApproved { .. })
    }
}

impl ApprovalRequest {
    pub fn can_transition_to(&self, next: ApprovalStatus) -> bool {
        matches!(
            (self.status, next),
            (ApprovalStatus::Pending, ApprovalStatus::Approved)
                | (ApprovalStatus::Pending, ApprovalStatus::Rejected)
                | (ApprovalStatus::Pending, ApprovalStatus::Cancelled)
        )
    }

    pub fn is_approver(&self, user_id: &str) -> bool {
        self.approver_actions.iter().any(|entry| entry.user_id == user_id)
    }

    pub fn has_pending_action_for(&self, user_id: &str) -> bool {
        self.approver_actions
            .iter()
            .any(|entry| entry.user_id == user_id && entry.action == ApproverActionState::Pending)
    }

    pub fn approver_ids(&self) -> Vec<String> {
        self.approver_actions.iter().map(|entry| entry.user_id.clone()).collect()
    }

    /// Records `user_id`'s decision. A single rejection vetoes the request no matter how many
    /// approvals were already collected.
    pub fn record_action(
        &mut self,
        user_id: &str,
        decision: ApprovalDecision,
        comment: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ActionOutcome, DomainError> {
        let target = match decision {
            ApprovalDecision::Approved => ApprovalStatus::Approved,
            ApprovalDecision::Rejected => ApprovalStatus::Rejected,
        };
        if self.status != ApprovalStatus::Pending {
            return Err(DomainError::InvalidApprovalTransition { from: self.status, to: target });
        }

        let Some(entry) = self.approver_actions.iter_mut().find(|entry| entry.user_id == user_id)
        else {
            return Err(DomainError::NotAnApprover { user_id: user_id.to_string() });
        };
        if entry.action != ApproverActionState::Pending {
            return Err(DomainError::AlreadyActed { user_id: user_id.to_string() });
        }

        entry.action = match decision {
            ApprovalDecision::Approved => ApproverActionState::Approved,
            ApprovalDecision::Rejected => ApproverActionState::Rejected,
        };
        entry.comment = comment.clone();
        entry.acted_at = Some(now);
        self.updated_at = now;

        match decision {
            ApprovalDecision::Approved => {
                self.current_approval_count += 1;
                let details = format!(
                    "approval {} of {} required",
                    self.current_approval_count, self.required_approvals
                );
                self.push_audit(AuditAction::Approved, user_id, now, details);

                if self.current_approval_count >= self.required_approvals {
                    self.resolve(ApprovalStatus::Approved, user_id, comment, now);
                    Ok(ActionOutcome::Approved)
                } else {
                    Ok(ActionOutcome::PartiallyApproved {
                        approvals: self.current_approval_count,
                        required: self.required_approvals,
                    })
                }
            }
            ApprovalDecision::Rejected => {
                let details = comment.clone().unwrap_or_else(|| "rejected".to_string());
                self.push_audit(AuditAction::Rejected, user_id, now, details);
                self.resolve(ApprovalStatus::Rejected, user_id, comment, now);
                Ok(ActionOutcome::Rejected)
            }
        }
    }

    pub fn cancel(
        &mut self,
        user_id: &str,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        if !self.can_transition_to(ApprovalStatus::Cancelled) {
            return Err(DomainError::InvalidApprovalTransition {
                from: self.status,
                to: ApprovalStatus::Cancelled,
            });
        }
        if self.requested_by != user_id {
            return Err(DomainError::NotRequester { user_id: user_id.to_string() });
        }

        let details = reason.clone().unwrap_or_else(|| "cancelled by requester".to_string());
        self.push_audit(AuditAction::Cancelled, user_id, now, details);
        self.resolve(ApprovalStatus::Cancelled, user_id, reason, now);
        Ok(())
    }

    /// Widens the approver pool. Never touches `status`.
    pub fn escalate(
        &mut self,
        new_approver: &str,
        level: u8,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        if self.status != ApprovalStatus::Pending {
            return Err(DomainError::InvariantViolation(format!(
                "cannot escalate a {} request",
                self.status.as_str()
            )));
        }
        if level <= self.current_escalation_level {
            return Err(DomainError::EscalationRegression {
                current: self.current_escalation_level,
                target: level,
            });
        }
        if new_approver == self.requested_by || self.is_approver(new_approver) {
            return Err(DomainError::InvariantViolation(format!(
                "`{new_approver}` cannot be added as an escalation approver"
            )));
        }

        let reason = reason.into();
        self.approver_actions.push(ApproverAction::pending(new_approver));
        self.current_escalation_level = level;
        self.escalation_history.push(EscalationRecord {
            level,
            escalated_to: new_approver.to_string(),
            reason: reason.clone(),
            escalated_at: now,
        });
        self.push_audit(
            AuditAction::Escalated,
            "system",
            now,
            format!("level {level} -> {new_approver}: {reason}"),
        );
        self.updated_at = now;
        Ok(())
    }

    fn resolve(
        &mut self,
        status: ApprovalStatus,
        resolved_by: &str,
        comment: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.status = status;
        self.resolved_by = Some(resolved_by.to_string());
        self.resolved_at = Some(now);
        self.resolution_comment = comment;
        self.updated_at = now;
    }

    pub(crate) fn push_audit(
        &mut self,
        action: AuditAction,
        actor: &str,
        at: DateTime<Utc>,
        details: impl Into<String>,
    ) {
        self.audit_trail.push(AuditTrailEntry {
            action,
            actor: actor.to_string(),
            at,
            details: details.into(),
        });
    }
}
