use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::approvals::ports::{EntityGateway, TaskTracker};
use crate::approvals::strategy::strategy_for;
use crate::domain::policy::ApprovalType;
use crate::domain::request::{ApprovalRequest, ApprovalRequestId};
use crate::domain::task::TaskResolution;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstallmentModification {
    AmountChange { new_amount: Decimal },
    DueDateChange { new_due_date: NaiveDate },
    Waiver {
        #[serde(default)]
        reason: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceApprovalStatus {
    Approved,
    Rejected,
}

/// A single change to a CRM entity, in application order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityMutation {
    BookSale { sale_id: String },
    MarkUnitSold { unit_id: String },
    MarkLeadBooked { lead_id: String },
    GeneratePaymentSchedule { sale_id: String },
    DeleteSale { sale_id: String },
    ReleaseUnit { unit_id: String },
    CancelSale { sale_id: String, reason: String, cancelled_by: String, cancelled_at: DateTime<Utc> },
    ReactivateLead { lead_id: String },
    SetUnitPrice { unit_id: String, price: Decimal },
    ClearPendingApproval { entity_type: String, entity_id: String },
    ModifyInstallment { installment_id: String, modification: InstallmentModification },
    SetInvoiceApproval {
        invoice_id: String,
        status: InvoiceApprovalStatus,
        rejection_reason: Option<String>,
    },
}

impl EntityMutation {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BookSale { .. } => "book_sale",
            Self::MarkUnitSold { .. } => "mark_unit_sold",
            Self::MarkLeadBooked { .. } => "mark_lead_booked",
            Self::GeneratePaymentSchedule { .. } => "generate_payment_schedule",
            Self::DeleteSale { .. } => "delete_sale",
            Self::ReleaseUnit { .. } => "release_unit",
            Self::CancelSale { .. } => "cancel_sale",
            Self::ReactivateLead { .. } => "reactivate_lead",
            Self::SetUnitPrice { .. } => "set_unit_price",
            Self::ClearPendingApproval { .. } => "clear_pending_approval",
            Self::ModifyInstallment { .. } => "modify_installment",
            Self::SetInvoiceApproval { .. } => "set_invoice_approval",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropagationPath {
    Approve,
    Reject,
}

impl PropagationPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationEnvelope {
    /// `{request_id}:{sequence}`; stable across retries of the same decision.
    pub idempotency_key: String,
    pub approval_request_id: ApprovalRequestId,
    pub org_id: String,
    pub approval_type: ApprovalType,
    pub path: PropagationPath,
    pub sequence: u32,
    pub mutation: EntityMutation,
}

impl MutationEnvelope {
    pub fn new(
        request: &ApprovalRequest,
        path: PropagationPath,
        sequence: u32,
        mutation: EntityMutation,
    ) -> Self {
        Self {
            idempotency_key: format!("{}:{sequence}", request.id.0),
            approval_request_id: request.id.clone(),
            org_id: request.org_id.clone(),
            approval_type: request.approval_type,
            path,
            sequence,
            mutation,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagationReport {
    pub planned: usize,
    pub applied: usize,
    pub failure: Option<String>,
    pub task_closed: bool,
}

impl PropagationReport {
    pub fn is_complete(&self) -> bool {
        self.failure.is_none() && self.applied == self.planned
    }
}

/// Applies a terminal decision to the subject entity and its task-board mirror.
///
/// Nothing here can undo the decision: failures end up in the report and the log.
#[derive(Clone)]
pub struct PropagationDispatcher {
    entities: Arc<dyn EntityGateway>,
    tasks: Arc<dyn TaskTracker>,
}

impl PropagationDispatcher {
    pub fn new(entities: Arc<dyn EntityGateway>, tasks: Arc<dyn TaskTracker>) -> Self {
        Self { entities, tasks }
    }

    pub async fn finalize(
        &self,
        request: &ApprovalRequest,
        path: PropagationPath,
    ) -> PropagationReport {
        let mut report = self.dispatch(request, path).await;
        report.task_closed = self.close_task(request).await;
        report
    }

    pub async fn dispatch(
        &self,
        request: &ApprovalRequest,
        path: PropagationPath,
    ) -> PropagationReport {
        let strategy = strategy_for(request.approval_type);
        let planned = match path {
            PropagationPath::Approve => strategy.on_approve(request),
            PropagationPath::Reject => strategy.on_reject(request),
        };
        let mutations = match planned {
            Ok(mutations) => mutations,
            Err(error) => {
                warn!(
                    event_name = "approval.propagation.plan_failed",
                    approval_request_id = %request.id.0,
                    org_id = %request.org_id,
                    path = path.as_str(),
                    error = %error,
                    "could not derive entity mutations"
                );
                return PropagationReport { failure: Some(error.to_string()), ..Default::default() };
            }
        };

        let mut report = PropagationReport { planned: mutations.len(), ..Default::default() };
        for (sequence, mutation) in mutations.into_iter().enumerate() {
            let kind = mutation.kind();
            let envelope = MutationEnvelope::new(request, path, sequence as u32, mutation);
            if let Err(error) = self.entities.apply(&envelope).await {
                warn!(
                    event_name = "approval.propagation.mutation_failed",
                    approval_request_id = %request.id.0,
                    idempotency_key = %envelope.idempotency_key,
                    mutation = kind,
                    error = %error,
                    "entity mutation failed; remaining mutations skipped"
                );
                report.failure = Some(format!("{kind}: {error}"));
                break;
            }
            report.applied += 1;
        }

        info!(
            event_name = "approval.propagation.completed",
            approval_request_id = %request.id.0,
            approval_type = request.approval_type.as_str(),
            path = path.as_str(),
            planned = report.planned,
            applied = report.applied,
            "propagation finished"
        );
        report
    }

    async fn close_task(&self, request: &ApprovalRequest) -> bool {
        let Some(task_id) = request.task_id.as_ref() else {
            return false;
        };
        let resolution = TaskResolution {
            outcome: request.status,
            resolved_by: request.resolved_by.clone().unwrap_or_else(|| request.requested_by.clone()),
            comment: request.resolution_comment.clone(),
        };

        match self.tasks.complete_task(task_id, &resolution).await {
            Ok(()) => true,
            Err(error) => {
                warn!(
                    event_name = "approval.task.complete_failed",
                    approval_request_id = %request.id.0,
                    task_id = %task_id.0,
                    error = %error,
                    "linked task could not be closed"
                );
                false
            }
        }
    }
}
