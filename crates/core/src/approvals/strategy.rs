//! One strategy per approval type.
//!
//! Each strategy owns the threshold rule for its type and the entity mutations that follow an
//! approve or reject decision. [`strategy_for`] matches exhaustively on [`ApprovalType`], so
//! adding a type does not compile until it has a strategy.

use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::approvals::context::ApprovalContext;
use crate::approvals::propagation::{
    EntityMutation, InstallmentModification, InvoiceApprovalStatus,
};
use crate::domain::policy::{ApprovalPolicy, ApprovalType};
use crate::domain::request::{ApprovalRequest, ApprovalStatus};
use crate::errors::ApplicationError;

pub trait ApprovalStrategy: Send + Sync {
    fn approval_type(&self) -> ApprovalType;

    /// Whether `evaluate` needs the requester's role level in the context.
    fn needs_requester_level(&self) -> bool {
        false
    }

    fn evaluate(
        &self,
        policy: &ApprovalPolicy,
        context: &ApprovalContext,
    ) -> Result<bool, ApplicationError>;

    /// Authority level that replaces the policy's approver rules, when the type has one.
    fn resolve_override(
        &self,
        _policy: &ApprovalPolicy,
        _context: &ApprovalContext,
    ) -> Result<Option<u8>, ApplicationError> {
        Ok(None)
    }

    /// Rejects payloads that `on_approve` or `on_reject` could not turn into mutations.
    fn validate_request_data(
        &self,
        _request_data: &serde_json::Value,
    ) -> Result<(), ApplicationError> {
        Ok(())
    }

    fn on_approve(&self, request: &ApprovalRequest) -> Result<Vec<EntityMutation>, ApplicationError>;

    fn on_reject(&self, _request: &ApprovalRequest) -> Result<Vec<EntityMutation>, ApplicationError> {
        Ok(Vec::new())
    }
}

pub fn strategy_for(approval_type: ApprovalType) -> &'static dyn ApprovalStrategy {
    match approval_type {
        ApprovalType::Discount => &DiscountStrategy,
        ApprovalType::SaleCancellation => &SaleCancellationStrategy,
        ApprovalType::PriceOverride => &PriceOverrideStrategy,
        ApprovalType::Refund => &RefundStrategy,
        ApprovalType::InstallmentModification => &InstallmentModificationStrategy,
        ApprovalType::CommissionPayout => &CommissionPayoutStrategy,
        ApprovalType::InvoiceApproval => &InvoiceApprovalStrategy,
    }
}

fn request_data<T: DeserializeOwned>(request: &ApprovalRequest) -> Result<T, ApplicationError> {
    serde_json::from_value(request.request_data.clone()).map_err(|error| {
        ApplicationError::Validation(format!(
            "request data for {} request `{}` is unusable: {error}",
            request.approval_type, request.id.0
        ))
    })
}

fn check_payload<T: DeserializeOwned>(
    approval_type: ApprovalType,
    request_data: &serde_json::Value,
) -> Result<(), ApplicationError> {
    serde_json::from_value::<T>(request_data.clone()).map(|_| ()).map_err(|error| {
        ApplicationError::Validation(format!("{approval_type} request data is incomplete: {error}"))
    })
}

fn required_field<T: Copy>(
    value: Option<T>,
    field: &str,
    approval_type: ApprovalType,
) -> Result<T, ApplicationError> {
    value.ok_or_else(|| {
        ApplicationError::Validation(format!("{approval_type} check requires `{field}`"))
    })
}

#[derive(Debug, Deserialize)]
struct DiscountData {
    unit_id: String,
    #[serde(default)]
    lead_id: Option<String>,
}

pub struct DiscountStrategy;

impl ApprovalStrategy for DiscountStrategy {
    fn approval_type(&self) -> ApprovalType {
        ApprovalType::Discount
    }

    fn needs_requester_level(&self) -> bool {
        true
    }

    fn evaluate(
        &self,
        policy: &ApprovalPolicy,
        context: &ApprovalContext,
    ) -> Result<bool, ApplicationError> {
        let discount =
            required_field(context.discount_percentage, "discount_percentage", self.approval_type())?;
        if discount.is_sign_negative() {
            return Err(ApplicationError::Validation(
                "discount_percentage cannot be negative".to_string(),
            ));
        }
        let level = required_field(
            context.requester_role_level,
            "requester_role_level",
            self.approval_type(),
        )?;
        Ok(discount > policy.discount_ceiling_for(level))
    }

    fn resolve_override(
        &self,
        policy: &ApprovalPolicy,
        context: &ApprovalContext,
    ) -> Result<Option<u8>, ApplicationError> {
        let discount =
            required_field(context.discount_percentage, "discount_percentage", self.approval_type())?;
        Ok(Some(policy.covering_discount_level(discount)))
    }

    fn validate_request_data(
        &self,
        request_data: &serde_json::Value,
    ) -> Result<(), ApplicationError> {
        check_payload::<DiscountData>(self.approval_type(), request_data)
    }

    fn on_approve(&self, request: &ApprovalRequest) -> Result<Vec<EntityMutation>, ApplicationError> {
        let data: DiscountData = request_data(request)?;
        let sale_id = request.entity_id.clone();
        let mut mutations = vec![
            EntityMutation::BookSale { sale_id: sale_id.clone() },
            EntityMutation::MarkUnitSold { unit_id: data.unit_id },
        ];
        if let Some(lead_id) = data.lead_id {
            mutations.push(EntityMutation::MarkLeadBooked { lead_id });
        }
        mutations.push(EntityMutation::GeneratePaymentSchedule { sale_id });
        Ok(mutations)
    }

    fn on_reject(&self, request: &ApprovalRequest) -> Result<Vec<EntityMutation>, ApplicationError> {
        let data: DiscountData = request_data(request)?;
        Ok(vec![
            EntityMutation::DeleteSale { sale_id: request.entity_id.clone() },
            EntityMutation::ReleaseUnit { unit_id: data.unit_id },
        ])
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SaleCancellationData {
    unit_id: Option<String>,
    lead_id: Option<String>,
    reason: Option<String>,
}

pub struct SaleCancellationStrategy;

impl ApprovalStrategy for SaleCancellationStrategy {
    fn approval_type(&self) -> ApprovalType {
        ApprovalType::SaleCancellation
    }

    fn evaluate(&self, _: &ApprovalPolicy, _: &ApprovalContext) -> Result<bool, ApplicationError> {
        Ok(true)
    }

    fn on_approve(&self, request: &ApprovalRequest) -> Result<Vec<EntityMutation>, ApplicationError> {
        let data: SaleCancellationData = request_data(request)?;
        let reason = data
            .reason
            .or_else(|| request.description.clone())
            .unwrap_or_else(|| "cancellation approved".to_string());

        let mut mutations = vec![EntityMutation::CancelSale {
            sale_id: request.entity_id.clone(),
            reason,
            cancelled_by: request.requested_by.clone(),
            cancelled_at: request.resolved_at.unwrap_or(request.updated_at),
        }];
        if let Some(unit_id) = data.unit_id {
            mutations.push(EntityMutation::ReleaseUnit { unit_id });
        }
        if let Some(lead_id) = data.lead_id {
            mutations.push(EntityMutation::ReactivateLead { lead_id });
        }
        Ok(mutations)
    }
}

#[derive(Debug, Deserialize)]
struct PriceOverrideData {
    #[serde(default)]
    unit_id: Option<String>,
    proposed_price: Decimal,
}

pub struct PriceOverrideStrategy;

impl ApprovalStrategy for PriceOverrideStrategy {
    fn approval_type(&self) -> ApprovalType {
        ApprovalType::PriceOverride
    }

    fn evaluate(
        &self,
        policy: &ApprovalPolicy,
        context: &ApprovalContext,
    ) -> Result<bool, ApplicationError> {
        let deviation = required_field(
            context.price_deviation_pct(),
            "price_deviation_percentage",
            self.approval_type(),
        )?;
        Ok(deviation > policy.max_price_deviation_pct.unwrap_or(Decimal::ZERO))
    }

    fn validate_request_data(
        &self,
        request_data: &serde_json::Value,
    ) -> Result<(), ApplicationError> {
        check_payload::<PriceOverrideData>(self.approval_type(), request_data)
    }

    fn on_approve(&self, request: &ApprovalRequest) -> Result<Vec<EntityMutation>, ApplicationError> {
        let data: PriceOverrideData = request_data(request)?;
        Ok(vec![EntityMutation::SetUnitPrice {
            unit_id: data.unit_id.unwrap_or_else(|| request.entity_id.clone()),
            price: data.proposed_price,
        }])
    }
}

pub struct RefundStrategy;

impl ApprovalStrategy for RefundStrategy {
    fn approval_type(&self) -> ApprovalType {
        ApprovalType::Refund
    }

    fn evaluate(
        &self,
        policy: &ApprovalPolicy,
        context: &ApprovalContext,
    ) -> Result<bool, ApplicationError> {
        let amount = required_field(context.amount, "amount", self.approval_type())?;
        Ok(policy.bracket_for(amount).is_some()
            || (policy.always_require && policy.amount_brackets.is_empty()))
    }

    fn resolve_override(
        &self,
        policy: &ApprovalPolicy,
        context: &ApprovalContext,
    ) -> Result<Option<u8>, ApplicationError> {
        let amount = required_field(context.amount, "amount", self.approval_type())?;
        Ok(policy.bracket_for(amount).map(|bracket| bracket.approver_level))
    }

    fn on_approve(&self, request: &ApprovalRequest) -> Result<Vec<EntityMutation>, ApplicationError> {
        Ok(vec![EntityMutation::ClearPendingApproval {
            entity_type: request.entity_type.clone(),
            entity_id: request.entity_id.clone(),
        }])
    }
}

#[derive(Debug, Deserialize)]
struct InstallmentData {
    modification: InstallmentModification,
}

pub struct InstallmentModificationStrategy;

impl ApprovalStrategy for InstallmentModificationStrategy {
    fn approval_type(&self) -> ApprovalType {
        ApprovalType::InstallmentModification
    }

    fn evaluate(&self, _: &ApprovalPolicy, _: &ApprovalContext) -> Result<bool, ApplicationError> {
        Ok(true)
    }

    fn validate_request_data(
        &self,
        request_data: &serde_json::Value,
    ) -> Result<(), ApplicationError> {
        check_payload::<InstallmentData>(self.approval_type(), request_data)
    }

    fn on_approve(&self, request: &ApprovalRequest) -> Result<Vec<EntityMutation>, ApplicationError> {
        let data: InstallmentData = request_data(request)?;
        Ok(vec![EntityMutation::ModifyInstallment {
            installment_id: request.entity_id.clone(),
            modification: data.modification,
        }])
    }
}

/// Payouts go through the commission workflow; this engine never gates them.
pub struct CommissionPayoutStrategy;

impl ApprovalStrategy for CommissionPayoutStrategy {
    fn approval_type(&self) -> ApprovalType {
        ApprovalType::CommissionPayout
    }

    fn evaluate(&self, _: &ApprovalPolicy, _: &ApprovalContext) -> Result<bool, ApplicationError> {
        Ok(false)
    }

    fn on_approve(&self, _: &ApprovalRequest) -> Result<Vec<EntityMutation>, ApplicationError> {
        Ok(Vec::new())
    }
}

pub struct InvoiceApprovalStrategy;

impl InvoiceApprovalStrategy {
    fn mutation(request: &ApprovalRequest, status: InvoiceApprovalStatus) -> EntityMutation {
        let rejection_reason = match status {
            InvoiceApprovalStatus::Rejected => request
                .resolution_comment
                .clone()
                .or_else(|| Some("rejected without comment".to_string())),
            InvoiceApprovalStatus::Approved => None,
        };
        EntityMutation::SetInvoiceApproval {
            invoice_id: request.entity_id.clone(),
            status,
            rejection_reason,
        }
    }
}

impl ApprovalStrategy for InvoiceApprovalStrategy {
    fn approval_type(&self) -> ApprovalType {
        ApprovalType::InvoiceApproval
    }

    fn evaluate(&self, _: &ApprovalPolicy, _: &ApprovalContext) -> Result<bool, ApplicationError> {
        Ok(true)
    }

    fn on_approve(&self, request: &ApprovalRequest) -> Result<Vec<EntityMutation>, ApplicationError> {
        Ok(vec![Self::mutation(request, InvoiceApprovalStatus::Approved)])
    }

    fn on_reject(&self, request: &ApprovalRequest) -> Result<Vec<EntityMutation>, ApplicationError> {
        // A cancelled invoice request never reached a decision; leave the invoice untouched.
        if request.status == ApprovalStatus::Cancelled {
            return Ok(Vec::new());
        }
        Ok(vec![Self::mutation(request, InvoiceApprovalStatus::Rejected)])
    }
}
