use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::approvals::context::ApprovalContext;
use crate::approvals::ports::{Directory, PolicyStore};
use crate::approvals::strategy::strategy_for;
use crate::domain::policy::{ApprovalPolicy, ApprovalType};
use crate::errors::ApplicationError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdOutcome {
    pub required: bool,
    pub policy: Option<ApprovalPolicy>,
    pub override_approver_level: Option<u8>,
}

impl ThresholdOutcome {
    fn not_required(policy: Option<ApprovalPolicy>) -> Self {
        Self { required: false, policy, override_approver_level: None }
    }
}

/// Decides whether an action needs sign-off and, for numeric types, whose.
#[derive(Clone)]
pub struct ThresholdEvaluator {
    policies: Arc<dyn PolicyStore>,
    directory: Arc<dyn Directory>,
}

impl ThresholdEvaluator {
    pub fn new(policies: Arc<dyn PolicyStore>, directory: Arc<dyn Directory>) -> Self {
        Self { policies, directory }
    }

    /// Project policy first, org-wide policy as the fallback.
    pub async fn load_policy(
        &self,
        org_id: &str,
        approval_type: ApprovalType,
        project_id: Option<&str>,
    ) -> Result<Option<ApprovalPolicy>, ApplicationError> {
        if let Some(project_id) = project_id {
            let scoped = self.policies.get_policy(org_id, approval_type, Some(project_id)).await?;
            if scoped.is_some() {
                return Ok(scoped);
            }
        }
        Ok(self.policies.get_policy(org_id, approval_type, None).await?)
    }

    pub async fn is_approval_required(
        &self,
        org_id: &str,
        approval_type: ApprovalType,
        context: &ApprovalContext,
        project_id: Option<&str>,
    ) -> Result<ThresholdOutcome, ApplicationError> {
        let Some(policy) = self.load_policy(org_id, approval_type, project_id).await? else {
            debug!(
                event_name = "approval.threshold.no_policy",
                org_id,
                approval_type = approval_type.as_str(),
                "no policy configured; approval not required"
            );
            return Ok(ThresholdOutcome::not_required(None));
        };
        if !policy.enabled {
            return Ok(ThresholdOutcome::not_required(Some(policy)));
        }

        let strategy = strategy_for(approval_type);
        let mut context = context.clone();
        if strategy.needs_requester_level() {
            context.requester_role_level = self.requester_level(org_id, &context).await?;
        }

        if !strategy.evaluate(&policy, &context)? {
            return Ok(ThresholdOutcome::not_required(Some(policy)));
        }

        let override_approver_level = strategy.resolve_override(&policy, &context)?;
        debug!(
            event_name = "approval.threshold.required",
            org_id,
            approval_type = approval_type.as_str(),
            override_approver_level = ?override_approver_level,
            "approval required"
        );
        Ok(ThresholdOutcome { required: true, policy: Some(policy), override_approver_level })
    }

    async fn requester_level(
        &self,
        org_id: &str,
        context: &ApprovalContext,
    ) -> Result<Option<u8>, ApplicationError> {
        let user = self
            .directory
            .find_user(org_id, &context.requester_id)
            .await
            .map_err(|error| ApplicationError::Dependency(format!("directory lookup: {error}")))?;
        Ok(user.map(|user| user.role_level))
    }
}
