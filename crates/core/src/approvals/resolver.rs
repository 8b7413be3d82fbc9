use std::collections::HashSet;
use std::sync::Arc;

use crate::approvals::ports::{Directory, PortError};
use crate::domain::policy::{ApprovalPolicy, ApproverRule};
use crate::errors::ApplicationError;

/// Turns approver rules, or a threshold override level, into concrete user ids.
#[derive(Clone)]
pub struct ApproverResolver {
    directory: Arc<dyn Directory>,
}

impl ApproverResolver {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }

    /// Distinct approvers in first-seen order. The requester is never included, even when they
    /// qualify. An empty result means nobody can approve.
    pub async fn resolve_approvers(
        &self,
        policy: &ApprovalPolicy,
        org_id: &str,
        requester_id: &str,
        override_level: Option<u8>,
    ) -> Result<Vec<String>, ApplicationError> {
        let mut candidates = Vec::new();

        if let Some(level) = override_level {
            let users = self.directory.users_by_level(org_id, level).await.map_err(directory_error)?;
            candidates.extend(users.into_iter().map(|user| user.user_id));
        } else {
            for rule in &policy.approver_rules {
                match rule {
                    ApproverRule::Specific { user_ids } => candidates.extend(user_ids.iter().cloned()),
                    ApproverRule::Role { role_slug } => {
                        let users = self
                            .directory
                            .users_by_role_slug(org_id, role_slug)
                            .await
                            .map_err(directory_error)?;
                        candidates.extend(users.into_iter().map(|user| user.user_id));
                    }
                    ApproverRule::Hierarchy { max_level } => {
                        let users = self
                            .directory
                            .users_by_level(org_id, *max_level)
                            .await
                            .map_err(directory_error)?;
                        candidates.extend(users.into_iter().map(|user| user.user_id));
                    }
                }
            }
        }

        let mut seen = HashSet::new();
        Ok(candidates
            .into_iter()
            .filter(|user_id| user_id != requester_id && !user_id.trim().is_empty())
            .filter(|user_id| seen.insert(user_id.clone()))
            .collect())
    }
}

fn directory_error(error: PortError) -> ApplicationError {
    ApplicationError::Dependency(format!("directory query failed: {error}"))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::ApproverResolver;
    use crate::approvals::memory::InMemoryDirectory;
    use crate::domain::policy::{ApprovalPolicy, ApprovalType, ApproverRule, EscalationTiming, PolicyId};

    fn policy(rules: Vec<ApproverRule>) -> ApprovalPolicy {
        let now = Utc::now();
        ApprovalPolicy {
            id: PolicyId("POL-1".to_string()),
            org_id: "org-1".to_string(),
            project_id: None,
            approval_type: ApprovalType::SaleCancellation,
            enabled: true,
            discount_ceilings: Vec::new(),
            max_price_deviation_pct: None,
            amount_brackets: Vec::new(),
            always_require: true,
            approver_rules: rules,
            required_approvals: 1,
            sla_hours: 48,
            escalation: EscalationTiming::default(),
            created_at: now,
            updated_at: now,
        }
    }

    async fn resolver() -> ApproverResolver {
        let directory = Arc::new(InMemoryDirectory::default());
        directory.add_user("org-1", "u-md", "managing-director", 1).await;
        directory.add_user("org-1", "u-gm", "general-manager", 2).await;
        directory.add_user("org-1", "u-sm", "sales-manager", 4).await;
        directory.add_user("org-1", "u-sm2", "sales-manager", 4).await;
        directory.add_user("org-1", "u-agent", "sales-agent", 5).await;
        ApproverResolver::new(directory)
    }

    #[tokio::test]
    async fn override_level_selects_that_authority_and_above() {
        let resolver = resolver().await;
        let approvers = resolver
            .resolve_approvers(&policy(Vec::new()), "org-1", "u-agent", Some(4))
            .await
            .expect("resolve");

        assert_eq!(approvers, vec!["u-md", "u-gm", "u-sm", "u-sm2"]);
    }

    #[tokio::test]
    async fn rules_union_without_duplicates_or_requester() {
        let resolver = resolver().await;
        let rules = vec![
            ApproverRule::Specific { user_ids: vec!["u-gm".to_string(), "u-sm".to_string()] },
            ApproverRule::Role { role_slug: "sales-manager".to_string() },
            ApproverRule::Hierarchy { max_level: 2 },
        ];

        let approvers = resolver
            .resolve_approvers(&policy(rules), "org-1", "u-sm", None)
            .await
            .expect("resolve");

        assert_eq!(approvers, vec!["u-gm", "u-sm2", "u-md"]);
    }

    #[tokio::test]
    async fn requester_who_is_the_only_candidate_leaves_nobody() {
        let resolver = resolver().await;
        let rules = vec![ApproverRule::Specific { user_ids: vec!["u-agent".to_string()] }];

        let approvers = resolver
            .resolve_approvers(&policy(rules), "org-1", "u-agent", None)
            .await
            .expect("resolve");

        assert!(approvers.is_empty());
    }
}
