use std::fs;
use std::path::Path;

use chrono::Utc;
use keystone_core::approvals::{DirectoryUser, PolicyStore};
use keystone_core::config::LoadOptions;
use keystone_core::domain::policy::{
    AmountBracket, ApprovalPolicy, ApprovalType, ApproverRule, DiscountCeiling, EscalationTiming,
    PolicyId,
};
use keystone_db::{SqlDirectory, SqlPolicyStore};
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use crate::commands::{exit, open_pool, prepare, CommandFailure, CommandResult};

/// Policies and org members read from a TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PolicyDocument {
    pub users: Vec<UserEntry>,
    pub policies: Vec<PolicyEntry>,
}

#[derive(Debug, Deserialize)]
pub struct UserEntry {
    pub org_id: String,
    pub user_id: String,
    pub role_slug: String,
    pub role_level: u8,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Deserialize)]
pub struct PolicyEntry {
    pub org_id: String,
    #[serde(default)]
    pub project_id: Option<String>,
    pub approval_type: ApprovalType,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub discount_ceilings: Vec<DiscountCeiling>,
    #[serde(default)]
    pub max_price_deviation_pct: Option<Decimal>,
    #[serde(default)]
    pub amount_brackets: Vec<AmountBracket>,
    #[serde(default)]
    pub always_require: bool,
    #[serde(default)]
    pub approver_rules: Vec<ApproverRule>,
    #[serde(default = "default_required_approvals")]
    pub required_approvals: u32,
    #[serde(default = "default_sla_hours")]
    pub sla_hours: u32,
    #[serde(default)]
    pub escalation: EscalationTiming,
}

fn default_true() -> bool {
    true
}

fn default_required_approvals() -> u32 {
    1
}

fn default_sla_hours() -> u32 {
    24
}

impl PolicyEntry {
    fn into_policy(self) -> ApprovalPolicy {
        let now = Utc::now();
        ApprovalPolicy {
            id: PolicyId(format!("POL-{}", Uuid::new_v4())),
            org_id: self.org_id,
            project_id: self.project_id,
            approval_type: self.approval_type,
            enabled: self.enabled,
            discount_ceilings: self.discount_ceilings,
            max_price_deviation_pct: self.max_price_deviation_pct,
            amount_brackets: self.amount_brackets,
            always_require: self.always_require,
            approver_rules: self.approver_rules,
            required_approvals: self.required_approvals,
            sla_hours: self.sla_hours,
            escalation: self.escalation,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Validates every policy before anything is written; an invalid entry aborts the whole import.
pub fn import(options: &LoadOptions, path: &Path) -> CommandResult {
    let document = match read_document(path) {
        Ok(document) => document,
        Err(message) => {
            return CommandResult::failure("policy.import", "input", message, exit::INPUT)
        }
    };

    let mut policies = Vec::with_capacity(document.policies.len());
    for (index, entry) in document.policies.into_iter().enumerate() {
        let policy = entry.into_policy();
        if let Err(error) = policy.validate() {
            return CommandResult::failure(
                "policy.import",
                "policy_validation",
                format!(
                    "policy #{index} ({} / {}): {error}",
                    policy.org_id, policy.approval_type
                ),
                exit::INPUT,
            );
        }
        policies.push(policy);
    }

    let (config, runtime) = match prepare("policy.import", options) {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };

    let users = document.users;
    let result = runtime.block_on(async {
        let pool = open_pool(&config).await?;
        let directory = SqlDirectory::new(pool.clone());
        for user in &users {
            let member = DirectoryUser {
                user_id: user.user_id.clone(),
                role_slug: user.role_slug.clone(),
                role_level: user.role_level,
            };
            directory
                .upsert_user(&user.org_id, &member, user.active)
                .await
                .map_err(|error| ("persistence", error.to_string(), exit::DATABASE))?;
        }

        let store = SqlPolicyStore::new(pool.clone());
        for policy in &policies {
            store
                .save_policy(policy.clone())
                .await
                .map_err(|error| ("persistence", error.to_string(), exit::DATABASE))?;
        }
        pool.close().await;
        Ok::<(), CommandFailure>(())
    });

    match result {
        Ok(()) => CommandResult::success_with(
            "policy.import",
            format!("imported {} policies and {} users", policies.len(), users.len()),
            Some(serde_json::json!({
                "policies": policies
                    .iter()
                    .map(|policy| {
                        serde_json::json!({
                            "org_id": policy.org_id,
                            "project_id": policy.project_id,
                            "approval_type": policy.approval_type,
                        })
                    })
                    .collect::<Vec<_>>(),
            })),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("policy.import", error_class, message, exit_code)
        }
    }
}

fn read_document(path: &Path) -> Result<PolicyDocument, String> {
    let raw = fs::read_to_string(path)
        .map_err(|error| format!("could not read `{}`: {error}", path.display()))?;
    toml::from_str(&raw).map_err(|error| format!("could not parse `{}`: {error}", path.display()))
}
