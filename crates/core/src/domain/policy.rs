use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

/// Most senior role level. Lower numbers carry more authority.
pub const TOP_AUTHORITY_LEVEL: u8 = 0;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolicyId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalType {
    Discount,
    SaleCancellation,
    PriceOverride,
    Refund,
    InstallmentModification,
    CommissionPayout,
    InvoiceApproval,
}

impl ApprovalType {
    pub const ALL: [ApprovalType; 7] = [
        Self::Discount,
        Self::SaleCancellation,
        Self::PriceOverride,
        Self::Refund,
        Self::InstallmentModification,
        Self::CommissionPayout,
        Self::InvoiceApproval,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discount => "discount",
            Self::SaleCancellation => "sale-cancellation",
            Self::PriceOverride => "price-override",
            Self::Refund => "refund",
            Self::InstallmentModification => "installment-modification",
            Self::CommissionPayout => "commission-payout",
            Self::InvoiceApproval => "invoice-approval",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL.into_iter().find(|candidate| candidate.as_str() == normalized)
    }
}

impl fmt::Display for ApprovalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscountCeiling {
    pub role_level: u8,
    pub max_discount_pct: Decimal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmountBracket {
    pub min_amount: Decimal,
    /// `None` means the bracket is unbounded above.
    pub max_amount: Option<Decimal>,
    pub approver_level: u8,
}

impl AmountBracket {
    pub fn contains(&self, amount: Decimal) -> bool {
        amount >= self.min_amount && self.max_amount.map_or(true, |max| amount <= max)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ApproverRule {
    /// Every active user holding exactly this role.
    Role { role_slug: String },
    /// An explicit list of user ids.
    Specific { user_ids: Vec<String> },
    /// Every active user at `max_level` or more senior.
    Hierarchy { max_level: u8 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationTiming {
    pub level1_hours: u32,
    pub level2_hours: u32,
    pub level3_hours: u32,
}

impl Default for EscalationTiming {
    fn default() -> Self {
        Self { level1_hours: 24, level2_hours: 48, level3_hours: 72 }
    }
}

/// Highest escalation level; a request there has nowhere left to go.
pub const MAX_ESCALATION_LEVEL: u8 = 3;

impl EscalationTiming {
    /// Maps hours elapsed since creation onto escalation level 0..=3.
    pub fn level_for_elapsed(&self, elapsed_hours: i64) -> u8 {
        if elapsed_hours >= i64::from(self.level3_hours) {
            MAX_ESCALATION_LEVEL
        } else if elapsed_hours >= i64::from(self.level2_hours) {
            2
        } else if elapsed_hours >= i64::from(self.level1_hours) {
            1
        } else {
            0
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    pub id: PolicyId,
    pub org_id: String,
    pub project_id: Option<String>,
    pub approval_type: ApprovalType,
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
    pub required_approvals: u32,
    pub sla_hours: u32,
    #[serde(default)]
    pub escalation: EscalationTiming,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalPolicy {
    /// Ceiling for a role level; levels missing from the table may not discount at all.
    pub fn discount_ceiling_for(&self, role_level: u8) -> Decimal {
        self.discount_ceilings
            .iter()
            .find(|ceiling| ceiling.role_level == role_level)
            .map(|ceiling| ceiling.max_discount_pct)
            .unwrap_or(Decimal::ZERO)
    }

    /// Most junior role level whose ceiling still covers `discount_pct`, falling back to the
    /// top of the hierarchy when nobody's ceiling is high enough.
    pub fn covering_discount_level(&self, discount_pct: Decimal) -> u8 {
        self.discount_ceilings
            .iter()
            .filter(|ceiling| ceiling.max_discount_pct >= discount_pct)
            .map(|ceiling| ceiling.role_level)
            .max()
            .unwrap_or(TOP_AUTHORITY_LEVEL)
    }

    pub fn bracket_for(&self, amount: Decimal) -> Option<&AmountBracket> {
        self.amount_brackets.iter().find(|bracket| bracket.contains(amount))
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.required_approvals == 0 {
            return Err(DomainError::InvariantViolation(
                "required_approvals must be at least 1".to_string(),
            ));
        }

        let timing = &self.escalation;
        if timing.level1_hours > timing.level2_hours || timing.level2_hours > timing.level3_hours {
            return Err(DomainError::InvariantViolation(
                "escalation thresholds must be non-decreasing (level1 <= level2 <= level3)"
                    .to_string(),
            ));
        }

        if let Some(bracket) = self
            .amount_brackets
            .iter()
            .find(|bracket| bracket.max_amount.is_some_and(|max| max < bracket.min_amount))
        {
            return Err(DomainError::InvariantViolation(format!(
                "amount bracket starting at {} has max below min",
                bracket.min_amount
            )));
        }

        if self.approval_type == ApprovalType::CommissionPayout && self.enabled {
            return Err(DomainError::InvariantViolation(
                "commission-payout approvals are handled by the commission workflow and cannot be enabled here"
                    .to_string(),
            ));
        }

        Ok(())
    }
}
