use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::ApplicationError;

/// Numeric facts the threshold rules read, lifted out of a request's `request_data`.
///
/// `requester_role_level` is never read from a payload. The threshold evaluator fills it from
/// the directory.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalContext {
    pub requester_id: String,
    #[serde(skip_deserializing)]
    pub requester_role_level: Option<u8>,
    pub discount_percentage: Option<Decimal>,
    pub price_deviation_percentage: Option<Decimal>,
    pub original_price: Option<Decimal>,
    pub proposed_price: Option<Decimal>,
    pub amount: Option<Decimal>,
}

impl ApprovalContext {
    pub fn for_requester(requester_id: impl Into<String>) -> Self {
        Self { requester_id: requester_id.into(), ..Self::default() }
    }

    /// Reads the context out of an opaque payload. Unknown keys are ignored so callers can keep
    /// propagation data (unit ids, lead ids) in the same object.
    pub fn from_request_data(
        requester_id: &str,
        request_data: &serde_json::Value,
    ) -> Result<Self, ApplicationError> {
        let mut context = if request_data.is_null() {
            Self::default()
        } else {
            serde_json::from_value::<Self>(request_data.clone()).map_err(|error| {
                ApplicationError::Validation(format!("malformed approval context: {error}"))
            })?
        };
        context.requester_id = requester_id.to_string();
        Ok(context)
    }

    pub fn with_requester_level(mut self, level: u8) -> Self {
        self.requester_role_level = Some(level);
        self
    }

    pub fn with_discount(mut self, percentage: Decimal) -> Self {
        self.discount_percentage = Some(percentage);
        self
    }

    pub fn with_amount(mut self, amount: Decimal) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn with_prices(mut self, original: Decimal, proposed: Decimal) -> Self {
        self.original_price = Some(original);
        self.proposed_price = Some(proposed);
        self
    }

    /// Absolute deviation in percent. An explicit percentage wins over the two prices.
    pub fn price_deviation_pct(&self) -> Option<Decimal> {
        if let Some(explicit) = self.price_deviation_percentage {
            return Some(explicit.abs());
        }

        let original = self.original_price?;
        let proposed = self.proposed_price?;
        if original.is_zero() {
            return None;
        }
        Some(((proposed - original).abs() / original.abs()) * Decimal::ONE_HUNDRED)
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use serde_json::json;

    use super::ApprovalContext;
    use crate::errors::ApplicationError;

    #[test]
    fn request_data_keeps_numeric_fields_and_ignores_the_rest() {
        let data = json!({
            "discount_percentage": "5.5",
            "unit_id": "unit-9",
            "amount": 1200,
            "requester_role_level": 1,
        });
        let context = ApprovalContext::from_request_data("u-agent", &data).expect("context");

        assert_eq!(context.requester_id, "u-agent");
        assert_eq!(context.discount_percentage, Some(Decimal::new(55, 1)));
        assert_eq!(context.amount, Some(Decimal::new(1200, 0)));
        assert_eq!(context.requester_role_level, None);
    }

    #[test]
    fn malformed_numbers_are_validation_errors() {
        let data = json!({ "amount": "lots" });
        let error = ApprovalContext::from_request_data("u-agent", &data).expect_err("malformed");
        assert!(matches!(error, ApplicationError::Validation(_)));
    }

    #[test]
    fn deviation_is_derived_from_prices_when_not_given() {
        let context = ApprovalContext::for_requester("u-agent")
            .with_prices(Decimal::new(200_000, 0), Decimal::new(180_000, 0));
        assert_eq!(context.price_deviation_pct(), Some(Decimal::new(10, 0)));

        let zero_base = ApprovalContext::for_requester("u-agent")
            .with_prices(Decimal::ZERO, Decimal::new(10, 0));
        assert_eq!(zero_base.price_deviation_pct(), None);
    }
}
