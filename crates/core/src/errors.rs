use thiserror::Error;

use crate::domain::request::ApprovalStatus;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid approval transition from {from:?} to {to:?}")]
    InvalidApprovalTransition { from: ApprovalStatus, to: ApprovalStatus },
    #[error("user `{user_id}` is not an approver on this request")]
    NotAnApprover { user_id: String },
    #[error("approver `{user_id}` has already acted on this request")]
    AlreadyActed { user_id: String },
    #[error("only the original requester may cancel; `{user_id}` is not the requester")]
    NotRequester { user_id: String },
    #[error("escalation level must increase (current {current}, target {target})")]
    EscalationRegression { current: u8, target: u8 },
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("not authorized: {0}")]
    Authorization(String),
    #[error("state conflict: {0}")]
    StateConflict(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("concurrent modification of approval request `{request_id}`")]
    ConcurrentModification { request_id: String },
    #[error("dependency failure: {0}")]
    Dependency(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl From<DomainError> for ApplicationError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::NotAnApprover { .. } | DomainError::NotRequester { .. } => {
                Self::Authorization(value.to_string())
            }
            DomainError::InvalidApprovalTransition { .. }
            | DomainError::AlreadyActed { .. }
            | DomainError::EscalationRegression { .. } => Self::StateConflict(value.to_string()),
            DomainError::InvariantViolation(message) => Self::Validation(message),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("forbidden: {message}")]
    Forbidden { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::Forbidden { .. } => "You are not allowed to perform this approval action.",
            Self::NotFound { .. } => "The requested approval record does not exist.",
            Self::Conflict { .. } => {
                "The approval request changed state. Refresh and review it before retrying."
            }
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::Forbidden { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::Conflict { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::Forbidden { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::Conflict { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let correlation_id = "unassigned".to_owned();
        match value {
            ApplicationError::Validation(message) => Self::BadRequest { message, correlation_id },
            ApplicationError::Authorization(message) => Self::Forbidden { message, correlation_id },
            ApplicationError::NotFound(message) => Self::NotFound { message, correlation_id },
            ApplicationError::StateConflict(message) => Self::Conflict { message, correlation_id },
            error @ ApplicationError::ConcurrentModification { .. } => {
                Self::Conflict { message: error.to_string(), correlation_id }
            }
            ApplicationError::Persistence(message) | ApplicationError::Dependency(message) => {
                Self::ServiceUnavailable { message, correlation_id }
            }
            ApplicationError::Configuration(message) => Self::Internal { message, correlation_id },
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::request::ApprovalStatus;
    use crate::errors::{ApplicationError, DomainError, InterfaceError};

    #[test]
    fn domain_errors_map_onto_the_approval_taxonomy() {
        let authorization =
            ApplicationError::from(DomainError::NotAnApprover { user_id: "u-1".to_owned() });
        assert!(matches!(authorization, ApplicationError::Authorization(_)));

        let conflict = ApplicationError::from(DomainError::InvalidApprovalTransition {
            from: ApprovalStatus::Approved,
            to: ApprovalStatus::Rejected,
        });
        assert!(matches!(conflict, ApplicationError::StateConflict(_)));

        let revote = ApplicationError::from(DomainError::AlreadyActed { user_id: "u-1".into() });
        assert!(matches!(revote, ApplicationError::StateConflict(_)));
    }

    #[test]
    fn validation_error_maps_to_bad_request_with_correlation_id() {
        let interface =
            ApplicationError::Validation("refund amount is required".to_owned()).into_interface("req-1");

        assert!(matches!(
            interface,
            InterfaceError::BadRequest {
                ref correlation_id,
                ..
            } if correlation_id == "req-1"
        ));
        assert_eq!(
            interface.user_message(),
            "The request could not be processed. Check inputs and try again."
        );
    }

    #[test]
    fn concurrent_modification_maps_to_conflict() {
        let interface = ApplicationError::ConcurrentModification { request_id: "APR-1".into() }
            .into_interface("req-2");
        assert!(matches!(interface, InterfaceError::Conflict { .. }));
        assert_eq!(interface.correlation_id(), "req-2");
    }

    #[test]
    fn dependency_error_maps_to_service_unavailable() {
        let interface =
            ApplicationError::Dependency("directory timeout".to_owned()).into_interface("req-3");

        assert!(matches!(interface, InterfaceError::ServiceUnavailable { .. }));
        assert_eq!(
            interface.user_message(),
            "The service is temporarily unavailable. Please retry shortly."
        );
    }
}
