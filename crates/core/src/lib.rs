pub mod approvals;
pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;

pub use approvals::{
    ApprovalActionInput, ApprovalCheck, ApprovalContext, ApprovalDashboard, ApprovalEngine,
    ApprovalPorts, CreateApprovalOutcome, EscalationStats, NewApprovalRequest,
};
pub use domain::policy::{ApprovalPolicy, ApprovalType, ApproverRule, PolicyId};
pub use domain::request::{
    ApprovalDecision, ApprovalRequest, ApprovalRequestId, ApprovalStatus, Priority,
};
pub use errors::{ApplicationError, DomainError, InterfaceError};
