use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::approvals::ports::{Notifier, PortError};
use crate::domain::policy::ApprovalType;
use crate::domain::request::{ApprovalRequest, ApprovalRequestId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ApprovalNotification {
    Requested {
        request_id: ApprovalRequestId,
        org_id: String,
        approval_type: ApprovalType,
        title: String,
        requested_by: String,
        approvers: Vec<String>,
        sla_deadline: DateTime<Utc>,
    },
    Approved {
        request_id: ApprovalRequestId,
        org_id: String,
        approval_type: ApprovalType,
        title: String,
        requester: String,
        resolved_by: String,
        comment: Option<String>,
    },
    Rejected {
        request_id: ApprovalRequestId,
        org_id: String,
        approval_type: ApprovalType,
        title: String,
        requester: String,
        resolved_by: String,
        reason: Option<String>,
    },
    Escalated {
        request_id: ApprovalRequestId,
        org_id: String,
        approval_type: ApprovalType,
        title: String,
        new_approver: String,
        level: u8,
        reason: String,
    },
}

impl ApprovalNotification {
    pub fn requested(request: &ApprovalRequest) -> Self {
        Self::Requested {
            request_id: request.id.clone(),
            org_id: request.org_id.clone(),
            approval_type: request.approval_type,
            title: request.title.clone(),
            requested_by: request.requested_by.clone(),
            approvers: request.approver_ids(),
            sla_deadline: request.sla_deadline,
        }
    }

    pub fn approved(request: &ApprovalRequest) -> Self {
        Self::Approved {
            request_id: request.id.clone(),
            org_id: request.org_id.clone(),
            approval_type: request.approval_type,
            title: request.title.clone(),
            requester: request.requested_by.clone(),
            resolved_by: request.resolved_by.clone().unwrap_or_default(),
            comment: request.resolution_comment.clone(),
        }
    }

    pub fn rejected(request: &ApprovalRequest) -> Self {
        Self::Rejected {
            request_id: request.id.clone(),
            org_id: request.org_id.clone(),
            approval_type: request.approval_type,
            title: request.title.clone(),
            requester: request.requested_by.clone(),
            resolved_by: request.resolved_by.clone().unwrap_or_default(),
            reason: request.resolution_comment.clone(),
        }
    }

    pub fn escalated(
        request: &ApprovalRequest,
        new_approver: &str,
        level: u8,
        reason: &str,
    ) -> Self {
        Self::Escalated {
            request_id: request.id.clone(),
            org_id: request.org_id.clone(),
            approval_type: request.approval_type,
            title: request.title.clone(),
            new_approver: new_approver.to_string(),
            level,
            reason: reason.to_string(),
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Requested { .. } => "approval.requested",
            Self::Approved { .. } => "approval.approved",
            Self::Rejected { .. } => "approval.rejected",
            Self::Escalated { .. } => "approval.escalated",
        }
    }

    pub fn request_id(&self) -> &ApprovalRequestId {
        match self {
            Self::Requested { request_id, .. }
            | Self::Approved { request_id, .. }
            | Self::Rejected { request_id, .. }
            | Self::Escalated { request_id, .. } => request_id,
        }
    }

    /// Users who should receive this notification.
    pub fn recipients(&self) -> Vec<String> {
        match self {
            Self::Requested { approvers, .. } => approvers.clone(),
            Self::Approved { requester, .. } | Self::Rejected { requester, .. } => {
                vec![requester.clone()]
            }
            Self::Escalated { new_approver, .. } => vec![new_approver.clone()],
        }
    }
}

pub type NotificationReceiver = mpsc::UnboundedReceiver<ApprovalNotification>;

/// Fire-and-forget publisher. Publishing never waits on delivery.
#[derive(Clone, Debug)]
pub struct NotificationOutbox {
    sender: mpsc::UnboundedSender<ApprovalNotification>,
}

impl NotificationOutbox {
    pub fn channel() -> (Self, NotificationReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn publish(&self, notification: ApprovalNotification) {
        let event_name = notification.event_name();
        let request_id = notification.request_id().0.clone();
        if self.sender.send(notification).is_err() {
            warn!(
                event_name = "approval.notification.dropped",
                notification = event_name,
                approval_request_id = %request_id,
                "notification worker is not running; notification dropped"
            );
        }
    }
}

/// Drains the outbox until every sender is gone. Returns how many notifications were delivered.
pub async fn run_notification_worker(
    notifier: Arc<dyn Notifier>,
    mut receiver: NotificationReceiver,
) -> usize {
    let mut delivered = 0;
    while let Some(notification) = receiver.recv().await {
        match notifier.deliver(&notification).await {
            Ok(()) => {
                delivered += 1;
                debug!(
                    event_name = "approval.notification.delivered",
                    notification = notification.event_name(),
                    approval_request_id = %notification.request_id().0,
                    "notification delivered"
                );
            }
            Err(error) => warn!(
                event_name = "approval.notification.failed",
                notification = notification.event_name(),
                approval_request_id = %notification.request_id().0,
                error = %error,
                "notification delivery failed"
            ),
        }
    }
    delivered
}

/// Writes notifications to the log instead of delivering them anywhere.
#[derive(Clone, Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn deliver(&self, notification: &ApprovalNotification) -> Result<(), PortError> {
        info!(
            event_name = notification.event_name(),
            approval_request_id = %notification.request_id().0,
            recipients = ?notification.recipients(),
            "approval notification"
        );
        Ok(())
    }
}
