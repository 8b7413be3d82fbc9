use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::approvals::ports::{ApprovalRequestStore, TypeStatusCount};
use crate::domain::request::ApprovalRequest;
use crate::errors::ApplicationError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDashboard {
    pub pending_for_me: Vec<ApprovalRequest>,
    pub my_requests: Vec<ApprovalRequest>,
    pub recently_resolved: Vec<ApprovalRequest>,
    pub stats: Vec<TypeStatusCount>,
}

#[derive(Clone)]
pub struct DashboardAggregator {
    requests: Arc<dyn ApprovalRequestStore>,
    limit: u32,
}

impl DashboardAggregator {
    pub fn new(requests: Arc<dyn ApprovalRequestStore>, limit: u32) -> Self {
        Self { requests, limit }
    }

    pub async fn dashboard(
        &self,
        user_id: &str,
        org_id: &str,
    ) -> Result<ApprovalDashboard, ApplicationError> {
        let pending_for_me =
            self.requests.list_pending_for_approver(org_id, user_id, self.limit).await?;
        let my_requests = self.requests.list_by_requester(org_id, user_id, self.limit).await?;
        let recently_resolved = self.requests.list_recently_resolved(org_id, self.limit).await?;
        let stats = self.requests.count_by_type_and_status(org_id).await?;

        Ok(ApprovalDashboard { pending_for_me, my_requests, recently_resolved, stats })
    }
}
