//! JSON API over the approval engine.
//!
//! - `POST /approvals/check`: would this change need approval, and from whom
//! - `POST /approvals`: create a request, or auto-approve it
//! - `POST /approvals/{id}/actions`: record an approve or reject vote
//! - `POST /approvals/{id}/cancel`: requester withdraws a pending request
//! - `GET  /approvals/dashboard?org_id=&user_id=`: per-user dashboard
//! - `POST /approvals/escalations/run`: run one escalation pass now

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use keystone_core::approvals::{
    ApprovalActionInput, ApprovalCheck, ApprovalContext, ApprovalDashboard, ApprovalEngine,
    CreateApprovalOutcome, EscalationStats, NewApprovalRequest,
};
use keystone_core::domain::policy::ApprovalType;
use keystone_core::domain::request::{ApprovalDecision, ApprovalRequest, ApprovalRequestId};
use keystone_core::errors::{ApplicationError, InterfaceError};
use keystone_db::DbPool;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::health;

#[derive(Clone)]
pub struct ApiState {
    engine: Arc<ApprovalEngine>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
    pub correlation_id: String,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    pub org_id: String,
    pub approval_type: ApprovalType,
    #[serde(default)]
    pub project_id: Option<String>,
    pub context: ApprovalContext,
}

#[derive(Debug, Deserialize)]
pub struct ActionRequest {
    pub user_id: String,
    pub action: ApprovalDecision,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub user_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DashboardQuery {
    pub org_id: String,
    pub user_id: String,
}

pub fn router(engine: Arc<ApprovalEngine>, db_pool: DbPool) -> Router {
    Router::new()
        .route("/approvals", post(create_request))
        .route("/approvals/check", post(check_required))
        .route("/approvals/dashboard", get(dashboard))
        .route("/approvals/escalations/run", post(run_escalations))
        .route("/approvals/{id}/actions", post(record_action))
        .route("/approvals/{id}/cancel", post(cancel_request))
        .with_state(ApiState { engine })
        .merge(health::router(db_pool))
}

async fn check_required(
    State(state): State<ApiState>,
    Json(body): Json<CheckRequest>,
) -> ApiResult<ApprovalCheck> {
    let correlation_id = Uuid::new_v4().to_string();
    state
        .engine
        .check_approval_required(
            &body.org_id,
            body.approval_type,
            &body.context,
            body.project_id.as_deref(),
        )
        .await
        .map(Json)
        .map_err(|error| reject(error, correlation_id, "check"))
}

async fn create_request(
    State(state): State<ApiState>,
    Json(body): Json<NewApprovalRequest>,
) -> Result<(StatusCode, Json<CreateApprovalOutcome>), (StatusCode, Json<ApiError>)> {
    let correlation_id = Uuid::new_v4().to_string();
    let outcome = state
        .engine
        .create_approval_request(body)
        .await
        .map_err(|error| reject(error, correlation_id.clone(), "create"))?;

    info!(
        event_name = "approval.api.created",
        correlation_id = %correlation_id,
        auto_approved = outcome.auto_approved,
        approval_request_id =
            ?outcome.approval_request.as_ref().map(|request| request.id.0.as_str()),
        "create request handled"
    );
    let status =
        if outcome.approval_request.is_some() { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(outcome)))
}

async fn record_action(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<ActionRequest>,
) -> ApiResult<ApprovalRequest> {
    let correlation_id = Uuid::new_v4().to_string();
    state
        .engine
        .process_approval_action(ApprovalActionInput {
            request_id: ApprovalRequestId(id),
            user_id: body.user_id,
            action: body.action,
            comment: body.comment,
        })
        .await
        .map(Json)
        .map_err(|error| reject(error, correlation_id, "action"))
}

async fn cancel_request(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<CancelRequest>,
) -> ApiResult<ApprovalRequest> {
    let correlation_id = Uuid::new_v4().to_string();
    state
        .engine
        .cancel_approval_request(&ApprovalRequestId(id), &body.user_id, body.reason)
        .await
        .map(Json)
        .map_err(|error| reject(error, correlation_id, "cancel"))
}

async fn dashboard(
    State(state): State<ApiState>,
    Query(query): Query<DashboardQuery>,
) -> ApiResult<ApprovalDashboard> {
    let correlation_id = Uuid::new_v4().to_string();
    state
        .engine
        .get_approval_dashboard(&query.user_id, &query.org_id)
        .await
        .map(Json)
        .map_err(|error| reject(error, correlation_id, "dashboard"))
}

async fn run_escalations(State(state): State<ApiState>) -> ApiResult<EscalationStats> {
    let correlation_id = Uuid::new_v4().to_string();
    state
        .engine
        .check_approval_escalations()
        .await
        .map(Json)
        .map_err(|error| reject(error, correlation_id, "escalations"))
}

fn reject(
    error: ApplicationError,
    correlation_id: String,
    operation: &'static str,
) -> (StatusCode, Json<ApiError>) {
    let mapped = error.into_interface(correlation_id);
    let (status, code) = match &mapped {
        InterfaceError::BadRequest { .. } => (StatusCode::BAD_REQUEST, "bad_request"),
        InterfaceError::Forbidden { .. } => (StatusCode::FORBIDDEN, "forbidden"),
        InterfaceError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
        InterfaceError::Conflict { .. } => (StatusCode::CONFLICT, "conflict"),
        InterfaceError::ServiceUnavailable { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
        }
        InterfaceError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };

    warn!(
        event_name = "approval.api.rejected",
        correlation_id = %mapped.correlation_id(),
        operation,
        status = status.as_u16(),
        error = %mapped,
        "approval api call failed"
    );

    (
        status,
        Json(ApiError {
            error: code.to_string(),
            message: mapped.user_message().to_string(),
            correlation_id: mapped.correlation_id().to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request, StatusCode},
        Router,
    };
    use chrono::Utc;
    use keystone_core::approvals::{ApprovalEngine, DirectoryUser, NotificationOutbox, PolicyStore};
    use keystone_core::audit::InMemoryAuditSink;
    use keystone_core::config::ApprovalsConfig;
    use keystone_core::domain::policy::{
        ApprovalPolicy, ApprovalType, ApproverRule, DiscountCeiling, EscalationTiming, PolicyId,
    };
    use keystone_db::{
        approval_ports, connect_with_settings, migrations, SqlDirectory, SqlPolicyStore,
    };
    use rust_decimal::Decimal;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::router;

    async fn app() -> Router {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool");
        migrations::run_pending(&pool).await.expect("migrate");

        let directory = SqlDirectory::new(pool.clone());
        for (user_id, role_slug, role_level) in [
            ("u-md", "managing-director", 1),
            ("u-sm", "sales-manager", 4),
            ("u-agent", "sales-agent", 5),
        ] {
            let user = DirectoryUser {
                user_id: user_id.to_string(),
                role_slug: role_slug.to_string(),
                role_level,
            };
            directory.upsert_user("org-1", &user, true).await.expect("seed user");
        }

        let now = Utc::now();
        SqlPolicyStore::new(pool.clone())
            .save_policy(ApprovalPolicy {
                id: PolicyId("POL-DISCOUNT".to_string()),
                org_id: "org-1".to_string(),
                project_id: None,
                approval_type: ApprovalType::Discount,
                enabled: true,
                discount_ceilings: vec![
                    DiscountCeiling { role_level: 5, max_discount_pct: Decimal::new(2, 0) },
                    DiscountCeiling { role_level: 4, max_discount_pct: Decimal::new(5, 0) },
                ],
                max_price_deviation_pct: None,
                amount_brackets: Vec::new(),
                always_require: false,
                approver_rules: vec![ApproverRule::Role {
                    role_slug: "sales-manager".to_string(),
                }],
                required_approvals: 1,
                sla_hours: 24,
                escalation: EscalationTiming::default(),
                created_at: now,
                updated_at: now,
            })
            .await
            .expect("seed policy");

        let (outbox, _receiver) = NotificationOutbox::channel();
        let engine = ApprovalEngine::new(
            approval_ports(&pool),
            outbox,
            Arc::new(InMemoryAuditSink::default()),
            ApprovalsConfig::default(),
        );
        router(Arc::new(engine), pool)
    }

    async fn call(
        app: &Router,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(value) => Body::from(value.to_string()),
                None => Body::empty(),
            })
            .expect("request");

        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, value)
    }

    fn discount_request(percentage: &str) -> Value {
        json!({
            "org_id": "org-1",
            "approval_type": "discount",
            "entity_type": "sale",
            "entity_id": "sale-12",
            "requested_by": "u-agent",
            "request_data": { "discount_percentage": percentage, "unit_id": "unit-12" },
            "title": "Discount on sale 12"
        })
    }

    #[tokio::test]
    async fn check_reports_required_and_approvers() {
        let app = app().await;
        let (status, body) = call(
            &app,
            Method::POST,
            "/approvals/check",
            Some(json!({
                "org_id": "org-1",
                "approval_type": "discount",
                "context": { "requester_id": "u-agent", "discount_percentage": "3" }
            })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["required"], json!(true));
        assert_eq!(body["approvers"], json!(["u-md", "u-sm"]));
    }

    #[tokio::test]
    async fn create_then_approve_through_the_api() {
        let app = app().await;
        let (status, created) =
            call(&app, Method::POST, "/approvals", Some(discount_request("4"))).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = created["approval_request"]["id"].as_str().expect("request id").to_string();

        let (status, approved) = call(
            &app,
            Method::POST,
            &format!("/approvals/{id}/actions"),
            Some(json!({ "user_id": "u-sm", "action": "approved" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(approved["status"], json!("approved"));

        let (status, error) = call(
            &app,
            Method::POST,
            &format!("/approvals/{id}/actions"),
            Some(json!({ "user_id": "u-sm", "action": "rejected" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(error["error"], json!("conflict"));
    }

    #[tokio::test]
    async fn under_ceiling_discount_is_auto_approved() {
        let app = app().await;
        let (status, body) =
            call(&app, Method::POST, "/approvals", Some(discount_request("1.5"))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["auto_approved"], json!(true));
        assert_eq!(body["approval_request"], Value::Null);
    }

    #[tokio::test]
    async fn errors_map_to_http_statuses() {
        let app = app().await;
        let (status, _) = call(
            &app,
            Method::POST,
            "/approvals/APR-missing/actions",
            Some(json!({ "user_id": "u-sm", "action": "approved" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, created) =
            call(&app, Method::POST, "/approvals", Some(discount_request("4"))).await;
        let id = created["approval_request"]["id"].as_str().expect("request id").to_string();

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/approvals/{id}/cancel"),
            Some(json!({ "user_id": "u-sm" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body["correlation_id"].as_str().is_some_and(|value| !value.is_empty()));
    }

    #[tokio::test]
    async fn dashboard_and_escalation_pass_are_served() {
        let app = app().await;
        call(&app, Method::POST, "/approvals", Some(discount_request("4"))).await;

        let (status, dashboard) =
            call(&app, Method::GET, "/approvals/dashboard?org_id=org-1&user_id=u-sm", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(dashboard["pending_for_me"].as_array().map(Vec::len), Some(1));

        let (status, stats) = call(&app, Method::POST, "/approvals/escalations/run", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["escalated"], json!(0));

        let (status, health) = call(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["status"], json!("ready"));
    }
}
