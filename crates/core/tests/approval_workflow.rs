use std::sync::Arc;

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use serde_json::json;

use keystone_core::approvals::memory::{
    InMemoryApprovalRequestStore, InMemoryDirectory, InMemoryEntityGateway, InMemoryPolicyStore,
    InMemoryTaskTracker,
};
use keystone_core::approvals::notify::NotificationReceiver;
use keystone_core::approvals::ports::{ApprovalRequestStore, PolicyStore};
use keystone_core::approvals::propagation::{EntityMutation, PropagationPath};
use keystone_core::approvals::{
    ApprovalActionInput, ApprovalContext, ApprovalEngine, ApprovalNotification, ApprovalPorts,
    NewApprovalRequest, NotificationOutbox, ThresholdEvaluator,
};
use keystone_core::audit::{AuditOutcome, InMemoryAuditSink};
use keystone_core::config::ApprovalsConfig;
use keystone_core::domain::policy::{
    AmountBracket, ApprovalPolicy, ApprovalType, ApproverRule, DiscountCeiling, EscalationTiming,
    PolicyId,
};
use keystone_core::domain::request::{
    ApprovalDecision, ApprovalRequest, ApprovalRequestId, ApprovalStatus, Priority,
};
use keystone_core::errors::ApplicationError;

struct Harness {
    engine: ApprovalEngine,
    policies: Arc<InMemoryPolicyStore>,
    requests: Arc<InMemoryApprovalRequestStore>,
    directory: Arc<InMemoryDirectory>,
    entities: Arc<InMemoryEntityGateway>,
    tasks: Arc<InMemoryTaskTracker>,
    audit: InMemoryAuditSink,
    notifications: NotificationReceiver,
}

impl Harness {
    async fn new() -> Self {
        Self::with_settings(ApprovalsConfig::default()).await
    }

    async fn with_settings(settings: ApprovalsConfig) -> Self {
        let policies = Arc::new(InMemoryPolicyStore::default());
        let requests = Arc::new(InMemoryApprovalRequestStore::default());
        let directory = Arc::new(InMemoryDirectory::default());
        let entities = Arc::new(InMemoryEntityGateway::default());
        let tasks = Arc::new(InMemoryTaskTracker::default());
        let audit = InMemoryAuditSink::default();
        let (outbox, notifications) = NotificationOutbox::channel();

        for (user_id, role_slug, level) in [
            ("u-md", "managing-director", 1),
            ("u-gm", "general-manager", 2),
            ("u-pm", "project-manager", 3),
            ("u-sm", "sales-manager", 4),
            ("u-sm2", "sales-manager", 4),
            ("u-agent", "sales-agent", 5),
            ("u-agent2", "sales-agent", 5),
        ] {
            directory.add_user("org-1", user_id, role_slug, level).await;
        }
        directory.add_user("org-2", "u-boss", "sales-manager", 4).await;
        directory.add_user("org-2", "u-rookie", "sales-agent", 5).await;

        let ports = ApprovalPorts {
            policies: policies.clone(),
            requests: requests.clone(),
            directory: directory.clone(),
            entities: entities.clone(),
            tasks: tasks.clone(),
        };
        let engine = ApprovalEngine::new(ports, outbox, Arc::new(audit.clone()), settings);

        let harness =
            Self { engine, policies, requests, directory, entities, tasks, audit, notifications };
        harness.seed_policies().await;
        harness
    }

    async fn seed_policies(&self) {
        for org_id in ["org-1", "org-2"] {
            let mut discount = policy(org_id, ApprovalType::Discount);
            discount.discount_ceilings = vec![
                DiscountCeiling { role_level: 5, max_discount_pct: Decimal::new(2, 0) },
                DiscountCeiling { role_level: 4, max_discount_pct: Decimal::new(5, 0) },
                DiscountCeiling { role_level: 2, max_discount_pct: Decimal::new(10, 0) },
            ];
            self.policies.save_policy(discount).await.expect("discount policy");
        }

        let mut refund = policy("org-1", ApprovalType::Refund);
        refund.amount_brackets = vec![
            AmountBracket {
                min_amount: Decimal::ZERO,
                max_amount: Some(Decimal::new(100_000, 0)),
                approver_level: 4,
            },
            AmountBracket {
                min_amount: Decimal::new(100_001, 0),
                max_amount: Some(Decimal::new(500_000, 0)),
                approver_level: 3,
            },
        ];
        self.policies.save_policy(refund).await.expect("refund policy");

        let mut cancellation = policy("org-1", ApprovalType::SaleCancellation);
        cancellation.approver_rules = vec![ApproverRule::Specific {
            user_ids: vec!["u-sm".to_string(), "u-gm".to_string()],
        }];
        cancellation.required_approvals = 2;
        self.policies.save_policy(cancellation).await.expect("cancellation policy");

        let mut invoice = policy("org-1", ApprovalType::InvoiceApproval);
        invoice.approver_rules = vec![ApproverRule::Specific {
            user_ids: vec!["u-sm".to_string(), "u-gm".to_string(), "u-md".to_string()],
        }];
        invoice.required_approvals = 3;
        self.policies.save_policy(invoice).await.expect("invoice policy");
    }

    async fn create(&self, input: NewApprovalRequest) -> ApprovalRequest {
        let outcome = self.engine.create_approval_request(input).await.expect("create request");
        assert!(!outcome.approved);
        outcome.approval_request.expect("persisted request")
    }

    async fn act(
        &self,
        request: &ApprovalRequest,
        user_id: &str,
        action: ApprovalDecision,
    ) -> Result<ApprovalRequest, ApplicationError> {
        self.engine
            .process_approval_action(ApprovalActionInput {
                request_id: request.id.clone(),
                user_id: user_id.to_string(),
                action,
                comment: Some(format!("{user_id} decided")),
            })
            .await
    }

    async fn stored(&self, id: &ApprovalRequestId) -> ApprovalRequest {
        self.requests.find_by_id(id).await.expect("lookup").expect("request exists")
    }

    fn drain_notifications(&mut self) -> Vec<ApprovalNotification> {
        let mut drained = Vec::new();
        while let Ok(notification) = self.notifications.try_recv() {
            drained.push(notification);
        }
        drained
    }
}

fn policy(org_id: &str, approval_type: ApprovalType) -> ApprovalPolicy {
    let now = Utc::now();
    ApprovalPolicy {
        id: PolicyId(format!("POL-{org_id}-{}", approval_type.as_str())),
        org_id: org_id.to_string(),
        project_id: None,
        approval_type,
        enabled: true,
        discount_ceilings: Vec::new(),
        max_price_deviation_pct: None,
        amount_brackets: Vec::new(),
        always_require: false,
        approver_rules: Vec::new(),
        required_approvals: 1,
        sla_hours: 24,
        escalation: EscalationTiming { level1_hours: 24, level2_hours: 48, level3_hours: 72 },
        created_at: now,
        updated_at: now,
    }
}

fn discount_request(org_id: &str, requester: &str, percentage: i64) -> NewApprovalRequest {
    NewApprovalRequest {
        org_id: org_id.to_string(),
        project_id: None,
        approval_type: ApprovalType::Discount,
        entity_type: "sale".to_string(),
        entity_id: "sale-77".to_string(),
        requested_by: requester.to_string(),
        request_data: json!({
            "discount_percentage": percentage,
            "unit_id": "unit-12",
            "lead_id": "lead-3",
        }),
        priority: Priority::High,
        title: format!("{percentage}% discount on unit 12"),
        description: None,
    }
}

fn cancellation_request() -> NewApprovalRequest {
    NewApprovalRequest {
        org_id: "org-1".to_string(),
        project_id: None,
        approval_type: ApprovalType::SaleCancellation,
        entity_type: "sale".to_string(),
        entity_id: "sale-5".to_string(),
        requested_by: "u-agent".to_string(),
        request_data: json!({ "unit_id": "unit-4", "lead_id": "lead-9", "reason": "loan denied" }),
        priority: Priority::Medium,
        title: "Cancel sale 5".to_string(),
        description: Some("buyer could not secure financing".to_string()),
    }
}

fn invoice_request() -> NewApprovalRequest {
    NewApprovalRequest {
        org_id: "org-1".to_string(),
        project_id: None,
        approval_type: ApprovalType::InvoiceApproval,
        entity_type: "invoice".to_string(),
        entity_id: "inv-2031".to_string(),
        requested_by: "u-agent".to_string(),
        request_data: json!({}),
        priority: Priority::Low,
        title: "Release invoice 2031".to_string(),
        description: None,
    }
}

#[tokio::test]
async fn discount_within_requester_ceiling_never_requires_approval() {
    let harness = Harness::new().await;

    for percentage in [0, 1, 2] {
        let context = ApprovalContext::for_requester("u-agent")
            .with_discount(Decimal::new(percentage, 0));
        let check = harness
            .engine
            .check_approval_required("org-1", ApprovalType::Discount, &context, None)
            .await
            .expect("check");

        assert!(!check.required, "{percentage}% should be within the agent ceiling");
        assert!(check.approvers.is_empty());
    }
}

#[tokio::test]
async fn junior_discount_over_ceiling_routes_to_most_junior_covering_level() {
    let harness = Harness::new().await;
    let context = ApprovalContext::for_requester("u-agent")
        .with_requester_level(5)
        .with_discount(Decimal::new(5, 0));

    let evaluator = ThresholdEvaluator::new(harness.policies.clone(), harness.directory.clone());
    let outcome = evaluator
        .is_approval_required("org-1", ApprovalType::Discount, &context, None)
        .await
        .expect("evaluate");
    assert!(outcome.required);
    assert_eq!(outcome.override_approver_level, Some(4));

    let check = harness
        .engine
        .check_approval_required("org-1", ApprovalType::Discount, &context, None)
        .await
        .expect("check");
    assert!(check.required);
    assert_eq!(check.approvers, vec!["u-md", "u-gm", "u-pm", "u-sm", "u-sm2"]);
}

#[tokio::test]
async fn discount_over_ceiling_never_lists_the_requester() {
    let harness = Harness::new().await;
    let context = ApprovalContext::for_requester("u-sm").with_discount(Decimal::new(7, 0));

    let check = harness
        .engine
        .check_approval_required("org-1", ApprovalType::Discount, &context, None)
        .await
        .expect("check");

    assert!(check.required);
    assert_eq!(check.approvers, vec!["u-md", "u-gm"]);
    assert!(!check.approvers.iter().any(|user| user == "u-sm"));
}

#[tokio::test]
async fn refund_amount_selects_bracket_level() {
    let harness = Harness::new().await;
    let context =
        ApprovalContext::for_requester("u-agent").with_amount(Decimal::new(150_000, 0));

    let evaluator = ThresholdEvaluator::new(harness.policies.clone(), harness.directory.clone());
    let outcome = evaluator
        .is_approval_required("org-1", ApprovalType::Refund, &context, None)
        .await
        .expect("evaluate");
    assert_eq!(outcome.override_approver_level, Some(3));

    let check = harness
        .engine
        .check_approval_required("org-1", ApprovalType::Refund, &context, None)
        .await
        .expect("check");
    assert_eq!(check.approvers, vec!["u-md", "u-gm", "u-pm"]);
}

#[tokio::test]
async fn refund_check_without_amount_is_a_validation_error() {
    let harness = Harness::new().await;
    let error = harness
        .engine
        .check_approval_required(
            "org-1",
            ApprovalType::Refund,
            &ApprovalContext::for_requester("u-agent"),
            None,
        )
        .await
        .expect_err("missing amount");

    assert!(matches!(error, ApplicationError::Validation(_)));
}

#[tokio::test]
async fn auto_approval_persists_nothing() {
    let mut harness = Harness::new().await;

    let within_ceiling = harness
        .engine
        .create_approval_request(discount_request("org-1", "u-agent", 1))
        .await
        .expect("create");
    assert!(within_ceiling.approved);
    assert!(within_ceiling.auto_approved);
    assert!(within_ceiling.approval_request.is_none());

    let mut lonely = policy("org-3", ApprovalType::SaleCancellation);
    lonely.approver_rules = vec![ApproverRule::Role { role_slug: "general-manager".to_string() }];
    harness.policies.save_policy(lonely).await.expect("policy");
    let mut nobody_to_ask = cancellation_request();
    nobody_to_ask.org_id = "org-3".to_string();
    let outcome = harness.engine.create_approval_request(nobody_to_ask).await.expect("create");
    assert!(outcome.approved && outcome.auto_approved);

    let commission = NewApprovalRequest {
        approval_type: ApprovalType::CommissionPayout,
        ..cancellation_request()
    };
    let outcome = harness.engine.create_approval_request(commission).await.expect("create");
    assert!(outcome.auto_approved);

    assert!(harness.requests.is_empty().await);
    assert!(harness.tasks.tasks().await.is_empty());
    assert!(harness.drain_notifications().is_empty());
}

#[tokio::test]
async fn task_link_survives_a_concurrent_write() {
    let harness = Harness::new().await;
    harness.requests.inject_conflicts(1);

    let request = harness.create(cancellation_request()).await;

    let task_id = request.task_id.clone().expect("linked task");
    assert_eq!(harness.stored(&request.id).await.task_id, Some(task_id));
    assert_eq!(harness.tasks.tasks().await.len(), 1);
}

#[tokio::test]
async fn unlinkable_task_leaves_request_open_without_link() {
    let harness = Harness::new().await;
    harness.requests.inject_conflicts(ApprovalsConfig::default().max_conflict_retries + 1);

    let outcome =
        harness.engine.create_approval_request(cancellation_request()).await.expect("create");

    let request = outcome.approval_request.expect("persisted request");
    assert!(outcome.task.is_some());
    assert_eq!(request.task_id, None);
    assert_eq!(harness.stored(&request.id).await.status, ApprovalStatus::Pending);
}

#[tokio::test]
async fn payload_role_level_cannot_lift_the_requester_ceiling() {
    let harness = Harness::new().await;
    let mut spoofed = discount_request("org-1", "u-agent", 5);
    spoofed.request_data["requester_role_level"] = json!(1);

    let outcome = harness.engine.create_approval_request(spoofed).await.expect("create");

    assert!(!outcome.approved);
    assert!(!outcome.auto_approved);
    let request = outcome.approval_request.expect("persisted request");
    assert_eq!(request.approver_ids(), vec!["u-md", "u-gm", "u-pm", "u-sm", "u-sm2"]);
}

#[tokio::test]
async fn discount_without_unit_is_refused_before_anything_is_written() {
    let mut harness = Harness::new().await;
    let mut incomplete = discount_request("org-1", "u-agent", 5);
    incomplete.request_data = json!({ "discount_percentage": 5 });

    let error =
        harness.engine.create_approval_request(incomplete).await.expect_err("missing unit");

    assert!(matches!(error, ApplicationError::Validation(_)));
    assert!(harness.requests.is_empty().await);
    assert!(harness.tasks.tasks().await.is_empty());
    assert!(harness.drain_notifications().is_empty());
}

#[tokio::test]
async fn creation_links_a_task_and_notifies_approvers() {
    let mut harness = Harness::new().await;

    let outcome = harness
        .engine
        .create_approval_request(discount_request("org-1", "u-agent", 5))
        .await
        .expect("create");
    let request = outcome.approval_request.expect("request");
    let task = outcome.task.expect("task");

    assert_eq!(request.status, ApprovalStatus::Pending);
    assert_eq!(request.required_approvals, 1);
    assert_eq!(request.task_id.as_ref(), Some(&task.id));
    assert_eq!(request.sla_deadline - request.created_at, Duration::hours(24));
    assert!(request.approver_actions.iter().all(|entry| entry.user_id != "u-agent"));

    let record = harness.tasks.task(&task.id).await.expect("task record");
    assert_eq!(record.assignee, "u-md");
    assert_eq!(record.task.watchers, vec!["u-gm", "u-pm", "u-sm", "u-sm2"]);
    assert_eq!(record.task.due_at, request.sla_deadline);
    assert_eq!(record.priority, Priority::High);

    let notifications = harness.drain_notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].recipients(), request.approver_ids());
}

#[tokio::test]
async fn task_board_outage_does_not_block_creation() {
    let harness = Harness::new().await;
    harness.tasks.set_unavailable(true);

    let outcome = harness
        .engine
        .create_approval_request(discount_request("org-1", "u-agent", 5))
        .await
        .expect("create succeeds without the task board");

    let request = outcome.approval_request.expect("request");
    assert!(outcome.task.is_none());
    assert!(request.task_id.is_none());
    assert_eq!(harness.stored(&request.id).await.status, ApprovalStatus::Pending);
}

#[tokio::test]
async fn single_approver_rejection_reverts_the_sale() {
    let mut harness = Harness::new().await;
    let request = harness.create(discount_request("org-2", "u-rookie", 5)).await;
    assert_eq!(request.approver_ids(), vec!["u-boss"]);
    harness.drain_notifications();

    let rejected = harness.act(&request, "u-boss", ApprovalDecision::Rejected).await.expect("reject");

    assert_eq!(rejected.status, ApprovalStatus::Rejected);
    assert_eq!(rejected.resolved_by.as_deref(), Some("u-boss"));
    let mutations: Vec<EntityMutation> =
        harness.entities.applied().await.into_iter().map(|envelope| envelope.mutation).collect();
    assert_eq!(
        mutations,
        vec![
            EntityMutation::DeleteSale { sale_id: "sale-77".to_string() },
            EntityMutation::ReleaseUnit { unit_id: "unit-12".to_string() },
        ]
    );

    let task_id = rejected.task_id.clone().expect("task");
    let task = harness.tasks.task(&task_id).await.expect("task record");
    assert_eq!(task.resolution.map(|resolution| resolution.outcome), Some(ApprovalStatus::Rejected));

    let notifications = harness.drain_notifications();
    assert!(matches!(
        notifications.as_slice(),
        [ApprovalNotification::Rejected { reason: Some(reason), .. }] if reason == "u-boss decided"
    ));
}

#[tokio::test]
async fn one_rejection_vetoes_the_rest_in_any_order() {
    for rejecting in ["u-sm", "u-gm", "u-md"] {
        let harness = Harness::new().await;
        let request = harness.create(invoice_request()).await;
        assert_eq!(request.required_approvals, 3);

        let mut rejected = false;
        for approver in ["u-sm", "u-gm", "u-md"] {
            let decision = if approver == rejecting {
                ApprovalDecision::Rejected
            } else {
                ApprovalDecision::Approved
            };
            match harness.act(&request, approver, decision).await {
                Ok(updated) if decision == ApprovalDecision::Rejected => {
                    assert_eq!(updated.status, ApprovalStatus::Rejected);
                    rejected = true;
                }
                Ok(updated) => assert_eq!(updated.status, ApprovalStatus::Pending),
                Err(error) => {
                    assert!(rejected, "only actions after the veto may fail");
                    assert!(matches!(error, ApplicationError::StateConflict(_)));
                }
            }
        }

        let stored = harness.stored(&request.id).await;
        assert_eq!(stored.status, ApprovalStatus::Rejected, "veto by {rejecting}");
    }
}

#[tokio::test]
async fn repeated_approval_by_same_user_is_a_state_conflict() {
    let harness = Harness::new().await;
    let request = harness.create(cancellation_request()).await;

    harness.act(&request, "u-sm", ApprovalDecision::Approved).await.expect("first approval");
    let error = harness
        .act(&request, "u-sm", ApprovalDecision::Approved)
        .await
        .expect_err("second approval");

    assert!(matches!(error, ApplicationError::StateConflict(_)));
    let stored = harness.stored(&request.id).await;
    assert_eq!(stored.current_approval_count, 1);
    assert_eq!(stored.status, ApprovalStatus::Pending);
}

#[tokio::test]
async fn non_approver_action_is_an_authorization_error() {
    let harness = Harness::new().await;
    let request = harness.create(cancellation_request()).await;

    let error = harness
        .act(&request, "u-agent2", ApprovalDecision::Approved)
        .await
        .expect_err("stranger");
    assert!(matches!(error, ApplicationError::Authorization(_)));

    let error = harness
        .engine
        .process_approval_action(ApprovalActionInput {
            request_id: ApprovalRequestId("APR-missing".to_string()),
            user_id: "u-sm".to_string(),
            action: ApprovalDecision::Approved,
            comment: None,
        })
        .await
        .expect_err("unknown request");
    assert!(matches!(error, ApplicationError::NotFound(_)));
}

#[tokio::test]
async fn second_approval_closes_the_request_exactly_once() {
    let mut harness = Harness::new().await;
    let request = harness.create(cancellation_request()).await;
    harness.drain_notifications();

    let partial = harness.act(&request, "u-sm", ApprovalDecision::Approved).await.expect("first");
    assert_eq!(partial.status, ApprovalStatus::Pending);
    assert!(partial.resolved_at.is_none());
    assert!(harness.entities.applied().await.is_empty());
    assert!(harness.drain_notifications().is_empty());

    let approved = harness.act(&request, "u-gm", ApprovalDecision::Approved).await.expect("second");
    assert_eq!(approved.status, ApprovalStatus::Approved);
    assert_eq!(approved.current_approval_count, 2);
    assert_eq!(approved.resolved_by.as_deref(), Some("u-gm"));

    let applied = harness.entities.applied().await;
    assert_eq!(applied.len(), 3);
    assert!(applied.iter().all(|envelope| envelope.path == PropagationPath::Approve));
    assert!(matches!(
        &applied[0].mutation,
        EntityMutation::CancelSale { reason, cancelled_by, .. }
            if reason == "loan denied" && cancelled_by == "u-agent"
    ));
    assert_eq!(applied[0].idempotency_key, format!("{}:0", request.id.0));

    let notifications = harness.drain_notifications();
    assert_eq!(notifications.len(), 1);
    assert!(matches!(notifications[0], ApprovalNotification::Approved { .. }));

    let error = harness
        .act(&request, "u-sm", ApprovalDecision::Rejected)
        .await
        .expect_err("terminal request");
    assert!(matches!(error, ApplicationError::StateConflict(_)));
    assert_eq!(harness.entities.applied().await.len(), 3);
}

#[tokio::test]
async fn propagation_failure_never_reverses_the_decision() {
    let harness = Harness::new().await;
    harness.entities.fail_on("book_sale").await;
    let request = harness.create(discount_request("org-2", "u-rookie", 5)).await;

    let approved = harness.act(&request, "u-boss", ApprovalDecision::Approved).await.expect("approve");

    assert_eq!(approved.status, ApprovalStatus::Approved);
    assert_eq!(harness.stored(&request.id).await.status, ApprovalStatus::Approved);
    assert!(harness.entities.applied().await.is_empty());
    let propagation_events: Vec<_> = harness
        .audit
        .events()
        .into_iter()
        .filter(|event| event.event_type == "approval.propagated")
        .collect();
    assert_eq!(propagation_events.len(), 1);
    assert_eq!(propagation_events[0].outcome, AuditOutcome::Failed);
}

#[tokio::test]
async fn version_conflict_is_retried_against_fresh_state() {
    let harness = Harness::new().await;
    let request = harness.create(cancellation_request()).await;
    let version_before = harness.stored(&request.id).await.version;

    harness.requests.inject_conflicts(2);
    let updated = harness.act(&request, "u-sm", ApprovalDecision::Approved).await.expect("retried");

    assert_eq!(updated.current_approval_count, 1);
    assert_eq!(updated.version, version_before + 1);
}

#[tokio::test]
async fn persistent_conflicts_surface_as_concurrent_modification() {
    let harness = Harness::new().await;
    let request = harness.create(cancellation_request()).await;

    harness.requests.inject_conflicts(ApprovalsConfig::default().max_conflict_retries + 1);
    let error = harness
        .act(&request, "u-sm", ApprovalDecision::Approved)
        .await
        .expect_err("conflicts exhausted");

    assert!(matches!(error, ApplicationError::ConcurrentModification { .. }));
    assert_eq!(harness.stored(&request.id).await.current_approval_count, 0);
}

#[tokio::test]
async fn only_the_requester_may_cancel_and_only_while_pending() {
    let mut harness = Harness::new().await;
    let request = harness.create(discount_request("org-1", "u-agent", 5)).await;
    harness.drain_notifications();

    let error = harness
        .engine
        .cancel_approval_request(&request.id, "u-md", None)
        .await
        .expect_err("approver cannot cancel");
    assert!(matches!(error, ApplicationError::Authorization(_)));

    let cancelled = harness
        .engine
        .cancel_approval_request(&request.id, "u-agent", Some("buyer walked away".to_string()))
        .await
        .expect("requester cancels");
    assert_eq!(cancelled.status, ApprovalStatus::Cancelled);
    assert!(harness.drain_notifications().is_empty());

    let reverted: Vec<&'static str> =
        harness.entities.applied().await.iter().map(|envelope| envelope.mutation.kind()).collect();
    assert_eq!(reverted, vec!["delete_sale", "release_unit"]);

    let error = harness
        .engine
        .cancel_approval_request(&request.id, "u-agent", None)
        .await
        .expect_err("already cancelled");
    assert!(matches!(error, ApplicationError::StateConflict(_)));

    let error = harness
        .act(&request, "u-md", ApprovalDecision::Approved)
        .await
        .expect_err("cancelled request accepts no action");
    assert!(matches!(error, ApplicationError::StateConflict(_)));
}

#[tokio::test]
async fn stalled_request_escalates_once_per_threshold() {
    let mut harness = Harness::new().await;
    let request = harness.create(cancellation_request()).await;
    harness.drain_notifications();

    let after_25h = request.created_at + Duration::hours(25);
    let stats = harness.engine.check_approval_escalations_at(after_25h).await.expect("escalate");
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.escalated, 1);

    let escalated = harness.stored(&request.id).await;
    assert_eq!(escalated.current_escalation_level, 1);
    assert_eq!(escalated.status, ApprovalStatus::Pending);
    assert_eq!(escalated.approver_ids(), vec!["u-sm", "u-gm", "u-md"]);
    assert_eq!(escalated.escalation_history.len(), 1);
    assert!(escalated.escalation_history[0].reason.contains("25h"));

    let task = harness.tasks.task(&escalated.task_id.clone().expect("task")).await.expect("task");
    assert_eq!(task.priority, Priority::Urgent);
    assert_eq!(task.assignee, "u-md");
    assert_eq!(task.escalations.len(), 1);

    let notifications = harness.drain_notifications();
    assert!(matches!(
        notifications.as_slice(),
        [ApprovalNotification::Escalated { new_approver, level: 1, .. }] if new_approver == "u-md"
    ));

    let stats = harness
        .engine
        .check_approval_escalations_at(after_25h + Duration::hours(1))
        .await
        .expect("second pass");
    assert_eq!(stats.escalated, 0);
    assert_eq!(stats.skipped, 1);
    assert_eq!(harness.stored(&request.id).await.current_escalation_level, 1);
    assert_eq!(harness.stored(&request.id).await.approver_actions.len(), 3);
}

#[tokio::test]
async fn escalation_never_resolves_and_reports_exhausted_pool() {
    let harness = Harness::new().await;
    let request = harness.create(discount_request("org-2", "u-rookie", 5)).await;

    let stats = harness
        .engine
        .check_approval_escalations_at(request.created_at + Duration::hours(100))
        .await
        .expect("escalate");

    assert_eq!(stats.no_candidate, 1);
    let stored = harness.stored(&request.id).await;
    assert_eq!(stored.status, ApprovalStatus::Pending);
    assert_eq!(stored.current_escalation_level, 0);
}

#[tokio::test]
async fn fully_escalated_requests_do_not_starve_newer_ones() {
    let harness = Harness::with_settings(ApprovalsConfig {
        escalation_batch_size: 1,
        ..ApprovalsConfig::default()
    })
    .await;
    let stale = harness.create(cancellation_request()).await;
    let stats = harness
        .engine
        .check_approval_escalations_at(stale.created_at + Duration::hours(100))
        .await
        .expect("first pass");
    assert_eq!(stats.escalated, 1);
    assert_eq!(harness.stored(&stale.id).await.current_escalation_level, 3);

    let mut second = cancellation_request();
    second.entity_id = "sale-6".to_string();
    let fresh = harness.create(second).await;
    let mut third = cancellation_request();
    third.entity_id = "sale-8".to_string();
    let newest = harness.create(third).await;

    let stats = harness
        .engine
        .check_approval_escalations_at(newest.created_at + Duration::hours(25))
        .await
        .expect("second pass");

    assert_eq!(stats.processed, 2);
    assert_eq!(stats.escalated, 2);
    assert_eq!(harness.stored(&stale.id).await.current_escalation_level, 3);
    assert_eq!(harness.stored(&fresh.id).await.current_escalation_level, 1);
    assert_eq!(harness.stored(&newest.id).await.current_escalation_level, 1);
}

#[tokio::test]
async fn requests_inside_their_sla_are_left_alone() {
    let harness = Harness::new().await;
    let request = harness.create(cancellation_request()).await;

    let stats = harness
        .engine
        .check_approval_escalations_at(request.created_at + Duration::hours(23))
        .await
        .expect("escalate");

    assert_eq!(stats.processed, 0);
    assert_eq!(harness.stored(&request.id).await.current_escalation_level, 0);
}

#[tokio::test]
async fn dashboard_splits_pending_submitted_and_resolved() {
    let harness = Harness::new().await;
    let open = harness.create(cancellation_request()).await;
    let closed = harness.create(discount_request("org-1", "u-agent", 5)).await;
    harness.act(&closed, "u-sm", ApprovalDecision::Rejected).await.expect("reject");

    let for_manager = harness.engine.get_approval_dashboard("u-sm", "org-1").await.expect("dash");
    assert_eq!(for_manager.pending_for_me.len(), 1);
    assert_eq!(for_manager.pending_for_me[0].id, open.id);
    assert!(for_manager.my_requests.is_empty());
    assert_eq!(for_manager.recently_resolved.len(), 1);
    assert_eq!(for_manager.recently_resolved[0].id, closed.id);

    let for_agent = harness.engine.get_approval_dashboard("u-agent", "org-1").await.expect("dash");
    assert!(for_agent.pending_for_me.is_empty());
    assert_eq!(for_agent.my_requests.len(), 2);

    let rejected_discounts = for_agent
        .stats
        .iter()
        .find(|count| {
            count.approval_type == ApprovalType::Discount && count.status == ApprovalStatus::Rejected
        })
        .map(|count| count.count);
    assert_eq!(rejected_discounts, Some(1));

    let other_org = harness.engine.get_approval_dashboard("u-sm", "org-2").await.expect("dash");
    assert!(other_org.pending_for_me.is_empty() && other_org.stats.is_empty());
}
