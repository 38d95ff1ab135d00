mod common;

use heimdall_gateway::gateway::admission::Completion;
use heimdall_gateway::gateway::store_types::{
    BillingMode, CycleType, PlanAssignmentRecord, PlanRecord, QuotaMetric, RolloverPolicy,
};
use heimdall_gateway::gateway::upstream::Usage;
use heimdall_gateway::{GatewayError, RequestContext};

use common::{NOW, TestGateway, gateway, seed_account};

fn request(request_id: &str) -> RequestContext {
    RequestContext::new("POST", "/v1/chat/completions")
        .with_header("authorization", "Bearer sk-key-alice")
        .with_header("content-type", "application/json")
        .with_header("x-request-id", request_id)
        .with_peer_addr("203.0.113.7")
        .with_body(r#"{"model":"gpt-4o","messages":[{"role":"user","content":"hello"}]}"#)
}

fn completed() -> Completion {
    Completion {
        status: 200,
        response_size: 64,
        upstream_provider: "stub".to_string(),
        usage: Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
        },
        error_message: None,
    }
}

async fn assign_plan(gw: &TestGateway, user_id: i64, quota: i64, mode: BillingMode) -> i64 {
    let store = gw.heimdall.store();
    let plan_id = store
        .insert_plan(&PlanRecord {
            id: 0,
            code: format!("starter-{}", mode.as_str()),
            name: "Starter".to_string(),
            cycle_type: CycleType::Monthly,
            cycle_duration_days: 0,
            quota_metric: QuotaMetric::Requests,
            quota_amount: quota,
            allow_carry_over: false,
            carry_limit_percent: 0,
            allowed_models: Vec::new(),
            is_active: true,
        })
        .await
        .expect("plan");
    store
        .insert_assignment(&PlanAssignmentRecord {
            id: 0,
            subject_type: "user".to_string(),
            subject_id: user_id,
            plan_id,
            billing_mode: mode,
            activated_at: NOW as i64 - 60,
            deactivated_at: None,
            expires_at: None,
            auto_fallback_enabled: mode == BillingMode::Auto,
            rollover_amount: 0,
            rollover_policy: RolloverPolicy::None,
            rollover_expires_at: None,
        })
        .await
        .expect("assignment")
}

#[tokio::test]
async fn plan_quota_exhaustion_rejects_without_fallback() {
    let gw = gateway(|config| config.billing.enabled = true).await;
    let account = seed_account(gw.heimdall.store(), "alice", "key-alice", 1_000).await;
    assign_plan(&gw, account.user_id, 1, BillingMode::Plan).await;

    let mut first = request("req-plan-1");
    let admission = gw.heimdall.admit(&mut first).await.expect("admit");
    assert_eq!(admission.prepared.mode, BillingMode::Plan);
    assert_eq!(admission.prepared.allowance, 1);
    let outcome = gw
        .heimdall
        .complete(&first, &admission, &completed())
        .await
        .expect("commit")
        .expect("charged");
    assert_eq!(outcome.mode, BillingMode::Plan);

    let mut second = request("req-plan-2");
    let admission = gw.heimdall.admit(&mut second).await.expect("admit");
    let err = gw
        .heimdall
        .complete(&second, &admission, &completed())
        .await
        .expect_err("exhausted");
    assert!(matches!(err, GatewayError::PlanExhausted { .. }));
    assert_eq!(err.status_code(), 402);
    assert!(
        gw.heimdall
            .store()
            .get_request_log("req-plan-2")
            .await
            .expect("log")
            .is_none()
    );

    let user = gw
        .heimdall
        .store()
        .get_user(account.user_id)
        .await
        .expect("user")
        .expect("exists");
    assert_eq!(user.quota, 1_000);
}

#[tokio::test]
async fn auto_mode_falls_back_to_balance_once_plan_is_used() {
    let gw = gateway(|config| config.billing.enabled = true).await;
    let account = seed_account(gw.heimdall.store(), "alice", "key-alice", 1_000).await;
    assign_plan(&gw, account.user_id, 1, BillingMode::Auto).await;

    let mut modes = Vec::new();
    for id in ["req-auto-1", "req-auto-2"] {
        let mut ctx = request(id);
        let admission = gw.heimdall.admit(&mut ctx).await.expect("admit");
        assert_eq!(admission.prepared.mode, BillingMode::Fallback);
        let outcome = gw
            .heimdall
            .complete(&ctx, &admission, &completed())
            .await
            .expect("commit")
            .expect("charged");
        modes.push(outcome.mode);
    }
    assert_eq!(modes, vec![BillingMode::Plan, BillingMode::Balance]);

    let user = gw
        .heimdall
        .store()
        .get_user(account.user_id)
        .await
        .expect("user")
        .expect("exists");
    assert_eq!(user.quota, 999);
}

#[tokio::test]
async fn repeated_commit_is_idempotent() {
    let gw = gateway(|_| {}).await;
    let account = seed_account(gw.heimdall.store(), "alice", "key-alice", 1_000).await;

    let mut ctx = request("req-once");
    let admission = gw.heimdall.admit(&mut ctx).await.expect("admit");
    let first = gw
        .heimdall
        .complete(&ctx, &admission, &completed())
        .await
        .expect("commit")
        .expect("charged");
    assert!(!first.idempotent);
    let second = gw
        .heimdall
        .complete(&ctx, &admission, &completed())
        .await
        .expect("commit")
        .expect("charged");
    assert!(second.idempotent);

    // 2 per request + ceil(15 * 10 / 1000)
    let user = gw
        .heimdall
        .store()
        .get_user(account.user_id)
        .await
        .expect("user")
        .expect("exists");
    assert_eq!(user.quota, 1_000 - 3);
}

#[tokio::test]
async fn balance_short_of_the_amount_is_rejected() {
    let gw = gateway(|_| {}).await;
    seed_account(gw.heimdall.store(), "alice", "key-alice", 2).await;

    let mut ctx = request("req-poor");
    let admission = gw.heimdall.admit(&mut ctx).await.expect("admit");
    let err = gw
        .heimdall
        .complete(&ctx, &admission, &completed())
        .await
        .expect_err("insufficient");
    assert!(matches!(err, GatewayError::BalanceInsufficient { needed: 3, .. }));

    gw.heimdall.shutdown().await;
    assert_eq!(
        gw.heimdall
            .store()
            .count_heimdall_logs("req-poor")
            .await
            .expect("count"),
        1
    );
}
