use super::*;
use crate::gateway::store_types::{
    AnomalyBaselineRecord, AnomalySeverity, AnomalyStatus, EnforcementAction, FlagSeverity,
    GrantType, HeimdallRequestLog, IpListKind, RequestFlagRecord, SecurityAnomalyRecord,
    TokenRecord, UserRecord, VoucherBatchRecord, VoucherCodeStatus,
};

const NOW: i64 = 1_708_004_700;

async fn store() -> (tempfile::TempDir, SqliteStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::new(dir.path().join("gateway.sqlite"));
    store.init().await.expect("init");
    (dir, store)
}

fn user(username: &str) -> UserRecord {
    UserRecord {
        id: 0,
        username: username.to_string(),
        quota: 100,
        used_quota: 0,
        status: 1,
        banned: false,
        redirect_model: None,
        encryption_key_hash: None,
        encryption_enabled: false,
        created_at: NOW,
    }
}

fn anomaly(user_id: i64, rule_type: &str, detected_at: i64) -> SecurityAnomalyRecord {
    SecurityAnomalyRecord {
        id: 0,
        user_id,
        token_id: None,
        rule_type: rule_type.to_string(),
        severity: AnomalySeverity::High,
        message: "too many tokens".to_string(),
        evidence: serde_json::json!({ "token_count": 12 }),
        risk_score: 0.8,
        status: AnomalyStatus::Pending,
        action_taken: None,
        detected_at,
        actioned_at: None,
        ttl_until: Some(detected_at + 3600),
        reviewed_by: None,
        reviewed_at: None,
        review_decision: None,
        review_rationale: None,
    }
}

#[tokio::test]
async fn tokens_round_trip_with_lists() {
    let (_dir, store) = store().await;
    let user_id = store.insert_user(&user("alice")).await.expect("user");
    let token_id = store
        .insert_token(&TokenRecord {
            id: 0,
            user_id,
            key: "sk-alice".to_string(),
            name: "ci".to_string(),
            status: 1,
            remain_quota: 50,
            unlimited_quota: false,
            model_limits: vec!["gpt-4o".to_string()],
            allowed_ips: vec!["10.0.0.0/8".to_string()],
            billing_mode: Some(crate::gateway::store_types::BillingMode::Plan),
            plan_assignment_id: None,
            expires_at: Some(NOW + 60),
        })
        .await
        .expect("token");

    let token = store
        .get_token_by_key("sk-alice")
        .await
        .expect("lookup")
        .expect("token");
    assert_eq!(token.id, token_id);
    assert_eq!(token.model_limits, vec!["gpt-4o".to_string()]);
    assert_eq!(token.allowed_ips, vec!["10.0.0.0/8".to_string()]);
    assert!(token.is_usable_at(NOW));
    assert!(!token.is_usable_at(NOW + 60));
    assert!(store.get_token_by_key("sk-nobody").await.expect("lookup").is_none());
}

#[tokio::test]
async fn user_ban_and_redirect_are_persisted() {
    let (_dir, store) = store().await;
    let user_id = store.insert_user(&user("bob")).await.expect("user");
    store.set_user_banned(user_id, true).await.expect("ban");
    store
        .set_user_redirect(user_id, Some("gpt-4o-mini"))
        .await
        .expect("redirect");

    let user = store.get_user(user_id).await.expect("get").expect("user");
    assert!(user.banned);
    assert_eq!(user.redirect_model.as_deref(), Some("gpt-4o-mini"));
    assert!(matches!(
        store.set_user_banned(user_id + 100, true).await,
        Err(StoreError::NotFound { entity: "user", .. })
    ));

    store.record_login(user_id, "203.0.113.1", NOW - 10).await.expect("login");
    store.record_login(user_id, "203.0.113.1", NOW - 7200).await.expect("login");
    assert_eq!(store.count_logins(user_id, NOW - 3600).await.expect("count"), 1);
}

#[tokio::test]
async fn flags_expire_by_ttl_or_age() {
    let (_dir, store) = store().await;
    let flag = |request_id: &str, created_at: i64, ttl_at: Option<i64>| RequestFlagRecord {
        id: 0,
        request_id: request_id.to_string(),
        subject_key: "user:1".to_string(),
        user_id: Some(1),
        token_id: None,
        reason: "high_rpm".to_string(),
        severity: FlagSeverity::Violation,
        reasons: vec!["high_rpm".to_string()],
        rerouted_model_alias: None,
        excluded_from_leaderboard: true,
        metadata: serde_json::json!({ "rpm": 90 }),
        created_at,
        ttl_at,
    };
    store.insert_flag(&flag("a", NOW - 10, Some(NOW - 1))).await.expect("flag");
    store.insert_flag(&flag("b", NOW - 10, Some(NOW + 100))).await.expect("flag");
    store.insert_flag(&flag("c", NOW - 100_000, None)).await.expect("flag");

    let removed = store.delete_expired_flags(NOW, 86_400).await.expect("cleanup");
    assert_eq!(removed, 2);
    let left = store.list_flags(10).await.expect("list");
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].request_id, "b");
    assert_eq!(left[0].metadata["rpm"], 90);
}

#[tokio::test]
async fn ip_bans_lift_on_expiry() {
    let (_dir, store) = store().await;
    store
        .insert_ip_ban("198.51.100.7", "Auto-ban: 20 violations (rate)", false, Some(NOW + 60), NOW)
        .await
        .expect("ban");
    store
        .insert_ip_ban("198.51.100.8", "manual", true, None, NOW)
        .await
        .expect("ban");
    assert!(store.active_ip_ban("198.51.100.7", NOW).await.expect("ban").is_some());
    assert!(store.active_ip_ban("198.51.100.7", NOW + 61).await.expect("ban").is_none());

    assert_eq!(store.lift_expired_ip_bans(NOW + 61).await.expect("lift"), 1);
    let bans = store.list_ip_bans(NOW + 61).await.expect("bans");
    assert_eq!(bans.len(), 1);
    assert!(bans[0].permanent);
    assert_eq!(store.lift_ip_ban("198.51.100.8").await.expect("lift"), 1);
    assert!(store.list_ip_bans(NOW).await.expect("bans").is_empty());

    store
        .add_ip_entry("10.0.0.0/8", IpListKind::Allow, None, NOW)
        .await
        .expect("entry");
    assert_eq!(store.list_ip_entries().await.expect("entries").len(), 1);
    assert!(store
        .remove_ip_entry("10.0.0.0/8", IpListKind::Allow)
        .await
        .expect("remove"));
}

#[tokio::test]
async fn voucher_batches_expire_with_their_codes() {
    let (_dir, store) = store().await;
    let batch_id = store
        .insert_voucher_batch(&VoucherBatchRecord {
            id: 0,
            code_prefix: "SPRING".to_string(),
            grant_type: GrantType::Credit,
            credit_amount: Some(500),
            plan_grant_id: None,
            valid_from: None,
            valid_until: Some(NOW - 1),
            max_redemptions: 10,
            max_per_subject: 1,
            created_at: NOW - 3600,
            deleted_at: None,
        })
        .await
        .expect("batch");
    store.insert_voucher_code(batch_id, "SPRING-AAAA").await.expect("code");
    store.insert_voucher_code(batch_id, "SPRING-BBBB").await.expect("code");

    assert_eq!(store.expire_voucher_batches(NOW).await.expect("expire"), (1, 2));
    let code = store
        .get_voucher_code("SPRING-AAAA")
        .await
        .expect("get")
        .expect("code");
    assert_eq!(code.status, VoucherCodeStatus::Expired);
    assert_eq!(store.expire_voucher_batches(NOW).await.expect("expire"), (0, 0));
}

#[tokio::test]
async fn anomalies_move_through_review() {
    let (_dir, store) = store().await;
    let id = store
        .insert_anomaly(&anomaly(7, "token_abuse", NOW))
        .await
        .expect("anomaly");

    let recent = store
        .recent_unresolved_anomaly(7, "token_abuse", NOW - 600)
        .await
        .expect("recent")
        .expect("present");
    assert_eq!(recent.id, id);
    assert_eq!(recent.evidence["token_count"], 12);

    assert!(store
        .mark_anomaly_actioned(id, EnforcementAction::Block, NOW + 1)
        .await
        .expect("action"));
    assert!(!store
        .mark_anomaly_actioned(id, EnforcementAction::Ban, NOW + 2)
        .await
        .expect("action"));

    store
        .review_anomaly(id, AnomalyStatus::Ignored, 1, "false positive", None, NOW + 5)
        .await
        .expect("review");
    let reviewed = store.get_anomaly(id).await.expect("get").expect("anomaly");
    assert_eq!(reviewed.status, AnomalyStatus::Ignored);
    assert_eq!(reviewed.action_taken, Some(EnforcementAction::Block));
    assert!(store
        .recent_unresolved_anomaly(7, "token_abuse", NOW - 600)
        .await
        .expect("recent")
        .is_none());
    assert!(matches!(
        store
            .review_anomaly(id + 1, AnomalyStatus::Approved, 1, "ok", None, NOW)
            .await,
        Err(StoreError::NotFound { .. })
    ));

    assert_eq!(store.delete_expired_anomalies(NOW + 3600).await.expect("delete"), 1);
    assert!(store.list_anomalies(None, 10).await.expect("list").is_empty());
}

#[tokio::test]
async fn baselines_upsert_in_place() {
    let (_dir, store) = store().await;
    let mut baseline = AnomalyBaselineRecord {
        user_id: 3,
        metric_type: "hourly_requests".to_string(),
        baseline_value: 12.0,
        window_size_seconds: 604_800,
        sample_size: 100,
        updated_at: NOW,
    };
    store.upsert_baseline(&baseline).await.expect("upsert");
    baseline.baseline_value = 20.5;
    baseline.updated_at = NOW + 60;
    store.upsert_baseline(&baseline).await.expect("upsert");

    let loaded = store
        .get_baseline(3, "hourly_requests")
        .await
        .expect("get")
        .expect("baseline");
    assert_eq!(loaded, baseline);
}

#[tokio::test]
async fn telemetry_rows_feed_activity_queries() {
    let (_dir, store) = store().await;
    let row = |request_id: &str, user_id: i64, occurred_at: i64| HeimdallRequestLog {
        request_id: request_id.to_string(),
        occurred_at,
        normalized_url: "/v1/chat/completions".to_string(),
        http_method: "POST".to_string(),
        http_status: 200,
        user_id: Some(user_id),
        ..HeimdallRequestLog::default()
    };
    store
        .insert_heimdall_logs(&[row("r1", 1, NOW - 10), row("r2", 1, NOW - 20), row("r3", 2, NOW - 90_000)])
        .await
        .expect("insert");

    assert_eq!(store.active_user_ids(NOW - 3600).await.expect("active"), vec![1]);
    assert_eq!(store.count_user_requests(1, NOW - 3600).await.expect("count"), 2);
    assert_eq!(store.count_heimdall_logs("r3").await.expect("count"), 1);
    let logs = store
        .heimdall_logs_for_user(1, NOW - 3600, NOW, 10)
        .await
        .expect("logs");
    assert_eq!(logs.len(), 2);
}
