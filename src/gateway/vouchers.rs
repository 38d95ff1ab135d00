//! Voucher redemption: credits or plan grants handed out through prefixed codes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::Clock;
use super::context::SubjectKey;
use super::store::{SqliteStore, StoreError, accounts, plans, vouchers};
use super::store_types::{
    BillingMode, GrantType, PlanAssignmentRecord, RolloverPolicy, VoucherCodeStatus,
    VoucherRedemptionRecord,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemOutcome {
    pub redemption_id: i64,
    pub grant_type: GrantType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credit_amount: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_assignment_id: Option<i64>,
    pub message: String,
}

/// Batch prefix of a code: everything before the first `-`, or the whole code.
pub fn code_prefix(code: &str) -> &str {
    code.split_once('-').map_or(code, |(prefix, _)| prefix)
}

#[derive(Clone)]
pub struct VoucherService {
    store: SqliteStore,
    clock: Arc<dyn Clock>,
}

impl VoucherService {
    pub fn new(store: SqliteStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Redeems `code` for `user_id` in one write transaction. Rejections come back as
    /// [`StoreError::VoucherRejected`] and leave nothing behind.
    pub async fn redeem_voucher(
        &self,
        code: &str,
        user_id: i64,
    ) -> Result<RedeemOutcome, StoreError> {
        let code = code.trim().to_string();
        if code.is_empty() {
            return Err(StoreError::voucher("voucher code is required"));
        }
        if user_id <= 0 {
            return Err(StoreError::voucher("invalid user id"));
        }
        let now = self.clock.now_unix();

        let outcome = self
            .store
            .transact(move |tx| {
                if vouchers::redemption_exists(tx, &code)? {
                    return Err(StoreError::voucher("voucher code already redeemed"));
                }
                let spent = vouchers::load_code(tx, &code)?.is_some_and(|tracked| {
                    !matches!(
                        tracked.status,
                        VoucherCodeStatus::Available | VoucherCodeStatus::Issued
                    )
                });
                if spent {
                    return Err(StoreError::voucher("voucher code is no longer valid"));
                }
                let batch = vouchers::load_batch_by_prefix(tx, code_prefix(&code))?
                    .filter(|batch| batch.deleted_at.is_none())
                    .ok_or_else(|| StoreError::voucher("invalid voucher code"))?;

                if batch.valid_from.is_some_and(|from| now < from) {
                    return Err(StoreError::voucher("voucher is not yet valid"));
                }
                if batch.valid_until.is_some_and(|until| now > until) {
                    return Err(StoreError::voucher("voucher has expired"));
                }
                if batch.max_redemptions > 0
                    && vouchers::count_batch_redemptions(tx, batch.id)? >= batch.max_redemptions
                {
                    return Err(StoreError::voucher(
                        "voucher batch has reached maximum redemptions",
                    ));
                }
                let subject_key = SubjectKey::user(user_id).to_string();
                if batch.max_per_subject > 0
                    && vouchers::count_subject_redemptions(tx, batch.id, &subject_key)?
                        >= batch.max_per_subject
                {
                    return Err(StoreError::voucher("voucher already redeemed by this user"));
                }
                if accounts::load_user(tx, user_id)?.is_none() {
                    return Err(StoreError::not_found("user", user_id));
                }

                let mut outcome = RedeemOutcome {
                    redemption_id: 0,
                    grant_type: batch.grant_type,
                    credit_amount: None,
                    plan_id: None,
                    plan_assignment_id: None,
                    message: String::new(),
                };
                match batch.grant_type {
                    GrantType::Credit => {
                        let amount = batch
                            .credit_amount
                            .filter(|amount| *amount > 0)
                            .ok_or_else(|| {
                                StoreError::voucher("voucher batch has no credit amount")
                            })?;
                        accounts::credit_user_quota(tx, user_id, amount)?;
                        outcome.credit_amount = Some(amount);
                        outcome.message = format!("redeemed {amount} credits");
                    }
                    GrantType::Plan => {
                        let plan_id = batch
                            .plan_grant_id
                            .filter(|id| *id > 0)
                            .ok_or_else(|| {
                                StoreError::voucher("voucher batch has invalid plan configuration")
                            })?;
                        let plan = plans::load_plan(tx, plan_id)?
                            .ok_or_else(|| StoreError::not_found("plan", plan_id))?;
                        let assignment_id = plans::insert_assignment_row(
                            tx,
                            &PlanAssignmentRecord {
                                id: 0,
                                subject_type: "user".to_string(),
                                subject_id: user_id,
                                plan_id,
                                billing_mode: BillingMode::Plan,
                                activated_at: now,
                                deactivated_at: None,
                                expires_at: None,
                                auto_fallback_enabled: false,
                                rollover_amount: 0,
                                rollover_policy: RolloverPolicy::None,
                                rollover_expires_at: None,
                            },
                        )?;
                        outcome.plan_id = Some(plan_id);
                        outcome.plan_assignment_id = Some(assignment_id);
                        outcome.message = format!("redeemed plan {}", plan.name);
                    }
                }

                vouchers::mark_code_redeemed(tx, &code)?;
                outcome.redemption_id = vouchers::insert_redemption(
                    tx,
                    &VoucherRedemptionRecord {
                        id: 0,
                        batch_id: batch.id,
                        code: code.clone(),
                        subject_key,
                        grant_type: batch.grant_type,
                        credit_amount: outcome.credit_amount,
                        plan_assignment_id: outcome.plan_assignment_id,
                        redeemed_at: now,
                    },
                )?;
                Ok(outcome)
            })
            .await;

        match &outcome {
            Ok(outcome) => tracing::info!(
                user_id,
                grant = %outcome.grant_type,
                redemption_id = outcome.redemption_id,
                "voucher redeemed"
            ),
            Err(err) => tracing::info!(user_id, error = %err, "voucher rejected"),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ManualClock;
    use crate::gateway::store_types::{
        CycleType, PlanRecord, QuotaMetric, UserRecord, VoucherBatchRecord,
    };

    const NOW: u64 = 1_700_000_000;

    async fn setup() -> (tempfile::TempDir, SqliteStore, VoucherService, i64) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("gateway.sqlite"));
        let user_id = store
            .insert_user(&UserRecord {
                id: 0,
                username: "alice".to_string(),
                quota: 100,
                used_quota: 0,
                status: 1,
                banned: false,
                redirect_model: None,
                encryption_key_hash: None,
                encryption_enabled: false,
                created_at: 0,
            })
            .await
            .expect("user");
        let service = VoucherService::new(store.clone(), Arc::new(ManualClock::new(NOW)));
        (dir, store, service, user_id)
    }

    fn batch(prefix: &str, grant_type: GrantType) -> VoucherBatchRecord {
        VoucherBatchRecord {
            id: 0,
            code_prefix: prefix.to_string(),
            grant_type,
            credit_amount: Some(500),
            plan_grant_id: None,
            valid_from: Some(NOW as i64 - 10),
            valid_until: Some(NOW as i64 + 86_400),
            max_redemptions: 2,
            max_per_subject: 1,
            created_at: NOW as i64 - 10,
            deleted_at: None,
        }
    }

    fn rejection(err: StoreError) -> String {
        match err {
            StoreError::VoucherRejected { message } => message,
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn prefix_is_text_before_first_dash() {
        assert_eq!(code_prefix("SPRING-1a2b-3c"), "SPRING");
        assert_eq!(code_prefix("PLAIN"), "PLAIN");
    }

    #[tokio::test]
    async fn credit_voucher_tops_up_once() {
        let (_dir, store, service, user_id) = setup().await;
        let batch_id = store
            .insert_voucher_batch(&batch("SPRING", GrantType::Credit))
            .await
            .expect("batch");
        store.insert_voucher_code(batch_id, "SPRING-0001").await.expect("code");

        let outcome = service.redeem_voucher("SPRING-0001", user_id).await.expect("redeem");
        assert_eq!(outcome.credit_amount, Some(500));
        let user = store.get_user(user_id).await.expect("get").expect("user");
        assert_eq!(user.quota, 600);
        let code = store.get_voucher_code("SPRING-0001").await.expect("get").expect("code");
        assert_eq!(code.status, VoucherCodeStatus::Redeemed);

        let again = service.redeem_voucher("SPRING-0001", user_id).await.expect_err("dup");
        assert_eq!(rejection(again), "voucher code already redeemed");
        let other = service.redeem_voucher("SPRING-0002", user_id).await.expect_err("cap");
        assert_eq!(rejection(other), "voucher already redeemed by this user");
    }

    #[tokio::test]
    async fn plan_voucher_creates_assignment() {
        let (_dir, store, service, user_id) = setup().await;
        let plan_id = store
            .insert_plan(&PlanRecord {
                id: 0,
                code: "starter".to_string(),
                name: "Starter".to_string(),
                cycle_type: CycleType::Monthly,
                cycle_duration_days: 0,
                quota_metric: QuotaMetric::Requests,
                quota_amount: 1000,
                allow_carry_over: false,
                carry_limit_percent: 0,
                allowed_models: Vec::new(),
                is_active: true,
            })
            .await
            .expect("plan");
        let mut record = batch("PLAN", GrantType::Plan);
        record.credit_amount = None;
        record.plan_grant_id = Some(plan_id);
        store.insert_voucher_batch(&record).await.expect("batch");

        let outcome = service.redeem_voucher("PLAN-xyz", user_id).await.expect("redeem");
        let assignment_id = outcome.plan_assignment_id.expect("assignment");
        let assignment = store
            .get_assignment(assignment_id)
            .await
            .expect("get")
            .expect("assignment");
        assert_eq!(assignment.plan_id, plan_id);
        assert_eq!(assignment.billing_mode, BillingMode::Plan);
        assert_eq!(assignment.subject_id, user_id);
    }

    #[tokio::test]
    async fn rejects_unknown_expired_and_exhausted_batches() {
        let (_dir, store, service, user_id) = setup().await;
        let unknown = service.redeem_voucher("NOPE-1", user_id).await.expect_err("unknown");
        assert_eq!(rejection(unknown), "invalid voucher code");

        let mut expired = batch("OLD", GrantType::Credit);
        expired.valid_until = Some(NOW as i64 - 1);
        store.insert_voucher_batch(&expired).await.expect("batch");
        let err = service.redeem_voucher("OLD-1", user_id).await.expect_err("expired");
        assert_eq!(rejection(err), "voucher has expired");

        let mut single = batch("ONE", GrantType::Credit);
        single.max_redemptions = 1;
        single.max_per_subject = 0;
        store.insert_voucher_batch(&single).await.expect("batch");
        service.redeem_voucher("ONE-a", user_id).await.expect("first");
        let err = service.redeem_voucher("ONE-b", user_id).await.expect_err("exhausted");
        assert_eq!(rejection(err), "voucher batch has reached maximum redemptions");
    }
}
