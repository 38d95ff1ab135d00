//! Plan and balance charging.
//!
//! A request is charged in two steps. [`BillingEngine::prepare_charge`] picks the billing
//! mode from the subject's active plan assignment without writing anything, and
//! [`BillingEngine::commit_charge`] writes the audit row and deducts plan usage or balance
//! in one `BEGIN IMMEDIATE` transaction. The request id is the idempotency key: a second
//! commit for the same id returns the stored row and deducts nothing.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

pub mod cycle;

use super::config::BillingConfig;
use super::context::SubjectKey;
use super::crypto::anonymize_subject;
use super::store::request_logs::LogInsert;
use super::store::{SqliteStore, StoreError, accounts, plans, request_logs};
use super::store_types::{
    BillingMode, PlanAssignmentRecord, PlanRecord, QuotaMetric, RequestLogRecord,
};
use super::{Clock, GatewayError};

pub use cycle::{allowance, carry_over_amount, cycle_window};

/// What the relay knows about the caller before dispatch.
#[derive(Clone, Debug, Default)]
pub struct RelayInfo {
    pub user_id: i64,
    pub token_id: Option<i64>,
    pub model: String,
    pub billing_mode_override: Option<BillingMode>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PreparedCharge {
    pub subject: SubjectKey,
    /// `plan`, `balance` or `fallback`.
    pub mode: BillingMode,
    pub assignment: Option<PlanAssignmentRecord>,
    pub plan: Option<PlanRecord>,
    pub metric: QuotaMetric,
    pub cycle_start: i64,
    pub cycle_end: i64,
    pub allowance: i64,
}

impl PreparedCharge {
    fn balance(subject: SubjectKey, now: i64) -> Self {
        Self {
            subject,
            mode: BillingMode::Balance,
            assignment: None,
            plan: None,
            metric: QuotaMetric::Credits,
            cycle_start: now,
            cycle_end: now,
            allowance: 0,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct CommitParams {
    pub request_id: String,
    pub user_id: i64,
    pub token_id: Option<i64>,
    pub unlimited_quota: bool,
    pub is_playground: bool,
    pub model_alias: String,
    pub upstream_provider: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub latency_ms: i64,
    pub amount: i64,
    pub is_public: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChargeOutcome {
    pub log: RequestLogRecord,
    /// The request id had already been committed; nothing was deducted.
    pub idempotent: bool,
    pub mode: BillingMode,
}

pub struct BillingEngine {
    store: SqliteStore,
    config: BillingConfig,
    anonymization_secret: String,
    clock: Arc<dyn Clock>,
}

impl BillingEngine {
    pub fn new(
        store: SqliteStore,
        config: BillingConfig,
        anonymization_secret: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            config,
            anonymization_secret: anonymization_secret.into(),
            clock,
        }
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    pub async fn prepare_charge(
        &self,
        subject_key: &str,
        relay: &RelayInfo,
    ) -> Result<PreparedCharge, GatewayError> {
        let subject: SubjectKey =
            subject_key
                .parse()
                .map_err(|err: super::context::InvalidSubjectKey| GatewayError::InvalidRequest {
                    reason: err.to_string(),
                })?;
        let now = self.clock.now_unix();
        if !self.config.enabled {
            return Ok(PreparedCharge::balance(subject, now));
        }

        let user_id = relay.user_id;
        let found = self
            .store
            .run(move |conn| {
                let mut assignment = plans::active_assignment_for(conn, subject, now)?;
                if assignment.is_none() && user_id > 0 && subject != SubjectKey::user(user_id) {
                    assignment = plans::active_assignment_for(conn, SubjectKey::user(user_id), now)?;
                }
                let Some(assignment) = assignment else {
                    return Ok(None);
                };
                let Some(plan) = plans::load_plan(conn, assignment.plan_id)? else {
                    return Ok(None);
                };
                let (cycle_start, cycle_end) = cycle_window(plan.cycle_type, now);
                let consumed = plans::load_counter(conn, assignment.id, plan.quota_metric, cycle_start)?
                    .map(|counter| counter.consumed_amount)
                    .unwrap_or(0);
                Ok(Some((assignment, plan, cycle_start, cycle_end, consumed)))
            })
            .await?;

        let Some((assignment, plan, cycle_start, cycle_end, consumed)) = found else {
            return Ok(PreparedCharge::balance(subject, now));
        };

        let requested = resolve_mode(
            relay.billing_mode_override,
            self.config.default_mode,
            assignment.billing_mode,
        );
        let mode = match requested {
            BillingMode::Auto | BillingMode::Fallback => BillingMode::Fallback,
            BillingMode::Plan if self.config.auto_fallback => BillingMode::Fallback,
            other => other,
        };
        let allowance = allowance(&plan, assignment.effective_rollover(now), consumed);
        debug!(
            subject = %subject,
            assignment_id = assignment.id,
            mode = mode.as_str(),
            allowance,
            "billing charge prepared"
        );
        Ok(PreparedCharge {
            subject,
            mode,
            metric: plan.quota_metric,
            assignment: Some(assignment),
            plan: Some(plan),
            cycle_start,
            cycle_end,
            allowance,
        })
    }

    pub async fn commit_charge(
        &self,
        prepared: &PreparedCharge,
        params: &CommitParams,
    ) -> Result<ChargeOutcome, GatewayError> {
        let now = self.clock.now_unix();
        let subject_hash =
            anonymize_subject(&self.anonymization_secret, &prepared.subject.to_string());
        let prepared = prepared.clone();
        let params = params.clone();

        let outcome = self
            .store
            .transact(move |tx| commit_in_tx(tx, &prepared, &params, &subject_hash, now))
            .await?;

        if outcome.idempotent {
            debug!(request_id = %outcome.log.request_id, "billing commit replayed");
        } else {
            debug!(
                request_id = %outcome.log.request_id,
                mode = outcome.mode.as_str(),
                "billing charge committed"
            );
        }
        Ok(outcome)
    }

    /// Deletes the audit row of an uncommitted or failed dispatch.
    pub async fn rollback_charge(&self, request_id: &str) -> Result<bool, GatewayError> {
        let removed = self.store.delete_request_log(request_id).await?;
        if removed {
            info!(request_id, "billing charge rolled back");
        }
        Ok(removed)
    }
}

/// Relay override wins; a global default of plan or fallback replaces the
/// assignment's own mode.
fn resolve_mode(
    relay_override: Option<BillingMode>,
    global_default: BillingMode,
    assignment_mode: BillingMode,
) -> BillingMode {
    match (relay_override, global_default) {
        (Some(mode), _) => mode,
        (None, BillingMode::Plan | BillingMode::Fallback) => global_default,
        (None, _) => assignment_mode,
    }
}

fn commit_in_tx(
    tx: &rusqlite::Connection,
    prepared: &PreparedCharge,
    params: &CommitParams,
    subject_hash: &str,
    now: i64,
) -> Result<ChargeOutcome, StoreError> {
    let restricted = prepared.mode != BillingMode::Balance
        && prepared
            .plan
            .as_ref()
            .is_some_and(|plan| !plan.allows_model(&params.model_alias));
    if restricted {
        return Err(StoreError::ModelRestricted {
            model: params.model_alias.clone(),
        });
    }

    let amount = params.amount.max(0);
    let mut metadata = json!({
        "mode": prepared.mode.as_str(),
        "amount": amount,
        "subject_key": prepared.subject.to_string(),
        "engine": "heimdall",
        "idempotent": false,
    });
    let log = RequestLogRecord {
        id: 0,
        request_id: params.request_id.clone(),
        occurred_at: now,
        subject_type: prepared.subject.subject_type.as_str().to_string(),
        anonymized_subject_hash: subject_hash.to_string(),
        plan_id: prepared.plan.as_ref().map(|plan| plan.id),
        plan_assignment_id: prepared.assignment.as_ref().map(|assignment| assignment.id),
        model_alias: params.model_alias.clone(),
        upstream_provider: params.upstream_provider.clone(),
        usage_metric: prepared.metric,
        prompt_tokens: params.prompt_tokens,
        completion_tokens: params.completion_tokens,
        total_tokens: params.prompt_tokens.saturating_add(params.completion_tokens),
        latency_ms: params.latency_ms,
        metadata: metadata.clone(),
        is_public: params.is_public,
    };

    let log_id = match request_logs::insert_request_log(tx, &log)? {
        LogInsert::Inserted(id) => id,
        LogInsert::Existing(existing) => {
            let mode = existing.mode().unwrap_or(BillingMode::Balance);
            return Ok(ChargeOutcome {
                log: existing,
                idempotent: true,
                mode,
            });
        }
    };

    let mut mode = match prepared.mode {
        BillingMode::Plan | BillingMode::Balance => prepared.mode,
        BillingMode::Auto | BillingMode::Fallback => {
            if prepared.allowance > 0 {
                BillingMode::Plan
            } else {
                BillingMode::Balance
            }
        }
    };

    if mode == BillingMode::Plan {
        mode = charge_plan(tx, prepared, amount, now)?;
        if mode == BillingMode::Balance {
            metadata["fallback"] = json!(true);
        }
    }
    if mode == BillingMode::Balance {
        charge_balance(tx, params, amount)?;
    }
    if mode != prepared.mode {
        metadata["mode"] = json!(mode.as_str());
        request_logs::set_request_log_metadata(tx, log_id, &metadata)?;
    }

    let stored = request_logs::load_request_log(tx, &params.request_id)?
        .ok_or_else(|| StoreError::not_found("request log", &params.request_id))?;
    Ok(ChargeOutcome {
        log: stored,
        idempotent: false,
        mode,
    })
}

/// Increments the cycle counter. Returns `Balance` when the plan is short and the
/// assignment (or the prepared fallback mode) allows falling back.
fn charge_plan(
    tx: &rusqlite::Connection,
    prepared: &PreparedCharge,
    amount: i64,
    now: i64,
) -> Result<BillingMode, StoreError> {
    let (Some(assignment), Some(plan)) = (prepared.assignment.as_ref(), prepared.plan.as_ref())
    else {
        return Ok(BillingMode::Balance);
    };
    // Re-read under the write lock; the prepared snapshot may be stale.
    let assignment = plans::load_assignment(tx, assignment.id)?.unwrap_or_else(|| assignment.clone());
    let counter = plans::ensure_counter(
        tx,
        assignment.id,
        plan.quota_metric,
        prepared.cycle_start,
        prepared.cycle_end,
        now,
    )?;
    let remaining = allowance(
        plan,
        assignment.effective_rollover(now),
        counter.consumed_amount,
    );
    if remaining < amount {
        if assignment.auto_fallback_enabled || prepared.mode == BillingMode::Fallback {
            return Ok(BillingMode::Balance);
        }
        return Err(StoreError::PlanExhausted {
            assignment_id: assignment.id,
            metric: plan.quota_metric.as_str().to_string(),
            remaining,
            needed: amount,
        });
    }
    plans::increment_counter(tx, counter.id, amount, now)?;
    Ok(BillingMode::Plan)
}

fn charge_balance(
    tx: &rusqlite::Connection,
    params: &CommitParams,
    amount: i64,
) -> Result<(), StoreError> {
    if amount == 0 {
        return Ok(());
    }
    let token_id = params.token_id.unwrap_or(0);
    let user = accounts::load_user(tx, params.user_id)?
        .ok_or_else(|| StoreError::not_found("user", params.user_id))?;
    if user.quota < amount || !accounts::deduct_user_quota(tx, user.id, amount)? {
        return Err(StoreError::BalanceInsufficient {
            user_id: user.id,
            token_id,
            remaining: user.quota,
            needed: amount,
        });
    }

    let Some(token_id) = params.token_id else {
        return Ok(());
    };
    if params.unlimited_quota || params.is_playground {
        return Ok(());
    }
    let token = accounts::load_token(tx, token_id)?
        .ok_or_else(|| StoreError::not_found("token", token_id))?;
    if token.unlimited_quota {
        return Ok(());
    }
    if token.remain_quota < amount || !accounts::deduct_token_quota(tx, token_id, amount)? {
        return Err(StoreError::BalanceInsufficient {
            user_id: user.id,
            token_id,
            remaining: token.remain_quota,
            needed: amount,
        });
    }
    Ok(())
}
