//! Rolls plan usage counters into their next cycle.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::gateway::billing::{carry_over_amount, cycle_window};
use crate::gateway::crypto::anonymize_subject;
use crate::gateway::store::request_logs::{self, LogInsert};
use crate::gateway::store::{SqliteStore, StoreError, plans};
use crate::gateway::store_types::{RequestLogRecord, RolloverPolicy, UsageCounterRecord};

const BATCH: usize = 200;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleResetReport {
    pub assignments_expired: usize,
    pub counters_reset: usize,
    pub counters_carried: usize,
    pub counters_deleted: usize,
    pub failures: usize,
}

#[derive(Debug, PartialEq, Eq)]
enum CounterOutcome {
    Skipped,
    Deleted,
    Reset,
    Carried,
}

/// Expires finished assignments, then moves every counter with `cycle_end <= now` into
/// the window containing `now`. Running twice at the same instant changes nothing.
pub async fn reset_expired_cycles(
    store: &SqliteStore,
    secret: &str,
    now: i64,
    shutdown: &CancellationToken,
) -> Result<CycleResetReport, StoreError> {
    let mut report = CycleResetReport {
        assignments_expired: store.expire_assignments(now).await?,
        ..CycleResetReport::default()
    };

    loop {
        if shutdown.is_cancelled() {
            break;
        }
        let batch = store
            .run(move |conn| plans::expired_counters(conn, now, BATCH))
            .await?;
        if batch.is_empty() {
            break;
        }

        let mut progressed = false;
        for counter in batch {
            if shutdown.is_cancelled() {
                break;
            }
            let counter_id = counter.id;
            let secret = secret.to_string();
            match store
                .transact(move |tx| roll_counter(tx, &counter, &secret, now))
                .await
            {
                Ok(outcome) => {
                    progressed = true;
                    match outcome {
                        CounterOutcome::Skipped => {}
                        CounterOutcome::Deleted => report.counters_deleted += 1,
                        CounterOutcome::Reset => report.counters_reset += 1,
                        CounterOutcome::Carried => {
                            report.counters_reset += 1;
                            report.counters_carried += 1;
                        }
                    }
                }
                Err(err) => {
                    report.failures += 1;
                    tracing::warn!(counter_id, error = %err, "usage counter reset failed");
                }
            }
        }
        if !progressed {
            break;
        }
    }

    if report.counters_reset + report.counters_deleted + report.assignments_expired > 0 {
        tracing::info!(
            expired = report.assignments_expired,
            reset = report.counters_reset,
            carried = report.counters_carried,
            deleted = report.counters_deleted,
            "plan cycle reset finished"
        );
    }
    Ok(report)
}

fn roll_counter(
    conn: &rusqlite::Connection,
    counter: &UsageCounterRecord,
    secret: &str,
    now: i64,
) -> Result<CounterOutcome, StoreError> {
    let Some(current) = plans::load_counter(
        conn,
        counter.plan_assignment_id,
        counter.metric,
        counter.cycle_start,
    )?
    else {
        return Ok(CounterOutcome::Skipped);
    };
    if current.cycle_end > now {
        return Ok(CounterOutcome::Skipped);
    }

    let assignment = plans::load_assignment(conn, current.plan_assignment_id)?;
    let plan = match &assignment {
        Some(assignment) => plans::load_plan(conn, assignment.plan_id)?,
        None => None,
    };
    let (Some(assignment), Some(plan)) = (assignment, plan) else {
        plans::delete_counter(conn, current.id)?;
        return Ok(CounterOutcome::Deleted);
    };

    let (start, end) = cycle_window(plan.cycle_type, now);
    if plans::load_counter(conn, assignment.id, current.metric, start)?.is_some() {
        plans::delete_counter(conn, current.id)?;
        return Ok(CounterOutcome::Deleted);
    }

    // Rollover granted for the finished cycle was valid during it.
    let rollover = assignment.effective_rollover(current.cycle_start);
    let (event, carried) = if plan.allow_carry_over {
        let carried = carry_over_amount(&plan, rollover, current.consumed_amount);
        plans::set_rollover(conn, assignment.id, carried, RolloverPolicy::Cap, Some(end))?;
        ("carry_over", carried)
    } else {
        plans::set_rollover(conn, assignment.id, 0, RolloverPolicy::None, None)?;
        ("reset", 0)
    };
    plans::reset_counter(conn, current.id, start, end, now)?;

    let subject_key = format!("{}:{}", assignment.subject_type, assignment.subject_id);
    let log = RequestLogRecord {
        id: 0,
        request_id: format!(
            "{event}:{}:{}:{start}",
            assignment.id,
            current.metric.as_str()
        ),
        occurred_at: now,
        subject_type: assignment.subject_type.clone(),
        anonymized_subject_hash: anonymize_subject(secret, &subject_key),
        plan_id: Some(plan.id),
        plan_assignment_id: Some(assignment.id),
        model_alias: String::new(),
        upstream_provider: String::new(),
        usage_metric: current.metric,
        prompt_tokens: 0,
        completion_tokens: 0,
        total_tokens: 0,
        latency_ms: 0,
        metadata: json!({
            "event": event,
            "engine": "scheduler",
            "previous_cycle_start": current.cycle_start,
            "previous_consumed": current.consumed_amount,
            "rollover": carried,
            "cycle_start": start,
            "cycle_end": end,
        }),
        is_public: false,
    };
    if let LogInsert::Existing(_) = request_logs::insert_request_log(conn, &log)? {
        tracing::debug!(request_id = %log.request_id, "cycle reset already recorded");
    }

    Ok(if plan.allow_carry_over {
        CounterOutcome::Carried
    } else {
        CounterOutcome::Reset
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::store_types::{
        BillingMode, CycleType, PlanAssignmentRecord, PlanRecord, QuotaMetric,
    };

    // 2024-02-15T13:45:00Z
    const MID_FEB: i64 = 1_708_004_700;
    // 2024-01-01T00:00:00Z .. 2024-02-01T00:00:00Z
    const JAN_START: i64 = 1_704_067_200;
    const FEB_START: i64 = 1_706_745_600;
    const MAR_START: i64 = 1_709_251_200;

    async fn setup(carry: bool) -> (tempfile::TempDir, SqliteStore, i64) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("gateway.sqlite"));
        let plan_id = store
            .insert_plan(&PlanRecord {
                id: 0,
                code: "pro".to_string(),
                name: "Pro".to_string(),
                cycle_type: CycleType::Monthly,
                cycle_duration_days: 0,
                quota_metric: QuotaMetric::Requests,
                quota_amount: 100,
                allow_carry_over: carry,
                carry_limit_percent: 50,
                allowed_models: Vec::new(),
                is_active: true,
            })
            .await
            .expect("plan");
        let assignment_id = store
            .insert_assignment(&PlanAssignmentRecord {
                id: 0,
                subject_type: "user".to_string(),
                subject_id: 1,
                plan_id,
                billing_mode: BillingMode::Plan,
                activated_at: JAN_START,
                deactivated_at: None,
                expires_at: None,
                auto_fallback_enabled: false,
                rollover_amount: 0,
                rollover_policy: RolloverPolicy::None,
                rollover_expires_at: None,
            })
            .await
            .expect("assignment");
        store
            .seed_counter(assignment_id, QuotaMetric::Requests, JAN_START, FEB_START, 40)
            .await
            .expect("counter");
        (dir, store, assignment_id)
    }

    #[tokio::test]
    async fn carry_over_moves_leftover_into_rollover() {
        let (_dir, store, assignment_id) = setup(true).await;
        let shutdown = CancellationToken::new();

        let report = reset_expired_cycles(&store, "secret", MID_FEB, &shutdown)
            .await
            .expect("reset");
        assert_eq!(report.counters_reset, 1);
        assert_eq!(report.counters_carried, 1);

        let assignment = store
            .get_assignment(assignment_id)
            .await
            .expect("get")
            .expect("assignment");
        assert_eq!(assignment.rollover_amount, 30);
        assert_eq!(assignment.rollover_policy, RolloverPolicy::Cap);
        assert_eq!(assignment.rollover_expires_at, Some(MAR_START));

        let counter = store
            .get_counter(assignment_id, QuotaMetric::Requests, FEB_START)
            .await
            .expect("get")
            .expect("counter");
        assert_eq!(counter.consumed_amount, 0);
        assert_eq!(counter.cycle_end, MAR_START);

        let log = store
            .get_request_log(&format!("carry_over:{assignment_id}:requests:{FEB_START}"))
            .await
            .expect("get")
            .expect("log");
        assert_eq!(log.metadata["rollover"], 30);

        let again = reset_expired_cycles(&store, "secret", MID_FEB, &shutdown)
            .await
            .expect("reset");
        assert_eq!(again, CycleResetReport::default());
        assert_eq!(store.count_request_logs().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn reset_without_carry_clears_rollover() {
        let (_dir, store, assignment_id) = setup(false).await;
        let report = reset_expired_cycles(&store, "secret", MID_FEB, &CancellationToken::new())
            .await
            .expect("reset");
        assert_eq!(report.counters_reset, 1);
        assert_eq!(report.counters_carried, 0);
        let assignment = store
            .get_assignment(assignment_id)
            .await
            .expect("get")
            .expect("assignment");
        assert_eq!(assignment.rollover_amount, 0);
        assert_eq!(assignment.rollover_policy, RolloverPolicy::None);
        assert!(store
            .get_request_log(&format!("reset:{assignment_id}:requests:{FEB_START}"))
            .await
            .expect("get")
            .is_some());
    }

    #[tokio::test]
    async fn stale_counter_is_dropped_when_next_window_exists() {
        let (_dir, store, assignment_id) = setup(true).await;
        store
            .seed_counter(assignment_id, QuotaMetric::Requests, FEB_START, MAR_START, 5)
            .await
            .expect("counter");
        let report = reset_expired_cycles(&store, "secret", MID_FEB, &CancellationToken::new())
            .await
            .expect("reset");
        assert_eq!(report.counters_deleted, 1);
        let counters = store.list_counters(assignment_id).await.expect("counters");
        assert_eq!(counters.len(), 1);
        assert_eq!(counters[0].consumed_amount, 5);
    }
}
