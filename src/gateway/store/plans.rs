use rusqlite::OptionalExtension;

use super::{SqliteStore, StoreError, json_to_list, list_to_json};
use crate::gateway::context::SubjectKey;
use crate::gateway::store_types::{
    BillingMode, CycleType, PlanAssignmentRecord, PlanRecord, QuotaMetric, RolloverPolicy,
    UsageCounterRecord,
};

const PLAN_COLUMNS: &str = "id, code, name, cycle_type, cycle_duration_days, quota_metric, \
     quota_amount, allow_carry_over, carry_limit_percent, allowed_models, is_active";

const ASSIGNMENT_COLUMNS: &str = "id, subject_type, subject_id, plan_id, billing_mode, \
     activated_at, deactivated_at, expires_at, auto_fallback_enabled, rollover_amount, \
     rollover_policy, rollover_expires_at";

const COUNTER_COLUMNS: &str =
    "id, plan_assignment_id, metric, cycle_start, cycle_end, consumed_amount";

fn plan_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PlanRecord> {
    let cycle_type: String = row.get(3)?;
    let quota_metric: String = row.get(5)?;
    let allowed_models: String = row.get(9)?;
    Ok(PlanRecord {
        id: row.get(0)?,
        code: row.get(1)?,
        name: row.get(2)?,
        cycle_type: CycleType::parse(&cycle_type).unwrap_or(CycleType::Monthly),
        cycle_duration_days: row.get(4)?,
        quota_metric: QuotaMetric::parse(&quota_metric).unwrap_or(QuotaMetric::Requests),
        quota_amount: row.get(6)?,
        allow_carry_over: row.get(7)?,
        carry_limit_percent: row.get(8)?,
        allowed_models: json_to_list(&allowed_models),
        is_active: row.get(10)?,
    })
}

fn assignment_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PlanAssignmentRecord> {
    let billing_mode: String = row.get(4)?;
    let rollover_policy: String = row.get(10)?;
    Ok(PlanAssignmentRecord {
        id: row.get(0)?,
        subject_type: row.get(1)?,
        subject_id: row.get(2)?,
        plan_id: row.get(3)?,
        billing_mode: BillingMode::parse(&billing_mode).unwrap_or(BillingMode::Plan),
        activated_at: row.get(5)?,
        deactivated_at: row.get(6)?,
        expires_at: row.get(7)?,
        auto_fallback_enabled: row.get(8)?,
        rollover_amount: row.get(9)?,
        rollover_policy: RolloverPolicy::parse(&rollover_policy).unwrap_or(RolloverPolicy::None),
        rollover_expires_at: row.get(11)?,
    })
}

fn counter_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UsageCounterRecord> {
    let metric: String = row.get(2)?;
    Ok(UsageCounterRecord {
        id: row.get(0)?,
        plan_assignment_id: row.get(1)?,
        metric: QuotaMetric::parse(&metric).unwrap_or(QuotaMetric::Requests),
        cycle_start: row.get(3)?,
        cycle_end: row.get(4)?,
        consumed_amount: row.get(5)?,
    })
}

pub(crate) fn load_plan(
    conn: &rusqlite::Connection,
    plan_id: i64,
) -> Result<Option<PlanRecord>, StoreError> {
    let plan = conn
        .query_row(
            &format!("SELECT {PLAN_COLUMNS} FROM plans WHERE id=?1"),
            rusqlite::params![plan_id],
            plan_from_row,
        )
        .optional()?;
    Ok(plan)
}

pub(crate) fn load_assignment(
    conn: &rusqlite::Connection,
    assignment_id: i64,
) -> Result<Option<PlanAssignmentRecord>, StoreError> {
    let assignment = conn
        .query_row(
            &format!("SELECT {ASSIGNMENT_COLUMNS} FROM plan_assignments WHERE id=?1"),
            rusqlite::params![assignment_id],
            assignment_from_row,
        )
        .optional()?;
    Ok(assignment)
}

/// Most recently activated assignment whose window contains `now`.
pub(crate) fn active_assignment_for(
    conn: &rusqlite::Connection,
    subject: SubjectKey,
    now: i64,
) -> Result<Option<PlanAssignmentRecord>, StoreError> {
    let assignment = conn
        .query_row(
            &format!(
                "SELECT {ASSIGNMENT_COLUMNS} FROM plan_assignments
                 WHERE subject_type=?1 AND subject_id=?2 AND activated_at <= ?3
                   AND (deactivated_at IS NULL OR deactivated_at > ?3)
                   AND (expires_at IS NULL OR expires_at > ?3)
                 ORDER BY activated_at DESC, id DESC LIMIT 1"
            ),
            rusqlite::params![subject.subject_type.as_str(), subject.id, now],
            assignment_from_row,
        )
        .optional()?;
    Ok(assignment)
}

pub(crate) fn insert_assignment_row(
    conn: &rusqlite::Connection,
    assignment: &PlanAssignmentRecord,
) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO plan_assignments (subject_type, subject_id, plan_id, billing_mode,
             activated_at, deactivated_at, expires_at, auto_fallback_enabled, rollover_amount,
             rollover_policy, rollover_expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        rusqlite::params![
            assignment.subject_type,
            assignment.subject_id,
            assignment.plan_id,
            assignment.billing_mode.as_str(),
            assignment.activated_at,
            assignment.deactivated_at,
            assignment.expires_at,
            assignment.auto_fallback_enabled,
            assignment.rollover_amount,
            assignment.rollover_policy.as_str(),
            assignment.rollover_expires_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn load_counter(
    conn: &rusqlite::Connection,
    assignment_id: i64,
    metric: QuotaMetric,
    cycle_start: i64,
) -> Result<Option<UsageCounterRecord>, StoreError> {
    let counter = conn
        .query_row(
            &format!(
                "SELECT {COUNTER_COLUMNS} FROM usage_counters
                 WHERE plan_assignment_id=?1 AND metric=?2 AND cycle_start=?3"
            ),
            rusqlite::params![assignment_id, metric.as_str(), cycle_start],
            counter_from_row,
        )
        .optional()?;
    Ok(counter)
}

/// Creates the counter for the window if missing and returns it.
pub(crate) fn ensure_counter(
    conn: &rusqlite::Connection,
    assignment_id: i64,
    metric: QuotaMetric,
    cycle_start: i64,
    cycle_end: i64,
    now: i64,
) -> Result<UsageCounterRecord, StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO usage_counters
             (plan_assignment_id, metric, cycle_start, cycle_end, consumed_amount, updated_at)
         VALUES (?1, ?2, ?3, ?4, 0, ?5)",
        rusqlite::params![assignment_id, metric.as_str(), cycle_start, cycle_end, now],
    )?;
    load_counter(conn, assignment_id, metric, cycle_start)?
        .ok_or_else(|| StoreError::not_found("usage counter", assignment_id))
}

pub(crate) fn increment_counter(
    conn: &rusqlite::Connection,
    counter_id: i64,
    amount: i64,
    now: i64,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE usage_counters SET consumed_amount = consumed_amount + ?2, updated_at=?3
         WHERE id=?1",
        rusqlite::params![counter_id, amount, now],
    )?;
    Ok(())
}

pub(crate) fn expired_counters(
    conn: &rusqlite::Connection,
    now: i64,
    limit: usize,
) -> Result<Vec<UsageCounterRecord>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COUNTER_COLUMNS} FROM usage_counters WHERE cycle_end <= ?1
         ORDER BY cycle_end, id LIMIT ?2"
    ))?;
    let rows = stmt.query_map(
        rusqlite::params![now, super::u64_to_i64(limit as u64)],
        counter_from_row,
    )?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub(crate) fn reset_counter(
    conn: &rusqlite::Connection,
    counter_id: i64,
    cycle_start: i64,
    cycle_end: i64,
    now: i64,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE usage_counters SET cycle_start=?2, cycle_end=?3, consumed_amount=0, updated_at=?4
         WHERE id=?1",
        rusqlite::params![counter_id, cycle_start, cycle_end, now],
    )?;
    Ok(())
}

pub(crate) fn delete_counter(conn: &rusqlite::Connection, counter_id: i64) -> Result<(), StoreError> {
    conn.execute(
        "DELETE FROM usage_counters WHERE id=?1",
        rusqlite::params![counter_id],
    )?;
    Ok(())
}

pub(crate) fn set_rollover(
    conn: &rusqlite::Connection,
    assignment_id: i64,
    amount: i64,
    policy: RolloverPolicy,
    expires_at: Option<i64>,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE plan_assignments SET rollover_amount=?2, rollover_policy=?3, rollover_expires_at=?4
         WHERE id=?1",
        rusqlite::params![assignment_id, amount, policy.as_str(), expires_at],
    )?;
    Ok(())
}

impl SqliteStore {
    /// Inserts a plan; `id` on the record is ignored.
    pub async fn insert_plan(&self, plan: &PlanRecord) -> Result<i64, StoreError> {
        let plan = plan.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO plans (code, name, cycle_type, cycle_duration_days, quota_metric,
                     quota_amount, allow_carry_over, carry_limit_percent, allowed_models, is_active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    plan.code,
                    plan.name,
                    plan.cycle_type.as_str(),
                    plan.cycle_duration_days,
                    plan.quota_metric.as_str(),
                    plan.quota_amount.max(0),
                    plan.allow_carry_over,
                    plan.carry_limit_percent.clamp(0, 100),
                    list_to_json(&plan.allowed_models),
                    plan.is_active,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn get_plan(&self, plan_id: i64) -> Result<Option<PlanRecord>, StoreError> {
        self.run(move |conn| load_plan(conn, plan_id)).await
    }

    /// Inserts an assignment; `id` on the record is ignored.
    pub async fn insert_assignment(
        &self,
        assignment: &PlanAssignmentRecord,
    ) -> Result<i64, StoreError> {
        let assignment = assignment.clone();
        self.run(move |conn| insert_assignment_row(conn, &assignment))
            .await
    }

    pub async fn get_assignment(
        &self,
        assignment_id: i64,
    ) -> Result<Option<PlanAssignmentRecord>, StoreError> {
        self.run(move |conn| load_assignment(conn, assignment_id))
            .await
    }

    pub async fn active_assignment(
        &self,
        subject: SubjectKey,
        now: i64,
    ) -> Result<Option<PlanAssignmentRecord>, StoreError> {
        self.run(move |conn| active_assignment_for(conn, subject, now))
            .await
    }

    pub async fn get_counter(
        &self,
        assignment_id: i64,
        metric: QuotaMetric,
        cycle_start: i64,
    ) -> Result<Option<UsageCounterRecord>, StoreError> {
        self.run(move |conn| load_counter(conn, assignment_id, metric, cycle_start))
            .await
    }

    pub async fn list_counters(
        &self,
        assignment_id: i64,
    ) -> Result<Vec<UsageCounterRecord>, StoreError> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COUNTER_COLUMNS} FROM usage_counters WHERE plan_assignment_id=?1
                 ORDER BY cycle_start"
            ))?;
            let rows = stmt.query_map(rusqlite::params![assignment_id], counter_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    /// Stamps `deactivated_at` on assignments whose `expires_at` has passed.
    pub async fn expire_assignments(&self, now: i64) -> Result<usize, StoreError> {
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE plan_assignments SET deactivated_at = expires_at
                 WHERE deactivated_at IS NULL AND expires_at IS NOT NULL AND expires_at <= ?1",
                rusqlite::params![now],
            )?;
            Ok(changed)
        })
        .await
    }

    /// Creates or tops up the counter of a cycle window, used when importing usage.
    pub async fn seed_counter(
        &self,
        assignment_id: i64,
        metric: QuotaMetric,
        cycle_start: i64,
        cycle_end: i64,
        consumed: i64,
    ) -> Result<UsageCounterRecord, StoreError> {
        self.transact(move |tx| {
            let counter =
                ensure_counter(tx, assignment_id, metric, cycle_start, cycle_end, cycle_start)?;
            increment_counter(tx, counter.id, consumed, cycle_start)?;
            load_counter(tx, assignment_id, metric, cycle_start)?
                .ok_or_else(|| StoreError::not_found("usage counter", counter.id))
        })
        .await
    }
}
