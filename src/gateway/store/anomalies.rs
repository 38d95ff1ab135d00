use rusqlite::OptionalExtension;

use super::{SqliteStore, StoreError, json_to_value, u64_to_i64};
use crate::gateway::store_types::{
    AnomalyBaselineRecord, AnomalySeverity, AnomalyStatus, EnforcementAction,
    SecurityAnomalyRecord,
};

const ANOMALY_COLUMNS: &str = "id, user_id, token_id, rule_type, severity, message, evidence, \
     risk_score, status, action_taken, detected_at, actioned_at, ttl_until, reviewed_by, \
     reviewed_at, review_decision, review_rationale";

fn anomaly_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SecurityAnomalyRecord> {
    let severity: String = row.get(4)?;
    let evidence: String = row.get(6)?;
    let status: String = row.get(8)?;
    let action_taken: Option<String> = row.get(9)?;
    Ok(SecurityAnomalyRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        token_id: row.get(2)?,
        rule_type: row.get(3)?,
        severity: AnomalySeverity::parse(&severity).unwrap_or(AnomalySeverity::Medium),
        message: row.get(5)?,
        evidence: json_to_value(&evidence),
        risk_score: row.get(7)?,
        status: AnomalyStatus::parse(&status).unwrap_or(AnomalyStatus::Pending),
        action_taken: action_taken.as_deref().and_then(EnforcementAction::parse),
        detected_at: row.get(10)?,
        actioned_at: row.get(11)?,
        ttl_until: row.get(12)?,
        reviewed_by: row.get(13)?,
        reviewed_at: row.get(14)?,
        review_decision: row.get(15)?,
        review_rationale: row.get(16)?,
    })
}

impl SqliteStore {
    /// Inserts an anomaly; `id` on the record is ignored.
    pub async fn insert_anomaly(&self, anomaly: &SecurityAnomalyRecord) -> Result<i64, StoreError> {
        let anomaly = anomaly.clone();
        let evidence = serde_json::to_string(&anomaly.evidence)?;
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO security_anomalies (user_id, token_id, rule_type, severity, message,
                     evidence, risk_score, status, action_taken, detected_at, actioned_at,
                     ttl_until)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                rusqlite::params![
                    anomaly.user_id,
                    anomaly.token_id,
                    anomaly.rule_type,
                    anomaly.severity.as_str(),
                    anomaly.message,
                    evidence,
                    anomaly.risk_score,
                    anomaly.status.as_str(),
                    anomaly.action_taken.map(|action| action.as_str()),
                    anomaly.detected_at,
                    anomaly.actioned_at,
                    anomaly.ttl_until,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Pending or actioned anomaly of the same rule detected at or after `since`.
    pub async fn recent_unresolved_anomaly(
        &self,
        user_id: i64,
        rule_type: &str,
        since: i64,
    ) -> Result<Option<SecurityAnomalyRecord>, StoreError> {
        let rule_type = rule_type.to_string();
        self.run(move |conn| {
            let anomaly = conn
                .query_row(
                    &format!(
                        "SELECT {ANOMALY_COLUMNS} FROM security_anomalies
                         WHERE user_id=?1 AND rule_type=?2 AND detected_at >= ?3
                           AND status IN ('pending', 'actioned')
                         ORDER BY detected_at DESC LIMIT 1"
                    ),
                    rusqlite::params![user_id, rule_type, since],
                    anomaly_from_row,
                )
                .optional()?;
            Ok(anomaly)
        })
        .await
    }

    pub async fn get_anomaly(&self, id: i64) -> Result<Option<SecurityAnomalyRecord>, StoreError> {
        self.run(move |conn| {
            let anomaly = conn
                .query_row(
                    &format!("SELECT {ANOMALY_COLUMNS} FROM security_anomalies WHERE id=?1"),
                    rusqlite::params![id],
                    anomaly_from_row,
                )
                .optional()?;
            Ok(anomaly)
        })
        .await
    }

    pub async fn list_anomalies(
        &self,
        status: Option<AnomalyStatus>,
        limit: usize,
    ) -> Result<Vec<SecurityAnomalyRecord>, StoreError> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ANOMALY_COLUMNS} FROM security_anomalies
                 WHERE (?1 IS NULL OR status=?1) ORDER BY detected_at DESC, id DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(
                rusqlite::params![status.map(|status| status.as_str()), u64_to_i64(limit as u64)],
                anomaly_from_row,
            )?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    /// Records the enforcement action; only pending anomalies move to `actioned`.
    pub async fn mark_anomaly_actioned(
        &self,
        id: i64,
        action: EnforcementAction,
        now: i64,
    ) -> Result<bool, StoreError> {
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE security_anomalies SET status='actioned', action_taken=?2, actioned_at=?3
                 WHERE id=?1 AND status='pending'",
                rusqlite::params![id, action.as_str(), now],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    pub async fn review_anomaly(
        &self,
        id: i64,
        status: AnomalyStatus,
        reviewer: i64,
        decision: &str,
        rationale: Option<&str>,
        now: i64,
    ) -> Result<(), StoreError> {
        let decision = decision.to_string();
        let rationale = rationale.map(|rationale| rationale.to_string());
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE security_anomalies SET status=?2, reviewed_by=?3, reviewed_at=?4,
                     review_decision=?5, review_rationale=?6
                 WHERE id=?1",
                rusqlite::params![id, status.as_str(), reviewer, now, decision, rationale],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found("anomaly", id));
            }
            Ok(())
        })
        .await
    }

    pub async fn delete_expired_anomalies(&self, now: i64) -> Result<usize, StoreError> {
        self.run(move |conn| {
            let changed = conn.execute(
                "DELETE FROM security_anomalies WHERE ttl_until IS NOT NULL AND ttl_until <= ?1",
                rusqlite::params![now],
            )?;
            Ok(changed)
        })
        .await
    }

    pub async fn upsert_baseline(&self, baseline: &AnomalyBaselineRecord) -> Result<(), StoreError> {
        let baseline = baseline.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO anomaly_baselines (user_id, metric_type, baseline_value,
                     window_size_seconds, sample_size, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(user_id, metric_type) DO UPDATE SET
                     baseline_value=excluded.baseline_value,
                     window_size_seconds=excluded.window_size_seconds,
                     sample_size=excluded.sample_size,
                     updated_at=excluded.updated_at",
                rusqlite::params![
                    baseline.user_id,
                    baseline.metric_type,
                    baseline.baseline_value,
                    baseline.window_size_seconds,
                    baseline.sample_size,
                    baseline.updated_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_baseline(
        &self,
        user_id: i64,
        metric_type: &str,
    ) -> Result<Option<AnomalyBaselineRecord>, StoreError> {
        let metric_type = metric_type.to_string();
        self.run(move |conn| {
            let baseline = conn
                .query_row(
                    "SELECT user_id, metric_type, baseline_value, window_size_seconds, sample_size,
                            updated_at
                     FROM anomaly_baselines WHERE user_id=?1 AND metric_type=?2",
                    rusqlite::params![user_id, metric_type],
                    |row| {
                        Ok(AnomalyBaselineRecord {
                            user_id: row.get(0)?,
                            metric_type: row.get(1)?,
                            baseline_value: row.get(2)?,
                            window_size_seconds: row.get(3)?,
                            sample_size: row.get(4)?,
                            updated_at: row.get(5)?,
                        })
                    },
                )
                .optional()?;
            Ok(baseline)
        })
        .await
    }
}
