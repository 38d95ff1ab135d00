use rusqlite::OptionalExtension;

use super::{SqliteStore, StoreError, json_to_value};
use crate::gateway::store_types::{QuotaMetric, RequestLogRecord};

const LOG_COLUMNS: &str = "id, request_id, occurred_at, subject_type, anonymized_subject_hash, \
     plan_id, plan_assignment_id, model_alias, upstream_provider, usage_metric, prompt_tokens, \
     completion_tokens, total_tokens, latency_ms, metadata, is_public";

pub(crate) enum LogInsert {
    Inserted(i64),
    Existing(RequestLogRecord),
}

fn log_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RequestLogRecord> {
    let usage_metric: String = row.get(9)?;
    let metadata: String = row.get(14)?;
    Ok(RequestLogRecord {
        id: row.get(0)?,
        request_id: row.get(1)?,
        occurred_at: row.get(2)?,
        subject_type: row.get(3)?,
        anonymized_subject_hash: row.get(4)?,
        plan_id: row.get(5)?,
        plan_assignment_id: row.get(6)?,
        model_alias: row.get(7)?,
        upstream_provider: row.get(8)?,
        usage_metric: QuotaMetric::parse(&usage_metric).unwrap_or(QuotaMetric::Requests),
        prompt_tokens: row.get(10)?,
        completion_tokens: row.get(11)?,
        total_tokens: row.get(12)?,
        latency_ms: row.get(13)?,
        metadata: json_to_value(&metadata),
        is_public: row.get(15)?,
    })
}

pub(crate) fn load_request_log(
    conn: &rusqlite::Connection,
    request_id: &str,
) -> Result<Option<RequestLogRecord>, StoreError> {
    let log = conn
        .query_row(
            &format!("SELECT {LOG_COLUMNS} FROM request_logs WHERE request_id=?1"),
            rusqlite::params![request_id],
            log_from_row,
        )
        .optional()?;
    Ok(log)
}

/// Inserts unless the request id already exists, in which case the stored row wins.
pub(crate) fn insert_request_log(
    conn: &rusqlite::Connection,
    log: &RequestLogRecord,
) -> Result<LogInsert, StoreError> {
    let metadata = serde_json::to_string(&log.metadata)?;
    let changed = conn.execute(
        "INSERT OR IGNORE INTO request_logs (request_id, occurred_at, subject_type,
             anonymized_subject_hash, plan_id, plan_assignment_id, model_alias, upstream_provider,
             usage_metric, prompt_tokens, completion_tokens, total_tokens, latency_ms, metadata,
             is_public)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        rusqlite::params![
            log.request_id,
            log.occurred_at,
            log.subject_type,
            log.anonymized_subject_hash,
            log.plan_id,
            log.plan_assignment_id,
            log.model_alias,
            log.upstream_provider,
            log.usage_metric.as_str(),
            log.prompt_tokens,
            log.completion_tokens,
            log.total_tokens,
            log.latency_ms,
            metadata,
            log.is_public,
        ],
    )?;
    if changed == 1 {
        return Ok(LogInsert::Inserted(conn.last_insert_rowid()));
    }
    let existing = load_request_log(conn, &log.request_id)?
        .ok_or_else(|| StoreError::not_found("request log", &log.request_id))?;
    Ok(LogInsert::Existing(existing))
}

pub(crate) fn set_request_log_metadata(
    conn: &rusqlite::Connection,
    log_id: i64,
    metadata: &serde_json::Value,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE request_logs SET metadata=?2 WHERE id=?1",
        rusqlite::params![log_id, serde_json::to_string(metadata)?],
    )?;
    Ok(())
}

impl SqliteStore {
    pub async fn get_request_log(
        &self,
        request_id: &str,
    ) -> Result<Option<RequestLogRecord>, StoreError> {
        let request_id = request_id.to_string();
        self.run(move |conn| load_request_log(conn, &request_id))
            .await
    }

    pub async fn delete_request_log(&self, request_id: &str) -> Result<bool, StoreError> {
        let request_id = request_id.to_string();
        self.run(move |conn| {
            let changed = conn.execute(
                "DELETE FROM request_logs WHERE request_id=?1",
                rusqlite::params![request_id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    pub async fn delete_public_logs_before(&self, cutoff: i64) -> Result<usize, StoreError> {
        self.run(move |conn| {
            let changed = conn.execute(
                "DELETE FROM request_logs WHERE is_public=1 AND occurred_at < ?1",
                rusqlite::params![cutoff],
            )?;
            Ok(changed)
        })
        .await
    }

    pub async fn count_request_logs(&self) -> Result<u64, StoreError> {
        self.run(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM request_logs", [], |row| row.get(0))?;
            Ok(super::i64_to_u64(count))
        })
        .await
    }

    /// Charged amount summed over the audit rows of the given subject hashes in
    /// `[since, until)`. Scheduler bookkeeping rows are not charges.
    pub async fn charged_amount(
        &self,
        subject_hashes: Vec<String>,
        since: i64,
        until: i64,
    ) -> Result<i64, StoreError> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT COALESCE(SUM(CAST(json_extract(metadata, '$.amount') AS INTEGER)), 0)
                 FROM request_logs
                 WHERE anonymized_subject_hash=?1 AND occurred_at >= ?2 AND occurred_at < ?3
                   AND json_extract(metadata, '$.engine')='heimdall'",
            )?;
            let mut total = 0i64;
            for hash in &subject_hashes {
                let amount: i64 =
                    stmt.query_row(rusqlite::params![hash, since, until], |row| row.get(0))?;
                total = total.saturating_add(amount);
            }
            Ok(total)
        })
        .await
    }
}

