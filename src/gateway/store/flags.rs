use super::{SqliteStore, StoreError, json_to_list, json_to_value, list_to_json, u64_to_i64};
use crate::gateway::store_types::{FlagSeverity, RequestFlagRecord};

fn flag_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RequestFlagRecord> {
    let severity: String = row.get(6)?;
    let reasons: String = row.get(7)?;
    let metadata: String = row.get(10)?;
    Ok(RequestFlagRecord {
        id: row.get(0)?,
        request_id: row.get(1)?,
        subject_key: row.get(2)?,
        user_id: row.get(3)?,
        token_id: row.get(4)?,
        reason: row.get(5)?,
        severity: FlagSeverity::parse(&severity).unwrap_or(FlagSeverity::Violation),
        reasons: json_to_list(&reasons),
        rerouted_model_alias: row.get(8)?,
        excluded_from_leaderboard: row.get(9)?,
        metadata: json_to_value(&metadata),
        created_at: row.get(11)?,
        ttl_at: row.get(12)?,
    })
}

impl SqliteStore {
    pub async fn insert_flag(&self, flag: &RequestFlagRecord) -> Result<i64, StoreError> {
        let flag = flag.clone();
        let metadata = serde_json::to_string(&flag.metadata)?;
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO request_flags (request_id, subject_key, user_id, token_id, reason,
                     severity, reasons, rerouted_model_alias, excluded_from_leaderboard, metadata,
                     created_at, ttl_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                rusqlite::params![
                    flag.request_id,
                    flag.subject_key,
                    flag.user_id,
                    flag.token_id,
                    flag.reason,
                    flag.severity.as_str(),
                    list_to_json(&flag.reasons),
                    flag.rerouted_model_alias,
                    flag.excluded_from_leaderboard,
                    metadata,
                    flag.created_at,
                    flag.ttl_at,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn list_flags(&self, limit: usize) -> Result<Vec<RequestFlagRecord>, StoreError> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, request_id, subject_key, user_id, token_id, reason, severity, reasons,
                        rerouted_model_alias, excluded_from_leaderboard, metadata, created_at,
                        ttl_at
                 FROM request_flags ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![u64_to_i64(limit as u64)],
                flag_from_row,
            )?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    /// Deletes flags past `ttl_at`, and flags without one created before
    /// `now - fallback_ttl_secs`.
    pub async fn delete_expired_flags(
        &self,
        now: i64,
        fallback_ttl_secs: i64,
    ) -> Result<usize, StoreError> {
        self.run(move |conn| {
            let changed = conn.execute(
                "DELETE FROM request_flags
                 WHERE (ttl_at IS NOT NULL AND ttl_at <= ?1)
                    OR (ttl_at IS NULL AND created_at < ?2)",
                rusqlite::params![now, now.saturating_sub(fallback_ttl_secs)],
            )?;
            Ok(changed)
        })
        .await
    }
}
