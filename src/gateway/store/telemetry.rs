use super::{SqliteStore, StoreError, u64_to_i64};
use crate::gateway::store_types::{AuthAuditEntry, HeimdallRequestLog};

const HEIMDALL_COLUMNS: &str = "request_id, occurred_at, auth_key_fingerprint, normalized_url, \
     http_method, http_status, latency_ms, client_ip, country_code, region, city, \
     client_user_agent, client_device_id, request_size_bytes, response_size_bytes, param_digest, \
     sanitized_cookies, model_name, upstream_provider, error_type, error_message, user_id, \
     token_id, excluded_from_leaderboard";

fn heimdall_log_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HeimdallRequestLog> {
    let http_status: i64 = row.get(5)?;
    Ok(HeimdallRequestLog {
        request_id: row.get(0)?,
        occurred_at: row.get(1)?,
        auth_key_fingerprint: row.get(2)?,
        normalized_url: row.get(3)?,
        http_method: row.get(4)?,
        http_status: u16::try_from(http_status).unwrap_or(0),
        latency_ms: row.get(6)?,
        client_ip: row.get(7)?,
        country_code: row.get(8)?,
        region: row.get(9)?,
        city: row.get(10)?,
        client_user_agent: row.get(11)?,
        client_device_id: row.get(12)?,
        request_size_bytes: row.get(13)?,
        response_size_bytes: row.get(14)?,
        param_digest: row.get(15)?,
        sanitized_cookies: row.get(16)?,
        model_name: row.get(17)?,
        upstream_provider: row.get(18)?,
        error_type: row.get(19)?,
        error_message: row.get(20)?,
        user_id: row.get(21)?,
        token_id: row.get(22)?,
        excluded_from_leaderboard: row.get(23)?,
    })
}

impl SqliteStore {
    pub async fn insert_heimdall_log(&self, log: &HeimdallRequestLog) -> Result<(), StoreError> {
        self.insert_heimdall_logs(std::slice::from_ref(log)).await
    }

    pub async fn insert_heimdall_logs(
        &self,
        logs: &[HeimdallRequestLog],
    ) -> Result<(), StoreError> {
        let logs = logs.to_vec();
        self.transact(move |tx| {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO heimdall_request_logs ({HEIMDALL_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                         ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)"
            ))?;
            for log in &logs {
                stmt.execute(rusqlite::params![
                    log.request_id,
                    log.occurred_at,
                    log.auth_key_fingerprint,
                    log.normalized_url,
                    log.http_method,
                    log.http_status,
                    log.latency_ms,
                    log.client_ip,
                    log.country_code,
                    log.region,
                    log.city,
                    log.client_user_agent,
                    log.client_device_id,
                    log.request_size_bytes,
                    log.response_size_bytes,
                    log.param_digest,
                    log.sanitized_cookies,
                    log.model_name,
                    log.upstream_provider,
                    log.error_type,
                    log.error_message,
                    log.user_id,
                    log.token_id,
                    log.excluded_from_leaderboard,
                ])?;
            }
            Ok(())
        })
        .await
    }

    pub async fn count_heimdall_logs(&self, request_id: &str) -> Result<u64, StoreError> {
        let request_id = request_id.to_string();
        self.run(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM heimdall_request_logs WHERE request_id=?1",
                rusqlite::params![request_id],
                |row| row.get(0),
            )?;
            Ok(super::i64_to_u64(count))
        })
        .await
    }

    /// Telemetry rows of one user in `[since, until)`, oldest first.
    pub async fn heimdall_logs_for_user(
        &self,
        user_id: i64,
        since: i64,
        until: i64,
        limit: usize,
    ) -> Result<Vec<HeimdallRequestLog>, StoreError> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {HEIMDALL_COLUMNS} FROM heimdall_request_logs
                 WHERE user_id=?1 AND occurred_at >= ?2 AND occurred_at < ?3
                 ORDER BY occurred_at, id LIMIT ?4"
            ))?;
            let rows = stmt.query_map(
                rusqlite::params![user_id, since, until, u64_to_i64(limit as u64)],
                heimdall_log_from_row,
            )?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    /// Users with telemetry since `since`, ascending.
    pub async fn active_user_ids(&self, since: i64) -> Result<Vec<i64>, StoreError> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT user_id FROM heimdall_request_logs
                 WHERE user_id IS NOT NULL AND occurred_at >= ?1 ORDER BY user_id",
            )?;
            let rows = stmt.query_map(rusqlite::params![since], |row| row.get::<_, i64>(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn count_user_requests(
        &self,
        user_id: i64,
        since: i64,
    ) -> Result<u64, StoreError> {
        self.run(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM heimdall_request_logs WHERE user_id=?1 AND occurred_at >= ?2",
                rusqlite::params![user_id, since],
                |row| row.get(0),
            )?;
            Ok(super::i64_to_u64(count))
        })
        .await
    }

    pub async fn insert_auth_audit(&self, entry: &AuthAuditEntry) -> Result<(), StoreError> {
        let entry = entry.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO auth_audit_logs (request_id, occurred_at, method, result, client_ip,
                     tls_version, tls_cipher, peer_cn, latency_ms, error, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                rusqlite::params![
                    entry.request_id,
                    entry.occurred_at,
                    entry.method,
                    entry.result,
                    entry.client_ip,
                    entry.tls_version,
                    entry.tls_cipher,
                    entry.peer_cn,
                    entry.latency_ms,
                    entry.error,
                    entry.payload,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_auth_audit(&self, limit: usize) -> Result<Vec<AuthAuditEntry>, StoreError> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT request_id, occurred_at, method, result, client_ip, tls_version,
                        tls_cipher, peer_cn, latency_ms, error, payload
                 FROM auth_audit_logs ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(rusqlite::params![u64_to_i64(limit as u64)], |row| {
                Ok(AuthAuditEntry {
                    request_id: row.get(0)?,
                    occurred_at: row.get(1)?,
                    method: row.get(2)?,
                    result: row.get(3)?,
                    client_ip: row.get(4)?,
                    tls_version: row.get(5)?,
                    tls_cipher: row.get(6)?,
                    peer_cn: row.get(7)?,
                    latency_ms: row.get(8)?,
                    error: row.get(9)?,
                    payload: row.get(10)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }
}
