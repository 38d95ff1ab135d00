use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::TransactionBehavior;
use thiserror::Error;

pub(crate) mod accounts;
pub(crate) mod anomalies;
pub(crate) mod flags;
pub(crate) mod ip;
pub(crate) mod plans;
pub(crate) mod request_logs;
pub(crate) mod telemetry;
pub(crate) mod vouchers;

#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("invalid subject: {0}")]
    InvalidSubject(String),
    #[error(
        "plan exhausted (assignment={assignment_id}, metric={metric}, remaining={remaining}, needed={needed})"
    )]
    PlanExhausted {
        assignment_id: i64,
        metric: String,
        remaining: i64,
        needed: i64,
    },
    #[error(
        "balance insufficient (user={user_id}, token={token_id}, remaining={remaining}, needed={needed})"
    )]
    BalanceInsufficient {
        user_id: i64,
        token_id: i64,
        remaining: i64,
        needed: i64,
    },
    #[error("model {model} is not allowed by the active plan")]
    ModelRestricted { model: String },
    #[error("{message}")]
    VoucherRejected { message: String },
}

impl StoreError {
    /// Busy/locked databases and worker join failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Join(_) => true,
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::CannotOpen
                    | rusqlite::ErrorCode::SystemIoFailure
            ),
            _ => false,
        }
    }

    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub(crate) fn voucher(message: &str) -> Self {
        Self::VoucherRejected {
            message: message.to_string(),
        }
    }
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        self.run(|_| Ok(())).await
    }

    /// Runs `f` on a blocking thread against a fresh connection.
    pub(crate) async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<T, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            f(&conn)
        })
        .await?
    }

    /// Runs `f` inside `BEGIN IMMEDIATE`; the write lock serializes concurrent charges.
    /// An `Err` from `f` rolls the whole transaction back.
    pub(crate) async fn transact<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<T, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
        .await?
    }
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            quota INTEGER NOT NULL DEFAULT 0,
            used_quota INTEGER NOT NULL DEFAULT 0,
            status INTEGER NOT NULL DEFAULT 1,
            banned INTEGER NOT NULL DEFAULT 0,
            redirect_model TEXT,
            encryption_key_hash TEXT,
            encryption_enabled INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tokens (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            key TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL DEFAULT '',
            status INTEGER NOT NULL DEFAULT 1,
            remain_quota INTEGER NOT NULL DEFAULT 0,
            unlimited_quota INTEGER NOT NULL DEFAULT 0,
            model_limits TEXT NOT NULL DEFAULT '[]',
            allowed_ips TEXT NOT NULL DEFAULT '[]',
            billing_mode TEXT,
            plan_assignment_id INTEGER,
            expires_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_tokens_user ON tokens(user_id);

        CREATE TABLE IF NOT EXISTS login_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            occurred_at INTEGER NOT NULL,
            client_ip TEXT NOT NULL DEFAULT ''
        );
        CREATE INDEX IF NOT EXISTS idx_login_events_user ON login_events(user_id, occurred_at);

        CREATE TABLE IF NOT EXISTS plans (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            cycle_type TEXT NOT NULL,
            cycle_duration_days INTEGER NOT NULL DEFAULT 0,
            quota_metric TEXT NOT NULL,
            quota_amount INTEGER NOT NULL CHECK (quota_amount >= 0),
            allow_carry_over INTEGER NOT NULL DEFAULT 0,
            carry_limit_percent INTEGER NOT NULL DEFAULT 0
                CHECK (carry_limit_percent BETWEEN 0 AND 100),
            allowed_models TEXT NOT NULL DEFAULT '[]',
            is_active INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS plan_assignments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            subject_type TEXT NOT NULL,
            subject_id INTEGER NOT NULL,
            plan_id INTEGER NOT NULL,
            billing_mode TEXT NOT NULL,
            activated_at INTEGER NOT NULL,
            deactivated_at INTEGER,
            expires_at INTEGER,
            auto_fallback_enabled INTEGER NOT NULL DEFAULT 0,
            rollover_amount INTEGER NOT NULL DEFAULT 0,
            rollover_policy TEXT NOT NULL DEFAULT 'none',
            rollover_expires_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_plan_assignments_subject
            ON plan_assignments(subject_type, subject_id, activated_at);

        CREATE TABLE IF NOT EXISTS usage_counters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            plan_assignment_id INTEGER NOT NULL,
            metric TEXT NOT NULL,
            cycle_start INTEGER NOT NULL,
            cycle_end INTEGER NOT NULL,
            consumed_amount INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL DEFAULT 0,
            UNIQUE (plan_assignment_id, metric, cycle_start)
        );
        CREATE INDEX IF NOT EXISTS idx_usage_counters_cycle_end ON usage_counters(cycle_end);

        CREATE TABLE IF NOT EXISTS request_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            request_id TEXT NOT NULL UNIQUE,
            occurred_at INTEGER NOT NULL,
            subject_type TEXT NOT NULL,
            anonymized_subject_hash TEXT NOT NULL,
            plan_id INTEGER,
            plan_assignment_id INTEGER,
            model_alias TEXT NOT NULL DEFAULT '',
            upstream_provider TEXT NOT NULL DEFAULT '',
            usage_metric TEXT NOT NULL,
            prompt_tokens INTEGER NOT NULL DEFAULT 0,
            completion_tokens INTEGER NOT NULL DEFAULT 0,
            total_tokens INTEGER NOT NULL DEFAULT 0,
            latency_ms INTEGER NOT NULL DEFAULT 0,
            metadata TEXT NOT NULL DEFAULT '{}',
            is_public INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_request_logs_occurred ON request_logs(occurred_at);

        CREATE TABLE IF NOT EXISTS request_flags (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            request_id TEXT NOT NULL,
            subject_key TEXT NOT NULL,
            user_id INTEGER,
            token_id INTEGER,
            reason TEXT NOT NULL,
            severity TEXT NOT NULL,
            reasons TEXT NOT NULL DEFAULT '[]',
            rerouted_model_alias TEXT,
            excluded_from_leaderboard INTEGER NOT NULL DEFAULT 1,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            ttl_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_request_flags_ttl ON request_flags(ttl_at);

        CREATE TABLE IF NOT EXISTS heimdall_request_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            request_id TEXT NOT NULL,
            occurred_at INTEGER NOT NULL,
            auth_key_fingerprint TEXT NOT NULL DEFAULT '',
            normalized_url TEXT NOT NULL DEFAULT '',
            http_method TEXT NOT NULL DEFAULT '',
            http_status INTEGER NOT NULL DEFAULT 0,
            latency_ms INTEGER NOT NULL DEFAULT 0,
            client_ip TEXT NOT NULL DEFAULT '',
            country_code TEXT,
            region TEXT,
            city TEXT,
            client_user_agent TEXT NOT NULL DEFAULT '',
            client_device_id TEXT NOT NULL DEFAULT '',
            request_size_bytes INTEGER NOT NULL DEFAULT 0,
            response_size_bytes INTEGER NOT NULL DEFAULT 0,
            param_digest TEXT NOT NULL DEFAULT '',
            sanitized_cookies TEXT NOT NULL DEFAULT '',
            model_name TEXT NOT NULL DEFAULT '',
            upstream_provider TEXT NOT NULL DEFAULT '',
            error_type TEXT,
            error_message TEXT,
            user_id INTEGER,
            token_id INTEGER,
            excluded_from_leaderboard INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_heimdall_logs_user ON heimdall_request_logs(user_id, occurred_at);
        CREATE INDEX IF NOT EXISTS idx_heimdall_logs_request ON heimdall_request_logs(request_id);

        CREATE TABLE IF NOT EXISTS auth_audit_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            request_id TEXT NOT NULL,
            occurred_at INTEGER NOT NULL,
            method TEXT NOT NULL,
            result TEXT NOT NULL,
            client_ip TEXT NOT NULL DEFAULT '',
            tls_version TEXT,
            tls_cipher TEXT,
            peer_cn TEXT,
            latency_ms INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            payload TEXT
        );

        CREATE TABLE IF NOT EXISTS voucher_batches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            code_prefix TEXT NOT NULL UNIQUE,
            grant_type TEXT NOT NULL,
            credit_amount INTEGER,
            plan_grant_id INTEGER,
            valid_from INTEGER,
            valid_until INTEGER,
            max_redemptions INTEGER NOT NULL DEFAULT 0,
            max_per_subject INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            deleted_at INTEGER
        );

        CREATE TABLE IF NOT EXISTS voucher_codes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            batch_id INTEGER NOT NULL,
            code TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL DEFAULT 'available'
        );

        CREATE TABLE IF NOT EXISTS voucher_redemptions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            batch_id INTEGER NOT NULL,
            code TEXT NOT NULL UNIQUE,
            subject_key TEXT NOT NULL,
            grant_type TEXT NOT NULL,
            credit_amount INTEGER,
            plan_assignment_id INTEGER,
            redeemed_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_voucher_redemptions_batch
            ON voucher_redemptions(batch_id, subject_key);

        CREATE TABLE IF NOT EXISTS ip_lists (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ip_pattern TEXT NOT NULL,
            kind TEXT NOT NULL,
            reason TEXT,
            created_at INTEGER NOT NULL,
            UNIQUE (ip_pattern, kind)
        );

        CREATE TABLE IF NOT EXISTS ip_bans (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ip TEXT NOT NULL,
            reason TEXT NOT NULL,
            permanent INTEGER NOT NULL DEFAULT 0,
            expires_at INTEGER,
            created_at INTEGER NOT NULL,
            active INTEGER NOT NULL DEFAULT 1
        );
        CREATE INDEX IF NOT EXISTS idx_ip_bans_ip ON ip_bans(ip, active);

        CREATE TABLE IF NOT EXISTS ip_rate_limits (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ip_pattern TEXT NOT NULL UNIQUE,
            max_requests INTEGER NOT NULL,
            window_secs INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS security_anomalies (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            token_id INTEGER,
            rule_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            message TEXT NOT NULL,
            evidence TEXT NOT NULL DEFAULT '{}',
            risk_score REAL NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            action_taken TEXT,
            detected_at INTEGER NOT NULL,
            actioned_at INTEGER,
            ttl_until INTEGER,
            reviewed_by INTEGER,
            reviewed_at INTEGER,
            review_decision TEXT,
            review_rationale TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_security_anomalies_user
            ON security_anomalies(user_id, rule_type, detected_at);

        CREATE TABLE IF NOT EXISTS anomaly_baselines (
            user_id INTEGER NOT NULL,
            metric_type TEXT NOT NULL,
            baseline_value REAL NOT NULL,
            window_size_seconds INTEGER NOT NULL,
            sample_size INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (user_id, metric_type)
        );
        "#,
    )?;
    Ok(())
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn u64_to_i64(value: u64) -> i64 {
    if value > i64::MAX as u64 {
        i64::MAX
    } else {
        value as i64
    }
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}

fn list_to_json(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

fn json_to_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn json_to_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests;
