use rusqlite::OptionalExtension;

use super::{SqliteStore, StoreError, i64_to_u64, u64_to_i64};
use crate::gateway::store_types::{IpBanRecord, IpListEntry, IpListKind, IpRateLimitRule};

fn ban_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IpBanRecord> {
    Ok(IpBanRecord {
        id: row.get(0)?,
        ip: row.get(1)?,
        reason: row.get(2)?,
        permanent: row.get(3)?,
        expires_at: row.get(4)?,
        created_at: row.get(5)?,
        active: row.get(6)?,
    })
}

impl SqliteStore {
    pub async fn list_ip_entries(&self) -> Result<Vec<IpListEntry>, StoreError> {
        self.run(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, ip_pattern, kind, reason, created_at FROM ip_lists ORDER BY id",
            )?;
            let rows = stmt.query_map([], |row| {
                let kind: String = row.get(2)?;
                Ok(IpListEntry {
                    id: row.get(0)?,
                    ip_pattern: row.get(1)?,
                    kind: IpListKind::parse(&kind).unwrap_or(IpListKind::Deny),
                    reason: row.get(3)?,
                    created_at: row.get(4)?,
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

    pub async fn add_ip_entry(
        &self,
        ip_pattern: &str,
        kind: IpListKind,
        reason: Option<&str>,
        now: i64,
    ) -> Result<(), StoreError> {
        let ip_pattern = ip_pattern.trim().to_string();
        let reason = reason.map(|reason| reason.to_string());
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO ip_lists (ip_pattern, kind, reason, created_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(ip_pattern, kind) DO UPDATE SET reason=excluded.reason",
                rusqlite::params![ip_pattern, kind.as_str(), reason, now],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn remove_ip_entry(&self, ip_pattern: &str, kind: IpListKind) -> Result<bool, StoreError> {
        let ip_pattern = ip_pattern.trim().to_string();
        self.run(move |conn| {
            let changed = conn.execute(
                "DELETE FROM ip_lists WHERE ip_pattern=?1 AND kind=?2",
                rusqlite::params![ip_pattern, kind.as_str()],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    pub async fn active_ip_ban(
        &self,
        ip: &str,
        now: i64,
    ) -> Result<Option<IpBanRecord>, StoreError> {
        let ip = ip.to_string();
        self.run(move |conn| {
            let ban = conn
                .query_row(
                    "SELECT id, ip, reason, permanent, expires_at, created_at, active FROM ip_bans
                     WHERE ip=?1 AND active=1
                       AND (permanent=1 OR expires_at IS NULL OR expires_at > ?2)
                     ORDER BY permanent DESC, id DESC LIMIT 1",
                    rusqlite::params![ip, now],
                    ban_from_row,
                )
                .optional()?;
            Ok(ban)
        })
        .await
    }

    /// Replaces any active ban of `ip` with a new one.
    pub async fn insert_ip_ban(
        &self,
        ip: &str,
        reason: &str,
        permanent: bool,
        expires_at: Option<i64>,
        now: i64,
    ) -> Result<i64, StoreError> {
        let ip = ip.to_string();
        let reason = reason.to_string();
        self.transact(move |tx| {
            tx.execute(
                "UPDATE ip_bans SET active=0 WHERE ip=?1 AND active=1",
                rusqlite::params![ip],
            )?;
            tx.execute(
                "INSERT INTO ip_bans (ip, reason, permanent, expires_at, created_at, active)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1)",
                rusqlite::params![ip, reason, permanent, expires_at, now],
            )?;
            Ok(tx.last_insert_rowid())
        })
        .await
    }

    pub async fn lift_ip_ban(&self, ip: &str) -> Result<usize, StoreError> {
        let ip = ip.to_string();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE ip_bans SET active=0 WHERE ip=?1 AND active=1",
                rusqlite::params![ip],
            )?;
            Ok(changed)
        })
        .await
    }

    pub async fn lift_expired_ip_bans(&self, now: i64) -> Result<usize, StoreError> {
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE ip_bans SET active=0
                 WHERE active=1 AND permanent=0 AND expires_at IS NOT NULL AND expires_at <= ?1",
                rusqlite::params![now],
            )?;
            Ok(changed)
        })
        .await
    }

    pub async fn list_ip_bans(&self, now: i64) -> Result<Vec<IpBanRecord>, StoreError> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, ip, reason, permanent, expires_at, created_at, active FROM ip_bans
                 WHERE active=1 AND (permanent=1 OR expires_at IS NULL OR expires_at > ?1)
                 ORDER BY id DESC",
            )?;
            let rows = stmt.query_map(rusqlite::params![now], ban_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn list_ip_rate_limits(&self) -> Result<Vec<IpRateLimitRule>, StoreError> {
        self.run(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, ip_pattern, max_requests, window_secs FROM ip_rate_limits ORDER BY id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(IpRateLimitRule {
                    id: row.get(0)?,
                    ip_pattern: row.get(1)?,
                    max_requests: i64_to_u64(row.get(2)?),
                    window_secs: i64_to_u64(row.get(3)?),
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

    pub async fn upsert_ip_rate_limit(
        &self,
        ip_pattern: &str,
        max_requests: u64,
        window_secs: u64,
    ) -> Result<(), StoreError> {
        let ip_pattern = ip_pattern.trim().to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO ip_rate_limits (ip_pattern, max_requests, window_secs)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(ip_pattern) DO UPDATE SET
                     max_requests=excluded.max_requests, window_secs=excluded.window_secs",
                rusqlite::params![ip_pattern, u64_to_i64(max_requests), u64_to_i64(window_secs)],
            )?;
            Ok(())
        })
        .await
    }
}
