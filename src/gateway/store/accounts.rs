use rusqlite::OptionalExtension;

use super::{SqliteStore, StoreError, json_to_list, list_to_json};
use crate::gateway::store_types::{BillingMode, TokenRecord, UserRecord};

const USER_COLUMNS: &str = "id, username, quota, used_quota, status, banned, redirect_model, \
     encryption_key_hash, encryption_enabled, created_at";

const TOKEN_COLUMNS: &str = "id, user_id, key, name, status, remain_quota, unlimited_quota, \
     model_limits, allowed_ips, billing_mode, plan_assignment_id, expires_at";

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        id: row.get(0)?,
        username: row.get(1)?,
        quota: row.get(2)?,
        used_quota: row.get(3)?,
        status: row.get(4)?,
        banned: row.get(5)?,
        redirect_model: row.get(6)?,
        encryption_key_hash: row.get(7)?,
        encryption_enabled: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn token_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TokenRecord> {
    let model_limits: String = row.get(7)?;
    let allowed_ips: String = row.get(8)?;
    let billing_mode: Option<String> = row.get(9)?;
    Ok(TokenRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        key: row.get(2)?,
        name: row.get(3)?,
        status: row.get(4)?,
        remain_quota: row.get(5)?,
        unlimited_quota: row.get(6)?,
        model_limits: json_to_list(&model_limits),
        allowed_ips: json_to_list(&allowed_ips),
        billing_mode: billing_mode.as_deref().and_then(BillingMode::parse),
        plan_assignment_id: row.get(10)?,
        expires_at: row.get(11)?,
    })
}

pub(crate) fn load_user(
    conn: &rusqlite::Connection,
    user_id: i64,
) -> Result<Option<UserRecord>, StoreError> {
    let user = conn
        .query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id=?1"),
            rusqlite::params![user_id],
            user_from_row,
        )
        .optional()?;
    Ok(user)
}

pub(crate) fn load_token(
    conn: &rusqlite::Connection,
    token_id: i64,
) -> Result<Option<TokenRecord>, StoreError> {
    let token = conn
        .query_row(
            &format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE id=?1"),
            rusqlite::params![token_id],
            token_from_row,
        )
        .optional()?;
    Ok(token)
}

/// Guarded decrement; returns false when the balance would go negative.
pub(crate) fn deduct_user_quota(
    conn: &rusqlite::Connection,
    user_id: i64,
    amount: i64,
) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "UPDATE users SET quota = quota - ?2, used_quota = used_quota + ?2
         WHERE id=?1 AND quota >= ?2",
        rusqlite::params![user_id, amount],
    )?;
    Ok(changed == 1)
}

pub(crate) fn deduct_token_quota(
    conn: &rusqlite::Connection,
    token_id: i64,
    amount: i64,
) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "UPDATE tokens SET remain_quota = remain_quota - ?2
         WHERE id=?1 AND remain_quota >= ?2",
        rusqlite::params![token_id, amount],
    )?;
    Ok(changed == 1)
}

pub(crate) fn credit_user_quota(
    conn: &rusqlite::Connection,
    user_id: i64,
    amount: i64,
) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE users SET quota = quota + ?2 WHERE id=?1",
        rusqlite::params![user_id, amount],
    )?;
    if changed == 0 {
        return Err(StoreError::not_found("user", user_id));
    }
    Ok(())
}

impl SqliteStore {
    /// Inserts a user; `id` on the record is ignored.
    pub async fn insert_user(&self, user: &UserRecord) -> Result<i64, StoreError> {
        let user = user.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO users (username, quota, used_quota, status, banned, redirect_model,
                     encryption_key_hash, encryption_enabled, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    user.username,
                    user.quota,
                    user.used_quota,
                    user.status,
                    user.banned,
                    user.redirect_model,
                    user.encryption_key_hash,
                    user.encryption_enabled,
                    user.created_at,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Inserts a token; `id` on the record is ignored.
    pub async fn insert_token(&self, token: &TokenRecord) -> Result<i64, StoreError> {
        let token = token.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO tokens (user_id, key, name, status, remain_quota, unlimited_quota,
                     model_limits, allowed_ips, billing_mode, plan_assignment_id, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                rusqlite::params![
                    token.user_id,
                    token.key,
                    token.name,
                    token.status,
                    token.remain_quota,
                    token.unlimited_quota,
                    list_to_json(&token.model_limits),
                    list_to_json(&token.allowed_ips),
                    token.billing_mode.map(|mode| mode.as_str()),
                    token.plan_assignment_id,
                    token.expires_at,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn get_user(&self, user_id: i64) -> Result<Option<UserRecord>, StoreError> {
        self.run(move |conn| load_user(conn, user_id)).await
    }

    pub async fn get_user_by_username(
        &self,
        username: &str,
    ) -> Result<Option<UserRecord>, StoreError> {
        let username = username.to_string();
        self.run(move |conn| {
            let user = conn
                .query_row(
                    &format!("SELECT {USER_COLUMNS} FROM users WHERE username=?1"),
                    rusqlite::params![username],
                    user_from_row,
                )
                .optional()?;
            Ok(user)
        })
        .await
    }

    pub async fn get_token(&self, token_id: i64) -> Result<Option<TokenRecord>, StoreError> {
        self.run(move |conn| load_token(conn, token_id)).await
    }

    pub async fn get_token_by_key(&self, key: &str) -> Result<Option<TokenRecord>, StoreError> {
        let key = key.to_string();
        self.run(move |conn| {
            let token = conn
                .query_row(
                    &format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE key=?1"),
                    rusqlite::params![key],
                    token_from_row,
                )
                .optional()?;
            Ok(token)
        })
        .await
    }

    pub async fn set_user_banned(&self, user_id: i64, banned: bool) -> Result<(), StoreError> {
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE users SET banned=?2 WHERE id=?1",
                rusqlite::params![user_id, banned],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found("user", user_id));
            }
            Ok(())
        })
        .await
    }

    pub async fn set_user_redirect(
        &self,
        user_id: i64,
        model: Option<&str>,
    ) -> Result<(), StoreError> {
        let model = model.map(|model| model.to_string());
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE users SET redirect_model=?2 WHERE id=?1",
                rusqlite::params![user_id, model],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found("user", user_id));
            }
            Ok(())
        })
        .await
    }

    pub async fn add_user_quota(&self, user_id: i64, amount: i64) -> Result<(), StoreError> {
        self.run(move |conn| credit_user_quota(conn, user_id, amount))
            .await
    }

    pub async fn record_login(
        &self,
        user_id: i64,
        client_ip: &str,
        occurred_at: i64,
    ) -> Result<(), StoreError> {
        let client_ip = client_ip.to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO login_events (user_id, occurred_at, client_ip) VALUES (?1, ?2, ?3)",
                rusqlite::params![user_id, occurred_at, client_ip],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn count_logins(&self, user_id: i64, since: i64) -> Result<u64, StoreError> {
        self.run(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM login_events WHERE user_id=?1 AND occurred_at >= ?2",
                rusqlite::params![user_id, since],
                |row| row.get(0),
            )?;
            Ok(super::i64_to_u64(count))
        })
        .await
    }

    pub async fn token_ids_for_user(&self, user_id: i64) -> Result<Vec<i64>, StoreError> {
        self.run(move |conn| {
            let mut stmt = conn.prepare("SELECT id FROM tokens WHERE user_id=?1 ORDER BY id")?;
            let rows = stmt.query_map(rusqlite::params![user_id], |row| row.get::<_, i64>(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }
}
