use rusqlite::OptionalExtension;

use super::{SqliteStore, StoreError};
use crate::gateway::store_types::{
    GrantType, VoucherBatchRecord, VoucherCodeRecord, VoucherCodeStatus, VoucherRedemptionRecord,
};

const BATCH_COLUMNS: &str = "id, code_prefix, grant_type, credit_amount, plan_grant_id, \
     valid_from, valid_until, max_redemptions, max_per_subject, created_at, deleted_at";

fn batch_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VoucherBatchRecord> {
    let grant_type: String = row.get(2)?;
    Ok(VoucherBatchRecord {
        id: row.get(0)?,
        code_prefix: row.get(1)?,
        grant_type: GrantType::parse(&grant_type).unwrap_or(GrantType::Credit),
        credit_amount: row.get(3)?,
        plan_grant_id: row.get(4)?,
        valid_from: row.get(5)?,
        valid_until: row.get(6)?,
        max_redemptions: row.get(7)?,
        max_per_subject: row.get(8)?,
        created_at: row.get(9)?,
        deleted_at: row.get(10)?,
    })
}

fn code_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VoucherCodeRecord> {
    let status: String = row.get(3)?;
    Ok(VoucherCodeRecord {
        id: row.get(0)?,
        batch_id: row.get(1)?,
        code: row.get(2)?,
        status: VoucherCodeStatus::parse(&status).unwrap_or(VoucherCodeStatus::Available),
    })
}

pub(crate) fn redemption_exists(conn: &rusqlite::Connection, code: &str) -> Result<bool, StoreError> {
    let found = conn
        .query_row(
            "SELECT 1 FROM voucher_redemptions WHERE code=?1",
            rusqlite::params![code],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

pub(crate) fn load_batch_by_prefix(
    conn: &rusqlite::Connection,
    prefix: &str,
) -> Result<Option<VoucherBatchRecord>, StoreError> {
    let batch = conn
        .query_row(
            &format!("SELECT {BATCH_COLUMNS} FROM voucher_batches WHERE code_prefix=?1"),
            rusqlite::params![prefix],
            batch_from_row,
        )
        .optional()?;
    Ok(batch)
}

pub(crate) fn load_code(
    conn: &rusqlite::Connection,
    code: &str,
) -> Result<Option<VoucherCodeRecord>, StoreError> {
    let record = conn
        .query_row(
            "SELECT id, batch_id, code, status FROM voucher_codes WHERE code=?1",
            rusqlite::params![code],
            code_from_row,
        )
        .optional()?;
    Ok(record)
}

pub(crate) fn count_batch_redemptions(
    conn: &rusqlite::Connection,
    batch_id: i64,
) -> Result<i64, StoreError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM voucher_redemptions WHERE batch_id=?1",
        rusqlite::params![batch_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub(crate) fn count_subject_redemptions(
    conn: &rusqlite::Connection,
    batch_id: i64,
    subject_key: &str,
) -> Result<i64, StoreError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM voucher_redemptions WHERE batch_id=?1 AND subject_key=?2",
        rusqlite::params![batch_id, subject_key],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Moves a tracked code to `redeemed`; codes are never moved back.
pub(crate) fn mark_code_redeemed(conn: &rusqlite::Connection, code: &str) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE voucher_codes SET status='redeemed'
         WHERE code=?1 AND status IN ('available', 'issued')",
        rusqlite::params![code],
    )?;
    Ok(())
}

pub(crate) fn insert_redemption(
    conn: &rusqlite::Connection,
    redemption: &VoucherRedemptionRecord,
) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO voucher_redemptions (batch_id, code, subject_key, grant_type, credit_amount,
             plan_assignment_id, redeemed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            redemption.batch_id,
            redemption.code,
            redemption.subject_key,
            redemption.grant_type.as_str(),
            redemption.credit_amount,
            redemption.plan_assignment_id,
            redemption.redeemed_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

impl SqliteStore {
    /// Inserts a batch; `id` on the record is ignored.
    pub async fn insert_voucher_batch(&self, batch: &VoucherBatchRecord) -> Result<i64, StoreError> {
        let batch = batch.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO voucher_batches (code_prefix, grant_type, credit_amount, plan_grant_id,
                     valid_from, valid_until, max_redemptions, max_per_subject, created_at,
                     deleted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    batch.code_prefix,
                    batch.grant_type.as_str(),
                    batch.credit_amount,
                    batch.plan_grant_id,
                    batch.valid_from,
                    batch.valid_until,
                    batch.max_redemptions,
                    batch.max_per_subject,
                    batch.created_at,
                    batch.deleted_at,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn insert_voucher_code(&self, batch_id: i64, code: &str) -> Result<i64, StoreError> {
        let code = code.trim().to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO voucher_codes (batch_id, code, status) VALUES (?1, ?2, 'available')",
                rusqlite::params![batch_id, code],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn get_voucher_code(&self, code: &str) -> Result<Option<VoucherCodeRecord>, StoreError> {
        let code = code.trim().to_string();
        self.run(move |conn| load_code(conn, &code)).await
    }

    pub async fn get_voucher_batch(
        &self,
        prefix: &str,
    ) -> Result<Option<VoucherBatchRecord>, StoreError> {
        let prefix = prefix.to_string();
        self.run(move |conn| load_batch_by_prefix(conn, &prefix))
            .await
    }

    pub async fn list_redemptions(
        &self,
        batch_id: i64,
    ) -> Result<Vec<VoucherRedemptionRecord>, StoreError> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, batch_id, code, subject_key, grant_type, credit_amount,
                        plan_assignment_id, redeemed_at
                 FROM voucher_redemptions WHERE batch_id=?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(rusqlite::params![batch_id], |row| {
                let grant_type: String = row.get(4)?;
                Ok(VoucherRedemptionRecord {
                    id: row.get(0)?,
                    batch_id: row.get(1)?,
                    code: row.get(2)?,
                    subject_key: row.get(3)?,
                    grant_type: GrantType::parse(&grant_type).unwrap_or(GrantType::Credit),
                    credit_amount: row.get(5)?,
                    plan_assignment_id: row.get(6)?,
                    redeemed_at: row.get(7)?,
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

    /// Soft-deletes batches past `valid_until` and expires their unredeemed codes.
    /// Returns `(batches, codes)` touched.
    pub async fn expire_voucher_batches(&self, now: i64) -> Result<(usize, usize), StoreError> {
        self.transact(move |tx| {
            let codes = tx.execute(
                "UPDATE voucher_codes SET status='expired'
                 WHERE status IN ('available', 'issued') AND batch_id IN (
                     SELECT id FROM voucher_batches
                     WHERE deleted_at IS NULL AND valid_until IS NOT NULL AND valid_until <= ?1)",
                rusqlite::params![now],
            )?;
            let batches = tx.execute(
                "UPDATE voucher_batches SET deleted_at=?1
                 WHERE deleted_at IS NULL AND valid_until IS NOT NULL AND valid_until <= ?1",
                rusqlite::params![now],
            )?;
            Ok((batches, codes))
        })
        .await
    }
}
