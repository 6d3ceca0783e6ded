//! Quota ledger.
//!
//! A user's `storage_used` only moves through this module. Bytes are charged
//! when an upload creates a new content record and recorded in
//! `quota_charges`, so a later release can only undo a charge that was made.

use serde::Serialize;
use sqlx::{SqliteConnection, SqliteExecutor};
use tracing::debug;

use crate::{HoardError, Result};

/// A user's consumption against their ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct QuotaUsage {
    /// Bytes currently charged.
    pub used: i64,
    /// Storage ceiling in bytes.
    pub quota: i64,
}

impl QuotaUsage {
    /// Bytes still free.
    pub fn available(&self) -> i64 {
        (self.quota - self.used).max(0)
    }
}

/// SQL operations on `users.storage_used` and `quota_charges`.
pub struct QuotaLedger;

impl QuotaLedger {
    /// Charge `bytes` for `hash` to `user_id`.
    ///
    /// The check and the increment are one conditional UPDATE, so two
    /// concurrent reservations cannot both pass against a stale total.
    pub async fn reserve(
        conn: &mut SqliteConnection,
        user_id: i64,
        hash: &str,
        bytes: i64,
    ) -> Result<()> {
        if bytes < 0 {
            return Err(HoardError::Validation(format!(
                "cannot reserve a negative amount ({bytes} bytes)"
            )));
        }

        let result = sqlx::query(
            "UPDATE users SET storage_used = storage_used + ?
             WHERE id = ? AND storage_used + ? <= storage_quota",
        )
        .bind(bytes)
        .bind(user_id)
        .bind(bytes)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            let usage = Self::usage(&mut *conn, user_id).await?;
            return Err(HoardError::QuotaExceeded {
                requested: bytes,
                available: usage.available(),
            });
        }

        sqlx::query(
            "INSERT INTO quota_charges (user_id, content_hash, bytes) VALUES (?, ?, ?)
             ON CONFLICT(user_id, content_hash) DO UPDATE SET bytes = bytes + excluded.bytes",
        )
        .bind(user_id)
        .bind(hash)
        .bind(bytes)
        .execute(&mut *conn)
        .await?;

        debug!(user_id, hash, bytes, "Quota reserved");
        Ok(())
    }

    /// Undo the charge for `hash` if `user_id` no longer has a file holding it.
    ///
    /// Must run after the user's file row is deleted in the same transaction.
    /// Returns the number of bytes released (0 when nothing was charged or a
    /// file still references the content).
    pub async fn release_if_last(
        conn: &mut SqliteConnection,
        user_id: i64,
        hash: &str,
    ) -> Result<i64> {
        let remaining: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM files WHERE owner_id = ? AND content_hash = ?",
        )
        .bind(user_id)
        .bind(hash)
        .fetch_one(&mut *conn)
        .await?;
        if remaining > 0 {
            return Ok(0);
        }

        let charged: Option<i64> = sqlx::query_scalar(
            "DELETE FROM quota_charges WHERE user_id = ? AND content_hash = ? RETURNING bytes",
        )
        .bind(user_id)
        .bind(hash)
        .fetch_optional(&mut *conn)
        .await?;

        let Some(bytes) = charged else {
            return Ok(0);
        };

        sqlx::query("UPDATE users SET storage_used = MAX(storage_used - ?, 0) WHERE id = ?")
            .bind(bytes)
            .bind(user_id)
            .execute(&mut *conn)
            .await?;

        debug!(user_id, hash, bytes, "Quota released");
        Ok(bytes)
    }

    /// Current usage for a user.
    pub async fn usage<'e, E>(executor: E, user_id: i64) -> Result<QuotaUsage>
    where
        E: SqliteExecutor<'e>,
    {
        sqlx::query_as::<_, QuotaUsage>(
            "SELECT storage_used AS used, storage_quota AS quota FROM users WHERE id = ?",
        )
        .bind(user_id)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| HoardError::NotFound("user".to_string()))
    }

    /// Total bytes charged to a user, summed from the charge table.
    ///
    /// Equals `storage_used` unless the ledger has drifted.
    pub async fn charged_total<'e, E>(executor: E, user_id: i64) -> Result<i64>
    where
        E: SqliteExecutor<'e>,
    {
        let total: i64 =
            sqlx::query_scalar("SELECT COALESCE(SUM(bytes), 0) FROM quota_charges WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(executor)
                .await?;
        Ok(total)
    }
}
