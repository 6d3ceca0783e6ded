//! Dedup index: content hash → ContentRecord.
//!
//! Every reference-count change is one SQL statement, so concurrent
//! acquire/release on the same hash cannot lose an update. The functions take
//! a connection so callers can run them inside a larger transaction.

use serde::Serialize;
use sqlx::{SqliteConnection, SqliteExecutor};

use crate::{HoardError, Result};

const RECORD_COLUMNS: &str = "hash, size, mime_type, ref_count, created_at";

/// Bookkeeping for one distinct byte sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct ContentRecord {
    /// Hex SHA-256 of the bytes.
    pub hash: String,
    /// Size in bytes.
    pub size: i64,
    /// MIME type recorded at first sighting.
    pub mime_type: String,
    /// Number of files referencing this content.
    pub ref_count: i64,
    /// When the content was first stored.
    pub created_at: String,
}

/// Outcome of acquiring a reference.
#[derive(Debug, Clone)]
pub struct Acquired {
    /// The record after the increment.
    pub record: ContentRecord,
    /// Whether this call inserted the record (a new distinct content).
    pub created: bool,
}

/// SQL operations on the `content_records` table.
pub struct DedupIndex;

impl DedupIndex {
    /// Take one reference on `hash`, inserting the record if it is new.
    ///
    /// The insert-or-increment is a single upsert. If the hash is already
    /// recorded with a different size the upsert matches no row and the call
    /// fails with an integrity error.
    pub async fn acquire(
        conn: &mut SqliteConnection,
        hash: &str,
        size: i64,
        mime_type: &str,
    ) -> Result<Acquired> {
        let record = sqlx::query_as::<_, ContentRecord>(&format!(
            "INSERT INTO content_records (hash, size, mime_type, ref_count)
             VALUES (?, ?, ?, 1)
             ON CONFLICT(hash) DO UPDATE SET ref_count = ref_count + 1
             WHERE content_records.size = excluded.size
             RETURNING {RECORD_COLUMNS}"
        ))
        .bind(hash)
        .bind(size)
        .bind(mime_type)
        .fetch_optional(&mut *conn)
        .await?;

        match record {
            // A record at zero is deleted in the same transaction that
            // zeroed it, so a count of one means this call inserted it.
            Some(record) => Ok(Acquired {
                created: record.ref_count == 1,
                record,
            }),
            None => {
                let existing = Self::lookup(&mut *conn, hash).await?;
                Err(HoardError::Integrity(format!(
                    "content {hash} is recorded with {} bytes but {size} bytes were supplied",
                    existing.size
                )))
            }
        }
    }

    /// Drop one reference on `hash`.
    ///
    /// When the count reaches zero the record is deleted and `true` is
    /// returned; the caller reclaims the blob once its transaction commits.
    pub async fn release(conn: &mut SqliteConnection, hash: &str) -> Result<bool> {
        let remaining: Option<i64> = sqlx::query_scalar(
            "UPDATE content_records SET ref_count = ref_count - 1
             WHERE hash = ? AND ref_count > 0
             RETURNING ref_count",
        )
        .bind(hash)
        .fetch_optional(&mut *conn)
        .await?;

        match remaining {
            None => Err(HoardError::NotFound(format!("content {hash}"))),
            Some(0) => {
                let deleted = sqlx::query(
                    "DELETE FROM content_records WHERE hash = ? AND ref_count = 0",
                )
                .bind(hash)
                .execute(&mut *conn)
                .await?;
                Ok(deleted.rows_affected() > 0)
            }
            Some(_) => Ok(false),
        }
    }

    /// Look up a record, failing with `NotFound`.
    pub async fn lookup<'e, E>(executor: E, hash: &str) -> Result<ContentRecord>
    where
        E: SqliteExecutor<'e>,
    {
        Self::find(executor, hash)
            .await?
            .ok_or_else(|| HoardError::NotFound(format!("content {hash}")))
    }

    /// Look up a record.
    pub async fn find<'e, E>(executor: E, hash: &str) -> Result<Option<ContentRecord>>
    where
        E: SqliteExecutor<'e>,
    {
        let record = sqlx::query_as::<_, ContentRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM content_records WHERE hash = ?"
        ))
        .bind(hash)
        .fetch_optional(executor)
        .await?;
        Ok(record)
    }

    /// List every record, ordered by hash.
    pub async fn list<'e, E>(executor: E) -> Result<Vec<ContentRecord>>
    where
        E: SqliteExecutor<'e>,
    {
        let records = sqlx::query_as::<_, ContentRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM content_records ORDER BY hash"
        ))
        .fetch_all(executor)
        .await?;
        Ok(records)
    }

    /// Count the files that reference `hash`.
    pub async fn count_references<'e, E>(executor: E, hash: &str) -> Result<i64>
    where
        E: SqliteExecutor<'e>,
    {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE content_hash = ?")
            .bind(hash)
            .fetch_one(executor)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    const HASH_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const HASH_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    async fn setup_db() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn test_acquire_new_record() {
        let db = setup_db().await;
        let mut conn = db.pool().acquire().await.unwrap();

        let acquired = DedupIndex::acquire(&mut conn, HASH_A, 10, "text/plain")
            .await
            .unwrap();

        assert!(acquired.created);
        assert_eq!(acquired.record.ref_count, 1);
        assert_eq!(acquired.record.size, 10);
        assert_eq!(acquired.record.mime_type, "text/plain");
    }

    #[tokio::test]
    async fn test_acquire_existing_increments() {
        let db = setup_db().await;
        let mut conn = db.pool().acquire().await.unwrap();

        DedupIndex::acquire(&mut conn, HASH_A, 10, "text/plain")
            .await
            .unwrap();
        let second = DedupIndex::acquire(&mut conn, HASH_A, 10, "application/octet-stream")
            .await
            .unwrap();

        assert!(!second.created);
        assert_eq!(second.record.ref_count, 2);
        // First sighting's MIME type is kept
        assert_eq!(second.record.mime_type, "text/plain");
    }

    #[tokio::test]
    async fn test_acquire_size_mismatch_is_integrity_error() {
        let db = setup_db().await;
        let mut conn = db.pool().acquire().await.unwrap();

        DedupIndex::acquire(&mut conn, HASH_A, 10, "text/plain")
            .await
            .unwrap();
        let result = DedupIndex::acquire(&mut conn, HASH_A, 11, "text/plain").await;

        assert!(matches!(result, Err(HoardError::Integrity(_))));
        let record = DedupIndex::lookup(&mut *conn, HASH_A).await.unwrap();
        assert_eq!(record.ref_count, 1);
    }

    #[tokio::test]
    async fn test_release_to_zero_deletes() {
        let db = setup_db().await;
        let mut conn = db.pool().acquire().await.unwrap();

        DedupIndex::acquire(&mut conn, HASH_A, 10, "text/plain")
            .await
            .unwrap();
        DedupIndex::acquire(&mut conn, HASH_A, 10, "text/plain")
            .await
            .unwrap();

        assert!(!DedupIndex::release(&mut conn, HASH_A).await.unwrap());
        assert_eq!(
            DedupIndex::lookup(&mut *conn, HASH_A).await.unwrap().ref_count,
            1
        );

        assert!(DedupIndex::release(&mut conn, HASH_A).await.unwrap());
        assert!(DedupIndex::find(&mut *conn, HASH_A).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_unknown_hash() {
        let db = setup_db().await;
        let mut conn = db.pool().acquire().await.unwrap();

        let result = DedupIndex::release(&mut conn, HASH_B).await;
        assert!(matches!(result, Err(HoardError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_reacquire_after_reclaim_is_new() {
        let db = setup_db().await;
        let mut conn = db.pool().acquire().await.unwrap();

        DedupIndex::acquire(&mut conn, HASH_A, 10, "text/plain")
            .await
            .unwrap();
        DedupIndex::release(&mut conn, HASH_A).await.unwrap();

        let again = DedupIndex::acquire(&mut conn, HASH_A, 10, "text/plain")
            .await
            .unwrap();
        assert!(again.created);
    }

    #[tokio::test]
    async fn test_list_records() {
        let db = setup_db().await;
        let mut conn = db.pool().acquire().await.unwrap();

        DedupIndex::acquire(&mut conn, HASH_B, 2, "a/b").await.unwrap();
        DedupIndex::acquire(&mut conn, HASH_A, 1, "a/b").await.unwrap();
        drop(conn);

        let records = DedupIndex::list(db.pool()).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].hash, HASH_A);
        assert_eq!(records[1].hash, HASH_B);
    }
}
