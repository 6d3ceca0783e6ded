//! Content store for Hoard.
//!
//! Ties together the blob files, the dedup index and the quota ledger:
//! - [`BlobStore`]: bytes on disk keyed by SHA-256
//! - [`DedupIndex`]: one reference-counted record per distinct hash
//! - [`QuotaLedger`]: per-user charges for newly stored content
//! - [`KeyedLocks`]: serializes blob placement and reclamation per hash
//!
//! Database work is done on a connection the caller supplies, so the
//! reference change commits or rolls back together with the caller's own
//! rows. The caller takes the hash lock before beginning its transaction.

mod blob;
mod dedup;
mod locks;
mod quota;

pub use blob::{hash_bytes, is_valid_hash, BlobStore, StagedBlob, HASH_LEN};
pub use dedup::{Acquired, ContentRecord, DedupIndex};
pub use locks::{KeyGuard, KeyedLocks};
pub use quota::{QuotaLedger, QuotaUsage};

use std::collections::HashSet;

use sqlx::SqliteConnection;
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

use crate::{Database, Result};

/// Result of ingesting a staged upload.
#[derive(Debug, Clone)]
pub struct Ingested {
    /// The content record after taking the reference.
    pub record: ContentRecord,
    /// Whether this ingest stored new bytes (and charged the quota).
    pub created: bool,
}

/// Counts reported by [`ContentStore::reconcile`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Leftover staging files removed.
    pub staging_removed: usize,
    /// Blob files without a content record, deleted.
    pub orphans_removed: usize,
    /// Content records whose blob file is missing.
    pub missing_blobs: Vec<String>,
}

/// Deduplicating content store.
#[derive(Debug, Clone)]
pub struct ContentStore {
    db: Database,
    blobs: BlobStore,
    locks: KeyedLocks,
}

impl ContentStore {
    /// Create a content store over an open database and blob directory.
    pub fn new(db: Database, blobs: BlobStore) -> Self {
        Self {
            db,
            blobs,
            locks: KeyedLocks::new(),
        }
    }

    /// The underlying blob store.
    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Stream an upload into staging and hash it.
    pub async fn stage<R>(&self, reader: R, declared_size: u64) -> Result<StagedBlob>
    where
        R: AsyncRead + Unpin,
    {
        self.blobs.stage(reader, declared_size).await
    }

    /// Lock one content hash.
    pub async fn lock(&self, hash: &str) -> KeyGuard {
        self.locks.lock(hash).await
    }

    /// Lock several content hashes in a deadlock-free order.
    pub async fn lock_many<I, S>(&self, hashes: I) -> Vec<KeyGuard>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.locks.lock_many(hashes).await
    }

    /// Take a reference on the staged content for `user_id`.
    ///
    /// On first sighting the user's quota is charged and the staged file is
    /// moved into place; otherwise the staged file is discarded. This is the
    /// first statement of the caller's transaction. If the transaction later
    /// fails, call [`abandon`](Self::abandon) before releasing `guard`.
    pub async fn ingest(
        &self,
        conn: &mut SqliteConnection,
        guard: &KeyGuard,
        user_id: i64,
        staged: StagedBlob,
        mime_type: &str,
    ) -> Result<Ingested> {
        debug_assert_eq!(guard.key(), staged.hash());
        let size = staged.size() as i64;
        let hash = staged.hash().to_string();

        let Acquired { record, created } =
            DedupIndex::acquire(&mut *conn, &hash, size, mime_type).await?;

        if created {
            QuotaLedger::reserve(&mut *conn, user_id, &hash, size).await?;
            self.blobs.place(staged).await?;
            info!(hash = %hash, size, "Stored new content");
        } else {
            debug!(hash = %hash, ref_count = record.ref_count, "Deduplicated upload");
        }

        Ok(Ingested { record, created })
    }

    /// Remove a blob placed by an ingest whose transaction is being rolled back.
    pub async fn abandon(&self, guard: &KeyGuard, ingested: &Ingested) {
        debug_assert_eq!(guard.key(), ingested.record.hash);
        if !ingested.created {
            return;
        }
        if let Err(e) = self.blobs.delete(&ingested.record.hash).await {
            warn!(hash = %ingested.record.hash, "Failed to remove abandoned blob: {}", e);
        }
    }

    /// Drop `user_id`'s reference on `hash`.
    ///
    /// The user's file row must already be deleted in the same transaction.
    /// Returns whether the content record reached zero; if so, call
    /// [`reclaim`](Self::reclaim) after commit while still holding the lock.
    pub async fn release(
        &self,
        conn: &mut SqliteConnection,
        user_id: i64,
        hash: &str,
    ) -> Result<bool> {
        let reclaimed = DedupIndex::release(&mut *conn, hash).await?;
        QuotaLedger::release_if_last(&mut *conn, user_id, hash).await?;
        Ok(reclaimed)
    }

    /// Delete the blob of a content record removed by a committed release.
    pub async fn reclaim(&self, guard: &KeyGuard) -> Result<()> {
        let hash = guard.key();
        if self.blobs.delete(hash).await? {
            info!(hash = %hash, "Reclaimed blob");
        } else {
            warn!(hash = %hash, "Blob already missing at reclaim");
        }
        Ok(())
    }

    /// Look up a content record.
    pub async fn lookup(&self, hash: &str) -> Result<ContentRecord> {
        DedupIndex::lookup(self.db.pool(), hash).await
    }

    /// Open the blob for a content hash.
    pub async fn open(&self, hash: &str) -> Result<tokio::fs::File> {
        self.blobs.open(hash).await
    }

    /// Bring the blob directory in line with the dedup index.
    ///
    /// Run at startup, before any upload is accepted.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport {
            staging_removed: self.blobs.clear_staging().await?,
            ..Default::default()
        };

        let records = DedupIndex::list(self.db.pool()).await?;
        let known: HashSet<&str> = records.iter().map(|r| r.hash.as_str()).collect();

        for hash in self.blobs.list_hashes().await? {
            if known.contains(hash.as_str()) {
                continue;
            }
            let _guard = self.lock(&hash).await;
            // Re-check under the lock
            if DedupIndex::find(self.db.pool(), &hash).await?.is_none()
                && self.blobs.delete(&hash).await?
            {
                report.orphans_removed += 1;
            }
        }

        for record in &records {
            if !self.blobs.exists(&record.hash).await {
                warn!(hash = %record.hash, "Content record has no blob");
                report.missing_blobs.push(record.hash.clone());
            }
        }

        info!(
            staging_removed = report.staging_removed,
            orphans_removed = report.orphans_removed,
            missing_blobs = report.missing_blobs.len(),
            "Content store reconciled"
        );
        Ok(report)
    }
}
