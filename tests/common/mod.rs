//! Test helpers for integration tests.
//!
//! Builds a vault over a file-backed database in a temporary directory, so
//! concurrent tasks get real separate connections.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use hoard::config::NotifierConfig;
use hoard::store::{hash_bytes, BlobStore, ContentStore, DedupIndex};
use hoard::{ChangeNotifier, Database, FileRecord, MutationGovernor, UploadRequest, Vault};

/// One mebibyte.
pub const MB: i64 = 1024 * 1024;

/// A vault plus the directory holding its database and blobs.
pub struct TestVault {
    pub dir: TempDir,
    pub vault: Vault,
}

impl TestVault {
    /// Vault with an effectively unlimited mutation rate.
    pub async fn new(default_quota: i64) -> Self {
        Self::with_governor(
            default_quota,
            MutationGovernor::with_limits(1_000_000, Duration::from_secs(1)),
        )
        .await
    }

    /// Vault with a custom governor.
    pub async fn with_governor(default_quota: i64, governor: MutationGovernor) -> Self {
        let dir = TempDir::new().unwrap();
        let vault = open_vault(dir.path(), default_quota, governor).await;
        Self { dir, vault }
    }

    /// Create a regular user and return its ID.
    pub async fn user(&self, username: &str) -> i64 {
        self.vault
            .create_user(username, None, false)
            .await
            .unwrap()
            .id
    }

    /// Current reference count of `content`, if it is stored.
    pub async fn ref_count(&self, content: &[u8]) -> Option<i64> {
        DedupIndex::find(self.vault.db().pool(), &hash_bytes(content))
            .await
            .unwrap()
            .map(|r| r.ref_count)
    }

    /// Number of blob files on disk.
    pub async fn blob_count(&self) -> usize {
        self.vault.store().blobs().list_hashes().await.unwrap().len()
    }
}

/// Open (or reopen) a vault rooted at `root`.
pub async fn open_vault(root: &Path, default_quota: i64, governor: MutationGovernor) -> Vault {
    let db = Database::open(root.join("hoard.db"), 8).await.unwrap();
    let blobs = BlobStore::new(root.join("blobs"), 64 * MB as u64).unwrap();
    let store = ContentStore::new(db.clone(), blobs);
    let notifier = ChangeNotifier::new(&NotifierConfig::default());
    Vault::new(db, store, notifier, Arc::new(governor), default_quota)
}

/// Upload `content` as `name` into the root folder.
pub async fn upload(
    vault: &Vault,
    user_id: i64,
    name: &str,
    content: &[u8],
) -> hoard::Result<FileRecord> {
    vault
        .upload_file(UploadRequest::new(
            user_id,
            name,
            content,
            content.len() as u64,
        ))
        .await
}
