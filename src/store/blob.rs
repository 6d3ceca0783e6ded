//! Content-addressed blob storage.
//!
//! Blobs live in a sharded directory keyed by their SHA-256:
//! ```text
//! {root}/
//! ├── .staging/
//! │   └── 7f0c9c1e-….part        (uploads in flight)
//! ├── 2c/
//! │   └── 2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824
//! └── ...
//! ```
//! Uploads are streamed into `.staging` while being hashed, then renamed into
//! place, so a blob path never exposes a partially written file.

use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{HoardError, Result};

const STAGING_DIR: &str = ".staging";
const COPY_BUF_SIZE: usize = 64 * 1024;

/// Length of a hex-encoded SHA-256 digest.
pub const HASH_LEN: usize = 64;

/// Check that `hash` is a lowercase hex SHA-256 digest.
pub fn is_valid_hash(hash: &str) -> bool {
    hash.len() == HASH_LEN && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Hash a byte slice the same way staged uploads are hashed.
pub fn hash_bytes(content: &[u8]) -> String {
    format!("{:x}", Sha256::digest(content))
}

fn validate_hash(hash: &str) -> Result<()> {
    if is_valid_hash(hash) {
        Ok(())
    } else {
        Err(HoardError::Validation(format!("malformed content hash: {hash}")))
    }
}

/// An upload that has been fully written to the staging area and hashed.
///
/// Dropping a staged blob that was never placed removes its temp file.
#[derive(Debug)]
pub struct StagedBlob {
    path: PathBuf,
    hash: String,
    size: u64,
    placed: bool,
}

impl StagedBlob {
    /// Content hash of the staged bytes.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Number of staged bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for StagedBlob {
    fn drop(&mut self) {
        if !self.placed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove staged upload {:?}: {}", self.path, e);
                }
            }
        }
    }
}

/// Filesystem store for blob bytes.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
    max_upload_bytes: u64,
}

impl BlobStore {
    /// Create a blob store rooted at `root`, creating the directory tree.
    pub fn new(root: impl Into<PathBuf>, max_upload_bytes: u64) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join(STAGING_DIR))?;
        Ok(Self {
            root,
            max_upload_bytes,
        })
    }

    /// Root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Largest upload accepted by [`stage`](Self::stage).
    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_bytes
    }

    /// Path of the blob for `hash`: `{root}/{hash[..2]}/{hash}`.
    pub fn blob_path(&self, hash: &str) -> PathBuf {
        let shard = hash.get(..2).unwrap_or(hash);
        self.root.join(shard).join(hash)
    }

    fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// Stream `reader` into the staging area, hashing as it goes.
    ///
    /// The byte count must equal `declared_size` and may not exceed the
    /// configured maximum; both are validation errors.
    pub async fn stage<R>(&self, mut reader: R, declared_size: u64) -> Result<StagedBlob>
    where
        R: AsyncRead + Unpin,
    {
        if declared_size > self.max_upload_bytes {
            return Err(HoardError::Validation(format!(
                "upload of {declared_size} bytes exceeds the {} byte limit",
                self.max_upload_bytes
            )));
        }

        let path = self.staging_dir().join(format!("{}.part", Uuid::new_v4()));
        let mut file = fs::File::create(&path).await?;
        // From here on the guard cleans up the temp file on any early return.
        let mut staged = StagedBlob {
            path,
            hash: String::new(),
            size: 0,
            placed: false,
        };

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            staged.size += n as u64;
            if staged.size > declared_size {
                return Err(HoardError::Validation(format!(
                    "upload is longer than the declared {declared_size} bytes"
                )));
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
        }

        if staged.size != declared_size {
            return Err(HoardError::Validation(format!(
                "upload ended after {} of {declared_size} declared bytes",
                staged.size
            )));
        }

        file.flush().await?;
        file.sync_all().await?;
        staged.hash = format!("{:x}", hasher.finalize());

        debug!(hash = %staged.hash, size = staged.size, "Upload staged");
        Ok(staged)
    }

    /// Move a staged upload into its content-addressed location.
    pub async fn place(&self, mut staged: StagedBlob) -> Result<PathBuf> {
        let target = self.blob_path(&staged.hash);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&staged.path, &target).await?;
        staged.placed = true;
        Ok(target)
    }

    /// Open a blob for reading.
    pub async fn open(&self, hash: &str) -> Result<fs::File> {
        validate_hash(hash)?;
        match fs::File::open(self.blob_path(hash)).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(HoardError::NotFound(format!("blob {hash}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read a whole blob into memory.
    pub async fn read(&self, hash: &str) -> Result<Vec<u8>> {
        let mut file = self.open(hash).await?;
        let mut content = Vec::new();
        file.read_to_end(&mut content).await?;
        Ok(content)
    }

    /// Delete a blob. Returns `false` if it did not exist.
    pub async fn delete(&self, hash: &str) -> Result<bool> {
        validate_hash(hash)?;
        match fs::remove_file(self.blob_path(hash)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Check whether a blob file exists.
    pub async fn exists(&self, hash: &str) -> bool {
        is_valid_hash(hash) && fs::try_exists(self.blob_path(hash)).await.unwrap_or(false)
    }

    /// List the hashes of every blob on disk.
    pub async fn list_hashes(&self) -> Result<Vec<String>> {
        let mut hashes = Vec::new();
        let mut shards = fs::read_dir(&self.root).await?;

        while let Some(shard) = shards.next_entry().await? {
            if shard.file_name() == STAGING_DIR || !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = fs::read_dir(shard.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                if let Some(name) = entry.file_name().to_str() {
                    if is_valid_hash(name) {
                        hashes.push(name.to_string());
                    }
                }
            }
        }

        hashes.sort();
        Ok(hashes)
    }

    /// Remove leftover staging files from interrupted uploads.
    ///
    /// Only safe while no upload is in flight, i.e. at startup.
    pub async fn clear_staging(&self) -> Result<usize> {
        let mut removed = 0;
        let mut entries = fs::read_dir(self.staging_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
