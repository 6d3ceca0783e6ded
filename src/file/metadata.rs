//! File records and repository for Hoard.
//!
//! A file record is a user's named handle on one content record. Functions
//! take a connection so they can run inside the caller's transaction.

use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::folder::ParentFilter;
use super::validate_name;
use crate::{HoardError, Result};

const FILE_COLUMNS: &str = "f.id, f.owner_id, f.content_hash, f.name, f.folder_id, f.is_public,
     f.downloads, f.created_at, f.updated_at, c.size, c.mime_type";
const FILE_FROM: &str = "FROM files f JOIN content_records c ON c.hash = f.content_hash";

/// A user's file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct FileRecord {
    /// Unique file ID.
    pub id: i64,
    /// Owning user.
    pub owner_id: i64,
    /// Hash of the content this file points at.
    pub content_hash: String,
    /// Display name.
    pub name: String,
    /// Containing folder (None at the root).
    pub folder_id: Option<i64>,
    /// Whether anyone may read the file.
    pub is_public: bool,
    /// Number of times downloaded.
    pub downloads: i64,
    /// When the file was uploaded.
    pub created_at: String,
    /// When the file was last renamed, moved or re-tagged.
    pub updated_at: String,
    /// Content size in bytes.
    pub size: i64,
    /// Content MIME type.
    pub mime_type: String,
    /// Tags, sorted.
    #[sqlx(skip)]
    pub tags: Vec<String>,
}

/// Data for creating a new file record.
#[derive(Debug, Clone)]
pub struct NewFile {
    /// Owning user.
    pub owner_id: i64,
    /// Content hash; the content record must already exist.
    pub content_hash: String,
    /// Display name.
    pub name: String,
    /// Containing folder.
    pub folder_id: Option<i64>,
    /// Public flag.
    pub is_public: bool,
}

impl NewFile {
    /// Create a private root-level file.
    pub fn new(owner_id: i64, content_hash: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner_id,
            content_hash: content_hash.into(),
            name: name.into(),
            folder_id: None,
            is_public: false,
        }
    }

    /// Set the containing folder.
    pub fn in_folder(mut self, folder_id: Option<i64>) -> Self {
        self.folder_id = folder_id;
        self
    }

    /// Set the public flag.
    pub fn public(mut self, is_public: bool) -> Self {
        self.is_public = is_public;
        self
    }
}

/// The parts of a file record needed to delete it.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct FileRef {
    /// File ID.
    pub id: i64,
    /// Owning user.
    pub owner_id: i64,
    /// Content hash.
    pub content_hash: String,
    /// Containing folder.
    pub folder_id: Option<i64>,
}

/// Filters for listing files.
#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    /// Folder constraint.
    pub folder: ParentFilter,
    /// Case-insensitive substring the name must contain.
    pub name_contains: Option<String>,
    /// Tag the file must carry.
    pub tag: Option<String>,
    /// Also list other users' files shared with the caller.
    pub include_shared: bool,
}

impl FileFilter {
    /// Files directly inside `folder_id`.
    pub fn in_folder(folder_id: i64) -> Self {
        Self {
            folder: ParentFilter::In(folder_id),
            ..Default::default()
        }
    }

    /// Restrict to files carrying `tag`.
    pub fn tagged(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Restrict to names containing `needle`.
    pub fn named(mut self, needle: impl Into<String>) -> Self {
        self.name_contains = Some(needle.into());
        self
    }

    /// Include files shared with the caller.
    pub fn with_shared(mut self) -> Self {
        self.include_shared = true;
        self
    }
}

fn push_file_filter(query: &mut QueryBuilder<'_, Sqlite>, filter: &FileFilter) {
    match filter.folder {
        ParentFilter::Any => {}
        ParentFilter::Root => {
            query.push(" AND f.folder_id IS NULL");
        }
        ParentFilter::In(folder_id) => {
            query.push(" AND f.folder_id = ");
            query.push_bind(folder_id);
        }
    }
    if let Some(needle) = &filter.name_contains {
        query.push(" AND instr(lower(f.name), lower(");
        query.push_bind(needle.clone());
        query.push(")) > 0");
    }
    if let Some(tag) = &filter.tag {
        query.push(" AND EXISTS (SELECT 1 FROM file_tags t WHERE t.file_id = f.id AND t.tag = ");
        query.push_bind(tag.trim().to_string());
        query.push(")");
    }
}

/// Repository for file record operations.
pub struct FileRepository;

impl FileRepository {
    /// Insert a file record with its tags.
    ///
    /// `tags` must already be normalized.
    pub async fn create(
        conn: &mut SqliteConnection,
        file: &NewFile,
        tags: &[String],
    ) -> Result<FileRecord> {
        let name = validate_name(&file.name)?;
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO files (owner_id, content_hash, name, folder_id, is_public)
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(file.owner_id)
        .bind(&file.content_hash)
        .bind(&name)
        .bind(file.folder_id)
        .bind(file.is_public)
        .fetch_one(&mut *conn)
        .await?;

        Self::insert_tags(&mut *conn, id, tags).await?;
        Self::require(conn, id).await
    }

    async fn insert_tags(conn: &mut SqliteConnection, file_id: i64, tags: &[String]) -> Result<()> {
        for tag in tags {
            sqlx::query("INSERT OR IGNORE INTO file_tags (file_id, tag) VALUES (?, ?)")
                .bind(file_id)
                .bind(tag)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    /// The deletion handle of a file.
    pub async fn get_ref(conn: &mut SqliteConnection, id: i64) -> Result<FileRef> {
        sqlx::query_as::<_, FileRef>(
            "SELECT id, owner_id, content_hash, folder_id FROM files WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| HoardError::NotFound(format!("file {id}")))
    }

    /// Get a file by ID, tags included.
    pub async fn get_by_id(conn: &mut SqliteConnection, id: i64) -> Result<Option<FileRecord>> {
        let file = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {FILE_COLUMNS} {FILE_FROM} WHERE f.id = ?"
        ))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

        match file {
            Some(mut file) => {
                file.tags = Self::tags(conn, id).await?;
                Ok(Some(file))
            }
            None => Ok(None),
        }
    }

    /// Fetch a file or fail with `NotFound`.
    pub async fn require(conn: &mut SqliteConnection, id: i64) -> Result<FileRecord> {
        Self::get_by_id(conn, id)
            .await?
            .ok_or_else(|| HoardError::NotFound(format!("file {id}")))
    }

    /// Tags on a file, sorted.
    pub async fn tags(conn: &mut SqliteConnection, file_id: i64) -> Result<Vec<String>> {
        let tags = sqlx::query_scalar("SELECT tag FROM file_tags WHERE file_id = ? ORDER BY tag")
            .bind(file_id)
            .fetch_all(&mut *conn)
            .await?;
        Ok(tags)
    }

    /// List files owned by `owner_id` matching `filter`.
    pub async fn list_owned(
        conn: &mut SqliteConnection,
        owner_id: i64,
        filter: &FileFilter,
    ) -> Result<Vec<FileRecord>> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {FILE_COLUMNS} {FILE_FROM} WHERE f.owner_id = "));
        query.push_bind(owner_id);
        push_file_filter(&mut query, filter);
        query.push(" ORDER BY f.name COLLATE NOCASE, f.id");

        let files = query.build_query_as::<FileRecord>().fetch_all(&mut *conn).await?;
        Self::with_tags(conn, files).await
    }

    /// List other users' files that `user_id` can see through a grant on the
    /// file or on one of its folders.
    pub async fn list_shared_with(
        conn: &mut SqliteConnection,
        user_id: i64,
        filter: &FileFilter,
    ) -> Result<Vec<FileRecord>> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
            "WITH RECURSIVE visible(id) AS (
                SELECT folder_id FROM folder_shares WHERE grantee_id = ",
        );
        query.push_bind(user_id);
        query.push(format!(
            "
                UNION
                SELECT c.id FROM folders c JOIN visible v ON c.parent_id = v.id
            )
            SELECT {FILE_COLUMNS} {FILE_FROM}
            WHERE f.owner_id != "
        ));
        query.push_bind(user_id);
        query.push(" AND (f.folder_id IN (SELECT id FROM visible) OR EXISTS (SELECT 1 FROM file_shares s WHERE s.file_id = f.id AND s.grantee_id = ");
        query.push_bind(user_id);
        query.push("))");
        push_file_filter(&mut query, filter);
        query.push(" ORDER BY f.name COLLATE NOCASE, f.id");

        let files = query.build_query_as::<FileRecord>().fetch_all(&mut *conn).await?;
        Self::with_tags(conn, files).await
    }

    async fn with_tags(
        conn: &mut SqliteConnection,
        mut files: Vec<FileRecord>,
    ) -> Result<Vec<FileRecord>> {
        for file in &mut files {
            file.tags = Self::tags(&mut *conn, file.id).await?;
        }
        Ok(files)
    }

    /// Every file in the given folders.
    pub async fn contents_of_folders(
        conn: &mut SqliteConnection,
        folder_ids: &[i64],
    ) -> Result<Vec<FileRef>> {
        if folder_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, owner_id, content_hash, folder_id FROM files WHERE folder_id IN (",
        );
        let mut separated = query.separated(", ");
        for id in folder_ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(") ORDER BY id");

        let rows = query.build_query_as::<FileRef>().fetch_all(&mut *conn).await?;
        Ok(rows)
    }

    /// Every file a user owns.
    pub async fn contents_of_owner(
        conn: &mut SqliteConnection,
        owner_id: i64,
    ) -> Result<Vec<FileRef>> {
        let rows = sqlx::query_as::<_, FileRef>(
            "SELECT id, owner_id, content_hash, folder_id FROM files WHERE owner_id = ? ORDER BY id",
        )
        .bind(owner_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows)
    }

    /// Rename a file.
    pub async fn rename(conn: &mut SqliteConnection, id: i64, name: &str) -> Result<FileRecord> {
        let name = validate_name(name)?;
        let result =
            sqlx::query("UPDATE files SET name = ?, updated_at = datetime('now') WHERE id = ?")
                .bind(&name)
                .bind(id)
                .execute(&mut *conn)
                .await?;
        if result.rows_affected() == 0 {
            return Err(HoardError::NotFound(format!("file {id}")));
        }
        Self::require(conn, id).await
    }

    /// Move a file into `folder_id` (None for the root).
    pub async fn move_to(
        conn: &mut SqliteConnection,
        id: i64,
        folder_id: Option<i64>,
    ) -> Result<FileRecord> {
        let result =
            sqlx::query("UPDATE files SET folder_id = ?, updated_at = datetime('now') WHERE id = ?")
                .bind(folder_id)
                .bind(id)
                .execute(&mut *conn)
                .await?;
        if result.rows_affected() == 0 {
            return Err(HoardError::NotFound(format!("file {id}")));
        }
        Self::require(conn, id).await
    }

    /// Set a file's public flag.
    pub async fn set_public(
        conn: &mut SqliteConnection,
        id: i64,
        is_public: bool,
    ) -> Result<FileRecord> {
        let result =
            sqlx::query("UPDATE files SET is_public = ?, updated_at = datetime('now') WHERE id = ?")
                .bind(is_public)
                .bind(id)
                .execute(&mut *conn)
                .await?;
        if result.rows_affected() == 0 {
            return Err(HoardError::NotFound(format!("file {id}")));
        }
        Self::require(conn, id).await
    }

    /// Replace a file's tags. `tags` must already be normalized.
    pub async fn set_tags(
        conn: &mut SqliteConnection,
        id: i64,
        tags: &[String],
    ) -> Result<FileRecord> {
        let result = sqlx::query("UPDATE files SET updated_at = datetime('now') WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(HoardError::NotFound(format!("file {id}")));
        }
        sqlx::query("DELETE FROM file_tags WHERE file_id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Self::insert_tags(&mut *conn, id, tags).await?;
        Self::require(conn, id).await
    }

    /// Increment the download count for a file, returning the new count.
    pub async fn increment_downloads(conn: &mut SqliteConnection, id: i64) -> Result<i64> {
        let downloads: Option<i64> = sqlx::query_scalar(
            "UPDATE files SET downloads = downloads + 1 WHERE id = ? RETURNING downloads",
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
        downloads.ok_or_else(|| HoardError::NotFound(format!("file {id}")))
    }

    /// Delete a file row, returning its content hash.
    pub async fn delete(conn: &mut SqliteConnection, id: i64) -> Result<Option<String>> {
        let hash = sqlx::query_scalar("DELETE FROM files WHERE id = ? RETURNING content_hash")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(hash)
    }

    /// Move every file in the given folders to the root.
    pub async fn detach_from_folders(
        conn: &mut SqliteConnection,
        folder_ids: &[i64],
    ) -> Result<u64> {
        if folder_ids.is_empty() {
            return Ok(0);
        }
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
            "UPDATE files SET folder_id = NULL, updated_at = datetime('now') WHERE folder_id IN (",
        );
        let mut separated = query.separated(", ");
        for id in folder_ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let result = query.build().execute(&mut *conn).await?;
        Ok(result.rows_affected())
    }
}
