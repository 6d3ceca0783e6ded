//! Folder types and repository for Hoard.

use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

use super::validate_name;
use crate::{HoardError, Result};

const FOLDER_COLUMNS: &str = "id, owner_id, name, parent_id, is_public, created_at, updated_at";
const FOLDER_COLUMNS_F: &str =
    "f.id, f.owner_id, f.name, f.parent_id, f.is_public, f.created_at, f.updated_at";

/// A folder in a user's hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Folder {
    /// Unique folder ID.
    pub id: i64,
    /// Owning user.
    pub owner_id: i64,
    /// Folder name.
    pub name: String,
    /// Parent folder ID (None for root folders).
    pub parent_id: Option<i64>,
    /// Whether anyone may read the folder's contents.
    pub is_public: bool,
    /// When the folder was created.
    pub created_at: String,
    /// When the folder was last renamed, moved or re-flagged.
    pub updated_at: String,
}

/// Data for creating a new folder.
#[derive(Debug, Clone)]
pub struct NewFolder {
    /// Owning user.
    pub owner_id: i64,
    /// Folder name.
    pub name: String,
    /// Parent folder ID (None for root folders).
    pub parent_id: Option<i64>,
    /// Public flag.
    pub is_public: bool,
}

impl NewFolder {
    /// Create a private root folder.
    pub fn new(owner_id: i64, name: impl Into<String>) -> Self {
        Self {
            owner_id,
            name: name.into(),
            parent_id: None,
            is_public: false,
        }
    }

    /// Set the parent folder.
    pub fn with_parent(mut self, parent_id: Option<i64>) -> Self {
        self.parent_id = parent_id;
        self
    }

    /// Set the public flag.
    pub fn public(mut self, is_public: bool) -> Self {
        self.is_public = is_public;
        self
    }
}

/// Which parent a listed folder (or file) must have.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ParentFilter {
    /// Anywhere in the tree.
    #[default]
    Any,
    /// Directly at the root.
    Root,
    /// Directly inside the given folder.
    In(i64),
}

/// Filters for listing folders.
#[derive(Debug, Clone, Default)]
pub struct FolderFilter {
    /// Parent constraint.
    pub parent: ParentFilter,
    /// Case-insensitive substring the name must contain.
    pub name_contains: Option<String>,
    /// Also list other users' folders shared with the caller.
    pub include_shared: bool,
    /// Only public folders.
    pub public_only: bool,
}

impl FolderFilter {
    /// Folders directly at the root.
    pub fn root() -> Self {
        Self {
            parent: ParentFilter::Root,
            ..Default::default()
        }
    }

    /// Folders directly inside `parent_id`.
    pub fn children_of(parent_id: i64) -> Self {
        Self {
            parent: ParentFilter::In(parent_id),
            ..Default::default()
        }
    }

    /// Restrict to names containing `needle`.
    pub fn named(mut self, needle: impl Into<String>) -> Self {
        self.name_contains = Some(needle.into());
        self
    }

    /// Include folders shared with the caller.
    pub fn with_shared(mut self) -> Self {
        self.include_shared = true;
        self
    }
}

/// What happens to files inside a deleted folder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeletePolicy {
    /// Delete the files and release their content.
    #[default]
    Cascade,
    /// Move the files to the root.
    Detach,
}

/// Append the parent/name/public constraints of `filter` to a query whose
/// folder table is aliased `f`.
fn push_folder_filter(query: &mut QueryBuilder<'_, Sqlite>, filter: &FolderFilter) {
    match filter.parent {
        ParentFilter::Any => {}
        ParentFilter::Root => {
            query.push(" AND f.parent_id IS NULL");
        }
        ParentFilter::In(parent_id) => {
            query.push(" AND f.parent_id = ");
            query.push_bind(parent_id);
        }
    }
    if let Some(needle) = &filter.name_contains {
        query.push(" AND instr(lower(f.name), lower(");
        query.push_bind(needle.clone());
        query.push(")) > 0");
    }
    if filter.public_only {
        query.push(" AND f.is_public = 1");
    }
}

/// Repository for folder operations.
pub struct FolderRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> FolderRepository<'a> {
    /// Create a new FolderRepository with the given database pool reference.
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new folder.
    ///
    /// The parent, if any, must exist and belong to the same owner.
    pub async fn create(&self, folder: &NewFolder) -> Result<Folder> {
        let name = validate_name(&folder.name)?;
        if let Some(parent_id) = folder.parent_id {
            let parent = self.require(parent_id).await?;
            if parent.owner_id != folder.owner_id {
                return Err(HoardError::Validation(
                    "parent folder belongs to another user".to_string(),
                ));
            }
        }

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO folders (owner_id, name, parent_id, is_public) VALUES (?, ?, ?, ?)
             RETURNING id",
        )
        .bind(folder.owner_id)
        .bind(&name)
        .bind(folder.parent_id)
        .bind(folder.is_public)
        .fetch_one(self.pool)
        .await?;

        self.require(id).await
    }

    /// Get a folder by ID.
    pub async fn get_by_id(&self, id: i64) -> Result<Option<Folder>> {
        let folder = sqlx::query_as::<_, Folder>(&format!(
            "SELECT {FOLDER_COLUMNS} FROM folders WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(self.pool)
        .await?;
        Ok(folder)
    }

    /// Fetch a folder or fail with `NotFound`.
    pub async fn require(&self, id: i64) -> Result<Folder> {
        self.get_by_id(id)
            .await?
            .ok_or_else(|| HoardError::NotFound(format!("folder {id}")))
    }

    /// List folders owned by `owner_id` matching `filter`.
    ///
    /// `filter.include_shared` is ignored here; see [`list_shared_with`](Self::list_shared_with).
    pub async fn list(&self, owner_id: i64, filter: &FolderFilter) -> Result<Vec<Folder>> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {FOLDER_COLUMNS_F} FROM folders f WHERE f.owner_id = "
        ));
        query.push_bind(owner_id);
        push_folder_filter(&mut query, filter);
        query.push(" ORDER BY f.name COLLATE NOCASE, f.id");

        let folders = query
            .build_query_as::<Folder>()
            .fetch_all(self.pool)
            .await?;
        Ok(folders)
    }

    /// List other users' folders that `user_id` can see through a folder grant.
    ///
    /// A grant on a folder makes its whole subtree visible.
    pub async fn list_shared_with(&self, user_id: i64, filter: &FolderFilter) -> Result<Vec<Folder>> {
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
            SELECT {FOLDER_COLUMNS_F} FROM folders f
            WHERE f.id IN (SELECT id FROM visible) AND f.owner_id != "
        ));
        query.push_bind(user_id);
        push_folder_filter(&mut query, filter);
        query.push(" ORDER BY f.name COLLATE NOCASE, f.id");

        let folders = query
            .build_query_as::<Folder>()
            .fetch_all(self.pool)
            .await?;
        Ok(folders)
    }

    /// List child folders of a parent folder.
    pub async fn list_by_parent(&self, parent_id: i64) -> Result<Vec<Folder>> {
        let folders = sqlx::query_as::<_, Folder>(&format!(
            "SELECT {FOLDER_COLUMNS} FROM folders WHERE parent_id = ?
             ORDER BY name COLLATE NOCASE, id"
        ))
        .bind(parent_id)
        .fetch_all(self.pool)
        .await?;
        Ok(folders)
    }

    /// Rename a folder.
    pub async fn rename(&self, id: i64, name: &str) -> Result<Folder> {
        let name = validate_name(name)?;
        let result =
            sqlx::query("UPDATE folders SET name = ?, updated_at = datetime('now') WHERE id = ?")
                .bind(&name)
                .bind(id)
                .execute(self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(HoardError::NotFound(format!("folder {id}")));
        }
        self.require(id).await
    }

    /// Set a folder's public flag.
    pub async fn set_public(&self, id: i64, is_public: bool) -> Result<Folder> {
        let mut conn = self.pool.acquire().await?;
        Self::set_public_in(&mut conn, id, is_public).await?;
        drop(conn);
        self.require(id).await
    }

    /// [`set_public`](Self::set_public) on a caller-held connection.
    pub async fn set_public_in(conn: &mut SqliteConnection, id: i64, is_public: bool) -> Result<()> {
        let result = sqlx::query(
            "UPDATE folders SET is_public = ?, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(is_public)
        .bind(id)
        .execute(&mut *conn)
        .await?;
        if result.rows_affected() == 0 {
            return Err(HoardError::NotFound(format!("folder {id}")));
        }
        Ok(())
    }

    /// Move a folder under `new_parent_id` (None moves it to the root).
    ///
    /// The cycle check and the move are one UPDATE: the row only changes if
    /// the folder is not among the new parent's ancestors (itself included).
    pub async fn reparent(&self, id: i64, new_parent_id: Option<i64>) -> Result<Folder> {
        let folder = self.require(id).await?;

        let result = match new_parent_id {
            None => {
                sqlx::query(
                    "UPDATE folders SET parent_id = NULL, updated_at = datetime('now') WHERE id = ?",
                )
                .bind(id)
                .execute(self.pool)
                .await?
            }
            Some(parent_id) => {
                let parent = self.require(parent_id).await?;
                if parent.owner_id != folder.owner_id {
                    return Err(HoardError::Validation(
                        "cannot move a folder under another user's folder".to_string(),
                    ));
                }
                sqlx::query(
                    "UPDATE folders SET parent_id = ?, updated_at = datetime('now')
                     WHERE id = ? AND NOT EXISTS (
                         WITH RECURSIVE chain(id) AS (
                             SELECT ?
                             UNION
                             SELECT p.parent_id FROM folders p JOIN chain c ON p.id = c.id
                             WHERE p.parent_id IS NOT NULL
                         )
                         SELECT 1 FROM chain WHERE id = ?
                     )",
                )
                .bind(parent_id)
                .bind(id)
                .bind(parent_id)
                .bind(id)
                .execute(self.pool)
                .await?
            }
        };

        if result.rows_affected() == 0 {
            // The folder existed above, so the guard rejected the move
            // (unless it was deleted in between).
            return match self.get_by_id(id).await? {
                Some(_) => Err(HoardError::Cycle(format!(
                    "folder {id} cannot be moved under its own descendant"
                ))),
                None => Err(HoardError::NotFound(format!("folder {id}"))),
            };
        }
        self.require(id).await
    }

    /// Ancestors of a folder, nearest first (the folder itself excluded).
    pub async fn ancestors(&self, id: i64) -> Result<Vec<Folder>> {
        let folders = sqlx::query_as::<_, Folder>(&format!(
            "WITH RECURSIVE chain(id, depth) AS (
                 SELECT parent_id, 1 FROM folders WHERE id = ? AND parent_id IS NOT NULL
                 UNION ALL
                 SELECT p.parent_id, c.depth + 1 FROM folders p JOIN chain c ON p.id = c.id
                 WHERE p.parent_id IS NOT NULL
             )
             SELECT {FOLDER_COLUMNS_F} FROM folders f JOIN chain ON f.id = chain.id
             ORDER BY chain.depth"
        ))
        .bind(id)
        .fetch_all(self.pool)
        .await?;
        Ok(folders)
    }

    /// All folders below a folder, shallowest first (the folder itself excluded).
    pub async fn descendants(&self, id: i64) -> Result<Vec<Folder>> {
        let folders = sqlx::query_as::<_, Folder>(&format!(
            "WITH RECURSIVE tree(id, depth) AS (
                 SELECT id, 1 FROM folders WHERE parent_id = ?
                 UNION ALL
                 SELECT c.id, t.depth + 1 FROM folders c JOIN tree t ON c.parent_id = t.id
             )
             SELECT {FOLDER_COLUMNS_F} FROM folders f JOIN tree ON f.id = tree.id
             ORDER BY tree.depth, f.id"
        ))
        .bind(id)
        .fetch_all(self.pool)
        .await?;
        Ok(folders)
    }

    /// Get the path from root to a folder, inclusive.
    pub async fn get_path(&self, id: i64) -> Result<Vec<Folder>> {
        let folder = self.require(id).await?;
        let mut path = self.ancestors(id).await?;
        path.reverse();
        path.push(folder);
        Ok(path)
    }

    /// Count files directly in a folder.
    pub async fn count_files(&self, folder_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE folder_id = ?")
            .bind(folder_id)
            .fetch_one(self.pool)
            .await?;
        Ok(count)
    }

    /// IDs of a folder and every folder below it.
    pub async fn subtree_ids(&self, id: i64) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar(
            "WITH RECURSIVE tree(id) AS (
                 SELECT id FROM folders WHERE id = ?
                 UNION
                 SELECT c.id FROM folders c JOIN tree t ON c.parent_id = t.id
             )
             SELECT id FROM tree ORDER BY id",
        )
        .bind(id)
        .fetch_all(self.pool)
        .await?;
        Ok(ids)
    }

    /// Delete a folder row; child folders cascade and contained files are
    /// detached by the foreign key.
    pub async fn delete(&self, id: i64) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        Self::delete_in(&mut conn, id).await
    }

    /// [`delete`](Self::delete) on a caller-held connection.
    pub async fn delete_in(conn: &mut SqliteConnection, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM folders WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NewUser, UserRepository};
    use crate::Database;

    async fn setup_db() -> (Database, i64, i64) {
        let db = Database::open_in_memory().await.unwrap();
        let users = UserRepository::new(db.pool());
        let alice = users.create(&NewUser::new("alice", 1000)).await.unwrap();
        let bob = users.create(&NewUser::new("bob", 1000)).await.unwrap();
        (db, alice.id, bob.id)
    }

    #[tokio::test]
    async fn test_create_folder() {
        let (db, alice, _) = setup_db().await;
        let repo = FolderRepository::new(db.pool());

        let folder = repo
            .create(&NewFolder::new(alice, " Documents ").public(true))
            .await
            .unwrap();

        assert_eq!(folder.name, "Documents");
        assert_eq!(folder.owner_id, alice);
        assert!(folder.parent_id.is_none());
        assert!(folder.is_public);
    }

    #[tokio::test]
    async fn test_create_subfolder() {
        let (db, alice, _) = setup_db().await;
        let repo = FolderRepository::new(db.pool());

        let parent = repo.create(&NewFolder::new(alice, "parent")).await.unwrap();
        let child = repo
            .create(&NewFolder::new(alice, "child").with_parent(Some(parent.id)))
            .await
            .unwrap();

        assert_eq!(child.parent_id, Some(parent.id));
        let children = repo.list_by_parent(parent.id).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, child.id);
    }

    #[tokio::test]
    async fn test_create_rejects_foreign_or_missing_parent() {
        let (db, alice, bob) = setup_db().await;
        let repo = FolderRepository::new(db.pool());

        let bobs = repo.create(&NewFolder::new(bob, "bobs")).await.unwrap();

        let foreign = repo
            .create(&NewFolder::new(alice, "x").with_parent(Some(bobs.id)))
            .await;
        assert!(matches!(foreign, Err(HoardError::Validation(_))));

        let missing = repo
            .create(&NewFolder::new(alice, "x").with_parent(Some(9999)))
            .await;
        assert!(matches!(missing, Err(HoardError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_create_rejects_bad_name() {
        let (db, alice, _) = setup_db().await;
        let repo = FolderRepository::new(db.pool());

        assert!(repo.create(&NewFolder::new(alice, "")).await.is_err());
        assert!(repo.create(&NewFolder::new(alice, "a/b")).await.is_err());
    }

    #[tokio::test]
    async fn test_list_with_filter() {
        let (db, alice, bob) = setup_db().await;
        let repo = FolderRepository::new(db.pool());

        let photos = repo.create(&NewFolder::new(alice, "Photos")).await.unwrap();
        repo.create(&NewFolder::new(alice, "Music")).await.unwrap();
        repo.create(&NewFolder::new(alice, "Holiday photos").with_parent(Some(photos.id)))
            .await
            .unwrap();
        repo.create(&NewFolder::new(bob, "Photos")).await.unwrap();

        let all = repo.list(alice, &FolderFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);

        let root = repo.list(alice, &FolderFilter::root()).await.unwrap();
        let names: Vec<&str> = root.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["Music", "Photos"]);

        let named = repo
            .list(alice, &FolderFilter::default().named("PHOTO"))
            .await
            .unwrap();
        assert_eq!(named.len(), 2);

        let children = repo
            .list(alice, &FolderFilter::children_of(photos.id))
            .await
            .unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name, "Holiday photos");
    }

    #[tokio::test]
    async fn test_list_shared_with_includes_subtree() {
        let (db, alice, bob) = setup_db().await;
        let repo = FolderRepository::new(db.pool());

        let shared = repo.create(&NewFolder::new(alice, "shared")).await.unwrap();
        let inner = repo
            .create(&NewFolder::new(alice, "inner").with_parent(Some(shared.id)))
            .await
            .unwrap();
        repo.create(&NewFolder::new(alice, "private")).await.unwrap();

        sqlx::query("INSERT INTO folder_shares (folder_id, grantee_id, permission) VALUES (?, ?, 'read')")
            .bind(shared.id)
            .bind(bob)
            .execute(db.pool())
            .await
            .unwrap();

        let visible = repo
            .list_shared_with(bob, &FolderFilter::default())
            .await
            .unwrap();
        let ids: Vec<i64> = visible.iter().map(|f| f.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&shared.id));
        assert!(ids.contains(&inner.id));

        let root_only = repo.list_shared_with(bob, &FolderFilter::root()).await.unwrap();
        assert_eq!(root_only.len(), 1);
        assert_eq!(root_only[0].id, shared.id);
    }

    #[tokio::test]
    async fn test_rename_and_set_public() {
        let (db, alice, _) = setup_db().await;
        let repo = FolderRepository::new(db.pool());

        let folder = repo.create(&NewFolder::new(alice, "old")).await.unwrap();
        let renamed = repo.rename(folder.id, "new").await.unwrap();
        assert_eq!(renamed.name, "new");

        let public = repo.set_public(folder.id, true).await.unwrap();
        assert!(public.is_public);

        assert!(matches!(
            repo.rename(9999, "x").await,
            Err(HoardError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reparent_to_unrelated_folder() {
        let (db, alice, _) = setup_db().await;
        let repo = FolderRepository::new(db.pool());

        let a = repo.create(&NewFolder::new(alice, "a")).await.unwrap();
        let b = repo.create(&NewFolder::new(alice, "b")).await.unwrap();

        let moved = repo.reparent(a.id, Some(b.id)).await.unwrap();
        assert_eq!(moved.parent_id, Some(b.id));
        assert_eq!(repo.list_by_parent(b.id).await.unwrap().len(), 1);

        let back = repo.reparent(a.id, None).await.unwrap();
        assert!(back.parent_id.is_none());
    }

    #[tokio::test]
    async fn test_reparent_under_descendant_is_cycle() {
        let (db, alice, _) = setup_db().await;
        let repo = FolderRepository::new(db.pool());

        let a = repo.create(&NewFolder::new(alice, "a")).await.unwrap();
        let b = repo
            .create(&NewFolder::new(alice, "b").with_parent(Some(a.id)))
            .await
            .unwrap();
        let c = repo
            .create(&NewFolder::new(alice, "c").with_parent(Some(b.id)))
            .await
            .unwrap();

        assert!(matches!(
            repo.reparent(a.id, Some(c.id)).await,
            Err(HoardError::Cycle(_))
        ));
        assert!(matches!(
            repo.reparent(a.id, Some(a.id)).await,
            Err(HoardError::Cycle(_))
        ));
        // Tree unchanged
        assert!(repo.require(a.id).await.unwrap().parent_id.is_none());
    }

    #[tokio::test]
    async fn test_reparent_under_foreign_folder_rejected() {
        let (db, alice, bob) = setup_db().await;
        let repo = FolderRepository::new(db.pool());

        let a = repo.create(&NewFolder::new(alice, "a")).await.unwrap();
        let b = repo.create(&NewFolder::new(bob, "b")).await.unwrap();

        assert!(matches!(
            repo.reparent(a.id, Some(b.id)).await,
            Err(HoardError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_ancestors_descendants_and_path() {
        let (db, alice, _) = setup_db().await;
        let repo = FolderRepository::new(db.pool());

        let a = repo.create(&NewFolder::new(alice, "a")).await.unwrap();
        let b = repo
            .create(&NewFolder::new(alice, "b").with_parent(Some(a.id)))
            .await
            .unwrap();
        let c = repo
            .create(&NewFolder::new(alice, "c").with_parent(Some(b.id)))
            .await
            .unwrap();

        let ancestors: Vec<i64> = repo.ancestors(c.id).await.unwrap().iter().map(|f| f.id).collect();
        assert_eq!(ancestors, vec![b.id, a.id]);
        assert!(repo.ancestors(a.id).await.unwrap().is_empty());

        let descendants: Vec<i64> = repo
            .descendants(a.id)
            .await
            .unwrap()
            .iter()
            .map(|f| f.id)
            .collect();
        assert_eq!(descendants, vec![b.id, c.id]);

        let path: Vec<String> = repo
            .get_path(c.id)
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(path, vec!["a", "b", "c"]);

        let mut subtree = repo.subtree_ids(a.id).await.unwrap();
        subtree.sort();
        assert_eq!(subtree, vec![a.id, b.id, c.id]);
    }

    #[tokio::test]
    async fn test_delete_cascades_children() {
        let (db, alice, _) = setup_db().await;
        let repo = FolderRepository::new(db.pool());

        let a = repo.create(&NewFolder::new(alice, "a")).await.unwrap();
        let b = repo
            .create(&NewFolder::new(alice, "b").with_parent(Some(a.id)))
            .await
            .unwrap();

        assert!(repo.delete(a.id).await.unwrap());
        assert!(repo.get_by_id(b.id).await.unwrap().is_none());
        assert!(!repo.delete(a.id).await.unwrap());
    }
}
