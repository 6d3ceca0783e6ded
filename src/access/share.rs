//! Share grants on files and folders.

use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};

use super::{Permission, ResourceRef};
use crate::{HoardError, Result};

/// An explicit grant of `permission` on a resource to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShareGrant {
    /// The shared file or folder.
    pub resource: ResourceRef,
    /// User the grant is for.
    pub grantee_id: i64,
    /// Grantee's username.
    pub grantee_username: String,
    /// Granted level.
    pub permission: Permission,
    /// When the grant was made or last changed.
    pub created_at: String,
}

#[derive(sqlx::FromRow)]
struct GrantRow {
    resource_id: i64,
    grantee_id: i64,
    grantee_username: String,
    permission: String,
    created_at: String,
}

fn table_for(resource: ResourceRef) -> (&'static str, &'static str, i64) {
    match resource {
        ResourceRef::File(id) => ("file_shares", "file_id", id),
        ResourceRef::Folder(id) => ("folder_shares", "folder_id", id),
    }
}

/// Repository for share grants.
pub struct ShareRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ShareRepository<'a> {
    /// Create a new ShareRepository with the given database pool reference.
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Grant `permission` on `resource` to `grantee_id`.
    ///
    /// Re-granting replaces the previous level.
    pub async fn grant(
        &self,
        resource: ResourceRef,
        grantee_id: i64,
        permission: Permission,
    ) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        Self::grant_in(&mut conn, resource, grantee_id, permission).await
    }

    /// [`grant`](Self::grant) on a caller-held connection.
    pub async fn grant_in(
        conn: &mut SqliteConnection,
        resource: ResourceRef,
        grantee_id: i64,
        permission: Permission,
    ) -> Result<()> {
        if !permission.is_grantable() {
            return Err(HoardError::Validation(
                "a share grant needs read, write or admin".to_string(),
            ));
        }
        let (table, column, id) = table_for(resource);
        sqlx::query(&format!(
            "INSERT INTO {table} ({column}, grantee_id, permission) VALUES (?, ?, ?)
             ON CONFLICT({column}, grantee_id) DO UPDATE
             SET permission = excluded.permission, created_at = datetime('now')"
        ))
        .bind(id)
        .bind(grantee_id)
        .bind(permission.as_str())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Remove a grant. Returns `false` if there was none.
    pub async fn revoke(&self, resource: ResourceRef, grantee_id: i64) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        Self::revoke_in(&mut conn, resource, grantee_id).await
    }

    /// [`revoke`](Self::revoke) on a caller-held connection.
    pub async fn revoke_in(
        conn: &mut SqliteConnection,
        resource: ResourceRef,
        grantee_id: i64,
    ) -> Result<bool> {
        let (table, column, id) = table_for(resource);
        let result = sqlx::query(&format!(
            "DELETE FROM {table} WHERE {column} = ? AND grantee_id = ?"
        ))
        .bind(id)
        .bind(grantee_id)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// The explicit grant on `resource` for `grantee_id`, if any.
    pub async fn get(&self, resource: ResourceRef, grantee_id: i64) -> Result<Option<Permission>> {
        let (table, column, id) = table_for(resource);
        let permission: Option<String> = sqlx::query_scalar(&format!(
            "SELECT permission FROM {table} WHERE {column} = ? AND grantee_id = ?"
        ))
        .bind(id)
        .bind(grantee_id)
        .fetch_optional(self.pool)
        .await?;

        permission
            .map(|p| p.parse().map_err(HoardError::Database))
            .transpose()
    }

    /// Every grant on a resource, ordered by grantee username.
    pub async fn list_for(&self, resource: ResourceRef) -> Result<Vec<ShareGrant>> {
        let (table, column, id) = table_for(resource);
        let rows = sqlx::query_as::<_, GrantRow>(&format!(
            "SELECT s.{column} AS resource_id, s.grantee_id, u.username AS grantee_username,
                    s.permission, s.created_at
             FROM {table} s JOIN users u ON u.id = s.grantee_id
             WHERE s.{column} = ?
             ORDER BY u.username COLLATE NOCASE"
        ))
        .bind(id)
        .fetch_all(self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(ShareGrant {
                    resource: match resource {
                        ResourceRef::File(_) => ResourceRef::File(row.resource_id),
                        ResourceRef::Folder(_) => ResourceRef::Folder(row.resource_id),
                    },
                    grantee_id: row.grantee_id,
                    grantee_username: row.grantee_username,
                    permission: row.permission.parse().map_err(HoardError::Database)?,
                    created_at: row.created_at,
                })
            })
            .collect()
    }

    /// Nearest folder grant for `grantee_id`, walking up from `folder_id`
    /// (inclusive) to the root.
    pub async fn nearest_folder_grant(
        &self,
        folder_id: i64,
        grantee_id: i64,
    ) -> Result<Option<Permission>> {
        let permission: Option<String> = sqlx::query_scalar(
            "WITH RECURSIVE chain(id, depth) AS (
                 SELECT ?, 0
                 UNION ALL
                 SELECT p.parent_id, c.depth + 1 FROM folders p JOIN chain c ON p.id = c.id
                 WHERE p.parent_id IS NOT NULL
             )
             SELECT s.permission FROM chain JOIN folder_shares s ON s.folder_id = chain.id
             WHERE s.grantee_id = ?
             ORDER BY chain.depth
             LIMIT 1",
        )
        .bind(folder_id)
        .bind(grantee_id)
        .fetch_optional(self.pool)
        .await?;

        permission
            .map(|p| p.parse().map_err(HoardError::Database))
            .transpose()
    }
}
