//! User repository for Hoard.

use sqlx::{SqliteConnection, SqlitePool};

use super::user::{NewUser, User};
use crate::{HoardError, Result};

const USER_COLUMNS: &str = "id, username, is_admin, storage_quota, storage_used, created_at";

/// Repository for user CRUD operations.
pub struct UserRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> UserRepository<'a> {
    /// Create a new UserRepository with the given database pool reference.
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new user.
    ///
    /// Fails with a validation error if the username is taken.
    pub async fn create(&self, new_user: &NewUser) -> Result<User> {
        let username = new_user.username.trim();
        if username.is_empty() {
            return Err(HoardError::Validation("username is empty".to_string()));
        }
        if new_user.storage_quota < 0 {
            return Err(HoardError::Validation("quota must not be negative".to_string()));
        }
        if self.get_by_username(username).await?.is_some() {
            return Err(HoardError::Validation(format!(
                "username '{username}' is already taken"
            )));
        }

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO users (username, is_admin, storage_quota) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(username)
        .bind(new_user.is_admin)
        .bind(new_user.storage_quota)
        .fetch_one(self.pool)
        .await?;

        self.get_by_id(id)
            .await?
            .ok_or_else(|| HoardError::NotFound("user".to_string()))
    }

    /// Get a user by ID.
    pub async fn get_by_id(&self, id: i64) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(self.pool)
        .await?;
        Ok(user)
    }

    /// Get a user by username (case-insensitive).
    pub async fn get_by_username(&self, username: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = ? COLLATE NOCASE"
        ))
        .bind(username.trim())
        .fetch_optional(self.pool)
        .await?;
        Ok(user)
    }

    /// Fetch a user or fail with `NotFound`.
    pub async fn require(&self, id: i64) -> Result<User> {
        self.get_by_id(id)
            .await?
            .ok_or_else(|| HoardError::NotFound("user".to_string()))
    }

    /// List all users ordered by username.
    pub async fn list_all(&self) -> Result<Vec<User>> {
        let users = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users ORDER BY username"
        ))
        .fetch_all(self.pool)
        .await?;
        Ok(users)
    }

    /// Change a user's storage ceiling.
    ///
    /// Lowering the ceiling below current usage is allowed; further
    /// reservations fail until usage drops.
    pub async fn set_quota(&self, id: i64, storage_quota: i64) -> Result<User> {
        if storage_quota < 0 {
            return Err(HoardError::Validation("quota must not be negative".to_string()));
        }
        let result = sqlx::query("UPDATE users SET storage_quota = ? WHERE id = ?")
            .bind(storage_quota)
            .bind(id)
            .execute(self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(HoardError::NotFound("user".to_string()));
        }
        self.require(id).await
    }

    /// Delete a user row.
    ///
    /// The user's files must already be gone; folders, grants and quota
    /// charges cascade.
    pub async fn delete(&self, id: i64) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        Self::delete_in(&mut conn, id).await
    }

    /// [`delete`](Self::delete) on a caller-held connection.
    pub async fn delete_in(conn: &mut SqliteConnection, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Count all users.
    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(self.pool)
            .await?;
        Ok(count)
    }
}
