//! User model for Hoard.

use serde::Serialize;

/// A registered user: identity, storage ceiling and current usage.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct User {
    /// Unique user ID.
    pub id: i64,
    /// Login username (unique, case-insensitive).
    pub username: String,
    /// Whether the user is an administrator.
    pub is_admin: bool,
    /// Storage ceiling in bytes.
    pub storage_quota: i64,
    /// Bytes currently counted against the quota.
    pub storage_used: i64,
    /// Account creation timestamp.
    pub created_at: String,
}

impl User {
    /// Bytes still available under the quota.
    pub fn storage_available(&self) -> i64 {
        (self.storage_quota - self.storage_used).max(0)
    }
}

/// Data for creating a new user.
#[derive(Debug, Clone)]
pub struct NewUser {
    /// Login username.
    pub username: String,
    /// Storage ceiling in bytes.
    pub storage_quota: i64,
    /// Administrator flag.
    pub is_admin: bool,
}

impl NewUser {
    /// Create a regular user with the given quota.
    pub fn new(username: impl Into<String>, storage_quota: i64) -> Self {
        Self {
            username: username.into(),
            storage_quota,
            is_admin: false,
        }
    }

    /// Mark the user as an administrator.
    pub fn admin(mut self) -> Self {
        self.is_admin = true;
        self
    }
}
