//! Effective permission resolution.

use sqlx::SqlitePool;
use tracing::trace;

use super::{Action, Permission, ResourceRef, ShareRepository};
use crate::{HoardError, Result};

/// Ownership and placement of a resource, as needed for resolution.
#[derive(Debug, sqlx::FromRow)]
struct Placement {
    owner_id: i64,
    /// Containing folder (for a folder: its parent).
    container_id: Option<i64>,
    is_public: bool,
}

/// Resolves what a user may do to a file or folder.
///
/// First match wins:
/// 1. the owner gets `Admin`
/// 2. an explicit grant on the resource
/// 3. the nearest folder above the resource with a grant for the user
/// 4. `Read` if the resource or its containing folder is public
/// 5. otherwise `None`
pub struct AccessResolver<'a> {
    pool: &'a SqlitePool,
}

impl<'a> AccessResolver<'a> {
    /// Create a resolver over the given database pool reference.
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    async fn placement(&self, resource: ResourceRef) -> Result<Placement> {
        let query = match resource {
            ResourceRef::File(_) => {
                "SELECT owner_id, folder_id AS container_id, is_public FROM files WHERE id = ?"
            }
            ResourceRef::Folder(_) => {
                "SELECT owner_id, parent_id AS container_id, is_public FROM folders WHERE id = ?"
            }
        };
        let id = match resource {
            ResourceRef::File(id) | ResourceRef::Folder(id) => id,
        };

        sqlx::query_as::<_, Placement>(query)
            .bind(id)
            .fetch_optional(self.pool)
            .await?
            .ok_or_else(|| HoardError::NotFound(resource.to_string()))
    }

    /// Effective permission of `user_id` on `resource`.
    pub async fn resolve(&self, user_id: i64, resource: ResourceRef) -> Result<Permission> {
        let placement = self.placement(resource).await?;

        if placement.owner_id == user_id {
            return Ok(Permission::Admin);
        }

        let shares = ShareRepository::new(self.pool);
        if let Some(permission) = shares.get(resource, user_id).await? {
            trace!(user_id, %resource, %permission, "Explicit grant");
            return Ok(permission);
        }

        if let Some(container_id) = placement.container_id {
            if let Some(permission) = shares.nearest_folder_grant(container_id, user_id).await? {
                trace!(user_id, %resource, %permission, "Inherited grant");
                return Ok(permission);
            }
        }

        if placement.is_public {
            return Ok(Permission::Read);
        }
        if let Some(container_id) = placement.container_id {
            let container_public: bool =
                sqlx::query_scalar("SELECT is_public FROM folders WHERE id = ?")
                    .bind(container_id)
                    .fetch_optional(self.pool)
                    .await?
                    .unwrap_or(false);
            if container_public {
                return Ok(Permission::Read);
            }
        }

        Ok(Permission::None)
    }

    /// Resolve and fail with `PermissionDenied` unless `action` is allowed.
    ///
    /// A resource the user cannot even read is reported as not found, so
    /// its existence is not revealed.
    pub async fn require(
        &self,
        user_id: i64,
        resource: ResourceRef,
        action: Action,
    ) -> Result<Permission> {
        let permission = self.resolve(user_id, resource).await?;
        if permission.allows(action.required()) {
            return Ok(permission);
        }
        if permission == Permission::None {
            return Err(HoardError::NotFound(resource.to_string()));
        }
        Err(HoardError::PermissionDenied(format!(
            "{action:?} on {resource} needs {} permission, user {user_id} has {permission}",
            action.required()
        )))
    }
}
