//! Access control for Hoard.
//!
//! Permissions are ordered `None < Read < Write < Admin`; an operation is
//! allowed when the resolved permission is at least the level its
//! [`Action`] requires.

mod resolver;
mod share;

pub use resolver::AccessResolver;
pub use share::{ShareGrant, ShareRepository};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Effective permission of a user on a resource.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    /// No access.
    #[default]
    None = 0,
    /// View, download, list.
    Read = 1,
    /// Rename, move, tag.
    Write = 2,
    /// Delete, share.
    Admin = 3,
}

impl Permission {
    /// Convert permission to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::None => "none",
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Admin => "admin",
        }
    }

    /// Check if this permission is at least `required`.
    ///
    /// ```
    /// use hoard::access::Permission;
    ///
    /// assert!(Permission::Admin.allows(Permission::Write));
    /// assert!(Permission::Read.allows(Permission::Read));
    /// assert!(!Permission::None.allows(Permission::Read));
    /// ```
    pub fn allows(&self, required: Permission) -> bool {
        *self >= required
    }

    /// Whether this level can be stored as a share grant.
    pub fn is_grantable(&self) -> bool {
        *self != Permission::None
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(Permission::None),
            "read" => Ok(Permission::Read),
            "write" => Ok(Permission::Write),
            "admin" => Ok(Permission::Admin),
            _ => Err(format!("unknown permission: {s}")),
        }
    }
}

impl TryFrom<String> for Permission {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A file or folder, as the target of a permission check or grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum ResourceRef {
    /// A file by ID.
    File(i64),
    /// A folder by ID.
    Folder(i64),
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceRef::File(id) => write!(f, "file {id}"),
            ResourceRef::Folder(id) => write!(f, "folder {id}"),
        }
    }
}

/// Something a user does to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    View,
    Download,
    List,
    Upload,
    Rename,
    Move,
    Tag,
    Delete,
    Share,
}

impl Action {
    /// Minimum permission this action needs.
    pub fn required(&self) -> Permission {
        match self {
            Action::View | Action::Download | Action::List => Permission::Read,
            Action::Upload | Action::Rename | Action::Move | Action::Tag => Permission::Write,
            Action::Delete | Action::Share => Permission::Admin,
        }
    }
}
