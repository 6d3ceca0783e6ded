//! File management module for Hoard.
//!
//! This module provides:
//! - Per-user folder hierarchy (cycle-free)
//! - File records pointing at deduplicated content, with tags
//! - The [`Vault`] facade that runs every user-facing operation

mod folder;
mod metadata;
mod service;

pub use folder::{DeletePolicy, Folder, FolderFilter, FolderRepository, NewFolder, ParentFilter};
pub use metadata::{FileFilter, FileRecord, FileRef, FileRepository, NewFile};
pub use service::{UploadRequest, Vault};

use crate::{HoardError, Result};

/// Maximum length for file and folder names (in characters).
pub const MAX_NAME_LENGTH: usize = 255;

/// Maximum length for a tag (in characters).
pub const MAX_TAG_LENGTH: usize = 50;

/// Maximum number of tags on one file.
pub const MAX_TAGS_PER_FILE: usize = 32;

/// Trim and check a file or folder name.
pub fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(HoardError::Validation("name is empty".to_string()));
    }
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(HoardError::Validation(format!(
            "name is longer than {MAX_NAME_LENGTH} characters"
        )));
    }
    if name.contains(['/', '\\']) || name.chars().any(char::is_control) {
        return Err(HoardError::Validation(format!(
            "name '{name}' contains a path separator or control character"
        )));
    }
    if name == "." || name == ".." {
        return Err(HoardError::Validation(format!("'{name}' is not a valid name")));
    }
    Ok(name.to_string())
}

/// Trim, check and deduplicate a tag list. The result is sorted.
pub fn normalize_tags<I, S>(tags: I) -> Result<Vec<String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut normalized = Vec::new();
    for tag in tags {
        let tag = tag.as_ref().trim();
        if tag.is_empty() {
            return Err(HoardError::Validation("tag is empty".to_string()));
        }
        if tag.chars().count() > MAX_TAG_LENGTH {
            return Err(HoardError::Validation(format!(
                "tag '{tag}' is longer than {MAX_TAG_LENGTH} characters"
            )));
        }
        normalized.push(tag.to_string());
    }
    normalized.sort();
    normalized.dedup();

    if normalized.len() > MAX_TAGS_PER_FILE {
        return Err(HoardError::Validation(format!(
            "a file can carry at most {MAX_TAGS_PER_FILE} tags"
        )));
    }
    Ok(normalized)
}
