//! Change events pushed to live subscribers.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::file::{FileRecord, Folder};

/// Kind of storage change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    FileUploaded,
    FileDeleted,
    FileDownloaded,
    FolderCreated,
    FolderUpdated,
    FolderDeleted,
}

impl EventType {
    /// Wire name of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::FileUploaded => "file_uploaded",
            EventType::FileDeleted => "file_deleted",
            EventType::FileDownloaded => "file_downloaded",
            EventType::FolderCreated => "folder_created",
            EventType::FolderUpdated => "folder_updated",
            EventType::FolderDeleted => "folder_deleted",
        }
    }
}

/// One change notification: `{"type": ..., "data": {...}}` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// What happened.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Event payload.
    pub data: Value,
}

impl ChangeEvent {
    /// Create an event with an arbitrary payload.
    pub fn new(event_type: EventType, data: Value) -> Self {
        Self { event_type, data }
    }

    /// Event about a file that still exists (uploaded or downloaded).
    pub fn file(event_type: EventType, file: &FileRecord) -> Self {
        Self::new(
            event_type,
            json!({
                "id": file.id,
                "owner_id": file.owner_id,
                "name": file.name,
                "folder_id": file.folder_id,
                "size": file.size,
                "mime_type": file.mime_type,
                "is_public": file.is_public,
                "downloads": file.downloads,
                "tags": file.tags,
            }),
        )
    }

    /// A file was deleted.
    pub fn file_deleted(file_id: i64, owner_id: i64, folder_id: Option<i64>) -> Self {
        Self::new(
            EventType::FileDeleted,
            json!({ "id": file_id, "owner_id": owner_id, "folder_id": folder_id }),
        )
    }

    /// Event about a folder that still exists (created or updated).
    pub fn folder(event_type: EventType, folder: &Folder) -> Self {
        Self::new(
            event_type,
            json!({
                "id": folder.id,
                "owner_id": folder.owner_id,
                "name": folder.name,
                "parent_id": folder.parent_id,
                "is_public": folder.is_public,
            }),
        )
    }

    /// A folder was deleted, along with `removed_files` files.
    pub fn folder_deleted(folder_id: i64, owner_id: i64, removed_files: usize) -> Self {
        Self::new(
            EventType::FolderDeleted,
            json!({ "id": folder_id, "owner_id": owner_id, "removed_files": removed_files }),
        )
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
