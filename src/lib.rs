//! Hoard - a deduplicating multi-tenant file store.
//!
//! Users upload files into their own folder trees and share files or folders
//! with each other at `read`, `write` or `admin` level. Identical content is
//! stored once and counted against the quota of the user who first stored
//! it. Every successful change is pushed to live WebSocket subscribers.

pub mod access;
pub mod config;
pub mod db;
pub mod error;
pub mod file;
pub mod logging;
pub mod notify;
pub mod rate_limit;
pub mod store;
pub mod web;

pub use access::{Action, Permission, ResourceRef};
pub use config::Config;
pub use db::{Database, NewUser, User, UserRepository};
pub use error::{HoardError, Result};
pub use file::{DeletePolicy, FileFilter, FileRecord, Folder, FolderFilter, UploadRequest, Vault};
pub use notify::{ChangeEvent, ChangeNotifier, EventType};
pub use rate_limit::{Endpoint, MutationGovernor};
pub use store::{BlobStore, ContentStore};
