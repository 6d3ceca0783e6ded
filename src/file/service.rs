//! The vault: every user-facing operation of Hoard.
//!
//! A mutating call is first admitted by the mutation governor, then checked
//! by the access resolver, and then runs in one database transaction.
//! Change events are published only after the transaction commits.

use std::sync::Arc;

use sqlx::{Sqlite, SqliteConnection, Transaction};
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

use crate::access::{AccessResolver, Action, Permission, ResourceRef, ShareGrant, ShareRepository};
use crate::db::{Database, NewUser, User, UserRepository};
use crate::notify::{ChangeEvent, ChangeNotifier, EventType};
use crate::rate_limit::{Endpoint, MutationGovernor};
use crate::store::{ContentStore, KeyGuard, QuotaLedger, QuotaUsage, ReconcileReport};
use crate::{HoardError, Result};

use super::folder::{DeletePolicy, Folder, FolderFilter, FolderRepository, NewFolder, ParentFilter};
use super::metadata::{FileFilter, FileRecord, FileRef, FileRepository, NewFile};
use super::{normalize_tags, validate_name};

/// Request data for a file upload.
#[derive(Debug)]
pub struct UploadRequest<R> {
    /// Uploading user; becomes the file owner.
    pub user_id: i64,
    /// Content source.
    pub reader: R,
    /// Declared size in bytes; must match what `reader` yields.
    pub size: u64,
    /// MIME type; guessed from `display_name` when missing.
    pub mime_type: Option<String>,
    /// File name shown to users.
    pub display_name: String,
    /// Target folder; `None` is the root.
    pub folder_id: Option<i64>,
    /// Readable by everyone.
    pub is_public: bool,
    /// Tags to attach.
    pub tags: Vec<String>,
}

impl<R> UploadRequest<R> {
    /// Create a new upload request into the root folder.
    pub fn new(user_id: i64, display_name: impl Into<String>, reader: R, size: u64) -> Self {
        Self {
            user_id,
            reader,
            size,
            mime_type: None,
            display_name: display_name.into(),
            folder_id: None,
            is_public: false,
            tags: Vec::new(),
        }
    }

    /// Set the target folder.
    pub fn in_folder(mut self, folder_id: Option<i64>) -> Self {
        self.folder_id = folder_id;
        self
    }

    /// Set the public flag.
    pub fn public(mut self, is_public: bool) -> Self {
        self.is_public = is_public;
        self
    }

    /// Set the MIME type.
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Set the tags.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// Files removed inside one transaction.
#[derive(Debug, Default)]
struct Removal {
    files: Vec<FileRef>,
    reclaimed: Vec<String>,
}

/// Facade over the content store, folder tree, access control and notifier.
///
/// Cheap to clone; all clones share the same components.
#[derive(Debug, Clone)]
pub struct Vault {
    db: Database,
    store: ContentStore,
    notifier: ChangeNotifier,
    governor: Arc<MutationGovernor>,
    default_quota: i64,
}

impl Vault {
    /// Create a vault from its components.
    pub fn new(
        db: Database,
        store: ContentStore,
        notifier: ChangeNotifier,
        governor: Arc<MutationGovernor>,
        default_quota: i64,
    ) -> Self {
        Self {
            db,
            store,
            notifier,
            governor,
            default_quota,
        }
    }

    /// The database handle.
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// The content store.
    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    /// The change notifier.
    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    /// The mutation governor.
    pub fn governor(&self) -> &MutationGovernor {
        &self.governor
    }

    fn admit(&self, user_id: i64, endpoint: Endpoint) -> Result<()> {
        self.governor.check(user_id, endpoint).into_result()
    }

    fn resolver(&self) -> AccessResolver<'_> {
        AccessResolver::new(self.db.pool())
    }

    fn folders(&self) -> FolderRepository<'_> {
        FolderRepository::new(self.db.pool())
    }

    fn users(&self) -> UserRepository<'_> {
        UserRepository::new(self.db.pool())
    }

    // ---- files ----

    /// Upload a file.
    ///
    /// The content is staged and hashed first. Identical content already in
    /// the store is shared and costs no quota; new content is charged to the
    /// uploader. Uploading into a folder needs write permission on it.
    pub async fn upload_file<R>(&self, request: UploadRequest<R>) -> Result<FileRecord>
    where
        R: AsyncRead + Unpin,
    {
        let UploadRequest {
            user_id,
            reader,
            size,
            mime_type,
            display_name,
            folder_id,
            is_public,
            tags,
        } = request;

        self.admit(user_id, Endpoint::Upload)?;
        let name = validate_name(&display_name)?;
        let tags = normalize_tags(&tags)?;
        self.users().require(user_id).await?;
        if let Some(folder_id) = folder_id {
            self.resolver()
                .require(user_id, ResourceRef::Folder(folder_id), Action::Upload)
                .await?;
        }

        let mime_type = match mime_type.as_deref().map(str::trim) {
            Some(mime) if !mime.is_empty() => mime.to_string(),
            _ => mime_guess::from_path(&name)
                .first_or_octet_stream()
                .essence_str()
                .to_string(),
        };

        let staged = self.store.stage(reader, size).await?;
        let guard = self.store.lock(staged.hash()).await;

        let mut tx = self.db.begin().await?;
        let ingested = self
            .store
            .ingest(&mut tx, &guard, user_id, staged, &mime_type)
            .await?;

        let new_file = NewFile::new(user_id, ingested.record.hash.clone(), name)
            .in_folder(folder_id)
            .public(is_public);
        let file = match create_and_commit(tx, &new_file, &tags).await {
            Ok(file) => file,
            Err(e) => {
                self.store.abandon(&guard, &ingested).await;
                return Err(e);
            }
        };
        drop(guard);

        info!(
            file_id = file.id,
            user_id,
            hash = %file.content_hash,
            size = file.size,
            deduplicated = !ingested.created,
            "File uploaded"
        );
        self.notifier
            .publish(ChangeEvent::file(EventType::FileUploaded, &file));
        Ok(file)
    }

    /// Delete a file. Needs admin permission on it.
    ///
    /// The owner's quota is released when this was their last file with the
    /// same content; the blob is reclaimed when no file references it.
    pub async fn delete_file(&self, user_id: i64, file_id: i64) -> Result<()> {
        self.admit(user_id, Endpoint::DeleteFile)?;
        self.resolver()
            .require(user_id, ResourceRef::File(file_id), Action::Delete)
            .await?;

        let file = {
            let mut conn = self.db.pool().acquire().await?;
            FileRepository::get_ref(&mut conn, file_id).await?
        };
        let guard = self.store.lock(&file.content_hash).await;

        let mut tx = self.db.begin().await?;
        let removal = self.remove_files(&mut tx, std::slice::from_ref(&file)).await?;
        if removal.files.is_empty() {
            return Err(HoardError::NotFound(ResourceRef::File(file_id).to_string()));
        }
        tx.commit().await?;

        if !removal.reclaimed.is_empty() {
            self.reclaim(std::slice::from_ref(&guard), &removal.reclaimed)
                .await;
        }
        drop(guard);

        info!(file_id, user_id, owner_id = file.owner_id, "File deleted");
        self.notifier.publish(ChangeEvent::file_deleted(
            file.id,
            file.owner_id,
            file.folder_id,
        ));
        Ok(())
    }

    /// Open a file for download and count the download.
    pub async fn download_file(
        &self,
        user_id: i64,
        file_id: i64,
    ) -> Result<(FileRecord, tokio::fs::File)> {
        self.resolver()
            .require(user_id, ResourceRef::File(file_id), Action::Download)
            .await?;

        let file = {
            let mut conn = self.db.pool().acquire().await?;
            FileRepository::get_ref(&mut conn, file_id).await?
        };
        // Held so the blob cannot be reclaimed between the check and the open
        let guard = self.store.lock(&file.content_hash).await;
        let blob = self.store.open(&file.content_hash).await?;

        let mut tx = self.db.begin().await?;
        FileRepository::increment_downloads(&mut tx, file_id).await?;
        let record = FileRepository::require(&mut tx, file_id).await?;
        tx.commit().await?;
        drop(guard);

        debug!(file_id, user_id, downloads = record.downloads, "File downloaded");
        self.notifier
            .publish(ChangeEvent::file(EventType::FileDownloaded, &record));
        Ok((record, blob))
    }

    /// Get a file's metadata.
    pub async fn get_file(&self, user_id: i64, file_id: i64) -> Result<FileRecord> {
        self.resolver()
            .require(user_id, ResourceRef::File(file_id), Action::View)
            .await?;
        let mut conn = self.db.pool().acquire().await?;
        FileRepository::require(&mut conn, file_id).await
    }

    /// List files visible to a user.
    ///
    /// Listing a folder needs read permission on it. Other users' files
    /// are included only with `filter.include_shared`.
    pub async fn list_files(&self, user_id: i64, filter: &FileFilter) -> Result<Vec<FileRecord>> {
        if let ParentFilter::In(folder_id) = filter.folder {
            self.resolver()
                .require(user_id, ResourceRef::Folder(folder_id), Action::List)
                .await?;
        }

        let mut conn = self.db.pool().acquire().await?;
        let mut files = FileRepository::list_owned(&mut conn, user_id, filter).await?;
        if filter.include_shared {
            files.extend(FileRepository::list_shared_with(&mut conn, user_id, filter).await?);
            files.sort_by(|a, b| {
                a.name
                    .to_lowercase()
                    .cmp(&b.name.to_lowercase())
                    .then(a.id.cmp(&b.id))
            });
        }
        Ok(files)
    }

    /// Rename a file.
    pub async fn rename_file(&self, user_id: i64, file_id: i64, name: &str) -> Result<FileRecord> {
        self.admit(user_id, Endpoint::UpdateFile)?;
        self.resolver()
            .require(user_id, ResourceRef::File(file_id), Action::Rename)
            .await?;
        let mut conn = self.db.pool().acquire().await?;
        FileRepository::rename(&mut conn, file_id, name).await
    }

    /// Move a file to another folder, or to the root with `None`.
    ///
    /// Needs write permission on the file and on the target folder.
    pub async fn move_file(
        &self,
        user_id: i64,
        file_id: i64,
        folder_id: Option<i64>,
    ) -> Result<FileRecord> {
        self.admit(user_id, Endpoint::UpdateFile)?;
        let resolver = self.resolver();
        resolver
            .require(user_id, ResourceRef::File(file_id), Action::Move)
            .await?;
        if let Some(folder_id) = folder_id {
            resolver
                .require(user_id, ResourceRef::Folder(folder_id), Action::Upload)
                .await?;
        }
        let mut conn = self.db.pool().acquire().await?;
        FileRepository::move_to(&mut conn, file_id, folder_id).await
    }

    /// Replace a file's tags.
    pub async fn set_tags(&self, user_id: i64, file_id: i64, tags: &[String]) -> Result<FileRecord> {
        self.admit(user_id, Endpoint::UpdateFile)?;
        let tags = normalize_tags(tags)?;
        self.resolver()
            .require(user_id, ResourceRef::File(file_id), Action::Tag)
            .await?;

        let mut tx = self.db.begin().await?;
        let file = FileRepository::set_tags(&mut tx, file_id, &tags).await?;
        tx.commit().await?;
        Ok(file)
    }

    // ---- sharing ----

    /// Grant `grantee_username` a permission on a resource and set the
    /// resource's public flag. Needs admin permission on the resource.
    ///
    /// `Permission::None` revokes an existing grant. Folder changes publish
    /// `folder_updated`; file shares publish nothing, as there is no file
    /// update event.
    pub async fn share_resource(
        &self,
        user_id: i64,
        resource: ResourceRef,
        grantee_username: &str,
        permission: Permission,
        is_public: bool,
    ) -> Result<()> {
        self.admit(user_id, Endpoint::Share)?;
        self.resolver()
            .require(user_id, resource, Action::Share)
            .await?;
        let grantee = self.grantee(user_id, grantee_username).await?;

        let mut tx = self.db.begin().await?;
        if permission.is_grantable() {
            ShareRepository::grant_in(&mut tx, resource, grantee.id, permission).await?;
        } else {
            ShareRepository::revoke_in(&mut tx, resource, grantee.id).await?;
        }
        match resource {
            ResourceRef::File(id) => {
                FileRepository::set_public(&mut tx, id, is_public).await?;
            }
            ResourceRef::Folder(id) => {
                FolderRepository::set_public_in(&mut tx, id, is_public).await?;
            }
        }
        tx.commit().await?;

        info!(
            user_id,
            %resource,
            grantee = %grantee.username,
            %permission,
            is_public,
            "Resource shared"
        );
        self.publish_share_change(resource).await?;
        Ok(())
    }

    /// Remove a grant. Returns whether one existed.
    ///
    /// Removing a folder grant publishes `folder_updated`.
    pub async fn revoke_share(
        &self,
        user_id: i64,
        resource: ResourceRef,
        grantee_username: &str,
    ) -> Result<bool> {
        self.admit(user_id, Endpoint::Share)?;
        self.resolver()
            .require(user_id, resource, Action::Share)
            .await?;
        let grantee = self.grantee(user_id, grantee_username).await?;
        let existed = ShareRepository::new(self.db.pool())
            .revoke(resource, grantee.id)
            .await?;
        if existed {
            info!(user_id, %resource, grantee = %grantee.username, "Share revoked");
            self.publish_share_change(resource).await?;
        }
        Ok(existed)
    }

    /// List the grants on a resource.
    pub async fn list_shares(&self, user_id: i64, resource: ResourceRef) -> Result<Vec<ShareGrant>> {
        self.resolver()
            .require(user_id, resource, Action::Share)
            .await?;
        ShareRepository::new(self.db.pool()).list_for(resource).await
    }

    async fn publish_share_change(&self, resource: ResourceRef) -> Result<()> {
        if let ResourceRef::Folder(id) = resource {
            if let Some(folder) = self.folders().get_by_id(id).await? {
                self.notifier
                    .publish(ChangeEvent::folder(EventType::FolderUpdated, &folder));
            }
        }
        Ok(())
    }

    async fn grantee(&self, user_id: i64, username: &str) -> Result<User> {
        let grantee = self
            .users()
            .get_by_username(username)
            .await?
            .ok_or_else(|| HoardError::NotFound(format!("user '{}'", username.trim())))?;
        if grantee.id == user_id {
            return Err(HoardError::Validation(
                "cannot share a resource with yourself".to_string(),
            ));
        }
        Ok(grantee)
    }

    /// Effective permission of a user on a resource.
    pub async fn resolve(&self, user_id: i64, resource: ResourceRef) -> Result<Permission> {
        self.resolver().resolve(user_id, resource).await
    }

    // ---- folders ----

    /// Create a folder owned by `user_id`.
    ///
    /// The parent, if any, must be one of the user's own folders.
    pub async fn create_folder(
        &self,
        user_id: i64,
        name: &str,
        parent_id: Option<i64>,
        is_public: bool,
    ) -> Result<Folder> {
        self.admit(user_id, Endpoint::CreateFolder)?;
        self.users().require(user_id).await?;
        if let Some(parent_id) = parent_id {
            self.resolver()
                .require(user_id, ResourceRef::Folder(parent_id), Action::Upload)
                .await?;
        }

        let folder = self
            .folders()
            .create(
                &NewFolder::new(user_id, name)
                    .with_parent(parent_id)
                    .public(is_public),
            )
            .await?;

        info!(folder_id = folder.id, user_id, name = %folder.name, "Folder created");
        self.notifier
            .publish(ChangeEvent::folder(EventType::FolderCreated, &folder));
        Ok(folder)
    }

    /// List folders visible to a user.
    ///
    /// Listing the children of a folder needs read permission on it. Other
    /// users' folders are included only with `filter.include_shared`.
    pub async fn list_folders(&self, user_id: i64, filter: &FolderFilter) -> Result<Vec<Folder>> {
        if let ParentFilter::In(parent_id) = filter.parent {
            self.resolver()
                .require(user_id, ResourceRef::Folder(parent_id), Action::List)
                .await?;
        }

        let repo = self.folders();
        let mut folders = repo.list(user_id, filter).await?;
        if filter.include_shared {
            folders.extend(repo.list_shared_with(user_id, filter).await?);
            folders.sort_by(|a, b| {
                a.name
                    .to_lowercase()
                    .cmp(&b.name.to_lowercase())
                    .then(a.id.cmp(&b.id))
            });
        }
        Ok(folders)
    }

    /// Rename a folder.
    pub async fn rename_folder(&self, user_id: i64, folder_id: i64, name: &str) -> Result<Folder> {
        self.admit(user_id, Endpoint::UpdateFolder)?;
        self.resolver()
            .require(user_id, ResourceRef::Folder(folder_id), Action::Rename)
            .await?;

        let folder = self.folders().rename(folder_id, name).await?;
        self.notifier
            .publish(ChangeEvent::folder(EventType::FolderUpdated, &folder));
        Ok(folder)
    }

    /// Move a folder under another folder, or to the root with `None`.
    ///
    /// Fails with [`HoardError::Cycle`] when the target is the folder itself
    /// or one of its descendants.
    pub async fn reparent_folder(
        &self,
        user_id: i64,
        folder_id: i64,
        new_parent_id: Option<i64>,
    ) -> Result<Folder> {
        self.admit(user_id, Endpoint::UpdateFolder)?;
        let resolver = self.resolver();
        resolver
            .require(user_id, ResourceRef::Folder(folder_id), Action::Move)
            .await?;
        if let Some(parent_id) = new_parent_id {
            resolver
                .require(user_id, ResourceRef::Folder(parent_id), Action::Upload)
                .await?;
        }

        let folder = self.folders().reparent(folder_id, new_parent_id).await?;
        info!(folder_id, user_id, parent_id = ?new_parent_id, "Folder moved");
        self.notifier
            .publish(ChangeEvent::folder(EventType::FolderUpdated, &folder));
        Ok(folder)
    }

    /// Delete a folder and its subfolders.
    ///
    /// Files inside follow `policy`. Returns the number of files deleted.
    pub async fn delete_folder(
        &self,
        user_id: i64,
        folder_id: i64,
        policy: DeletePolicy,
    ) -> Result<usize> {
        self.admit(user_id, Endpoint::DeleteFolder)?;
        self.resolver()
            .require(user_id, ResourceRef::Folder(folder_id), Action::Delete)
            .await?;

        let repo = self.folders();
        let folder = repo.require(folder_id).await?;
        let subtree = repo.subtree_ids(folder_id).await?;

        let removal = match policy {
            DeletePolicy::Detach => {
                let mut tx = self.db.begin().await?;
                let detached = FileRepository::detach_from_folders(&mut tx, &subtree).await?;
                FolderRepository::delete_in(&mut tx, folder_id).await?;
                tx.commit().await?;
                debug!(folder_id, detached, "Files moved to root");
                Removal::default()
            }
            DeletePolicy::Cascade => {
                let files = {
                    let mut conn = self.db.pool().acquire().await?;
                    FileRepository::contents_of_folders(&mut conn, &subtree).await?
                };
                let guards = self
                    .store
                    .lock_many(files.iter().map(|f| f.content_hash.as_str()))
                    .await;

                // Files added after the listing are detached by the foreign key
                let mut tx = self.db.begin().await?;
                let removal = self.remove_files(&mut tx, &files).await?;
                FolderRepository::delete_in(&mut tx, folder_id).await?;
                tx.commit().await?;

                self.reclaim(&guards, &removal.reclaimed).await;
                removal
            }
        };

        info!(
            folder_id,
            user_id,
            folders = subtree.len(),
            files = removal.files.len(),
            "Folder deleted"
        );
        for file in &removal.files {
            self.notifier.publish(ChangeEvent::file_deleted(
                file.id,
                file.owner_id,
                file.folder_id,
            ));
        }
        self.notifier.publish(ChangeEvent::folder_deleted(
            folder.id,
            folder.owner_id,
            removal.files.len(),
        ));
        Ok(removal.files.len())
    }

    // ---- users ----

    /// Create a user. `quota` defaults to the configured default.
    pub async fn create_user(
        &self,
        username: &str,
        quota: Option<i64>,
        is_admin: bool,
    ) -> Result<User> {
        let mut new_user = NewUser::new(username, quota.unwrap_or(self.default_quota));
        if is_admin {
            new_user = new_user.admin();
        }
        let user = self.users().create(&new_user).await?;
        info!(user_id = user.id, username = %user.username, "User created");
        Ok(user)
    }

    /// Delete a user together with all their files.
    ///
    /// Allowed for the user themselves and for admins. Returns the number
    /// of files deleted.
    pub async fn delete_user(&self, actor_id: i64, user_id: i64) -> Result<usize> {
        let users = self.users();
        let actor = users.require(actor_id).await?;
        if !actor.is_admin && actor.id != user_id {
            return Err(HoardError::PermissionDenied(format!(
                "user {actor_id} cannot delete user {user_id}"
            )));
        }
        let user = users.require(user_id).await?;

        let files = {
            let mut conn = self.db.pool().acquire().await?;
            FileRepository::contents_of_owner(&mut conn, user_id).await?
        };
        let guards = self
            .store
            .lock_many(files.iter().map(|f| f.content_hash.as_str()))
            .await;

        let mut tx = self.db.begin().await?;
        let removal = self.remove_files(&mut tx, &files).await?;
        UserRepository::delete_in(&mut tx, user_id).await?;
        tx.commit().await?;

        self.reclaim(&guards, &removal.reclaimed).await;
        drop(guards);

        info!(
            user_id,
            username = %user.username,
            actor_id,
            files = removal.files.len(),
            "User deleted"
        );
        for file in &removal.files {
            self.notifier.publish(ChangeEvent::file_deleted(
                file.id,
                file.owner_id,
                file.folder_id,
            ));
        }
        Ok(removal.files.len())
    }

    /// Change a user's storage ceiling. Admins only.
    pub async fn set_quota(&self, actor_id: i64, user_id: i64, quota: i64) -> Result<User> {
        let users = self.users();
        let actor = users.require(actor_id).await?;
        if !actor.is_admin {
            return Err(HoardError::PermissionDenied(
                "only admins can change quotas".to_string(),
            ));
        }
        let user = users.set_quota(user_id, quota).await?;
        info!(user_id, quota, actor_id, "Quota changed");
        Ok(user)
    }

    /// Storage used by a user and their ceiling.
    pub async fn storage_usage(&self, user_id: i64) -> Result<QuotaUsage> {
        QuotaLedger::usage(self.db.pool(), user_id).await
    }

    /// Bring the blob directory in line with the database.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.store.reconcile().await
    }

    // ---- helpers ----

    /// Delete file rows and release their content inside `conn`'s
    /// transaction. The caller holds the locks for every hash involved.
    ///
    /// Files already gone are skipped.
    async fn remove_files(&self, conn: &mut SqliteConnection, files: &[FileRef]) -> Result<Removal> {
        let mut removal = Removal::default();
        for file in files {
            let Some(hash) = FileRepository::delete(&mut *conn, file.id).await? else {
                continue;
            };
            if self.store.release(&mut *conn, file.owner_id, &hash).await? {
                removal.reclaimed.push(hash);
            }
            removal.files.push(file.clone());
        }
        Ok(removal)
    }

    /// Delete blobs whose records reached zero in a committed transaction.
    async fn reclaim(&self, guards: &[KeyGuard], hashes: &[String]) {
        for hash in hashes {
            let Some(guard) = guards.iter().find(|g| g.key() == hash) else {
                continue;
            };
            if let Err(e) = self.store.reclaim(guard).await {
                warn!(hash = %hash, "Failed to reclaim blob: {}", e);
            }
        }
    }
}

/// Insert the file row and commit. Dropping `tx` on error rolls back.
async fn create_and_commit(
    mut tx: Transaction<'static, Sqlite>,
    file: &NewFile,
    tags: &[String],
) -> Result<FileRecord> {
    let record = FileRepository::create(&mut tx, file, tags).await?;
    tx.commit().await?;
    Ok(record)
}
