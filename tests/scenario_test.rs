//! End-to-end scenarios for Hoard, driven through the vault.

mod common;

use std::time::Duration;

use common::{open_vault, upload, TestVault, MB};
use hoard::file::FolderRepository;
use hoard::store::hash_bytes;
use hoard::{
    DeletePolicy, EventType, FileFilter, FolderFilter, HoardError, MutationGovernor, Permission,
    ResourceRef, UploadRequest,
};

#[tokio::test]
async fn test_quota_and_dedup_lifecycle() {
    let t = TestVault::new(10 * MB).await;
    let alice = t.user("alice").await;
    let content = vec![b'a'; 4 * MB as usize];
    let hash = hash_bytes(&content);

    let a = upload(&t.vault, alice, "a.txt", &content).await.unwrap();
    assert_eq!(t.vault.storage_usage(alice).await.unwrap().used, 4 * MB);

    let b = upload(&t.vault, alice, "b.txt", &content).await.unwrap();
    assert_eq!(t.vault.storage_usage(alice).await.unwrap().used, 4 * MB);
    assert_eq!(t.ref_count(&content).await, Some(2));
    assert_eq!(t.blob_count().await, 1);

    t.vault.delete_file(alice, a.id).await.unwrap();
    assert_eq!(t.ref_count(&content).await, Some(1));
    assert!(t.vault.store().blobs().exists(&hash).await);
    assert_eq!(t.vault.storage_usage(alice).await.unwrap().used, 4 * MB);

    t.vault.delete_file(alice, b.id).await.unwrap();
    assert_eq!(t.ref_count(&content).await, None);
    assert!(!t.vault.store().blobs().exists(&hash).await);
    assert_eq!(t.vault.storage_usage(alice).await.unwrap().used, 0);

    // A 12 MB upload never fits
    let big = vec![b'b'; 12 * MB as usize];
    let err = upload(&t.vault, alice, "big.bin", &big).await.unwrap_err();
    assert!(matches!(err, HoardError::QuotaExceeded { .. }));
    assert_eq!(t.blob_count().await, 0);
}

#[tokio::test]
async fn test_sharing_through_nested_folders() {
    let t = TestVault::new(10 * MB).await;
    let alice = t.user("alice").await;
    let bob = t.user("bob").await;
    let vault = &t.vault;

    let projects = vault.create_folder(alice, "projects", None, false).await.unwrap();
    let hoard = vault
        .create_folder(alice, "hoard", Some(projects.id), false)
        .await
        .unwrap();
    let deep = vault
        .create_folder(alice, "deep", Some(hoard.id), false)
        .await
        .unwrap();
    let readme = vault
        .upload_file(
            UploadRequest::new(alice, "README.md", &b"# hoard"[..], 7).in_folder(Some(deep.id)),
        )
        .await
        .unwrap();

    // Nearest ancestor with a grant wins
    vault
        .share_resource(alice, ResourceRef::Folder(projects.id), "bob", Permission::Read, false)
        .await
        .unwrap();
    assert_eq!(
        vault.resolve(bob, ResourceRef::File(readme.id)).await.unwrap(),
        Permission::Read
    );
    vault
        .share_resource(alice, ResourceRef::Folder(hoard.id), "bob", Permission::Write, false)
        .await
        .unwrap();
    assert_eq!(
        vault.resolve(bob, ResourceRef::File(readme.id)).await.unwrap(),
        Permission::Write
    );

    // Write on the folder lets bob upload into it; the file is his
    let note = vault
        .upload_file(UploadRequest::new(bob, "note.txt", &b"hi"[..], 2).in_folder(Some(deep.id)))
        .await
        .unwrap();
    assert_eq!(note.owner_id, bob);
    assert_eq!(vault.storage_usage(bob).await.unwrap().used, 2);

    // Write is not enough to delete alice's file
    let err = vault.delete_file(bob, readme.id).await.unwrap_err();
    assert!(matches!(err, HoardError::PermissionDenied(_)));

    // Bob sees the shared tree
    let shared = vault
        .list_folders(bob, &FolderFilter::default().with_shared())
        .await
        .unwrap();
    let names: Vec<_> = shared.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["deep", "hoard", "projects"]);
    let files = vault
        .list_files(bob, &FileFilter::in_folder(deep.id).with_shared())
        .await
        .unwrap();
    assert_eq!(files.len(), 2);

    // Owner is always admin
    vault
        .share_resource(bob, ResourceRef::File(note.id), "alice", Permission::Read, false)
        .await
        .unwrap();
    assert_eq!(
        vault.resolve(bob, ResourceRef::File(note.id)).await.unwrap(),
        Permission::Admin
    );

    // Deleting the tree removes bob's file too and releases his quota
    let removed = vault
        .delete_folder(alice, projects.id, DeletePolicy::Cascade)
        .await
        .unwrap();
    assert_eq!(removed, 2);
    assert_eq!(vault.storage_usage(bob).await.unwrap().used, 0);
    assert_eq!(t.blob_count().await, 0);
}

#[tokio::test]
async fn test_folder_moves_keep_tree_acyclic() {
    let t = TestVault::new(MB).await;
    let alice = t.user("alice").await;
    let bob = t.user("bob").await;
    let vault = &t.vault;

    let a = vault.create_folder(alice, "a", None, false).await.unwrap();
    let b = vault.create_folder(alice, "b", Some(a.id), false).await.unwrap();
    let c = vault.create_folder(alice, "c", Some(b.id), false).await.unwrap();
    let x = vault.create_folder(alice, "x", None, false).await.unwrap();

    let err = vault.reparent_folder(alice, a.id, Some(c.id)).await.unwrap_err();
    assert!(matches!(err, HoardError::Cycle(_)));

    vault.reparent_folder(alice, b.id, Some(x.id)).await.unwrap();
    let path = FolderRepository::new(vault.db().pool())
        .get_path(c.id)
        .await
        .unwrap();
    let names: Vec<_> = path.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["x", "b", "c"]);

    // Bob cannot hang his folder under alice's
    let err = vault
        .create_folder(bob, "mine", Some(x.id), false)
        .await
        .unwrap_err();
    assert!(matches!(err, HoardError::NotFound(_)));

    vault.reparent_folder(alice, b.id, None).await.unwrap();
    let roots = vault.list_folders(alice, &FolderFilter::root()).await.unwrap();
    assert_eq!(roots.len(), 3);
}

#[tokio::test]
async fn test_event_stream_for_a_session() {
    let t = TestVault::new(MB).await;
    let alice = t.user("alice").await;
    let vault = &t.vault;
    let mut subscription = vault.notifier().subscribe();

    let folder = vault.create_folder(alice, "inbox", None, false).await.unwrap();
    let file = vault
        .upload_file(UploadRequest::new(alice, "a.txt", &b"abc"[..], 3).in_folder(Some(folder.id)))
        .await
        .unwrap();
    vault.download_file(alice, file.id).await.unwrap();
    vault.rename_folder(alice, folder.id, "archive").await.unwrap();
    vault
        .delete_folder(alice, folder.id, DeletePolicy::Cascade)
        .await
        .unwrap();

    let mut types = Vec::new();
    while types.len() < 6 {
        let event = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
            .await
            .unwrap()
            .unwrap();
        types.push(event.event_type);
    }
    assert_eq!(
        types,
        vec![
            EventType::FolderCreated,
            EventType::FileUploaded,
            EventType::FileDownloaded,
            EventType::FolderUpdated,
            EventType::FileDeleted,
            EventType::FolderDeleted,
        ]
    );
}

#[tokio::test]
async fn test_reconcile_after_restart() {
    let t = TestVault::new(MB).await;
    let alice = t.user("alice").await;
    let kept = upload(&t.vault, alice, "kept.txt", b"kept").await.unwrap();
    let lost = upload(&t.vault, alice, "lost.txt", b"lost").await.unwrap();

    // Simulate damage while the process is down
    let blobs = t.vault.store().blobs().clone();
    let orphan = hash_bytes(b"orphan");
    let orphan_path = blobs.blob_path(&orphan);
    std::fs::create_dir_all(orphan_path.parent().unwrap()).unwrap();
    std::fs::write(&orphan_path, b"orphan").unwrap();
    std::fs::remove_file(blobs.blob_path(&lost.content_hash)).unwrap();
    t.vault.db().close().await;

    let vault = open_vault(
        t.dir.path(),
        MB,
        MutationGovernor::with_limits(100, Duration::from_secs(1)),
    )
    .await;
    let report = vault.reconcile().await.unwrap();

    assert_eq!(report.orphans_removed, 1);
    assert_eq!(report.missing_blobs, vec![lost.content_hash.clone()]);
    assert!(!orphan_path.exists());
    assert!(vault.store().blobs().exists(&kept.content_hash).await);
}
