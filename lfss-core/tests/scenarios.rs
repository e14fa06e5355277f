use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use lfss_core::config::Config;
use lfss_core::engine::Engine;
use lfss_core::types::{AccessLevel, ByteRange, FileReadPermission, UserRecord};
use lfss_core::{lifecycle, metadata, user, LfssError};

async fn test_engine(large_threshold: u64) -> (Arc<Engine>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.data_home = dir.path().to_path_buf();
    config.external_dir = config.data_home.join("large_blobs");
    config.thumb_db_path = config.data_home.join("thumbs.1.db");
    config.blob_large_threshold_bytes = large_threshold;
    let engine = Engine::open(config).await.unwrap();
    (engine, dir)
}

/// There is no public bootstrap path for the very first (admin) user —
/// every real one requires an existing admin caller — so tests seed
/// one directly through the metadata layer, the same way `main.rs`'s
/// `--init-admin` flag does.
async fn seed_admin(engine: &Arc<Engine>, username: &str) -> UserRecord {
    let credential = user::hash_credential(username, "adminpass");
    let username = username.to_string();
    let mut cursor = engine.pool().write_cursor().await;
    cursor
        .with(move |conn| metadata::users::create_user(conn, &username, &credential, true, u64::MAX, FileReadPermission::Private))
        .await
        .unwrap()
}

async fn make_user(engine: &Arc<Engine>, admin: &UserRecord, username: &str, quota: u64) -> UserRecord {
    user::create_user(engine, admin, username, "pw", quota, FileReadPermission::Unset).await.unwrap()
}

async fn dupcount(engine: &Arc<Engine>, file_id: &str) -> u64 {
    let file_id = file_id.to_string();
    let mut cursor = engine.pool().read_cursor().await;
    cursor.with(move |conn| metadata::files::get_dupcount(conn, &file_id)).await.unwrap()
}

#[tokio::test]
async fn scenario_a_put_get_delete_roundtrip() {
    let (engine, _dir) = test_engine(1024 * 1024).await;
    let admin = seed_admin(&engine, "root").await;
    let alice = make_user(&engine, &admin, "alice", 1024 * 1024).await;

    let rec = lifecycle::save_file(&engine, &alice, "alice/hello.txt", Bytes::from_static(b"hello"), FileReadPermission::Unset, None, false)
        .await
        .unwrap();
    assert_eq!(rec.url, "alice/hello.txt");
    assert_eq!(rec.file_size, 5);

    let (got, start, end) = lifecycle::read_file(&engine, &alice, "alice/hello.txt", ByteRange::full()).await.unwrap();
    assert_eq!(end - start, 5);
    let bytes = lifecycle::read_record_bytes(&engine, &got).await.unwrap();
    assert_eq!(&bytes[..], b"hello");

    lifecycle::delete_file(&engine, &alice, "alice/hello.txt").await.unwrap();
    let err = lifecycle::read_file(&engine, &alice, "alice/hello.txt", ByteRange::full()).await.unwrap_err();
    assert!(matches!(err, LfssError::FileNotFound(_)));
}

#[tokio::test]
async fn scenario_b_range_read() {
    let (engine, _dir) = test_engine(1024 * 1024).await;
    let admin = seed_admin(&engine, "root").await;
    let alice = make_user(&engine, &admin, "alice", 10 * 1024 * 1024).await;

    let data: Vec<u8> = (0..1024u32).map(|i| (i % 256) as u8).collect();
    lifecycle::save_file(&engine, &alice, "alice/buf.bin", Bytes::from(data.clone()), FileReadPermission::Unset, None, false)
        .await
        .unwrap();

    let (rec, start, end) = lifecycle::read_file(&engine, &alice, "alice/buf.bin", ByteRange { start: 10, end: Some(21) }).await.unwrap();
    assert_eq!((start, end), (10, 21));
    let (s, e, mut stream) = lifecycle::stream_record_range(engine.clone(), rec, ByteRange { start: 10, end: Some(21) }).await.unwrap();
    assert_eq!((s, e), (10, 21));
    let mut collected = Vec::new();
    while let Some(chunk) = stream.next().await {
        collected.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(collected, data[10..=20]);

    let oob = lifecycle::read_file(&engine, &alice, "alice/buf.bin", ByteRange { start: 1024, end: Some(1025) }).await;
    assert!(matches!(oob, Err(LfssError::InvalidRange)));
}

#[tokio::test]
async fn scenario_c_quota_rejects_oversized_put() {
    let (engine, _dir) = test_engine(1024 * 1024).await;
    let admin = seed_admin(&engine, "root").await;
    let alice = make_user(&engine, &admin, "alice", 1024).await;

    let data = vec![0u8; 1025];
    let err = lifecycle::save_file(&engine, &alice, "alice/big.bin", Bytes::from(data), FileReadPermission::Unset, None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, LfssError::StorageExceeded));

    let (used, _quota) = user::storage(&engine, &alice).await.unwrap();
    assert_eq!(used, 0);
}

#[tokio::test]
async fn scenario_d_dedup_on_copy_and_delete() {
    let (engine, _dir) = test_engine(1024).await;
    let admin = seed_admin(&engine, "root").await;
    let alice = make_user(&engine, &admin, "alice", 16 * 1024 * 1024).await;

    let data = vec![7u8; 2048];
    let a = lifecycle::save_file(&engine, &alice, "alice/a.bin", Bytes::from(data), FileReadPermission::Unset, None, false)
        .await
        .unwrap();
    assert!(a.external);

    let b = lifecycle::copy_file(&engine, &alice, "alice/a.bin", "alice/b.bin").await.unwrap();
    assert_eq!(b.file_id, a.file_id);
    assert_eq!(dupcount(&engine, &a.file_id).await, 1);

    lifecycle::delete_file(&engine, &alice, "alice/a.bin").await.unwrap();
    assert!(engine.config.external_dir.join(&a.file_id).exists());

    lifecycle::delete_file(&engine, &alice, "alice/b.bin").await.unwrap();
    // The deferred-cleanup hook unlinks the now-unreferenced external
    // blob as a fire-and-forget task after commit; give it a tick.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!engine.config.external_dir.join(&a.file_id).exists());
    assert_eq!(dupcount(&engine, &a.file_id).await, 0);
}

#[tokio::test]
async fn scenario_e_peer_access() {
    let (engine, _dir) = test_engine(1024 * 1024).await;
    let u0 = seed_admin(&engine, "u0").await;
    let u1 = make_user(&engine, &u0, "u1", 1024 * 1024).await;
    let u2 = make_user(&engine, &u0, "u2", 1024 * 1024).await;

    user::set_peer(&engine, &u0, "u1", "u2", AccessLevel::Read).await.unwrap();

    let denied = lifecycle::save_file(&engine, &u1, "u2/x", Bytes::from_static(b"nope"), FileReadPermission::Unset, None, false).await;
    assert!(matches!(denied, Err(LfssError::PermissionDenied)));

    lifecycle::save_file(&engine, &u2, "u2/x", Bytes::from_static(b"hello"), FileReadPermission::Unset, None, false).await.unwrap();

    let (rec, _, _) = lifecycle::read_file(&engine, &u1, "u2/x", ByteRange::full()).await.unwrap();
    let bytes = lifecycle::read_record_bytes(&engine, &rec).await.unwrap();
    assert_eq!(&bytes[..], b"hello");

    let denied_delete = lifecycle::delete_file(&engine, &u1, "u2/x").await;
    assert!(matches!(denied_delete, Err(LfssError::PermissionDenied)));
}

#[tokio::test]
async fn scenario_f_user_deletion_rehomes_cross_subtree_files() {
    let (engine, _dir) = test_engine(1024 * 1024).await;
    let u0 = seed_admin(&engine, "u0").await;
    let u1 = make_user(&engine, &u0, "u1", 1024 * 1024).await;

    let rec = lifecycle::save_file(&engine, &u0, "u1/shared.bin", Bytes::from_static(b"shared"), FileReadPermission::Unset, None, false)
        .await
        .unwrap();
    assert_eq!(rec.owner_id, u0.id);

    user::delete_user(&engine, &u0, "u0").await.unwrap();

    let (u1_used, _) = user::storage(&engine, &u1).await.unwrap();
    assert_eq!(u1_used, rec.file_size);

    let (moved, _, _) = lifecycle::read_file(&engine, &u1, "u1/shared.bin", ByteRange::full()).await.unwrap();
    assert_eq!(moved.owner_id, u1.id);
}

#[tokio::test]
async fn scenario_g_directory_move() {
    let (engine, _dir) = test_engine(1024 * 1024).await;
    let admin = seed_admin(&engine, "root").await;
    let u0 = make_user(&engine, &admin, "u0", 1024 * 1024).await;

    for path in ["u0/a/f1", "u0/a/f2", "u0/a/sub/f3"] {
        lifecycle::save_file(&engine, &u0, path, Bytes::from_static(b"x"), FileReadPermission::Unset, None, false).await.unwrap();
    }

    let moved = lifecycle::move_dir(&engine, &u0, "u0/a/", "u0/b/").await.unwrap();
    assert_eq!(moved.len(), 3);

    for path in ["u0/a/f1", "u0/a/f2", "u0/a/sub/f3"] {
        let err = lifecycle::read_file(&engine, &u0, path, ByteRange::full()).await.unwrap_err();
        assert!(matches!(err, LfssError::FileNotFound(_)));
    }
    for path in ["u0/b/f1", "u0/b/f2", "u0/b/sub/f3"] {
        lifecycle::read_file(&engine, &u0, path, ByteRange::full()).await.unwrap();
    }
}

#[tokio::test]
async fn scenario_h_move_and_copy_transfer_ownership_to_caller() {
    // Mirrors test_move_transfer: an admin moving/copying a file within
    // another user's own subtree becomes the new owner of record, even
    // though the destination subtree's owner is unchanged.
    let (engine, _dir) = test_engine(1024 * 1024).await;
    let admin = seed_admin(&engine, "root").await;
    let u1 = make_user(&engine, &admin, "u1", 1024 * 1024).await;

    let original = lifecycle::save_file(&engine, &u1, "u1/move_test/f.bin", Bytes::from_static(b"payload"), FileReadPermission::Unset, None, false)
        .await
        .unwrap();
    assert_eq!(original.owner_id, u1.id);

    let moved = lifecycle::move_file(&engine, &admin, "u1/move_test/f.bin", "u1/move_test_moved/f.bin").await.unwrap();
    assert_eq!(moved.owner_id, admin.id);

    let (u1_used, _) = user::storage(&engine, &u1).await.unwrap();
    assert_eq!(u1_used, 0);
    let (admin_used, _) = user::storage(&engine, &admin).await.unwrap();
    assert_eq!(admin_used, moved.file_size);

    let copied = lifecycle::copy_file(&engine, &admin, "u1/move_test_moved/f.bin", "u1/move_test_moved/f_copy.bin").await.unwrap();
    assert_eq!(copied.owner_id, admin.id);
    assert_eq!(dupcount(&engine, &moved.file_id).await, 1);
}

#[tokio::test]
async fn invariant_user_size_matches_sum_of_owned_files() {
    let (engine, _dir) = test_engine(1024 * 1024).await;
    let admin = seed_admin(&engine, "root").await;
    let alice = make_user(&engine, &admin, "alice", 1024 * 1024).await;

    lifecycle::save_file(&engine, &alice, "alice/a", Bytes::from_static(b"12345"), FileReadPermission::Unset, None, false).await.unwrap();
    lifecycle::save_file(&engine, &alice, "alice/b", Bytes::from_static(b"1234567890"), FileReadPermission::Unset, None, false)
        .await
        .unwrap();

    let (used, _) = user::storage(&engine, &alice).await.unwrap();
    assert_eq!(used, 15);

    lifecycle::delete_file(&engine, &alice, "alice/a").await.unwrap();
    let (used, _) = user::storage(&engine, &alice).await.unwrap();
    assert_eq!(used, 10);
}

#[tokio::test]
async fn expired_virtual_user_authenticates_nobody() {
    let (engine, _dir) = test_engine(1024 * 1024).await;
    let admin = seed_admin(&engine, "root").await;
    let (_virtual_user, token) = user::create_virtual_user(&engine, &admin, 1024, FileReadPermission::Unset, Some(chrono::Duration::seconds(-1)))
        .await
        .unwrap();

    let resolved = user::authenticate(&engine, &token).await.unwrap();
    assert!(resolved.is_none());
}
