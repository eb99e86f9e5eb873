//! End-to-end drive scenarios against the in-memory object client

use bucketfs::client::{compute_etag, ClientError, MemoryClient, ObjectClient};
use bucketfs::common::{Error, Options};
use bucketfs::drive::Drive;
use std::sync::Arc;
use std::time::Duration;

fn options() -> Options {
    Options {
        retry_scale_factor_ms: 1,
        ..Options::default()
    }
}

fn drive_with(client: Arc<MemoryClient>, mut options: Options) -> (Drive, tempfile::TempDir) {
    let scratch = tempfile::tempdir().unwrap();
    options.scratch_dir = scratch.path().join("cache");
    let drive = Drive::new(client, options, 1000, 1000);
    (drive, scratch)
}

async fn drain_background() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_cold_read_then_cached_read() {
    let client = Arc::new(MemoryClient::new());
    client.insert_object("/a/b.txt", b"helloworld");
    let (drive, _scratch) = drive_with(client.clone(), options());

    let mut buf = [0u8; 5];
    let n = drive.read_file("/a/b.txt", 0, 5, &mut buf).await.unwrap();
    assert_eq!(n, 5);
    assert_eq!(&buf, b"hello");

    // the tail prefetch finishes in the background; afterwards the whole
    // file is resident and further reads touch the network only for stat
    drain_background().await;
    let downloads = client.counters().downloads;

    let mut buf2 = [0u8; 5];
    let n = drive.read_file("/a/b.txt", 5, 5, &mut buf2).await.unwrap();
    assert_eq!(n, 5);
    assert_eq!(&buf2, b"world");
    assert_eq!(client.counters().downloads, downloads);
}

#[tokio::test]
async fn test_overwrite_then_flush() {
    let client = Arc::new(MemoryClient::new());
    let (drive, _scratch) = drive_with(client.clone(), options());

    drive.make_file("/x", 0o644, 0).await.unwrap();
    drive.open_file("/x", false).await.unwrap();
    assert_eq!(drive.write_file("/x", 0, b"abc").await.unwrap(), 3);
    assert_eq!(drive.write_file("/x", 3, b"de").await.unwrap(), 2);

    let node = drive.lookup_cached("/x").unwrap();
    assert!(node.is_dirty());
    assert_eq!(node.file_size(), 5);

    drive.upload_file("/x", false).await.unwrap();

    let (data, etag) = client.object("/x").unwrap();
    assert_eq!(&data[..], b"abcde");
    assert_eq!(etag, compute_etag(b"abcde"));
    assert!(!node.is_dirty());
    assert!(!drive.cache().has("/x", 0, 5));
    drain_background().await;
    assert_eq!(node.record().etag, compute_etag(b"abcde"));
}

#[tokio::test]
async fn test_multipart_upload_thresholds() {
    let client = Arc::new(MemoryClient::new());
    let (drive, _scratch) = drive_with(
        client.clone(),
        Options {
            multipart_upload_threshold: 4096,
            transfer_buf_size: 4096,
            ..options()
        },
    );

    let body = vec![7u8; 10 * 1024];
    drive.make_file("/big", 0o644, 0).await.unwrap();
    drive.open_file("/big", false).await.unwrap();
    drive.write_file("/big", 0, &body).await.unwrap();
    drive.upload_file("/big", false).await.unwrap();

    let counters = client.counters();
    assert_eq!(counters.initiates, 1);
    assert_eq!(counters.parts, 3); // 4 KiB + 4 KiB + 2 KiB
    assert_eq!(counters.completes, 1);
    assert_eq!(counters.aborts, 0);
    let (data, _) = client.object("/big").unwrap();
    assert_eq!(data.len(), 10 * 1024);
    assert!(data.iter().all(|b| *b == 7));
}

#[tokio::test]
async fn test_read_retries_through_transient_failures() {
    let client = Arc::new(MemoryClient::new());
    client.insert_object("/r.txt", b"0123456789");
    client.push_download_failure(ClientError::Timeout("one".to_string()));
    client.push_download_failure(ClientError::Timeout("two".to_string()));
    let (drive, _scratch) = drive_with(client.clone(), options());

    let mut buf = [0u8; 10];
    let n = drive.read_file("/r.txt", 0, 10, &mut buf).await.unwrap();
    assert_eq!(n, 10);
    assert_eq!(&buf, b"0123456789");
}

#[tokio::test]
async fn test_read_fails_once_retries_exhausted() {
    let client = Arc::new(MemoryClient::new());
    client.insert_object("/r.txt", b"0123456789");
    for _ in 0..3 {
        client.push_download_failure(ClientError::Timeout("down".to_string()));
    }
    let (drive, _scratch) = drive_with(client.clone(), options());

    let mut buf = [0u8; 10];
    let err = drive.read_file("/r.txt", 0, 10, &mut buf).await.unwrap_err();
    assert!(matches!(err, Error::TransferFailed(_)));
}

#[tokio::test]
async fn test_rename_is_atomic_for_local_observers() {
    let client = Arc::new(MemoryClient::new());
    client.insert_object("/d/a", b"payload");
    client.insert_object("/d/b", b"other");
    let (drive, _scratch) = drive_with(client.clone(), options());

    let (node, _) = drive.get_node("/d/a", false, false).await.unwrap();
    let etag_before = node.unwrap().record().etag;

    drive.rename_file("/d/a", "/d/c").await.unwrap();

    let stats_before = client.counters().stats;
    assert!(drive.lookup_cached("/d/a").is_none());
    assert!(drive.meta_store().peek("/d/a").is_none());
    let renamed = drive.lookup_cached("/d/c").unwrap();
    assert_eq!(renamed.record().etag, etag_before);
    // the local observations above consulted only the tree and meta store
    assert_eq!(client.counters().stats, stats_before);

    assert!(!client.has_object("/d/a"));
    assert!(client.has_object("/d/c"));
}

#[tokio::test]
async fn test_mkdir_and_listing() {
    let client = Arc::new(MemoryClient::new());
    client.insert_object("/docs/readme.md", b"# hi");
    let (drive, _scratch) = drive_with(client.clone(), options());

    drive.make_dir("/docs/sub", 0o755).await.unwrap();
    let children = drive.find_children("/docs", false).await.unwrap();
    let mut paths: Vec<String> = children.iter().map(|n| n.path()).collect();
    paths.sort();
    assert_eq!(paths, vec!["/docs/readme.md", "/docs/sub/"]);
}

#[tokio::test]
async fn test_refresh_prunes_remotely_deleted_children() {
    let client = Arc::new(MemoryClient::new());
    client.insert_object("/d/keep", b"k");
    client.insert_object("/d/gone", b"g");
    let (drive, _scratch) = drive_with(client.clone(), options());

    let children = drive.find_children("/d", false).await.unwrap();
    assert_eq!(children.len(), 2);

    // another writer deletes one object behind our back
    client.delete_file("/d/gone").await.unwrap();

    let children = drive.find_children("/d", true).await.unwrap();
    let paths: Vec<String> = children.iter().map(|n| n.path()).collect();
    assert_eq!(paths, vec!["/d/keep"]);
    assert!(drive.lookup_cached("/d/gone").is_none());
}

#[tokio::test]
async fn test_stat_prunes_remotely_deleted_file() {
    let client = Arc::new(MemoryClient::new());
    client.insert_object("/f", b"bytes");
    let (drive, _scratch) = drive_with(client.clone(), options());

    let (node, _) = drive.get_node("/f", false, false).await.unwrap();
    assert!(node.is_some());

    client.delete_file("/f").await.unwrap();
    let (node, _) = drive.get_node("/f", false, false).await.unwrap();
    assert!(node.is_none());
    assert!(drive.lookup_cached("/f").is_none());
    assert!(!drive.cache().has_file("/f"));
}

#[tokio::test]
async fn test_remove_dir_recursive_batches_deletes() {
    let client = Arc::new(MemoryClient::new());
    for i in 0..5 {
        client.insert_object(&format!("/batch/f{}", i), b"x");
    }
    let (drive, _scratch) = drive_with(
        client.clone(),
        Options {
            delete_multiple_limit: 2,
            ..options()
        },
    );

    drive.find_children("/batch", false).await.unwrap();
    let deletes_before = client.counters().deletes;
    drive.remove_dir("/batch", true, false).await.unwrap();

    // 5 files + the directory key itself, in chunks of 2
    assert_eq!(client.counters().deletes - deletes_before, 3);
    for i in 0..5 {
        assert!(!client.has_object(&format!("/batch/f{}", i)));
    }
    assert!(drive.lookup_cached("/batch/").is_none());
}

#[tokio::test]
async fn test_remove_dir_non_recursive_rejects_non_empty() {
    let client = Arc::new(MemoryClient::new());
    client.insert_object("/full/file", b"x");
    let (drive, _scratch) = drive_with(client.clone(), options());

    drive.find_children("/full", false).await.unwrap();
    let err = drive.remove_dir("/full", false, false).await.unwrap_err();
    assert!(matches!(err, Error::NotEmpty(_)));
}

#[tokio::test]
async fn test_truncate_then_flush() {
    let client = Arc::new(MemoryClient::new());
    client.insert_object("/t", b"abcdef");
    let (drive, _scratch) = drive_with(client.clone(), options());

    drive.open_file("/t", false).await.unwrap();
    drive.truncate_file("/t", 3).await.unwrap();
    let node = drive.lookup_cached("/t").unwrap();
    assert_eq!(node.file_size(), 3);
    assert!(node.is_dirty());

    drive.upload_file("/t", false).await.unwrap();
    let (data, _) = client.object("/t").unwrap();
    assert_eq!(&data[..], b"abc");
}

#[tokio::test]
async fn test_truncate_extends_with_zeros() {
    let client = Arc::new(MemoryClient::new());
    client.insert_object("/z", b"ab");
    let (drive, _scratch) = drive_with(client.clone(), options());

    drive.open_file("/z", false).await.unwrap();
    drive.truncate_file("/z", 5).await.unwrap();
    drive.upload_file("/z", false).await.unwrap();

    let (data, _) = client.object("/z").unwrap();
    assert_eq!(&data[..], b"ab\0\0\0");
}

#[tokio::test]
async fn test_symlink_round_trip() {
    let client = Arc::new(MemoryClient::new());
    let (drive, _scratch) = drive_with(client.clone(), options());

    drive.symlink("/real/target", "/lnk").await.unwrap();
    assert_eq!(drive.read_symlink("/lnk").await.unwrap(), "/real/target");

    // a fresh mount sees only the backing object and re-reads the target
    let (fresh, _scratch2) = drive_with(client.clone(), options());
    assert_eq!(fresh.read_symlink("/lnk").await.unwrap(), "/real/target");
}

#[tokio::test]
async fn test_hard_link_is_local_only() {
    let client = Arc::new(MemoryClient::new());
    client.insert_object("/orig", b"data");
    let (drive, _scratch) = drive_with(client.clone(), options());

    drive.get_node("/orig", false, false).await.unwrap();
    let puts_before = client.counters().puts;
    drive.hard_link("/orig", "/alias").unwrap();

    let alias = drive.lookup_cached("/alias").unwrap();
    assert_eq!(alias.path(), "/orig");
    assert_eq!(alias.record().num_links, 2);
    assert_eq!(client.counters().puts, puts_before);
    assert!(!client.has_object("/alias"));
}

#[tokio::test]
async fn test_write_requires_open_file() {
    let client = Arc::new(MemoryClient::new());
    client.insert_object("/w", b"data");
    let (drive, _scratch) = drive_with(client.clone(), options());

    drive.get_node("/w", false, false).await.unwrap();
    let err = drive.write_file("/w", 0, b"nope").await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[tokio::test]
async fn test_chmod_survives_unsupported_backend_metadata() {
    let client = Arc::new(MemoryClient::new());
    client.insert_object("/m", b"data");
    let (drive, _scratch) = drive_with(client.clone(), options());

    drive.chmod("/m", 0o600).await.unwrap();
    let node = drive.lookup_cached("/m").unwrap();
    assert_eq!(node.record().mode, 0o600);
    assert_eq!(client.counters().metadata_updates, 1);
}

#[tokio::test]
async fn test_rename_dir_moves_objects_and_subtree() {
    let client = Arc::new(MemoryClient::new());
    client.insert_object("/old/a", b"a");
    client.insert_object("/old/sub/b", b"b");
    let (drive, _scratch) = drive_with(client.clone(), options());

    drive.find_children("/old", false).await.unwrap();
    drive.rename_dir("/old", "/new", false).await.unwrap();

    assert!(client.has_object("/new/a"));
    assert!(client.has_object("/new/sub/b"));
    assert!(!client.has_object("/old/a"));
    assert!(drive.lookup_cached("/old/").is_none());
    let children = drive.find_children("/new", false).await.unwrap();
    assert_eq!(children.len(), 2);
}
