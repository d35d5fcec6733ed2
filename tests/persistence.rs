use std::fs;
use std::path::Path;
use std::sync::Arc;

use stepcache::clock::{Clock, SystemClock};
use stepcache::key::{BucketFlags, BucketId, CacheKey, ContentKey};
use stepcache::server::{CacheServer, CacheServerConfig};
use stepcache::store::{ContentStore, MemoryContentStore};
use stepcache::transport::{CacheClient, LocalChannel};
use tempfile::tempdir;

fn open(root: &Path, store: &Arc<MemoryContentStore>) -> Arc<CacheServer> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    Arc::new(CacheServer::open(CacheServerConfig::with_root(root), store.clone(), clock).unwrap())
}

fn bucket(family: u32) -> BucketId {
    BucketId::new(family, 0, BucketFlags::CASE_SENSITIVE)
}

fn store_one(server: &Arc<CacheServer>, bucket: BucketId, cmd: &str, output: &[u8]) {
    let mut client = CacheClient::connect(LocalChannel::new(server.clone()), "persist").unwrap();
    client
        .store(
            bucket,
            &CacheKey::from_command(cmd),
            &[("src/input.c", ContentKey::from_content(cmd.as_bytes()))],
            &[("out/output.o", output)],
            b"log text",
        )
        .unwrap();
}

fn fetch_count(server: &Arc<CacheServer>, bucket: BucketId, cmd: &str) -> usize {
    let mut client = CacheClient::connect(LocalChannel::new(server.clone()), "persist").unwrap();
    client
        .fetch_entries(bucket, &CacheKey::from_command(cmd))
        .unwrap()
        .len()
}

#[test]
fn reopen_restores_entries() {
    let dir = tempdir().unwrap();
    let content = Arc::new(MemoryContentStore::new());

    let server = open(dir.path(), &content);
    store_one(&server, bucket(1), "cc a.c", b"obj-a");
    let stats = server.save().unwrap();
    assert_eq!(stats.written, 1);
    assert!(dir.path().join("cachedb").is_file());
    assert!(dir.path().join("buckets").join(bucket(1).0.to_string()).is_file());
    drop(server);

    let server = open(dir.path(), &content);
    assert_eq!(server.bucket_count(), 1);
    assert_eq!(fetch_count(&server, bucket(1), "cc a.c"), 1);
    assert_eq!(server.execute_command("validate", ""), "Validation OK");

    // Nothing changed since load, so nothing is rewritten.
    assert_eq!(server.save().unwrap().written, 0);
}

#[test]
fn corrupt_bucket_is_dropped_and_others_survive() {
    let dir = tempdir().unwrap();
    let content = Arc::new(MemoryContentStore::new());

    let server = open(dir.path(), &content);
    store_one(&server, bucket(1), "cc a.c", b"obj-a");
    store_one(&server, bucket(2), "cc b.c", b"obj-b");
    server.save().unwrap();
    drop(server);

    let damaged = dir.path().join("buckets").join(bucket(1).0.to_string());
    let mut bytes = fs::read(&damaged).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0x5a;
    fs::write(&damaged, bytes).unwrap();

    let server = open(dir.path(), &content);
    assert_eq!(server.bucket_count(), 1);
    assert!(server.bucket(bucket(1)).is_none());
    assert_eq!(fetch_count(&server, bucket(2), "cc b.c"), 1);
    assert!(!damaged.exists());
}

#[test]
fn unreadable_database_starts_empty() {
    let dir = tempdir().unwrap();
    let content = Arc::new(MemoryContentStore::new());

    let server = open(dir.path(), &content);
    store_one(&server, bucket(1), "cc a.c", b"obj-a");
    server.save().unwrap();
    drop(server);

    fs::write(dir.path().join("cachedb"), b"not a database").unwrap();
    let server = open(dir.path(), &content);
    assert_eq!(server.bucket_count(), 0);
    assert_eq!(
        fs::read_dir(dir.path().join("buckets")).unwrap().count(),
        0
    );
}

#[test]
fn stray_files_are_cleaned_up() {
    let dir = tempdir().unwrap();
    let content = Arc::new(MemoryContentStore::new());
    drop(open(dir.path(), &content));

    let buckets = dir.path().join("buckets");
    fs::create_dir_all(&buckets).unwrap();
    fs::write(buckets.join("notes.txt"), b"hello").unwrap();

    let server = open(dir.path(), &content);
    assert_eq!(server.bucket_count(), 0);
    assert!(!buckets.join("notes.txt").exists());
}

#[test]
fn emptied_bucket_loses_its_file() {
    let dir = tempdir().unwrap();
    let content = Arc::new(MemoryContentStore::new());

    let server = open(dir.path(), &content);
    store_one(&server, bucket(1), "cc a.c", b"obj-a");
    server.save().unwrap();
    let file = dir.path().join("buckets").join(bucket(1).0.to_string());
    assert!(file.is_file());

    assert!(content.evict(&ContentKey::from_content(b"obj-a")));
    let report = server.run_maintenance(true, &|| false).unwrap();
    assert_eq!(report.missing_outputs, 1);
    assert_eq!(report.removed_buckets, 1);
    assert!(!file.exists());

    drop(server);
    assert_eq!(open(dir.path(), &content).bucket_count(), 0);
}

#[cfg(feature = "fs-store")]
#[test]
fn filesystem_store_survives_restart() {
    use stepcache::store::FsContentStore;

    let dir = tempdir().unwrap();
    let open_fs = || {
        let store = FsContentStore::open(dir.path().join("content"), None).unwrap();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Arc::new(
            CacheServer::open(CacheServerConfig::with_root(dir.path()), Arc::new(store), clock)
                .unwrap(),
        )
    };

    let server = open_fs();
    store_one(&server, bucket(4), "cc fs.c", b"fs-object");
    server.save().unwrap();
    drop(server);

    let server = open_fs();
    assert!(
        server
            .store()
            .has_content(&ContentKey::from_content(b"fs-object"))
    );
    let mut client = CacheClient::connect(LocalChannel::new(server.clone()), "persist").unwrap();
    let hits = client
        .fetch_entries(bucket(4), &CacheKey::from_command("cc fs.c"))
        .unwrap();
    assert_eq!(hits.len(), 1);
    let object = client.download(&hits[0].outputs[0].1).unwrap();
    assert_eq!(object.as_deref(), Some(&b"fs-object"[..]));
}
