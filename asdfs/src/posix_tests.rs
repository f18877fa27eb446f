//! Kernel-level scenarios run against the core over the in-process store,
//! with multi-record transactions enabled.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use crate::config::Settings;
use crate::fs::codec::EntryType;
use crate::fs::errors::FsError;
use crate::fs::file::FileHandle;
use crate::fs::{Asdfs, SetAttrs, ROOT_INODE};
use crate::store::memory::MemoryStore;
use crate::store::{
    Bin, Operation, ReadPolicy, Record, RecordKey, RecordStore, StoreResult, Txn, WritePolicy,
};

fn settings(yaml: &str) -> Settings {
    Settings::from_reader(yaml.as_bytes()).unwrap()
}

fn default_settings() -> Settings {
    settings("aerospike: {host: memory, mrt: true}")
}

async fn fs_with(store: Arc<dyn RecordStore>, s: Settings) -> Asdfs {
    let fs = Asdfs::new(store, s);
    fs.initialize().await.unwrap();
    fs
}

async fn new_fs() -> Asdfs {
    fs_with(Arc::new(MemoryStore::new()), default_settings()).await
}

async fn write_file(fs: &Asdfs, parent: u64, name: &str, data: &[u8]) -> u64 {
    let flags = libc::O_CREAT | libc::O_WRONLY;
    let inode = fs.create(parent, name, 0o644, flags, 0, 0).await.unwrap();
    let handle = FileHandle { inode, flags };
    assert_eq!(fs.write(handle, 0, data).await.unwrap(), data.len());
    inode
}

async fn read_file(fs: &Asdfs, inode: u64) -> Vec<u8> {
    let handle = fs.open(inode, libc::O_RDONLY).await.unwrap();
    fs.read(handle, 0, 1 << 20).await.unwrap()
}

#[tokio::test]
async fn scenario_create_and_read_back() {
    let fs = new_fs().await;
    let dir = fs.mkdir(ROOT_INODE, "a", 0o755, 0, 0).await.unwrap();
    assert_eq!(dir, 2);

    let file = write_file(&fs, dir, "b", b"hello").await;
    assert_eq!(file, 3);

    let reopened = fs.open(file, libc::O_RDONLY).await.unwrap();
    assert_eq!(fs.read(reopened, 0, 5).await.unwrap(), b"hello");
    assert_eq!(fs.getattr(file).await.unwrap().size, 5);
}

#[tokio::test]
async fn scenario_rename_over_file_deletes_target() {
    let fs = new_fs().await;
    let x = write_file(&fs, ROOT_INODE, "x", b"X").await;
    let y = write_file(&fs, ROOT_INODE, "y", b"Y").await;

    fs.rename(ROOT_INODE, "x", ROOT_INODE, "y").await.unwrap();

    let entry = fs.lookup(ROOT_INODE, "y").await.unwrap();
    assert_eq!(entry.inode, x);
    assert_eq!(read_file(&fs, entry.inode).await, b"X");
    assert_eq!(fs.getattr(y).await.unwrap_err(), FsError::NotFound);
    assert_eq!(fs.lookup(ROOT_INODE, "x").await.unwrap_err(), FsError::NotFound);
}

#[tokio::test]
async fn scenario_hard_link_survives_unlink() {
    let fs = new_fs().await;
    let f = write_file(&fs, ROOT_INODE, "f", b"Z").await;

    fs.link(ROOT_INODE, "g", f).await.unwrap();
    assert_eq!(fs.getattr(f).await.unwrap().nlink, 2);

    fs.remove(ROOT_INODE, "f").await.unwrap();
    assert_eq!(fs.getattr(f).await.unwrap().nlink, 1);
    assert_eq!(read_file(&fs, f).await, b"Z");

    fs.remove(ROOT_INODE, "g").await.unwrap();
    assert_eq!(fs.getattr(f).await.unwrap_err(), FsError::NotFound);
}

#[tokio::test]
async fn scenario_rmdir_refuses_non_empty() {
    let fs = new_fs().await;
    let d = fs.mkdir(ROOT_INODE, "d", 0o755, 0, 0).await.unwrap();
    write_file(&fs, d, "c", b"").await;

    assert_eq!(fs.remove(ROOT_INODE, "d").await.unwrap_err(), FsError::NotEmpty);

    fs.remove(d, "c").await.unwrap();
    fs.remove(ROOT_INODE, "d").await.unwrap();
    assert_eq!(fs.lookup(ROOT_INODE, "d").await.unwrap_err(), FsError::NotFound);
}

#[tokio::test]
async fn scenario_symlink_round_trip() {
    let fs = new_fs().await;
    let l = fs
        .symlink(ROOT_INODE, "l", "target/path", 0, 0)
        .await
        .unwrap();

    assert_eq!(fs.readlink(l).await.unwrap(), "target/path");
    let attr = fs.symlink_attr(l).await.unwrap();
    assert_eq!(attr.mode & libc::S_IFMT, libc::S_IFLNK);
    assert_eq!(attr.size, "target/path".len() as u64);

    let entry = fs.lookup(ROOT_INODE, "l").await.unwrap();
    assert_eq!(entry.entry_type, EntryType::Symlink);
}

#[tokio::test]
async fn empty_symlink_target_round_trips() {
    let fs = new_fs().await;
    let l = fs.symlink(ROOT_INODE, "empty", "", 0, 0).await.unwrap();
    assert_eq!(fs.readlink(l).await.unwrap(), "");
    assert_eq!(fs.getattr(l).await.unwrap().size, 0);
}

#[tokio::test]
async fn lookup_agrees_with_readdir() {
    let fs = new_fs().await;
    let d = fs.mkdir(ROOT_INODE, "dir", 0o755, 0, 0).await.unwrap();
    write_file(&fs, d, "file", b"1").await;
    fs.symlink(d, "sym", "file", 0, 0).await.unwrap();
    fs.mkdir(d, "sub", 0o755, 0, 0).await.unwrap();

    let listing = fs.readdir(d).await.unwrap();
    assert_eq!(listing.len(), 3);
    let names: Vec<_> = listing.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["file", "sub", "sym"], "listing is name-ordered");

    for entry in listing {
        let found = fs.lookup(d, &entry.name).await.unwrap();
        assert_eq!(found.inode, entry.inode);
        assert_eq!(found.entry_type, entry.entry_type);
    }
}

#[tokio::test]
async fn create_then_unlink_removes_the_record() {
    let fs = new_fs().await;
    let f = write_file(&fs, ROOT_INODE, "tmp", b"x").await;
    fs.remove(ROOT_INODE, "tmp").await.unwrap();
    assert_eq!(fs.getattr(f).await.unwrap_err(), FsError::NotFound);
}

#[tokio::test]
async fn remove_of_missing_name_is_silent() {
    let fs = new_fs().await;
    fs.remove(ROOT_INODE, "never-existed").await.unwrap();
}

#[tokio::test]
async fn mkdir_twice_reports_exists() {
    let fs = new_fs().await;
    fs.mkdir(ROOT_INODE, "n", 0o755, 0, 0).await.unwrap();
    assert_eq!(
        fs.mkdir(ROOT_INODE, "n", 0o755, 0, 0).await.unwrap_err(),
        FsError::Exists
    );
}

#[tokio::test]
async fn inode_allocation_is_strictly_monotonic() {
    let fs = new_fs().await;
    let a = fs.mkdir(ROOT_INODE, "a", 0o755, 0, 0).await.unwrap();
    let b = fs.mkdir(ROOT_INODE, "b", 0o755, 0, 0).await.unwrap();
    let c = write_file(&fs, ROOT_INODE, "c", b"").await;
    assert!(a < b && b < c);
}

#[tokio::test]
async fn rename_directory_onto_existing_name_fails() {
    let fs = new_fs().await;
    fs.mkdir(ROOT_INODE, "src", 0o755, 0, 0).await.unwrap();
    write_file(&fs, ROOT_INODE, "dst", b"").await;
    assert_eq!(
        fs.rename(ROOT_INODE, "src", ROOT_INODE, "dst").await.unwrap_err(),
        FsError::Exists
    );
}

#[tokio::test]
async fn rename_file_onto_directory_fails() {
    let fs = new_fs().await;
    write_file(&fs, ROOT_INODE, "src", b"").await;
    fs.mkdir(ROOT_INODE, "dst", 0o755, 0, 0).await.unwrap();
    assert_eq!(
        fs.rename(ROOT_INODE, "src", ROOT_INODE, "dst").await.unwrap_err(),
        FsError::Exists
    );
}

#[tokio::test]
async fn rename_within_one_directory() {
    let fs = new_fs().await;
    let f = write_file(&fs, ROOT_INODE, "old", b"keep").await;
    fs.rename(ROOT_INODE, "old", ROOT_INODE, "new").await.unwrap();
    assert_eq!(fs.lookup(ROOT_INODE, "old").await.unwrap_err(), FsError::NotFound);
    assert_eq!(fs.lookup(ROOT_INODE, "new").await.unwrap().inode, f);
    assert_eq!(read_file(&fs, f).await, b"keep");
}

#[tokio::test]
async fn rename_missing_source_fails() {
    let fs = new_fs().await;
    assert_eq!(
        fs.rename(ROOT_INODE, "ghost", ROOT_INODE, "x").await.unwrap_err(),
        FsError::NotFound
    );
}

#[tokio::test]
async fn rename_overwrite_keeps_hardlinked_target_alive() {
    let fs = new_fs().await;
    let src = write_file(&fs, ROOT_INODE, "src", b"new").await;
    let dst = write_file(&fs, ROOT_INODE, "dst", b"old").await;
    fs.link(ROOT_INODE, "keeper", dst).await.unwrap();

    fs.rename(ROOT_INODE, "src", ROOT_INODE, "dst").await.unwrap();

    // The overwritten inode survives through its other name.
    assert_eq!(fs.getattr(dst).await.unwrap().nlink, 1);
    assert_eq!(read_file(&fs, dst).await, b"old");
    assert_eq!(fs.lookup(ROOT_INODE, "dst").await.unwrap().inode, src);
}

#[tokio::test]
async fn setattr_round_trips_through_getattr() {
    let fs = new_fs().await;
    let f = write_file(&fs, ROOT_INODE, "f", b"12345678").await;

    let atime = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    let mtime = Utc.with_ymd_and_hms(2024, 6, 2, 12, 0, 0).unwrap();
    let changes = SetAttrs {
        mode: Some(libc::S_IFREG | 0o600),
        uid: Some(1000),
        gid: Some(100),
        size: Some(4),
        atime: Some(atime),
        mtime: Some(mtime),
    };
    fs.setattr(f, &changes).await.unwrap();

    let attr = fs.getattr(f).await.unwrap();
    assert_eq!(attr.mode, libc::S_IFREG | 0o600);
    assert_eq!(attr.uid, 1000);
    assert_eq!(attr.gid, 100);
    assert_eq!(attr.size, 4);
    assert_eq!(attr.atime, atime);
    assert_eq!(attr.mtime, mtime);

    let handle = fs.open(f, libc::O_RDONLY).await.unwrap();
    assert_eq!(fs.read(handle, 0, 16).await.unwrap(), b"1234");
}

#[tokio::test]
async fn setattr_zero_extends() {
    let fs = new_fs().await;
    let f = write_file(&fs, ROOT_INODE, "f", b"ab").await;
    let changes = SetAttrs {
        size: Some(4),
        ..Default::default()
    };
    fs.setattr(f, &changes).await.unwrap();
    assert_eq!(read_file(&fs, f).await, b"ab\0\0");
}

#[tokio::test]
async fn write_read_round_trip_and_clipping() {
    let fs = new_fs().await;
    let f = write_file(&fs, ROOT_INODE, "f", b"hello world").await;
    let handle = fs.open(f, libc::O_RDONLY).await.unwrap();
    assert_eq!(fs.read(handle, 0, 11).await.unwrap(), b"hello world");
    assert_eq!(fs.read(handle, 6, 100).await.unwrap(), b"world");
    assert_eq!(fs.read(handle, 100, 10).await.unwrap(), b"");
}

#[tokio::test]
async fn append_mode_concatenates() {
    let fs = new_fs().await;
    let f = write_file(&fs, ROOT_INODE, "log", b"one").await;
    let handle = fs
        .open(f, libc::O_WRONLY | libc::O_APPEND)
        .await
        .unwrap();
    assert_eq!(fs.write(handle, 0, b" two").await.unwrap(), 4);
    assert_eq!(read_file(&fs, f).await, b"one two");
    assert_eq!(fs.getattr(f).await.unwrap().size, 7);
}

#[tokio::test]
async fn open_truncate_zeroes_the_blob() {
    let fs = new_fs().await;
    let f = write_file(&fs, ROOT_INODE, "f", b"content").await;
    fs.open(f, libc::O_WRONLY | libc::O_TRUNC).await.unwrap();
    assert_eq!(fs.getattr(f).await.unwrap().size, 0);
    assert_eq!(read_file(&fs, f).await, b"");
}

#[tokio::test]
async fn truncate_on_read_only_handle_is_refused() {
    let fs = new_fs().await;
    let f = write_file(&fs, ROOT_INODE, "f", b"content").await;
    assert_eq!(
        fs.open(f, libc::O_RDONLY | libc::O_TRUNC).await.unwrap_err(),
        FsError::Access
    );
    assert_eq!(read_file(&fs, f).await, b"content");
}

#[tokio::test]
async fn create_on_existing_file_opens_it() {
    let fs = new_fs().await;
    let f = write_file(&fs, ROOT_INODE, "f", b"data").await;
    let again = fs
        .create(ROOT_INODE, "f", 0o644, libc::O_CREAT | libc::O_RDWR, 0, 0)
        .await
        .unwrap();
    assert_eq!(again, f);
    assert_eq!(read_file(&fs, f).await, b"data");

    // With the truncate flag the existing contents are dropped.
    fs.create(
        ROOT_INODE,
        "f",
        0o644,
        libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC,
        0,
        0,
    )
    .await
    .unwrap();
    assert_eq!(fs.getattr(f).await.unwrap().size, 0);
}

#[tokio::test]
async fn create_over_directory_fails() {
    let fs = new_fs().await;
    fs.mkdir(ROOT_INODE, "d", 0o755, 0, 0).await.unwrap();
    assert_eq!(
        fs.create(ROOT_INODE, "d", 0o644, libc::O_CREAT | libc::O_WRONLY, 0, 0)
            .await
            .unwrap_err(),
        FsError::Exists
    );
}

#[tokio::test]
async fn handle_flag_gating() {
    let fs = new_fs().await;
    let f = write_file(&fs, ROOT_INODE, "f", b"data").await;

    let write_only = fs.open(f, libc::O_WRONLY).await.unwrap();
    assert_eq!(fs.read(write_only, 0, 4).await.unwrap_err(), FsError::Access);

    let read_only = fs.open(f, libc::O_RDONLY | libc::O_NOFOLLOW).await.unwrap();
    assert_eq!(fs.write(read_only, 0, b"x").await.unwrap_err(), FsError::Access);

    // A handle with no flags at all was never opened.
    let stale = FileHandle { inode: f, flags: 0 };
    assert_eq!(fs.write(stale, 0, b"x").await.unwrap_err(), FsError::BadHandle);
}

#[tokio::test]
async fn read_only_mount_rejects_all_mutations() {
    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
    // Initialize through a writable mount first, then remount read-only.
    fs_with(Arc::clone(&store), default_settings()).await;
    let fs = Asdfs::new(
        store,
        settings("{aerospike: {host: memory, mrt: true}, mountParams: {ro: true}}"),
    );

    let e = FsError::ReadOnly;
    assert_eq!(fs.mkdir(ROOT_INODE, "d", 0o755, 0, 0).await.unwrap_err(), e);
    assert_eq!(
        fs.create(ROOT_INODE, "f", 0o644, libc::O_CREAT, 0, 0).await.unwrap_err(),
        e
    );
    assert_eq!(fs.remove(ROOT_INODE, "x").await.unwrap_err(), e);
    assert_eq!(fs.rename(ROOT_INODE, "a", ROOT_INODE, "b").await.unwrap_err(), e);
    assert_eq!(fs.link(ROOT_INODE, "l", 2).await.unwrap_err(), e);
    assert_eq!(fs.symlink(ROOT_INODE, "s", "t", 0, 0).await.unwrap_err(), e);
    assert_eq!(fs.setattr(ROOT_INODE, &SetAttrs::default()).await.unwrap_err(), e);
    let h = FileHandle { inode: 2, flags: libc::O_WRONLY };
    assert_eq!(fs.write(h, 0, b"x").await.unwrap_err(), e);
    assert_eq!(
        fs.open(2, libc::O_WRONLY | libc::O_TRUNC).await.unwrap_err(),
        e
    );

    // Reads still work.
    assert_eq!(fs.getattr(ROOT_INODE).await.unwrap().inode, ROOT_INODE);
    assert!(fs.readdir(ROOT_INODE).await.unwrap().is_empty());
}

#[tokio::test]
async fn getattr_of_missing_inode_is_not_found() {
    let fs = new_fs().await;
    assert_eq!(fs.getattr(4242).await.unwrap_err(), FsError::NotFound);
}

#[tokio::test]
async fn initialize_twice_is_idempotent() {
    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
    let fs = fs_with(Arc::clone(&store), default_settings()).await;
    write_file(&fs, ROOT_INODE, "survivor", b"x").await;

    // A second mount against the same store must not reinitialize.
    let again = fs_with(store, default_settings()).await;
    assert!(again.lookup(ROOT_INODE, "survivor").await.is_ok());
}

/// Store wrapper that slows every record put, keeping write operations
/// in flight long enough to race shutdown against them.
struct SlowStore {
    inner: MemoryStore,
    delay: Duration,
}

#[async_trait]
impl RecordStore for SlowStore {
    async fn get(&self, p: &ReadPolicy, k: &RecordKey, bins: &[&str]) -> StoreResult<Record> {
        self.inner.get(p, k, bins).await
    }

    async fn exists(&self, p: &ReadPolicy, k: &RecordKey) -> StoreResult<bool> {
        self.inner.exists(p, k).await
    }

    async fn put(&self, p: &WritePolicy, k: &RecordKey, bins: Vec<Bin>) -> StoreResult<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.put(p, k, bins).await
    }

    async fn operate(&self, p: &WritePolicy, k: &RecordKey, ops: Vec<Operation>) -> StoreResult<Record> {
        self.inner.operate(p, k, ops).await
    }

    async fn delete(&self, p: &WritePolicy, k: &RecordKey) -> StoreResult<bool> {
        self.inner.delete(p, k).await
    }

    fn begin(&self, deadline: Duration) -> Txn {
        self.inner.begin(deadline)
    }

    async fn commit(&self, txn: &Txn) -> StoreResult<()> {
        self.inner.commit(txn).await
    }

    async fn abort(&self, txn: &Txn) -> StoreResult<()> {
        self.inner.abort(txn).await
    }
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_write() {
    let store = Arc::new(SlowStore {
        inner: MemoryStore::new(),
        delay: Duration::from_millis(100),
    });
    let fs = Arc::new(fs_with(store, default_settings()).await);
    let f = write_file(&fs, ROOT_INODE, "f", b"seed").await;

    let handle = FileHandle { inode: f, flags: libc::O_WRONLY };
    let writer_fs = Arc::clone(&fs);
    let started = Instant::now();
    let writer = tokio::spawn(async move {
        writer_fs.write(handle, 0, b"final contents").await.unwrap();
    });

    // Let the write get admitted and stall inside the store.
    tokio::time::sleep(Duration::from_millis(20)).await;
    fs.shutdown().await;

    // Shutdown returned only after the write's transaction committed: the
    // new contents are durable and the writer held its permit the whole way.
    assert!(started.elapsed() >= Duration::from_millis(100));
    writer.await.unwrap();
    assert_eq!(read_file(&fs, f).await, b"final contents");

    // And nothing new gets admitted.
    assert!(fs.write(handle, 0, b"late").await.is_err());
}
