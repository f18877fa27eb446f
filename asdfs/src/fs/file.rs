//! File operations.
//!
//! Files are stored as a single blob, read and written whole. Handles carry
//! only the inode and the open flags; permission gating happens against the
//! flags on every call.

use chrono::Utc;
use tracing::{debug, error, warn};

use crate::fs::codec::{self, BIN_DATA, BIN_SIZE};
use crate::fs::errors::FsError;
use crate::fs::txn::TxnScope;
use crate::fs::Asdfs;
use crate::store::{Bin, RecordKey, Value};

/// An opened file: the inode plus the kernel's open flags.
#[derive(Debug, Clone, Copy)]
pub struct FileHandle {
    pub inode: u64,
    pub flags: i32,
}

impl FileHandle {
    fn read_allowed(self) -> bool {
        self.flags & libc::O_ACCMODE != libc::O_WRONLY
    }

    fn write_allowed(self) -> bool {
        self.flags & libc::O_ACCMODE != libc::O_RDONLY
    }

    fn append(self) -> bool {
        self.flags & libc::O_APPEND != 0
    }
}

impl Asdfs {
    /// Open an inode. The returned handle carries the flags for later
    /// permission gating; a truncate flag zeroes the blob under its own
    /// transaction before the handle is handed out.
    pub async fn open(&self, inode: u64, flags: i32) -> Result<FileHandle, FsError> {
        debug!("open {inode} flags {flags:#x}");
        let handle = FileHandle { inode, flags };
        if flags & libc::O_TRUNC != 0 {
            if self.read_only() {
                return Err(FsError::ReadOnly);
            }
            // Truncation is a write; a handle that cannot write must not
            // clobber data as a side effect of open.
            if !handle.write_allowed() {
                return Err(FsError::Access);
            }
            let _permit = self.quiesce.admit().await?;
            let scope = self.scope_write_only();
            if let Err(e) = self.truncate_in(&scope, inode).await {
                scope.abort().await;
                error!("open: truncating {inode}: {e}");
                return Err(e);
            }
            scope.commit().await?;
        }
        Ok(handle)
    }

    pub(crate) async fn truncate_in(&self, scope: &TxnScope, inode: u64) -> Result<(), FsError> {
        debug!(txn = scope.id(), "truncating {inode}");
        let now = Utc::now();
        let bins = vec![
            Bin::new(BIN_DATA, Value::Blob(Vec::new())),
            Bin::new(BIN_SIZE, Value::Int(0)),
            Bin::new(codec::BIN_MTIME, codec::encode_time(now)),
            Bin::new(codec::BIN_ATIME, codec::encode_time(now)),
        ];
        self.store
            .put(scope.write(), &RecordKey::fs(inode), bins)
            .await?;
        Ok(())
    }

    /// Serve `[offset, offset + size)` out of the whole blob, clipped to the
    /// file bounds.
    pub async fn read(&self, handle: FileHandle, offset: i64, size: u32) -> Result<Vec<u8>, FsError> {
        debug!("read {} offset {offset} size {size}", handle.inode);
        if !handle.read_allowed() {
            debug!("read {}: opened write-only", handle.inode);
            return Err(FsError::Access);
        }
        let key = RecordKey::fs(handle.inode);
        let record = self
            .store
            .get(&self.detached_read_policy(), &key, &[BIN_DATA])
            .await
            .map_err(|e| {
                let err = FsError::from(e);
                if err != FsError::NotFound {
                    error!("read {}: {err}", handle.inode);
                }
                err
            })?;
        let data = record
            .bin(BIN_DATA)
            .and_then(Value::as_blob)
            .ok_or(FsError::Fault)?;
        Ok(codec::clip(data, offset, size).to_vec())
    }

    /// Replace the blob with the payload (append mode concatenates instead)
    /// and return the number of bytes consumed.
    pub async fn write(
        &self,
        handle: FileHandle,
        offset: i64,
        payload: &[u8],
    ) -> Result<usize, FsError> {
        if self.read_only() {
            return Err(FsError::ReadOnly);
        }
        debug!("write {} offset {offset} len {}", handle.inode, payload.len());
        if handle.flags == 0 {
            error!("write {}: not an open handle", handle.inode);
            return Err(FsError::BadHandle);
        }
        if !handle.write_allowed() {
            debug!("write {}: opened read-only", handle.inode);
            return Err(FsError::Access);
        }
        let _permit = self.quiesce.admit().await?;
        let scope = self.scope_read_write();
        match self.write_in(&scope, handle, offset, payload).await {
            Ok(()) => {
                scope.commit().await?;
                Ok(payload.len())
            }
            Err(e) => {
                scope.abort().await;
                error!("write {}: {e}", handle.inode);
                Err(e)
            }
        }
    }

    async fn write_in(
        &self,
        scope: &TxnScope,
        handle: FileHandle,
        offset: i64,
        payload: &[u8],
    ) -> Result<(), FsError> {
        let key = RecordKey::fs(handle.inode);
        let wanted: &[&str] = if handle.append() {
            &[BIN_SIZE, BIN_DATA]
        } else {
            &[BIN_SIZE]
        };
        let record = self.store.get(scope.read(), &key, wanted).await?;

        let data = if handle.append() {
            let mut data = record
                .bin(BIN_DATA)
                .and_then(Value::as_blob)
                .ok_or(FsError::Fault)?
                .to_vec();
            data.extend_from_slice(payload);
            data
        } else {
            // Random-offset writes overwrite the whole blob; partial-write
            // correctness is a documented non-goal.
            if offset != 0 {
                warn!(
                    "write {} at offset {offset} replaces the entire blob",
                    handle.inode
                );
            }
            payload.to_vec()
        };

        let now = Utc::now();
        let bins = vec![
            Bin::new(BIN_SIZE, Value::Int(data.len() as i64)),
            Bin::new(BIN_DATA, Value::Blob(data)),
            Bin::new(codec::BIN_MTIME, codec::encode_time(now)),
            Bin::new(codec::BIN_ATIME, codec::encode_time(now)),
        ];
        self.store.put(scope.write(), &key, bins).await?;
        Ok(())
    }
}
