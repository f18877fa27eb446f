//! Filesystem semantics layer.
//!
//! Maps kernel filesystem operations onto transactionally consistent
//! sequences of record commands. Handles carry no state beyond the inode
//! number; every operation re-reads the store, so mounts on different hosts
//! observe the same tree without any in-process cache coherence.

pub mod codec;
pub mod dir;
pub mod errors;
pub mod file;
pub mod quiesce;
pub mod symlink;
pub mod txn;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use crate::config::{Settings, Timeouts};
use crate::fs::codec::{InodeAttr, ATTR_BINS, BIN_CTIME, BIN_DATA, BIN_SIZE};
use crate::fs::errors::FsError;
use crate::fs::quiesce::Quiesce;
use crate::fs::txn::TxnScope;
use crate::store::{Bin, ReadPolicy, RecordKey, RecordStore, Value, LAST_INODE};

pub const ROOT_INODE: u64 = 1;

/// Attribute changes requested by `setattr`; unset fields are untouched.
#[derive(Debug, Clone, Default)]
pub struct SetAttrs {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<DateTime<Utc>>,
    pub mtime: Option<DateTime<Utc>>,
}

pub struct Asdfs {
    pub(crate) store: Arc<dyn RecordStore>,
    pub(crate) settings: Settings,
    pub(crate) quiesce: Quiesce,
}

impl Asdfs {
    pub fn new(store: Arc<dyn RecordStore>, settings: Settings) -> Self {
        Self {
            store,
            settings,
            quiesce: Quiesce::new(),
        }
    }

    pub fn read_only(&self) -> bool {
        self.settings.mount_params.ro
    }

    fn mrt(&self) -> bool {
        self.settings.aerospike.mrt
    }

    fn timeouts(&self) -> &Timeouts {
        &self.settings.aerospike.timeouts
    }

    pub(crate) fn scope_read_write(&self) -> TxnScope {
        TxnScope::read_write(Arc::clone(&self.store), self.timeouts(), self.mrt())
    }

    pub(crate) fn scope_write_only(&self) -> TxnScope {
        TxnScope::write_only(Arc::clone(&self.store), self.timeouts(), self.mrt())
    }

    /// Read policy for lookups outside any transaction.
    pub(crate) fn detached_read_policy(&self) -> ReadPolicy {
        ReadPolicy {
            txn: None,
            socket_timeout: Duration::from_secs(self.timeouts().socket),
            total_timeout: Duration::from_secs(self.timeouts().total),
        }
    }

    pub(crate) fn detached_write_policy(&self) -> crate::store::WritePolicy {
        txn::detached_write_policy(self.timeouts())
    }

    /// Detect an empty store and create the root inode and `lastInode`
    /// metadata record.
    pub async fn initialize(&self) -> Result<(), FsError> {
        let root = RecordKey::fs(ROOT_INODE);
        let scope = self.scope_read_write();
        match self.store.exists(scope.read(), &root).await {
            Ok(true) => {
                debug!("filesystem already initialized");
                scope.abort().await;
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => {
                scope.abort().await;
                error!("initialize: probing root: {e}");
                return Err(e.into());
            }
        }
        info!("initializing filesystem");
        let mode = libc::S_IFDIR | self.settings.fs.root_mode;
        let bins = codec::new_dir_bins(mode, 0, 0, Utc::now());
        if let Err(e) = self.store.put(&scope.create_only(), &root, bins).await {
            scope.abort().await;
            error!("initialize: creating root: {e}");
            return Err(e.into());
        }
        let meta = RecordKey::meta(LAST_INODE);
        let last = vec![Bin::new(LAST_INODE, Value::Int(ROOT_INODE as i64))];
        if let Err(e) = self.store.put(&scope.create_only(), &meta, last).await {
            scope.abort().await;
            error!("initialize: creating {LAST_INODE}: {e}");
            return Err(e.into());
        }
        scope.commit().await?;
        info!("filesystem initialization complete");
        Ok(())
    }

    /// Allocate a new inode by advancing `lastInode` under the current
    /// transaction. Outside MRT two mounts can race this read-modify-write
    /// and duplicate inode numbers; single-mount operation is unaffected.
    pub(crate) async fn new_inode(&self, scope: &TxnScope) -> Result<u64, FsError> {
        let key = RecordKey::meta(LAST_INODE);
        let record = self.store.get(scope.read(), &key, &[LAST_INODE]).await?;
        let last = record
            .bin(LAST_INODE)
            .and_then(Value::as_int)
            .ok_or(FsError::Fault)?;
        let next = last + 1;
        self.store
            .put(scope.write(), &key, vec![Bin::new(LAST_INODE, Value::Int(next))])
            .await?;
        debug!(txn = scope.id(), "allocated inode {next}");
        Ok(next as u64)
    }

    pub async fn getattr(&self, inode: u64) -> Result<InodeAttr, FsError> {
        debug!("getattr {inode}");
        let key = RecordKey::fs(inode);
        let record = self
            .store
            .get(&self.detached_read_policy(), &key, ATTR_BINS)
            .await
            .map_err(|e| {
                let err = FsError::from(e);
                if err != FsError::NotFound {
                    error!("getattr {inode}: {err}");
                }
                err
            })?;
        Ok(codec::decode_attr(inode, &record)?)
    }

    pub async fn setattr(&self, inode: u64, changes: &SetAttrs) -> Result<(), FsError> {
        if self.read_only() {
            return Err(FsError::ReadOnly);
        }
        let _permit = self.quiesce.admit().await?;
        debug!("setattr {inode}: {changes:?}");
        let scope = self.scope_read_write();
        match self.setattr_in(&scope, inode, changes).await {
            Ok(()) => scope.commit().await,
            Err(e) => {
                scope.abort().await;
                error!("setattr {inode}: {e}");
                Err(e)
            }
        }
    }

    async fn setattr_in(
        &self,
        scope: &TxnScope,
        inode: u64,
        changes: &SetAttrs,
    ) -> Result<(), FsError> {
        let key = RecordKey::fs(inode);
        let mut bins: Vec<Bin> = Vec::new();

        // Size changes rewrite the whole blob, truncated or zero-extended.
        if let Some(new_size) = changes.size {
            let record = self
                .store
                .get(scope.read(), &key, &[BIN_DATA, BIN_SIZE])
                .await?;
            let mut data = record
                .bin(BIN_DATA)
                .and_then(Value::as_blob)
                .ok_or(FsError::Fault)?
                .to_vec();
            data.resize(new_size as usize, 0);
            bins.push(Bin::new(BIN_SIZE, Value::Int(new_size as i64)));
            bins.push(Bin::new(BIN_DATA, Value::Blob(data)));
        }

        if let Some(mode) = changes.mode {
            bins.push(Bin::new(codec::BIN_MODE, Value::Int(mode as i64)));
        }
        if let Some(uid) = changes.uid {
            bins.push(Bin::new(codec::BIN_UID, Value::Int(uid as i64)));
        }
        if let Some(gid) = changes.gid {
            bins.push(Bin::new(codec::BIN_GID, Value::Int(gid as i64)));
        }
        bins.push(Bin::new(BIN_CTIME, codec::encode_time(Utc::now())));
        if let Some(atime) = changes.atime {
            bins.push(Bin::new(codec::BIN_ATIME, codec::encode_time(atime)));
        }
        if let Some(mtime) = changes.mtime {
            bins.push(Bin::new(codec::BIN_MTIME, codec::encode_time(mtime)));
        }

        self.store.put(scope.write(), &key, bins).await?;
        Ok(())
    }

    /// Drain in-flight writes and refuse new ones. After this returns, no
    /// transaction from this process remains open at the store.
    pub async fn shutdown(&self) {
        info!("draining in-flight operations");
        self.quiesce.shutdown().await;
        info!("filesystem quiesced");
    }
}
