//! Directory operations.
//!
//! Every mutating operation follows one template: fail `EROFS` on a
//! read-only mount, get admitted by the quiescence gate, open a transaction
//! scope, decide based on a map-get-by-key of the parent listing, apply the
//! mutation ops, then commit, aborting instead on any error exit.

use chrono::Utc;
use tracing::{debug, error};

use crate::fs::codec::{self, EntryType, Ls, LsEntry, BIN_LS, BIN_NLINK};
use crate::fs::errors::FsError;
use crate::fs::txn::TxnScope;
use crate::fs::Asdfs;
use crate::store::{
    MapOrder, MapPolicy, MapWriteMode, Operation, RecordKey, Value, WritePolicy,
};

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    pub inode: u64,
    pub name: String,
    pub entry_type: EntryType,
}

fn ls_map_policy() -> MapPolicy {
    MapPolicy::new(MapOrder::KeyOrdered, MapWriteMode::CreateOnly)
}

fn map_put(name: &str, entry: LsEntry) -> Operation {
    Operation::MapPut {
        policy: ls_map_policy(),
        bin: BIN_LS,
        key: name.to_owned(),
        value: entry.to_value(),
    }
}

impl Asdfs {
    /// Resolve `name` in `parent` to its inode and type.
    pub async fn lookup(&self, parent: u64, name: &str) -> Result<LsEntry, FsError> {
        debug!("lookup {parent} '{name}'");
        let wp = self.detached_write_policy();
        self.lookup_entry(&wp, parent, name)
            .await?
            .ok_or(FsError::NotFound)
    }

    /// Map-get-by-key on the parent listing; `None` when the name is absent.
    pub(crate) async fn lookup_entry(
        &self,
        wp: &WritePolicy,
        parent: u64,
        name: &str,
    ) -> Result<Option<LsEntry>, FsError> {
        let key = RecordKey::fs(parent);
        let record = self
            .store
            .operate(
                wp,
                &key,
                vec![Operation::MapGetByKey {
                    bin: BIN_LS,
                    key: name.to_owned(),
                }],
            )
            .await
            .map_err(|e| {
                error!("lookup ({parent},'{name}'): {e}");
                FsError::from(e)
            })?;
        match record.bin(BIN_LS) {
            None => Ok(None),
            Some(v) => Ok(Some(LsEntry::from_value(v)?)),
        }
    }

    /// Full listing of a directory, in name order.
    pub async fn readdir(&self, dir: u64) -> Result<Vec<Dirent>, FsError> {
        let wp = self.detached_write_policy();
        self.read_dir_all(&wp, dir).await
    }

    pub(crate) async fn read_dir_all(
        &self,
        wp: &WritePolicy,
        dir: u64,
    ) -> Result<Vec<Dirent>, FsError> {
        debug!("readdir {dir}");
        let key = RecordKey::fs(dir);
        let record = self
            .store
            .operate(wp, &key, vec![Operation::Get { bin: BIN_LS }])
            .await?;
        let ls = match record.bin(BIN_LS) {
            Some(v) => Ls::from_value(v)?,
            // Inode exists but carries no listing: not a directory.
            None => return Err(FsError::Fault),
        };
        Ok(ls
            .0
            .into_iter()
            .map(|(name, entry)| Dirent {
                inode: entry.inode,
                name,
                entry_type: entry.entry_type,
            })
            .collect())
    }

    pub async fn mkdir(
        &self,
        parent: u64,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<u64, FsError> {
        if self.read_only() {
            return Err(FsError::ReadOnly);
        }
        let _permit = self.quiesce.admit().await?;
        debug!("mkdir {parent} '{name}' mode {mode:o}");
        let scope = self.scope_read_write();
        match self.mkdir_in(&scope, parent, name, mode, uid, gid).await {
            Ok(inode) => {
                scope.commit().await?;
                Ok(inode)
            }
            Err(e) => {
                scope.abort().await;
                error!("mkdir {parent} '{name}': {e}");
                Err(e)
            }
        }
    }

    async fn mkdir_in(
        &self,
        scope: &TxnScope,
        parent: u64,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<u64, FsError> {
        if self.lookup_entry(scope.write(), parent, name).await?.is_some() {
            return Err(FsError::Exists);
        }
        let inode = self.new_inode(scope).await?;
        let mode = libc::S_IFDIR | (mode & !libc::S_IFMT);
        let bins = codec::new_dir_bins(mode, uid, gid, Utc::now());
        self.store
            .put(&scope.create_only(), &RecordKey::fs(inode), bins)
            .await?;
        self.insert_entry(scope, parent, name, LsEntry { inode, entry_type: EntryType::Directory })
            .await?;
        Ok(inode)
    }

    /// Insert a listing entry under the key-ordered, create-only map policy
    /// and refresh the parent timestamps.
    async fn insert_entry(
        &self,
        scope: &TxnScope,
        parent: u64,
        name: &str,
        entry: LsEntry,
    ) -> Result<(), FsError> {
        let mut ops = vec![map_put(name, entry)];
        ops.extend(codec::touch_bins(Utc::now()).into_iter().map(Operation::Put));
        self.store
            .operate(scope.write(), &RecordKey::fs(parent), ops)
            .await?;
        Ok(())
    }

    /// Remove `name` from `parent`; serves both `rmdir` and `unlink`.
    /// Removing a missing name succeeds silently.
    pub async fn remove(&self, parent: u64, name: &str) -> Result<(), FsError> {
        if self.read_only() {
            return Err(FsError::ReadOnly);
        }
        let _permit = self.quiesce.admit().await?;
        let scope = self.scope_read_write();
        match self.remove_in(&scope, parent, name).await {
            Ok(true) => scope.commit().await,
            Ok(false) => {
                scope.abort().await;
                Ok(())
            }
            Err(e) => {
                scope.abort().await;
                error!("remove '{name}' from {parent}: {e}");
                Err(e)
            }
        }
    }

    /// Returns whether anything was removed. Decrements the target's link
    /// count and deletes its record in the same transaction when the count
    /// reaches zero, so hard-linked files survive until their last name goes.
    pub(crate) async fn remove_in(
        &self,
        scope: &TxnScope,
        parent: u64,
        name: &str,
    ) -> Result<bool, FsError> {
        debug!(txn = scope.id(), "remove '{name}' from {parent}");
        let Some(entry) = self.lookup_entry(scope.write(), parent, name).await? else {
            return Ok(false);
        };
        let target = RecordKey::fs(entry.inode);
        if entry.entry_type == EntryType::Directory {
            let entries = self.read_dir_all(scope.write(), entry.inode).await?;
            if !entries.is_empty() {
                debug!("remove '{name}' from {parent}: not empty");
                return Err(FsError::NotEmpty);
            }
        }
        let mut ops = vec![Operation::MapRemoveByKey {
            bin: BIN_LS,
            key: name.to_owned(),
        }];
        ops.extend(codec::touch_bins(Utc::now()).into_iter().map(Operation::Put));
        self.store
            .operate(scope.write(), &RecordKey::fs(parent), ops)
            .await?;

        let record = self
            .store
            .operate(
                scope.write(),
                &target,
                vec![
                    Operation::Increment { bin: BIN_NLINK, delta: -1 },
                    Operation::Get { bin: BIN_NLINK },
                ],
            )
            .await?;
        let nlink = record
            .bin(BIN_NLINK)
            .and_then(Value::as_int)
            .ok_or(FsError::Fault)?;
        if nlink == 0 {
            self.store.delete(scope.write(), &target).await?;
        }
        Ok(true)
    }

    pub async fn rename(
        &self,
        parent: u64,
        name: &str,
        new_parent: u64,
        new_name: &str,
    ) -> Result<(), FsError> {
        if self.read_only() {
            return Err(FsError::ReadOnly);
        }
        let _permit = self.quiesce.admit().await?;
        debug!("rename '{name}'->'{new_name}' on {parent}->{new_parent}");
        let scope = self.scope_read_write();
        match self
            .rename_in(&scope, parent, name, new_parent, new_name)
            .await
        {
            Ok(()) => scope.commit().await,
            Err(e) => {
                scope.abort().await;
                error!("rename '{name}'->'{new_name}' on {parent}->{new_parent}: {e}");
                Err(e)
            }
        }
    }

    async fn rename_in(
        &self,
        scope: &TxnScope,
        parent: u64,
        name: &str,
        new_parent: u64,
        new_name: &str,
    ) -> Result<(), FsError> {
        let src = self
            .lookup_entry(scope.write(), parent, name)
            .await?
            .ok_or(FsError::NotFound)?;
        let dst = self.lookup_entry(scope.write(), new_parent, new_name).await?;

        match (&src.entry_type, &dst) {
            // A directory never replaces an existing destination.
            (EntryType::Directory, Some(_)) => return Err(FsError::Exists),
            (_, Some(d)) if d.entry_type == EntryType::Directory => return Err(FsError::Exists),
            // A file or symlink overwrites an existing file or symlink; the
            // destination is deleted (link-count aware) in this transaction.
            (_, Some(_)) => {
                self.remove_in(scope, new_parent, new_name).await?;
            }
            (_, None) => {}
        }

        let moved = LsEntry {
            inode: src.inode,
            entry_type: src.entry_type,
        };
        if parent == new_parent {
            // Same record mutated twice: a single operation list keeps it to
            // one atomic command.
            let mut ops = vec![
                Operation::MapRemoveByKey { bin: BIN_LS, key: name.to_owned() },
                map_put(new_name, moved),
            ];
            ops.extend(codec::touch_bins(Utc::now()).into_iter().map(Operation::Put));
            self.store
                .operate(scope.write(), &RecordKey::fs(parent), ops)
                .await?;
        } else {
            let mut ops = vec![Operation::MapRemoveByKey { bin: BIN_LS, key: name.to_owned() }];
            ops.extend(codec::touch_bins(Utc::now()).into_iter().map(Operation::Put));
            self.store
                .operate(scope.write(), &RecordKey::fs(parent), ops)
                .await?;
            self.insert_entry(scope, new_parent, new_name, moved).await?;
        }
        Ok(())
    }

    /// Create a regular file, or open the existing one when the caller asked
    /// to create-or-open. Returns the file inode; the caller builds the open
    /// handle from it.
    pub async fn create(
        &self,
        parent: u64,
        name: &str,
        mode: u32,
        flags: i32,
        uid: u32,
        gid: u32,
    ) -> Result<u64, FsError> {
        if self.read_only() {
            return Err(FsError::ReadOnly);
        }
        let _permit = self.quiesce.admit().await?;
        debug!("create '{name}' in {parent} mode {mode:o} flags {flags:#x}");
        let scope = self.scope_read_write();
        match self
            .create_in(&scope, parent, name, mode, flags, uid, gid)
            .await
        {
            Ok(inode) => {
                scope.commit().await?;
                Ok(inode)
            }
            Err(e) => {
                scope.abort().await;
                error!("create '{name}' in {parent}: {e}");
                Err(e)
            }
        }
    }

    async fn create_in(
        &self,
        scope: &TxnScope,
        parent: u64,
        name: &str,
        mode: u32,
        flags: i32,
        uid: u32,
        gid: u32,
    ) -> Result<u64, FsError> {
        if let Some(existing) = self.lookup_entry(scope.write(), parent, name).await? {
            if existing.entry_type == EntryType::Directory {
                return Err(FsError::Exists);
            }
            if flags & libc::O_CREAT == 0 {
                return Err(FsError::Exists);
            }
            // Create-or-open intent on an existing file: open it, honouring
            // the truncate flag.
            if flags & libc::O_TRUNC != 0 {
                if flags & libc::O_ACCMODE == libc::O_RDONLY {
                    return Err(FsError::Access);
                }
                self.truncate_in(scope, existing.inode).await?;
            }
            return Ok(existing.inode);
        }

        let inode = self.new_inode(scope).await?;
        let mode = libc::S_IFREG | (mode & !libc::S_IFMT);
        let bins = codec::new_file_bins(mode, uid, gid, Utc::now());
        self.store
            .put(scope.write(), &RecordKey::fs(inode), bins)
            .await?;
        self.insert_entry(scope, parent, name, LsEntry { inode, entry_type: EntryType::File })
            .await?;
        Ok(inode)
    }

    /// Add `new_name` as another name for an existing file inode.
    pub async fn link(&self, new_parent: u64, new_name: &str, inode: u64) -> Result<(), FsError> {
        if self.read_only() {
            return Err(FsError::ReadOnly);
        }
        let _permit = self.quiesce.admit().await?;
        debug!("link {inode} -> {new_parent}/'{new_name}'");
        let scope = self.scope_read_write();
        match self.link_in(&scope, new_parent, new_name, inode).await {
            Ok(()) => scope.commit().await,
            Err(e) => {
                scope.abort().await;
                error!("link {inode} -> {new_parent}/'{new_name}': {e}");
                Err(e)
            }
        }
    }

    async fn link_in(
        &self,
        scope: &TxnScope,
        new_parent: u64,
        new_name: &str,
        inode: u64,
    ) -> Result<(), FsError> {
        self.store
            .operate(
                scope.write(),
                &RecordKey::fs(inode),
                vec![Operation::Increment { bin: BIN_NLINK, delta: 1 }],
            )
            .await?;
        // The create-only map policy turns a lost name race into EEXIST.
        self.insert_entry(scope, new_parent, new_name, LsEntry { inode, entry_type: EntryType::File })
            .await?;
        Ok(())
    }

    /// Create a symbolic link holding `target` verbatim.
    pub async fn symlink(
        &self,
        parent: u64,
        name: &str,
        target: &str,
        uid: u32,
        gid: u32,
    ) -> Result<u64, FsError> {
        if self.read_only() {
            return Err(FsError::ReadOnly);
        }
        let _permit = self.quiesce.admit().await?;
        debug!("symlink {parent}/'{name}' -> '{target}'");
        let scope = self.scope_read_write();
        match self.symlink_in(&scope, parent, name, target, uid, gid).await {
            Ok(inode) => {
                scope.commit().await?;
                Ok(inode)
            }
            Err(e) => {
                scope.abort().await;
                error!("symlink {parent}/'{name}': {e}");
                Err(e)
            }
        }
    }

    async fn symlink_in(
        &self,
        scope: &TxnScope,
        parent: u64,
        name: &str,
        target: &str,
        uid: u32,
        gid: u32,
    ) -> Result<u64, FsError> {
        if self.lookup_entry(scope.write(), parent, name).await?.is_some() {
            return Err(FsError::Exists);
        }
        let inode = self.new_inode(scope).await?;
        let bins = codec::new_symlink_bins(target, uid, gid, Utc::now());
        self.store
            .put(scope.write(), &RecordKey::fs(inode), bins)
            .await?;
        self.insert_entry(scope, parent, name, LsEntry { inode, entry_type: EntryType::Symlink })
            .await?;
        Ok(inode)
    }
}
