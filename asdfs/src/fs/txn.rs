//! Transaction wrapper around store command policies.
//!
//! A [`TxnScope`] bundles the read policy, write policy, and optional
//! transaction handle for one logical filesystem operation. With MRT enabled
//! a fresh handle is created per scope, its deadline taken from
//! configuration, and attached to every policy handed out; `commit`/`abort`
//! then seal or roll back the whole operation. With MRT disabled both are
//! no-ops and record commands execute with per-command atomicity only.
//!
//! Every operation path must resolve a scope through exactly one of
//! [`TxnScope::commit`] or [`TxnScope::abort`] on every exit.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use crate::config::Timeouts;
use crate::fs::errors::FsError;
use crate::store::{ReadPolicy, RecordExistsAction, RecordStore, Txn, WritePolicy};

pub struct TxnScope {
    store: Arc<dyn RecordStore>,
    txn: Option<Txn>,
    read: ReadPolicy,
    write: WritePolicy,
}

fn read_policy(txn: Option<Txn>, t: &Timeouts) -> ReadPolicy {
    ReadPolicy {
        txn,
        socket_timeout: Duration::from_secs(t.socket),
        total_timeout: Duration::from_secs(t.total),
    }
}

fn write_policy(txn: Option<Txn>, t: &Timeouts) -> WritePolicy {
    WritePolicy {
        txn,
        record_exists_action: RecordExistsAction::Update,
        // Tombstones must persist across restarts, and the integer inode
        // must stay inspectable in the store.
        durable_delete: true,
        send_key: true,
        socket_timeout: Duration::from_secs(t.socket),
        total_timeout: Duration::from_secs(t.total),
    }
}

/// Write policy for reads that go through `operate` outside any transaction
/// (`lookup`, `readdir`).
pub fn detached_write_policy(t: &Timeouts) -> WritePolicy {
    write_policy(None, t)
}

impl TxnScope {
    fn new(store: Arc<dyn RecordStore>, timeouts: &Timeouts, mrt: bool) -> Self {
        let txn = mrt.then(|| store.begin(Duration::from_secs(timeouts.mrt)));
        let read = read_policy(txn.clone(), timeouts);
        let write = write_policy(txn.clone(), timeouts);
        Self {
            store,
            txn,
            read,
            write,
        }
    }

    /// Scope for an operation that only reads.
    pub fn read_only(store: Arc<dyn RecordStore>, timeouts: &Timeouts, mrt: bool) -> Self {
        Self::new(store, timeouts, mrt)
    }

    /// Scope for an operation that only writes.
    pub fn write_only(store: Arc<dyn RecordStore>, timeouts: &Timeouts, mrt: bool) -> Self {
        Self::new(store, timeouts, mrt)
    }

    /// Scope for an operation that reads and writes.
    pub fn read_write(store: Arc<dyn RecordStore>, timeouts: &Timeouts, mrt: bool) -> Self {
        Self::new(store, timeouts, mrt)
    }

    pub fn read(&self) -> &ReadPolicy {
        &self.read
    }

    pub fn write(&self) -> &WritePolicy {
        &self.write
    }

    /// Derive a create-only write policy, preserving the durable-delete and
    /// send-key defaults.
    pub fn create_only(&self) -> WritePolicy {
        let mut wp = self.write.clone();
        wp.record_exists_action = RecordExistsAction::CreateOnly;
        wp
    }

    /// Transaction id for log correlation; -1 when MRT is off.
    pub fn id(&self) -> i64 {
        self.txn.as_ref().map(|t| t.id as i64).unwrap_or(-1)
    }

    /// Seal the transaction. A commit failure aborts and surfaces `EFAULT`.
    pub async fn commit(self) -> Result<(), FsError> {
        let Some(txn) = &self.txn else { return Ok(()) };
        if let Err(e) = self.store.commit(txn).await {
            error!(txn = txn.id, "commit failed: {e}");
            let _ = self.store.abort(txn).await;
            return Err(FsError::Fault);
        }
        Ok(())
    }

    /// Roll back the transaction. Abort failures are logged and swallowed;
    /// the operation error already on its way out is the one that matters.
    pub async fn abort(&self) {
        let Some(txn) = &self.txn else { return };
        if let Err(e) = self.store.abort(txn).await {
            debug!(txn = txn.id, "abort failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn timeouts() -> Timeouts {
        Timeouts {
            total: 120,
            socket: 30,
            mrt: 120,
            connect: 60,
            login: 60,
        }
    }

    #[tokio::test]
    async fn policies_carry_write_defaults() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let scope = TxnScope::read_write(store, &timeouts(), true);
        assert!(scope.write().durable_delete);
        assert!(scope.write().send_key);
        assert_eq!(scope.write().socket_timeout, Duration::from_secs(30));
        assert_eq!(scope.write().total_timeout, Duration::from_secs(120));

        let co = scope.create_only();
        assert_eq!(co.record_exists_action, RecordExistsAction::CreateOnly);
        assert!(co.durable_delete);
        assert!(co.send_key);
    }

    #[tokio::test]
    async fn mrt_toggle_controls_txn_attachment() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let with = TxnScope::read_write(Arc::clone(&store), &timeouts(), true);
        assert!(with.read().txn.is_some());
        assert!(with.write().txn.is_some());
        assert!(with.id() >= 0);
        with.commit().await.unwrap();

        let without = TxnScope::read_write(store, &timeouts(), false);
        assert!(without.read().txn.is_none());
        assert_eq!(without.id(), -1);
        without.commit().await.unwrap();
    }
}
