//! Contract for the record-oriented key-value store backing the filesystem.
//!
//! The store holds records addressed by `(set, key)`, each record a map of
//! named bins. Commands are atomic per record; [`Operation`] lists execute as
//! one atomic unit on a single record. When the backend supports multi-record
//! transactions, a [`Txn`] handle attached to the command policies makes a
//! group of commands commit or abort together.
//!
//! The wire client speaking to a remote cluster implements [`RecordStore`]
//! out of tree; [`memory::MemoryStore`] is the bundled implementation used by
//! the test suite and single-host mounts.

pub mod memory;
pub mod policy;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

pub use policy::{MapOrder, MapPolicy, MapWriteMode, ReadPolicy, RecordExistsAction, Txn, WritePolicy};

/// Set holding inode records, keyed by integer inode.
pub const SET_FS: &str = "fs";
/// Set holding filesystem metadata records, keyed by string.
pub const SET_META: &str = "meta";
/// Key and bin name of the inode allocation high-water mark.
pub const LAST_INODE: &str = "lastInode";

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("key not found")]
    KeyNotFound,
    #[error("record already exists")]
    RecordExists,
    #[error("map key already exists")]
    MapKeyExists,
    #[error("bin {0} has an incompatible type")]
    BinType(String),
    #[error("transaction expired")]
    TxnExpired,
    #[error("store error: {0}")]
    Io(String),
}

/// Generic value as the store represents it. The codec layer coerces these
/// into concrete widths; the store itself is untyped.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Int(i64),
    Str(String),
    Blob(Vec<u8>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}

/// One named bin of a record.
#[derive(Debug, Clone)]
pub struct Bin {
    pub name: &'static str,
    pub value: Value,
}

impl Bin {
    pub fn new(name: &'static str, value: Value) -> Self {
        Self { name, value }
    }
}

/// Record contents returned by `get` and `operate`. For `operate`, only the
/// bins produced by read sub-ops are present.
#[derive(Debug, Clone, Default)]
pub struct Record {
    pub bins: HashMap<String, Value>,
}

impl Record {
    pub fn bin(&self, name: &str) -> Option<&Value> {
        self.bins.get(name).filter(|v| !matches!(v, Value::Nil))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyValue {
    Int(i64),
    Str(String),
}

/// Address of one record: set name plus key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey {
    pub set: &'static str,
    pub key: KeyValue,
}

impl RecordKey {
    /// Inode record key in the `fs` set.
    pub fn fs(inode: u64) -> Self {
        Self {
            set: SET_FS,
            key: KeyValue::Int(inode as i64),
        }
    }

    /// Metadata record key in the `meta` set.
    pub fn meta(name: &str) -> Self {
        Self {
            set: SET_META,
            key: KeyValue::Str(name.to_owned()),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            KeyValue::Int(i) => write!(f, "{}/{}", self.set, i),
            KeyValue::Str(s) => write!(f, "{}/{}", self.set, s),
        }
    }
}

/// One sub-operation of an atomic per-record operation list.
#[derive(Debug, Clone)]
pub enum Operation {
    /// Read a map entry by key; the result record carries the value under the
    /// bin name, absent when the key is not in the map.
    MapGetByKey { bin: &'static str, key: String },
    /// Insert a map entry under the given map policy.
    MapPut {
        policy: MapPolicy,
        bin: &'static str,
        key: String,
        value: Value,
    },
    /// Remove a map entry by key; removing a missing key is not an error.
    MapRemoveByKey { bin: &'static str, key: String },
    /// Add a delta to an integer bin, creating it from zero when missing.
    Increment { bin: &'static str, delta: i64 },
    /// Read a bin into the result record.
    Get { bin: &'static str },
    /// Write a bin.
    Put(Bin),
}

impl Operation {
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Operation::MapPut { .. }
                | Operation::MapRemoveByKey { .. }
                | Operation::Increment { .. }
                | Operation::Put(_)
        )
    }
}

/// The store client the filesystem core runs against.
///
/// Every method may block on network I/O. Implementations are shared
/// process-wide and must be internally thread-safe.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Read a record, restricted to `bins` when non-empty.
    async fn get(&self, policy: &ReadPolicy, key: &RecordKey, bins: &[&str]) -> StoreResult<Record>;

    async fn exists(&self, policy: &ReadPolicy, key: &RecordKey) -> StoreResult<bool>;

    /// Write bins into a record, honouring `policy.record_exists_action`.
    /// Bins not named keep their current values.
    async fn put(&self, policy: &WritePolicy, key: &RecordKey, bins: Vec<Bin>) -> StoreResult<()>;

    /// Execute an ordered sub-op list atomically on one record.
    async fn operate(
        &self,
        policy: &WritePolicy,
        key: &RecordKey,
        ops: Vec<Operation>,
    ) -> StoreResult<Record>;

    /// Delete a record; returns whether it existed.
    async fn delete(&self, policy: &WritePolicy, key: &RecordKey) -> StoreResult<bool>;

    /// Create a transaction handle expiring after `deadline`.
    fn begin(&self, deadline: Duration) -> Txn;

    /// Commit every command executed under `txn` as one unit.
    async fn commit(&self, txn: &Txn) -> StoreResult<()>;

    /// Roll back every command executed under `txn`.
    async fn abort(&self, txn: &Txn) -> StoreResult<()>;
}
