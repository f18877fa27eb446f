//! In-process implementation of the record-store contract.
//!
//! Backs the test suite and `host: memory` mounts. Per-command atomicity
//! comes from a single state lock; transactions stage whole-record images
//! that are installed atomically at commit and discarded on abort. Staged
//! state is visible only to commands carrying the same transaction handle.
//!
//! Like the remote store outside MRT, concurrent transactions are not
//! conflict-checked against each other; the last commit wins.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{
    Bin, KeyValue, MapWriteMode, Operation, ReadPolicy, Record, RecordExistsAction, RecordKey,
    RecordStore, StoreError, StoreResult, Txn, Value, WritePolicy,
};

type Bins = BTreeMap<String, Value>;

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
struct StoredKey {
    set: &'static str,
    key: KeyValue,
}

impl From<&RecordKey> for StoredKey {
    fn from(k: &RecordKey) -> Self {
        Self {
            set: k.set,
            key: k.key.clone(),
        }
    }
}

struct TxnState {
    /// Staged record images; `None` is a pending delete.
    staged: BTreeMap<StoredKey, Option<Bins>>,
    deadline: Instant,
}

#[derive(Default)]
struct State {
    records: BTreeMap<StoredKey, Bins>,
    txns: HashMap<u64, TxnState>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    next_txn: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Validate the transaction a policy carries, if any, against registered
/// transaction state and its deadline.
fn check_txn(state: &State, txn: Option<&Txn>) -> StoreResult<()> {
    let Some(txn) = txn else { return Ok(()) };
    let known = state
        .txns
        .get(&txn.id)
        .ok_or(StoreError::TxnExpired)?;
    if Instant::now() > known.deadline {
        return Err(StoreError::TxnExpired);
    }
    Ok(())
}

/// The record as seen by `txn`: its staged image when present, the committed
/// record otherwise.
fn visible(state: &State, txn: Option<&Txn>, key: &StoredKey) -> Option<Bins> {
    if let Some(txn) = txn {
        if let Some(staged) = state.txns.get(&txn.id).and_then(|t| t.staged.get(key)) {
            return staged.clone();
        }
    }
    state.records.get(key).cloned()
}

/// Install a record image, either staged under `txn` or committed in place.
fn install(state: &mut State, txn: Option<&Txn>, key: StoredKey, image: Option<Bins>) {
    if let Some(txn) = txn {
        if let Some(t) = state.txns.get_mut(&txn.id) {
            t.staged.insert(key, image);
            return;
        }
    }
    match image {
        Some(bins) => {
            state.records.insert(key, bins);
        }
        None => {
            state.records.remove(&key);
        }
    }
}

fn apply_op(bins: &mut Bins, op: Operation, results: &mut Record) -> StoreResult<()> {
    match op {
        Operation::MapGetByKey { bin, key } => {
            if let Some(v) = bins.get(bin) {
                let map = v
                    .as_map()
                    .ok_or_else(|| StoreError::BinType(bin.to_owned()))?;
                if let Some(found) = map.get(&key) {
                    results.bins.insert(bin.to_owned(), found.clone());
                }
            }
        }
        Operation::MapPut {
            policy,
            bin,
            key,
            value,
        } => {
            let entry = bins
                .entry(bin.to_owned())
                .or_insert_with(|| Value::Map(BTreeMap::new()));
            let Value::Map(map) = entry else {
                return Err(StoreError::BinType(bin.to_owned()));
            };
            if policy.write_mode == MapWriteMode::CreateOnly && map.contains_key(&key) {
                return Err(StoreError::MapKeyExists);
            }
            map.insert(key, value);
        }
        Operation::MapRemoveByKey { bin, key } => {
            if let Some(v) = bins.get_mut(bin) {
                let Value::Map(map) = v else {
                    return Err(StoreError::BinType(bin.to_owned()));
                };
                map.remove(&key);
            }
        }
        Operation::Increment { bin, delta } => {
            let current = match bins.get(bin) {
                Some(v) => v
                    .as_int()
                    .ok_or_else(|| StoreError::BinType(bin.to_owned()))?,
                None => 0,
            };
            bins.insert(bin.to_owned(), Value::Int(current + delta));
        }
        Operation::Get { bin } => {
            if let Some(v) = bins.get(bin) {
                results.bins.insert(bin.to_owned(), v.clone());
            }
        }
        Operation::Put(Bin { name, value }) => {
            bins.insert(name.to_owned(), value);
        }
    }
    Ok(())
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, policy: &ReadPolicy, key: &RecordKey, bins: &[&str]) -> StoreResult<Record> {
        let state = self.state.lock().map_err(|e| StoreError::Io(e.to_string()))?;
        check_txn(&state, policy.txn.as_ref())?;
        let image = visible(&state, policy.txn.as_ref(), &key.into()).ok_or(StoreError::KeyNotFound)?;
        let mut record = Record::default();
        for (name, value) in image {
            if bins.is_empty() || bins.contains(&name.as_str()) {
                record.bins.insert(name, value);
            }
        }
        Ok(record)
    }

    async fn exists(&self, policy: &ReadPolicy, key: &RecordKey) -> StoreResult<bool> {
        let state = self.state.lock().map_err(|e| StoreError::Io(e.to_string()))?;
        check_txn(&state, policy.txn.as_ref())?;
        Ok(visible(&state, policy.txn.as_ref(), &key.into()).is_some())
    }

    async fn put(&self, policy: &WritePolicy, key: &RecordKey, bins: Vec<Bin>) -> StoreResult<()> {
        let mut state = self.state.lock().map_err(|e| StoreError::Io(e.to_string()))?;
        check_txn(&state, policy.txn.as_ref())?;
        let stored: StoredKey = key.into();
        let existing = visible(&state, policy.txn.as_ref(), &stored);
        if existing.is_some() && policy.record_exists_action == RecordExistsAction::CreateOnly {
            return Err(StoreError::RecordExists);
        }
        let mut image = existing.unwrap_or_default();
        for bin in bins {
            image.insert(bin.name.to_owned(), bin.value);
        }
        install(&mut state, policy.txn.as_ref(), stored, Some(image));
        Ok(())
    }

    async fn operate(
        &self,
        policy: &WritePolicy,
        key: &RecordKey,
        ops: Vec<Operation>,
    ) -> StoreResult<Record> {
        let mut state = self.state.lock().map_err(|e| StoreError::Io(e.to_string()))?;
        check_txn(&state, policy.txn.as_ref())?;
        let stored: StoredKey = key.into();
        let writes = ops.iter().any(Operation::is_write);
        let mut image = match visible(&state, policy.txn.as_ref(), &stored) {
            Some(image) => image,
            // A pure read list on a missing record fails; a write list
            // creates the record.
            None if writes => Bins::new(),
            None => return Err(StoreError::KeyNotFound),
        };
        let mut results = Record::default();
        for op in ops {
            apply_op(&mut image, op, &mut results)?;
        }
        if writes {
            install(&mut state, policy.txn.as_ref(), stored, Some(image));
        }
        Ok(results)
    }

    async fn delete(&self, policy: &WritePolicy, key: &RecordKey) -> StoreResult<bool> {
        let mut state = self.state.lock().map_err(|e| StoreError::Io(e.to_string()))?;
        check_txn(&state, policy.txn.as_ref())?;
        let stored: StoredKey = key.into();
        let existed = visible(&state, policy.txn.as_ref(), &stored).is_some();
        install(&mut state, policy.txn.as_ref(), stored, None);
        Ok(existed)
    }

    fn begin(&self, deadline: Duration) -> Txn {
        let id = self.next_txn.fetch_add(1, Ordering::SeqCst);
        let deadline = Instant::now() + deadline;
        if let Ok(mut state) = self.state.lock() {
            state.txns.insert(
                id,
                TxnState {
                    staged: BTreeMap::new(),
                    deadline,
                },
            );
        }
        Txn { id, deadline }
    }

    async fn commit(&self, txn: &Txn) -> StoreResult<()> {
        let mut state = self.state.lock().map_err(|e| StoreError::Io(e.to_string()))?;
        // Commit after commit/abort is a caller bug; the store treats it as
        // a no-op.
        let Some(t) = state.txns.remove(&txn.id) else {
            return Ok(());
        };
        if Instant::now() > t.deadline {
            return Err(StoreError::TxnExpired);
        }
        for (key, image) in t.staged {
            match image {
                Some(bins) => {
                    state.records.insert(key, bins);
                }
                None => {
                    state.records.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn abort(&self, txn: &Txn) -> StoreResult<()> {
        let mut state = self.state.lock().map_err(|e| StoreError::Io(e.to_string()))?;
        state.txns.remove(&txn.id);
        Ok(())
    }
}
