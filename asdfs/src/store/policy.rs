use std::time::{Duration, Instant};

/// Handle for one multi-record transaction. Created by [`RecordStore::begin`]
/// and attached to the policies of every command that should join the
/// transaction. The store expires the transaction once `deadline` passes.
///
/// [`RecordStore::begin`]: super::RecordStore::begin
#[derive(Debug, Clone)]
pub struct Txn {
    pub id: u64,
    pub deadline: Instant,
}

impl Txn {
    pub fn expired(&self) -> bool {
        Instant::now() > self.deadline
    }
}

/// What `put` does when the record already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordExistsAction {
    #[default]
    Update,
    CreateOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapOrder {
    Unordered,
    KeyOrdered,
}

/// What a map put does when the map key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapWriteMode {
    Update,
    CreateOnly,
}

#[derive(Debug, Clone, Copy)]
pub struct MapPolicy {
    pub order: MapOrder,
    pub write_mode: MapWriteMode,
}

impl MapPolicy {
    pub fn new(order: MapOrder, write_mode: MapWriteMode) -> Self {
        Self { order, write_mode }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReadPolicy {
    pub txn: Option<Txn>,
    pub socket_timeout: Duration,
    pub total_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct WritePolicy {
    pub txn: Option<Txn>,
    pub record_exists_action: RecordExistsAction,
    pub durable_delete: bool,
    pub send_key: bool,
    pub socket_timeout: Duration,
    pub total_timeout: Duration,
}
