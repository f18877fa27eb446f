//! Admit/drain gate guaranteeing no write operation is mid-flight when the
//! daemon exits.
//!
//! Two locks: a short gate mutex held only around admission, and a drain
//! rwlock whose read side is held for the duration of each write operation.
//! Admission takes the gate, acquires the read side, releases the gate.
//! Shutdown takes the gate (stalling new admissions), then the write side,
//! which is granted only once every in-flight operation has released its
//! read guard.
//!
//! Read-only operations do not participate; they leave no partial state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedRwLockReadGuard, RwLock};

use crate::fs::errors::FsError;

pub struct Quiesce {
    gate: Mutex<()>,
    drain: Arc<RwLock<()>>,
    closed: AtomicBool,
}

/// Held for the duration of one admitted write operation.
pub struct OpPermit {
    _guard: OwnedRwLockReadGuard<()>,
}

impl Quiesce {
    pub fn new() -> Self {
        Self {
            gate: Mutex::new(()),
            drain: Arc::new(RwLock::new(())),
            closed: AtomicBool::new(false),
        }
    }

    /// Admit a write operation. Fails once shutdown has commenced.
    pub async fn admit(&self) -> Result<OpPermit, FsError> {
        let gate = self.gate.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(FsError::Fault);
        }
        let guard = Arc::clone(&self.drain).read_owned().await;
        drop(gate);
        Ok(OpPermit { _guard: guard })
    }

    /// Block new admissions, then wait for every admitted operation to
    /// finish. Idempotent.
    pub async fn shutdown(&self) {
        let _gate = self.gate.lock().await;
        self.closed.store(true, Ordering::SeqCst);
        let _drained = self.drain.write().await;
    }
}

impl Default for Quiesce {
    fn default() -> Self {
        Self::new()
    }
}
