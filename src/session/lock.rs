//! Pending-operation lock
//!
//! A single slot holding the operation currently in flight. Acquisition
//! is check-and-set from `Idle` only; the returned guard writes `Idle`
//! back when dropped, so the slot is released on every exit path of the
//! operation that holds it, including early returns and panics. The
//! inner mutex is never held across an await.

use std::sync::{Arc, Mutex, PoisonError};

use crate::provider::types::PendingOperation;

/// Shared slot for the one operation allowed in flight at a time
#[derive(Clone, Default)]
pub struct OpLock {
    current: Arc<Mutex<PendingOperation>>,
}

impl OpLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Operation currently in flight, `Idle` when none
    pub fn current(&self) -> PendingOperation {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_idle(&self) -> bool {
        self.current().is_idle()
    }

    /// Try to begin `op`, returning `None` when another operation is
    /// already outstanding (or when asked to begin `Idle`)
    pub fn try_begin(&self, op: PendingOperation) -> Option<OpGuard> {
        if op.is_idle() {
            return None;
        }
        let mut slot = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if !slot.is_idle() {
            return None;
        }
        *slot = op;
        Some(OpGuard {
            slot: Arc::clone(&self.current),
            op,
        })
    }
}

/// Holder of an in-flight operation; releases the slot on drop
pub struct OpGuard {
    slot: Arc<Mutex<PendingOperation>>,
    op: PendingOperation,
}

impl OpGuard {
    /// The operation this guard holds
    pub fn operation(&self) -> PendingOperation {
        self.op
    }
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = PendingOperation::Idle;
    }
}
