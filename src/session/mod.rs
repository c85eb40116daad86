//! Session coordination
//!
//! The orchestrator is the only writer of session state; the lock keeps
//! at most one state-changing operation in flight and rejects the rest.

pub mod lock;
pub mod orchestrator;

pub use lock::{OpGuard, OpLock};
pub use orchestrator::SessionOrchestrator;
