//! Wallet Session Manager Library
//!
//! Coordinates two mutually exclusive wallet credential providers behind
//! one session authority, with defensive disconnects and background
//! reconciliation.

pub mod balance;
pub mod cli;
pub mod config;
pub mod error;
pub mod host;
pub mod provider;
pub mod reconcile;
pub mod session;
pub mod store;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use provider::types::{ProviderKind, Session};
pub use session::SessionOrchestrator;
