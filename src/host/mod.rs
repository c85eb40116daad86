//! Extension host implementations
//!
//! The extension signer reaches the browser extension through an injected
//! host object rather than probing ambient globals. Availability is a
//! property of the host, and a missing signer surfaces as a typed error
//! instead of a crash.
//!
//! Implementations:
//! - SimulatedExtensionHost (in-process, demo and tests)
//! - WsExtensionHost (WebSocket bridge to a companion signer process)

pub mod sim;
pub mod ws;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::provider::types::{Address, Payload, TxId};

pub use sim::{SimBehavior, SimulatedExtensionHost};
pub use ws::WsExtensionHost;

/// Event pushed by the signer outside any request we made
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// Signer opened a session on its own side, e.g. from the extension UI
    Connected(Address),

    /// Signer session ended on the signer's own side
    Disconnected,

    /// Signer switched to a different account
    AccountChanged(Address),
}

/// Seam between the extension signer adapter and the actual extension
#[async_trait]
pub trait ExtensionHost: Send + Sync {
    /// Whether the underlying signer is reachable at all
    fn is_available(&self) -> bool;

    /// Ask the signer to approve a connection; resolves to the account address
    async fn request_connect(&self) -> Result<Address>;

    /// Ask the signer to release its session
    async fn request_disconnect(&self) -> Result<()>;

    /// Whether the signer exposes a session-release capability
    fn supports_disconnect(&self) -> bool;

    /// Forward a payload for signing and submission
    async fn sign_and_send(&self, payload: &Payload) -> Result<TxId>;

    /// Subscribe to signer-pushed events
    fn subscribe_events(&self) -> broadcast::Receiver<HostEvent>;
}
