//! Provider adapters
//!
//! Each adapter wraps one credential source behind the same capability
//! interface. Adapters are independently connectable and only ever report
//! their own truth; which one is authoritative is decided by the session
//! orchestrator, never by an adapter.

pub mod extension;
pub mod passkey;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;

pub use extension::ExtensionSigner;
pub use passkey::PasskeySigner;
pub use types::{
    AdapterEvent, Address, BalanceSet, Payload, PendingOperation, ProviderKind, Session,
    SessionError, TokenBalance, TxId,
};

/// Capability interface every adapter satisfies
#[async_trait]
pub trait ProviderCapability: Send + Sync {
    /// Which provider this adapter represents
    fn kind(&self) -> ProviderKind;

    /// Establish a session with the credential source
    async fn connect(&self) -> Result<Address>;

    /// Tear down the adapter's session; idempotent
    async fn disconnect(&self) -> Result<()>;

    /// Whether the adapter currently believes itself connected
    fn is_connected(&self) -> bool;

    /// Address of the adapter's current session, if any
    fn current_address(&self) -> Option<Address>;

    /// Best-effort balance fetch; failures degrade to stale cached values
    async fn fetch_balances(&self, address: &Address) -> Result<BalanceSet>;

    /// Sign and submit a payload through this adapter
    async fn sign_and_send(&self, payload: &Payload) -> Result<TxId>;

    /// Subscribe to externally observed state changes
    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent>;
}

/// Explicitly constructed adapter set handed to the orchestrator
///
/// Adapters are injected rather than discovered, so availability is a
/// typed property instead of ambient global presence.
pub struct AdapterRegistry {
    extension: Arc<dyn ProviderCapability>,
    passkey: Arc<dyn ProviderCapability>,
}

impl AdapterRegistry {
    pub fn new(extension: Arc<dyn ProviderCapability>, passkey: Arc<dyn ProviderCapability>) -> Self {
        Self { extension, passkey }
    }

    /// Adapter for the given provider
    pub fn get(&self, kind: ProviderKind) -> &Arc<dyn ProviderCapability> {
        match kind {
            ProviderKind::Extension => &self.extension,
            ProviderKind::Passkey => &self.passkey,
        }
    }
}
