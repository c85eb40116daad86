//! Simulated extension host
//!
//! In-process stand-in for the browser extension, used by the demo command
//! and tests. Availability, user decisions, latency, and externally
//! triggered disconnects are all scriptable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::provider::types::{Address, Payload, ProviderKind, TxId};

use super::{ExtensionHost, HostEvent};

/// What the simulated user does when prompted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimBehavior {
    /// Approve the request
    Approve,

    /// Decline the request
    Reject,

    /// Never answer
    Hang,
}

/// Scriptable in-process extension host
pub struct SimulatedExtensionHost {
    /// Whether the signer appears installed
    available: AtomicBool,

    /// Whether the signer advertises a session-release capability
    supports_disconnect: AtomicBool,

    /// Decision applied to connect and sign prompts
    connect_behavior: RwLock<SimBehavior>,

    /// Decision applied to disconnect requests
    disconnect_behavior: RwLock<SimBehavior>,

    /// Artificial delay before every answer
    latency: RwLock<Duration>,

    /// Account the signer resolves to
    address: RwLock<Address>,

    events: broadcast::Sender<HostEvent>,
}

impl SimulatedExtensionHost {
    pub fn new(address: Address) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            available: AtomicBool::new(true),
            supports_disconnect: AtomicBool::new(true),
            connect_behavior: RwLock::new(SimBehavior::Approve),
            disconnect_behavior: RwLock::new(SimBehavior::Approve),
            latency: RwLock::new(Duration::ZERO),
            address: RwLock::new(address),
            events,
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_connect_behavior(&self, behavior: SimBehavior) {
        *self
            .connect_behavior
            .write()
            .unwrap_or_else(PoisonError::into_inner) = behavior;
    }

    pub fn set_disconnect_behavior(&self, behavior: SimBehavior) {
        *self
            .disconnect_behavior
            .write()
            .unwrap_or_else(PoisonError::into_inner) = behavior;
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    pub fn set_supports_disconnect(&self, supported: bool) {
        self.supports_disconnect.store(supported, Ordering::SeqCst);
    }

    /// Inject a connect as if the user opened a session from the
    /// extension's own popup
    pub fn simulate_external_connect(&self) {
        let address = self.current_address();
        info!("Simulated signer connected externally as {}", address.short());
        let _ = self.events.send(HostEvent::Connected(address));
    }

    /// Inject a disconnect as if the user closed the session in the
    /// extension's own popup
    pub fn simulate_external_disconnect(&self) {
        info!("Simulated signer disconnected externally");
        let _ = self.events.send(HostEvent::Disconnected);
    }

    /// Inject an account switch on the signer side
    pub fn simulate_account_change(&self, address: Address) {
        info!("Simulated signer switched account to {}", address.short());
        *self.address.write().unwrap_or_else(PoisonError::into_inner) = address.clone();
        let _ = self.events.send(HostEvent::AccountChanged(address));
    }

    fn current_address(&self) -> Address {
        self.address
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn behavior_of(&self, lock: &RwLock<SimBehavior>) -> SimBehavior {
        *lock.read().unwrap_or_else(PoisonError::into_inner)
    }

    async fn pause(&self) {
        let latency = *self.latency.read().unwrap_or_else(PoisonError::into_inner);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ExtensionHost for SimulatedExtensionHost {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn request_connect(&self) -> Result<Address> {
        self.pause().await;
        match self.behavior_of(&self.connect_behavior) {
            SimBehavior::Approve => {
                debug!("Simulated signer approved connect");
                Ok(self.current_address())
            }
            SimBehavior::Reject => Err(Error::UserRejected(ProviderKind::Extension)),
            SimBehavior::Hang => std::future::pending().await,
        }
    }

    async fn request_disconnect(&self) -> Result<()> {
        self.pause().await;
        match self.behavior_of(&self.disconnect_behavior) {
            SimBehavior::Approve => {
                debug!("Simulated signer released session");
                Ok(())
            }
            SimBehavior::Reject => Err(Error::HostRequest(
                "signer refused to release session".to_string(),
            )),
            SimBehavior::Hang => std::future::pending().await,
        }
    }

    fn supports_disconnect(&self) -> bool {
        self.supports_disconnect.load(Ordering::SeqCst)
    }

    async fn sign_and_send(&self, payload: &Payload) -> Result<TxId> {
        self.pause().await;
        match self.behavior_of(&self.connect_behavior) {
            SimBehavior::Approve => {
                debug!("Simulated signer signed {} byte payload", payload.len());
                Ok(TxId::new(uuid::Uuid::new_v4().simple().to_string()))
            }
            SimBehavior::Reject => Err(Error::UserRejected(ProviderKind::Extension)),
            SimBehavior::Hang => std::future::pending().await,
        }
    }

    fn subscribe_events(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_address() -> Address {
        Address::new("SimExtAddr111111111111111111111111111111111").unwrap()
    }

    #[tokio::test]
    async fn test_approve_returns_address() {
        let host = SimulatedExtensionHost::new(test_address());
        let addr = host.request_connect().await.unwrap();
        assert_eq!(addr, test_address());
    }

    #[tokio::test]
    async fn test_reject_surfaces_user_rejection() {
        let host = SimulatedExtensionHost::new(test_address());
        host.set_connect_behavior(SimBehavior::Reject);
        let err = host.request_connect().await.unwrap_err();
        assert!(matches!(err, Error::UserRejected(ProviderKind::Extension)));
    }

    #[tokio::test]
    async fn test_availability_toggle() {
        let host = SimulatedExtensionHost::new(test_address());
        assert!(host.is_available());
        host.set_available(false);
        assert!(!host.is_available());
    }

    #[tokio::test]
    async fn test_external_disconnect_event() {
        let host = SimulatedExtensionHost::new(test_address());
        let mut rx = host.subscribe_events();
        host.simulate_external_disconnect();
        assert_eq!(rx.recv().await.unwrap(), HostEvent::Disconnected);
    }

    #[tokio::test]
    async fn test_account_change_updates_address() {
        let host = SimulatedExtensionHost::new(test_address());
        let next = Address::new("SimExtAddr222222222222222222222222222222222").unwrap();
        host.simulate_account_change(next.clone());
        assert_eq!(host.request_connect().await.unwrap(), next);
    }
}
