//! Extension signer adapter
//!
//! Delegates to an injected `ExtensionHost`. The adapter keeps its own
//! connected flag and address; a listener task mirrors signer-pushed events
//! into that local state so `is_connected` always reports the adapter's
//! own truth, including disconnects made from the signer's own UI.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::balance::{BalanceCache, BalanceSource};
use crate::error::{Error, Result};
use crate::host::{ExtensionHost, HostEvent};

use super::types::{AdapterEvent, Address, BalanceSet, Payload, ProviderKind, TxId};
use super::ProviderCapability;

#[derive(Debug, Clone, Default)]
struct LocalState {
    connected: bool,
    address: Option<Address>,
}

/// Adapter for the browser-extension signer
pub struct ExtensionSigner {
    host: Arc<dyn ExtensionHost>,
    source: Arc<dyn BalanceSource>,
    state: Arc<RwLock<LocalState>>,
    cache: BalanceCache,
    events: broadcast::Sender<AdapterEvent>,
}

impl ExtensionSigner {
    /// Create the adapter and start mirroring signer-pushed events
    pub fn new(host: Arc<dyn ExtensionHost>, source: Arc<dyn BalanceSource>) -> Self {
        let (events, _) = broadcast::channel(16);
        let state = Arc::new(RwLock::new(LocalState::default()));

        Self::spawn_event_listener(host.subscribe_events(), Arc::clone(&state), events.clone());

        Self {
            host,
            source,
            state,
            cache: BalanceCache::default(),
            events,
        }
    }

    /// Mirror signer-pushed events into adapter-local state
    fn spawn_event_listener(
        mut host_rx: broadcast::Receiver<HostEvent>,
        state: Arc<RwLock<LocalState>>,
        events: broadcast::Sender<AdapterEvent>,
    ) {
        tokio::spawn(async move {
            loop {
                match host_rx.recv().await {
                    Ok(HostEvent::Connected(address)) => {
                        let adopted = {
                            let mut guard =
                                state.write().unwrap_or_else(PoisonError::into_inner);
                            if guard.connected {
                                false
                            } else {
                                guard.connected = true;
                                guard.address = Some(address.clone());
                                true
                            }
                        };
                        if adopted {
                            info!("Extension signer connected externally as {}", address.short());
                            let _ = events.send(AdapterEvent::Connected(ProviderKind::Extension));
                        }
                    }
                    Ok(HostEvent::Disconnected) => {
                        let was_connected = {
                            let mut guard =
                                state.write().unwrap_or_else(PoisonError::into_inner);
                            let was = guard.connected;
                            guard.connected = false;
                            guard.address = None;
                            was
                        };
                        if was_connected {
                            info!("Extension signer disconnected externally");
                            let _ =
                                events.send(AdapterEvent::Disconnected(ProviderKind::Extension));
                        }
                    }
                    Ok(HostEvent::AccountChanged(address)) => {
                        let changed = {
                            let mut guard =
                                state.write().unwrap_or_else(PoisonError::into_inner);
                            if guard.connected && guard.address.as_ref() != Some(&address) {
                                guard.address = Some(address.clone());
                                true
                            } else {
                                false
                            }
                        };
                        if changed {
                            info!("Extension signer switched account to {}", address.short());
                            let _ =
                                events.send(AdapterEvent::AddressChanged(ProviderKind::Extension));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Extension event listener lagged by {} event(s)", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

#[async_trait]
impl ProviderCapability for ExtensionSigner {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Extension
    }

    async fn connect(&self) -> Result<Address> {
        if !self.host.is_available() {
            return Err(Error::ProviderUnavailable(ProviderKind::Extension));
        }

        let address = self.host.request_connect().await?;

        {
            let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
            guard.connected = true;
            guard.address = Some(address.clone());
        }

        info!("Extension signer connected: {}", address.short());
        Ok(address)
    }

    async fn disconnect(&self) -> Result<()> {
        let was_connected = {
            let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let was = guard.connected;
            guard.connected = false;
            guard.address = None;
            was
        };

        // Ask the host to release its session even when we believe
        // ourselves disconnected. An abandoned connect can leave the
        // signer holding a session the local flag never recorded.
        if self.host.is_available() && self.host.supports_disconnect() {
            match self.host.request_disconnect().await {
                Ok(()) | Err(Error::NotConnected(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if was_connected {
            info!("Extension signer disconnected");
        } else {
            debug!("Extension signer already disconnected");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .connected
    }

    fn current_address(&self) -> Option<Address> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .address
            .clone()
    }

    async fn fetch_balances(&self, address: &Address) -> Result<BalanceSet> {
        Ok(self.cache.fetch_through(self.source.as_ref(), address).await)
    }

    async fn sign_and_send(&self, payload: &Payload) -> Result<TxId> {
        if !self.is_connected() {
            return Err(Error::NotConnected(ProviderKind::Extension));
        }
        self.host.sign_and_send(payload).await
    }

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::StaticBalanceSource;
    use crate::host::{SimBehavior, SimulatedExtensionHost};
    use std::time::Duration;

    fn sim_address() -> Address {
        Address::new("SimExtAddr111111111111111111111111111111111").unwrap()
    }

    fn signer_with_host() -> (ExtensionSigner, Arc<SimulatedExtensionHost>) {
        let host = Arc::new(SimulatedExtensionHost::new(sim_address()));
        let source = Arc::new(StaticBalanceSource::default());
        let signer = ExtensionSigner::new(host.clone(), source);
        (signer, host)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_connect_reports_address() {
        let (signer, _host) = signer_with_host();
        let addr = signer.connect().await.unwrap();
        assert_eq!(addr, sim_address());
        assert!(signer.is_connected());
        assert_eq!(signer.current_address(), Some(sim_address()));
    }

    #[tokio::test]
    async fn test_unavailable_host_is_typed_error() {
        let (signer, host) = signer_with_host();
        host.set_available(false);
        let err = signer.connect().await.unwrap_err();
        assert!(matches!(err, Error::ProviderUnavailable(ProviderKind::Extension)));
        assert!(!signer.is_connected());
    }

    #[tokio::test]
    async fn test_rejection_leaves_adapter_disconnected() {
        let (signer, host) = signer_with_host();
        host.set_connect_behavior(SimBehavior::Reject);
        let err = signer.connect().await.unwrap_err();
        assert!(matches!(err, Error::UserRejected(ProviderKind::Extension)));
        assert!(!signer.is_connected());
        assert_eq!(signer.current_address(), None);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (signer, _host) = signer_with_host();
        signer.connect().await.unwrap();

        signer.disconnect().await.unwrap();
        assert!(!signer.is_connected());

        // Second disconnect of an already-disconnected adapter succeeds
        signer.disconnect().await.unwrap();
        assert!(!signer.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_clears_state_even_when_host_fails() {
        let (signer, host) = signer_with_host();
        signer.connect().await.unwrap();

        host.set_disconnect_behavior(SimBehavior::Reject);
        assert!(signer.disconnect().await.is_err());
        assert!(!signer.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_skips_host_without_release_capability() {
        let (signer, host) = signer_with_host();
        signer.connect().await.unwrap();

        // A hung release request would block forever if it were sent
        host.set_supports_disconnect(false);
        host.set_disconnect_behavior(SimBehavior::Hang);

        signer.disconnect().await.unwrap();
        assert!(!signer.is_connected());
    }

    #[tokio::test]
    async fn test_external_disconnect_updates_local_state() {
        let (signer, host) = signer_with_host();
        signer.connect().await.unwrap();

        let mut rx = signer.subscribe();
        host.simulate_external_disconnect();

        wait_until(|| !signer.is_connected()).await;
        assert_eq!(signer.current_address(), None);
        assert_eq!(
            rx.recv().await.unwrap(),
            AdapterEvent::Disconnected(ProviderKind::Extension)
        );
    }

    #[tokio::test]
    async fn test_sign_requires_connection() {
        let (signer, _host) = signer_with_host();
        let err = signer
            .sign_and_send(&Payload::new(vec![1, 2, 3]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected(ProviderKind::Extension)));

        signer.connect().await.unwrap();
        assert!(signer.sign_and_send(&Payload::new(vec![1, 2, 3])).await.is_ok());
    }

    #[tokio::test]
    async fn test_balance_failure_degrades_to_stale() {
        let host = Arc::new(SimulatedExtensionHost::new(sim_address()));
        let source = Arc::new(StaticBalanceSource::new(BalanceSet {
            native_lamports: 7,
            ..Default::default()
        }));
        let signer = ExtensionSigner::new(host, source.clone());

        let addr = signer.connect().await.unwrap();
        let fresh = signer.fetch_balances(&addr).await.unwrap();
        assert!(!fresh.stale);

        source.set_failing(true);
        let stale = signer.fetch_balances(&addr).await.unwrap();
        assert!(stale.stale);
        assert_eq!(stale.native_lamports, 7);
    }
}
