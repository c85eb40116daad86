//! Session orchestrator
//!
//! Sole writer of the session snapshot. Every state-changing intent is
//! serialized through the pending-operation lock: an intent that arrives
//! while another is in flight is rejected immediately, never queued.
//! Readers observe the session through a watch channel and only ever see
//! complete snapshots.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::provider::types::{
    AdapterEvent, Address, BalanceSet, Payload, PendingOperation, ProviderKind, Session,
    SessionError, TxId,
};
use crate::provider::AdapterRegistry;

use super::lock::OpLock;

/// Single authority over which provider is active
pub struct SessionOrchestrator {
    adapters: AdapterRegistry,
    lock: OpLock,
    session_tx: Arc<watch::Sender<Session>>,
    connect_timeout: Option<Duration>,
    disconnect_timeout: Duration,
}

impl SessionOrchestrator {
    pub fn new(adapters: AdapterRegistry, config: &SessionConfig) -> Self {
        let (session_tx, _) = watch::channel(Session::default());
        let connect_timeout = match config.connect_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Self {
            adapters,
            lock: OpLock::new(),
            session_tx: Arc::new(session_tx),
            connect_timeout,
            disconnect_timeout: Duration::from_millis(config.disconnect_timeout_ms),
        }
    }

    /// Current session snapshot
    pub fn session(&self) -> Session {
        self.session_tx.borrow().clone()
    }

    /// Watch receiver yielding a snapshot on every session change
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.session_tx.subscribe()
    }

    /// Last published balances of the active address
    pub fn balances(&self) -> BalanceSet {
        self.session_tx.borrow().balances.clone()
    }

    /// Operation currently holding the intent lock
    pub fn pending_operation(&self) -> PendingOperation {
        self.lock.current()
    }

    /// Event stream of the given adapter, for reconciliation triggers
    pub fn adapter_events(&self, kind: ProviderKind) -> broadcast::Receiver<AdapterEvent> {
        self.adapters.get(kind).subscribe()
    }

    /// Connect the given provider and make it the active one.
    ///
    /// Returns `Ok(None)` when another operation is in flight; the intent
    /// is rejected, not queued. Every accepted connect first disconnects
    /// both adapters, even when nothing is believed connected.
    pub async fn connect(&self, kind: ProviderKind) -> Result<Option<Address>> {
        let _guard = match self.lock.try_begin(PendingOperation::Connecting(kind)) {
            Some(guard) => guard,
            None => {
                warn!(
                    "connect({}) rejected, {} already in flight",
                    kind,
                    self.lock.current()
                );
                return Ok(None);
            }
        };

        info!("Connecting {}...", kind);
        self.session_tx.send_modify(|s| s.is_connecting = true);

        self.disconnect_all_inner().await;
        self.session_tx.send_modify(|s| {
            s.active = None;
            s.address = None;
            s.balances = BalanceSet::default();
        });

        let adapter = self.adapters.get(kind);
        let attempt = match self.connect_timeout {
            Some(bound) => match timeout(bound, adapter.connect()).await {
                Ok(result) => result,
                Err(_) => Err(Error::ConnectTimeout {
                    kind,
                    seconds: bound.as_secs(),
                }),
            },
            None => adapter.connect().await,
        };

        match attempt {
            Ok(address) => {
                self.session_tx.send_modify(|s| {
                    s.active = Some(kind);
                    s.address = Some(address.clone());
                    s.is_connecting = false;
                    s.last_error = None;
                });
                info!("Session active: {} ({})", kind, address.short());
                self.spawn_balance_refresh(kind, address.clone());
                Ok(Some(address))
            }
            Err(e) => {
                error!("connect({}) failed: {}", kind, e);
                self.session_tx.send_modify(|s| {
                    s.is_connecting = false;
                    s.last_error = Some(SessionError::from_error(&e));
                });
                Err(e)
            }
        }
    }

    /// Disconnect whatever is connected and clear the session.
    ///
    /// A no-op that still returns `Ok` when another operation is in
    /// flight or when no provider is active.
    pub async fn disconnect(&self) -> Result<()> {
        let _guard = match self.lock.try_begin(PendingOperation::DisconnectingAll) {
            Some(guard) => guard,
            None => {
                warn!(
                    "disconnect rejected, {} already in flight",
                    self.lock.current()
                );
                return Ok(());
            }
        };

        let was_active = self.session().is_active();
        if was_active {
            info!("Disconnecting...");
        } else {
            debug!("Disconnect requested with no active provider");
        }

        self.disconnect_all_inner().await;

        if was_active {
            self.session_tx.send_modify(|s| *s = Session::default());
            info!("Session cleared");
        }
        Ok(())
    }

    /// One reconciliation pass aligning the session with adapter reality.
    ///
    /// Skips without touching anything when an operation is in flight.
    /// Adopts a solo-connected adapter, demotes a vanished active one and
    /// resolves dual connections in favor of the active provider, falling
    /// back to the preferred one.
    pub async fn reconcile(&self) -> Result<()> {
        let _guard = match self.lock.try_begin(PendingOperation::DisconnectingAll) {
            Some(guard) => guard,
            None => {
                debug!("Reconcile skipped, {} in flight", self.lock.current());
                return Ok(());
            }
        };

        let snapshot = self.session();
        let ext_connected = self.adapters.get(ProviderKind::Extension).is_connected();
        let pk_connected = self.adapters.get(ProviderKind::Passkey).is_connected();

        if ext_connected && pk_connected {
            let keep = snapshot.active.unwrap_or_else(ProviderKind::preferred);
            let demote = keep.other();
            warn!(
                "Both providers report connected, resolving in favor of {}",
                keep
            );
            self.force_disconnect(demote).await;

            let address = self.adapters.get(keep).current_address();
            let changed = snapshot.active != Some(keep) || snapshot.address != address;
            self.session_tx.send_modify(|s| {
                s.active = Some(keep);
                s.address = address.clone();
                s.is_connecting = false;
            });
            info!("Conflict resolved, {} stays active", keep);
            if changed {
                if let Some(addr) = address {
                    self.spawn_balance_refresh(keep, addr);
                }
            }
        } else if let Some(active) = snapshot.active {
            let adapter = self.adapters.get(active);
            if !adapter.is_connected() {
                warn!(
                    "Active provider {} is no longer connected, demoting session",
                    active
                );
                let fallback = active.other();
                if self.adapters.get(fallback).is_connected() {
                    self.adopt(fallback);
                } else {
                    self.session_tx.send_modify(|s| *s = Session::default());
                }
            } else {
                let address = adapter.current_address();
                if address != snapshot.address {
                    info!("Active provider {} switched address", active);
                    self.session_tx.send_modify(|s| {
                        s.address = address.clone();
                        s.balances = BalanceSet::default();
                    });
                    if let Some(addr) = address {
                        self.spawn_balance_refresh(active, addr);
                    }
                }
            }
        } else if ext_connected {
            self.adopt(ProviderKind::Extension);
        } else if pk_connected {
            self.adopt(ProviderKind::Passkey);
        }

        Ok(())
    }

    /// Re-fetch balances of the active address and publish them
    pub async fn refresh_balances(&self) -> Result<()> {
        let snapshot = self.session();
        let (kind, address) = match (snapshot.active, snapshot.address) {
            (Some(kind), Some(address)) => (kind, address),
            _ => {
                debug!("Balance refresh requested with no active session");
                return Ok(());
            }
        };

        let balances = self.adapters.get(kind).fetch_balances(&address).await?;
        self.session_tx.send_modify(|s| {
            if s.active == Some(kind) && s.address.as_ref() == Some(&address) {
                s.balances = balances;
            }
        });
        Ok(())
    }

    /// Sign and submit a payload through the active provider
    pub async fn sign_and_send(&self, payload: &Payload) -> Result<TxId> {
        let active = self.session().active.ok_or(Error::NoActiveProvider)?;
        let tx = self.adapters.get(active).sign_and_send(payload).await?;
        info!("Submitted through {}: {}", active, tx);
        Ok(tx)
    }

    /// Make an externally connected adapter the active provider
    fn adopt(&self, kind: ProviderKind) {
        let address = self.adapters.get(kind).current_address();
        info!("Adopting externally connected provider {}", kind);
        self.session_tx.send_modify(|s| {
            s.active = Some(kind);
            s.address = address.clone();
            s.balances = BalanceSet::default();
            s.is_connecting = false;
            s.last_error = None;
        });
        if let Some(addr) = address {
            self.spawn_balance_refresh(kind, addr);
        }
    }

    /// Disconnect both adapters concurrently, each bounded by the
    /// disconnect timeout
    async fn disconnect_all_inner(&self) {
        let tasks = ProviderKind::ALL.map(|kind| self.force_disconnect(kind));
        join_all(tasks).await;
    }

    /// Bounded disconnect of one adapter; failures and timeouts are
    /// logged, never surfaced
    async fn force_disconnect(&self, kind: ProviderKind) {
        let adapter = self.adapters.get(kind);
        match timeout(self.disconnect_timeout, adapter.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Disconnect of {} failed: {}", kind, e),
            Err(_) => {
                let e = Error::DisconnectTimeout {
                    kind,
                    millis: self.disconnect_timeout.as_millis() as u64,
                };
                warn!("{}", e);
            }
        }
    }

    /// Fetch balances off the hot path and publish them if the session
    /// still points at the same provider and address
    fn spawn_balance_refresh(&self, kind: ProviderKind, address: Address) {
        let adapter = Arc::clone(self.adapters.get(kind));
        let session_tx = Arc::clone(&self.session_tx);
        tokio::spawn(async move {
            match adapter.fetch_balances(&address).await {
                Ok(balances) => {
                    session_tx.send_modify(|s| {
                        if s.active == Some(kind) && s.address.as_ref() == Some(&address) {
                            s.balances = balances;
                        }
                    });
                }
                Err(e) => warn!("Background balance refresh failed: {}", e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::StaticBalanceSource;
    use crate::error::ErrorCode;
    use crate::host::{SimBehavior, SimulatedExtensionHost};
    use crate::provider::{ExtensionSigner, PasskeySigner, ProviderCapability};
    use crate::store::CredentialStore;
    use std::time::Instant;
    use tempfile::tempdir;
    use tokio_test::assert_ok;

    fn ext_address() -> Address {
        Address::new("SimExtAddr111111111111111111111111111111111").unwrap()
    }

    struct Fixture {
        orchestrator: Arc<SessionOrchestrator>,
        extension: Arc<ExtensionSigner>,
        passkey: Arc<PasskeySigner>,
        host: Arc<SimulatedExtensionHost>,
        balances: Arc<StaticBalanceSource>,
        _dir: tempfile::TempDir,
    }

    fn fixture_with(config: SessionConfig) -> Fixture {
        let dir = tempdir().unwrap();
        let host = Arc::new(SimulatedExtensionHost::new(ext_address()));
        let balances = Arc::new(StaticBalanceSource::default());

        let extension = Arc::new(ExtensionSigner::new(host.clone(), balances.clone()));
        let store = CredentialStore::load(&dir.path().join("credentials.json"));
        let passkey = Arc::new(PasskeySigner::new(
            store,
            "fixture|device".to_string(),
            balances.clone(),
        ));

        let registry = AdapterRegistry::new(extension.clone(), passkey.clone());
        Fixture {
            orchestrator: Arc::new(SessionOrchestrator::new(registry, &config)),
            extension,
            passkey,
            host,
            balances,
            _dir: dir,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(SessionConfig {
            connect_timeout_secs: 5,
            disconnect_timeout_ms: 200,
            ..Default::default()
        })
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
    async fn test_connect_extension_activates_session() {
        let f = fixture();

        let address = f
            .orchestrator
            .connect(ProviderKind::Extension)
            .await
            .unwrap();
        assert_eq!(address, Some(ext_address()));

        let session = f.orchestrator.session();
        assert_eq!(session.active, Some(ProviderKind::Extension));
        assert_eq!(session.address, Some(ext_address()));
        assert!(!session.is_connecting);
        assert!(session.last_error.is_none());
        assert!(f.orchestrator.pending_operation().is_idle());
    }

    #[tokio::test]
    async fn test_connect_passkey_activates_session() {
        let f = fixture();

        let address = f.orchestrator.connect(ProviderKind::Passkey).await.unwrap();
        assert!(address.is_some());

        let session = f.orchestrator.session();
        assert_eq!(session.active, Some(ProviderKind::Passkey));
        assert_eq!(session.address, address);
    }

    #[tokio::test]
    async fn test_intent_during_connect_is_rejected() {
        let f = fixture();
        f.host.set_latency(Duration::from_millis(200));

        let first = {
            let orchestrator = f.orchestrator.clone();
            tokio::spawn(async move { orchestrator.connect(ProviderKind::Extension).await })
        };
        wait_until(|| !f.orchestrator.pending_operation().is_idle()).await;

        // Second intent is rejected, not queued
        let second = f.orchestrator.connect(ProviderKind::Passkey).await.unwrap();
        assert_eq!(second, None);

        let first = first.await.unwrap().unwrap();
        assert_eq!(first, Some(ext_address()));
        assert_eq!(
            f.orchestrator.session().active,
            Some(ProviderKind::Extension)
        );
        assert!(!f.passkey.is_connected());
    }

    #[tokio::test]
    async fn test_rejection_surfaces_on_session() {
        let f = fixture();
        f.host.set_connect_behavior(SimBehavior::Reject);

        let err = f
            .orchestrator
            .connect(ProviderKind::Extension)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UserRejected(ProviderKind::Extension)));

        let session = f.orchestrator.session();
        assert_eq!(session.active, None);
        assert!(!session.is_connecting);
        assert_eq!(
            session.last_error.as_ref().map(|e| e.code),
            Some(ErrorCode::UserRejected)
        );
        // Lock released on the failure path too
        assert!(f.orchestrator.pending_operation().is_idle());
    }

    #[tokio::test]
    async fn test_unavailable_provider_is_typed() {
        let f = fixture();
        f.host.set_available(false);

        let err = f
            .orchestrator
            .connect(ProviderKind::Extension)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ProviderUnavailable(ProviderKind::Extension)
        ));
        assert_eq!(
            f.orchestrator.session().last_error.map(|e| e.code),
            Some(ErrorCode::ProviderUnavailable)
        );
    }

    #[tokio::test]
    async fn test_connect_timeout_bounds_hung_signer() {
        let f = fixture_with(SessionConfig {
            connect_timeout_secs: 1,
            disconnect_timeout_ms: 100,
            ..Default::default()
        });
        f.host.set_connect_behavior(SimBehavior::Hang);

        let err = f
            .orchestrator
            .connect(ProviderKind::Extension)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ConnectTimeout {
                kind: ProviderKind::Extension,
                ..
            }
        ));

        let session = f.orchestrator.session();
        assert!(!session.is_connecting);
        assert_eq!(
            session.last_error.map(|e| e.code),
            Some(ErrorCode::Timeout)
        );
        assert!(f.orchestrator.pending_operation().is_idle());
    }

    #[tokio::test]
    async fn test_switch_replaces_previous_provider() {
        let f = fixture();

        f.orchestrator
            .connect(ProviderKind::Extension)
            .await
            .unwrap();
        assert!(f.extension.is_connected());

        f.orchestrator.connect(ProviderKind::Passkey).await.unwrap();

        // The connect sequence released the extension before activating
        // the passkey
        assert!(!f.extension.is_connected());
        assert!(f.passkey.is_connected());
        assert_eq!(f.orchestrator.session().active, Some(ProviderKind::Passkey));
    }

    #[tokio::test]
    async fn test_disconnect_clears_session() {
        let f = fixture();
        f.orchestrator
            .connect(ProviderKind::Extension)
            .await
            .unwrap();

        f.orchestrator.disconnect().await.unwrap();

        assert_eq!(f.orchestrator.session(), Session::default());
        assert!(!f.extension.is_connected());
        assert!(f.orchestrator.pending_operation().is_idle());
    }

    #[tokio::test]
    async fn test_disconnect_without_session_is_noop() {
        let f = fixture();
        let before = f.orchestrator.session();

        tokio_test::assert_ok!(f.orchestrator.disconnect().await);
        tokio_test::assert_ok!(f.orchestrator.disconnect().await);

        assert_eq!(f.orchestrator.session(), before);
    }

    #[tokio::test]
    async fn test_disconnect_is_bounded_by_timeout() {
        let f = fixture_with(SessionConfig {
            connect_timeout_secs: 5,
            disconnect_timeout_ms: 100,
            ..Default::default()
        });
        f.orchestrator
            .connect(ProviderKind::Extension)
            .await
            .unwrap();
        f.host.set_disconnect_behavior(SimBehavior::Hang);

        let started = Instant::now();
        f.orchestrator.disconnect().await.unwrap();

        // Adapters are disconnected concurrently, so the whole pass stays
        // under twice the per-adapter bound
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(f.orchestrator.session(), Session::default());
    }

    #[tokio::test]
    async fn test_reconcile_adopts_solo_connected_adapter() {
        let f = fixture();

        // Adapter connected outside any orchestrated call
        f.extension.connect().await.unwrap();
        assert_eq!(f.orchestrator.session().active, None);

        f.orchestrator.reconcile().await.unwrap();

        let session = f.orchestrator.session();
        assert_eq!(session.active, Some(ProviderKind::Extension));
        assert_eq!(session.address, Some(ext_address()));
    }

    #[tokio::test]
    async fn test_reconcile_demotes_vanished_provider() {
        let f = fixture();
        f.orchestrator
            .connect(ProviderKind::Extension)
            .await
            .unwrap();

        f.host.simulate_external_disconnect();
        wait_until(|| !f.extension.is_connected()).await;

        f.orchestrator.reconcile().await.unwrap();
        assert_eq!(f.orchestrator.session(), Session::default());
    }

    #[tokio::test]
    async fn test_reconcile_keeps_active_on_dual_connect() {
        let f = fixture();
        f.orchestrator.connect(ProviderKind::Passkey).await.unwrap();

        // Extension comes up behind the orchestrator's back
        f.extension.connect().await.unwrap();
        assert!(f.extension.is_connected() && f.passkey.is_connected());

        f.orchestrator.reconcile().await.unwrap();

        assert_eq!(f.orchestrator.session().active, Some(ProviderKind::Passkey));
        assert!(!f.extension.is_connected());
        assert!(f.passkey.is_connected());
    }

    #[tokio::test]
    async fn test_reconcile_prefers_extension_without_active() {
        let f = fixture();
        f.extension.connect().await.unwrap();
        f.passkey.connect().await.unwrap();

        f.orchestrator.reconcile().await.unwrap();

        let session = f.orchestrator.session();
        assert_eq!(session.active, Some(ProviderKind::Extension));
        assert!(!f.passkey.is_connected());
    }

    #[tokio::test]
    async fn test_reconcile_skips_while_operation_in_flight() {
        let f = fixture();
        f.extension.connect().await.unwrap();

        let _guard = f
            .orchestrator
            .lock
            .try_begin(PendingOperation::Connecting(ProviderKind::Passkey))
            .unwrap();

        f.orchestrator.reconcile().await.unwrap();

        // Nothing adopted while the lock is held
        assert_eq!(f.orchestrator.session().active, None);
    }

    #[tokio::test]
    async fn test_reconcile_follows_account_switch() {
        let f = fixture();
        f.orchestrator
            .connect(ProviderKind::Extension)
            .await
            .unwrap();

        let switched = Address::new("SimExtAddr222222222222222222222222222222222").unwrap();
        f.host.simulate_account_change(switched.clone());
        wait_until(|| f.extension.current_address() == Some(switched.clone())).await;

        f.orchestrator.reconcile().await.unwrap();
        assert_eq!(f.orchestrator.session().address, Some(switched));
    }

    #[tokio::test]
    async fn test_balances_published_after_connect() {
        let f = fixture();
        f.balances.set_balances(BalanceSet {
            native_lamports: 5_000_000_000,
            ..Default::default()
        });

        f.orchestrator
            .connect(ProviderKind::Extension)
            .await
            .unwrap();

        wait_until(|| f.orchestrator.balances().native_lamports == 5_000_000_000).await;
        assert!(!f.orchestrator.balances().stale);
    }

    #[tokio::test]
    async fn test_balance_failure_keeps_last_values() {
        let f = fixture();
        f.balances.set_balances(BalanceSet {
            native_lamports: 7_000_000_000,
            ..Default::default()
        });
        f.orchestrator
            .connect(ProviderKind::Extension)
            .await
            .unwrap();
        wait_until(|| f.orchestrator.balances().native_lamports == 7_000_000_000).await;

        f.balances.set_failing(true);
        f.orchestrator.refresh_balances().await.unwrap();

        let balances = f.orchestrator.balances();
        assert_eq!(balances.native_lamports, 7_000_000_000);
        assert!(balances.stale);
        assert!(f.orchestrator.session().last_error.is_none());
    }

    #[tokio::test]
    async fn test_sign_routes_to_active_provider() {
        let f = fixture();

        let err = f
            .orchestrator
            .sign_and_send(&Payload::new(vec![1]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoActiveProvider));

        f.orchestrator.connect(ProviderKind::Passkey).await.unwrap();
        let tx = f
            .orchestrator
            .sign_and_send(&Payload::new(vec![1]))
            .await
            .unwrap();
        assert!(!tx.as_str().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_observes_transitions() {
        let f = fixture();
        let mut rx = f.orchestrator.subscribe();

        f.orchestrator
            .connect(ProviderKind::Extension)
            .await
            .unwrap();

        rx.changed().await.unwrap();
        let session = rx.borrow_and_update().clone();
        assert!(session.is_active() || session.is_connecting);
    }
}
