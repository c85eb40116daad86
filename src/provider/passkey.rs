//! Passkey signer adapter
//!
//! Locally derived credential standing in for a WebAuthn authenticator.
//! First connect generates a credential and derives an address from a
//! stable device fingerprint plus the stored credential material; later
//! connects reuse the persisted record. The persisted candidate address is
//! read at construction but never auto-activates a session.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::balance::{BalanceCache, BalanceSource};
use crate::error::{Error, Result};
use crate::store::{CredentialStore, StoredCredential};

use super::types::{AdapterEvent, Address, BalanceSet, Payload, ProviderKind, TxId};
use super::ProviderCapability;

/// Fixed store key for the primary passkey credential
const CREDENTIAL_KEY: &str = "passkey.primary";

#[derive(Debug, Clone, Default)]
struct LocalState {
    connected: bool,
    address: Option<Address>,
}

/// Adapter for the passkey-style signer
pub struct PasskeySigner {
    store: Mutex<CredentialStore>,
    fingerprint: String,
    state: RwLock<LocalState>,
    candidate: Option<Address>,
    source: Arc<dyn BalanceSource>,
    cache: BalanceCache,
    events: broadcast::Sender<AdapterEvent>,
}

impl PasskeySigner {
    pub fn new(store: CredentialStore, fingerprint: String, source: Arc<dyn BalanceSource>) -> Self {
        let candidate = store
            .get(CREDENTIAL_KEY)
            .and_then(|rec| Address::new(rec.derived_address.clone()).ok());

        if let Some(addr) = &candidate {
            debug!("Pre-populated passkey candidate: {}", addr.short());
        }

        let (events, _) = broadcast::channel(16);

        Self {
            store: Mutex::new(store),
            fingerprint,
            state: RwLock::new(LocalState::default()),
            candidate,
            source,
            cache: BalanceCache::default(),
            events,
        }
    }

    /// Persisted candidate address, if a credential exists
    ///
    /// Informational only; the candidate never activates a session by
    /// itself.
    pub fn candidate_address(&self) -> Option<Address> {
        self.candidate.clone()
    }

    /// Reuse the persisted credential or generate a new one
    fn resolve_credential(&self) -> Result<Address> {
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(record) = store.get(CREDENTIAL_KEY) {
            match Address::new(record.derived_address.clone()) {
                Ok(address) => {
                    debug!("Reusing persisted passkey credential");
                    return Ok(address);
                }
                Err(_) => {
                    warn!("Persisted passkey address is invalid, regenerating credential");
                }
            }
        }

        let credential_id = uuid::Uuid::new_v4().to_string();
        let salt_bytes: [u8; 16] = rand::thread_rng().gen();
        let salt = bs58::encode(salt_bytes).into_string();
        let address = derive_address(&self.fingerprint, &credential_id, &salt)?;

        store.put(
            CREDENTIAL_KEY,
            StoredCredential {
                credential_id,
                salt,
                derived_address: address.to_string(),
                created_at: Utc::now(),
            },
        )?;

        info!("Generated passkey credential: {}", address.short());
        Ok(address)
    }
}

/// Derive a deterministic address from the fingerprint and credential material
///
/// Development stand-in for a WebAuthn-derived key. The fingerprint has
/// weak entropy and the result must not be treated as unguessable.
fn derive_address(fingerprint: &str, credential_id: &str, salt: &str) -> Result<Address> {
    let mut hasher = Sha256::new();
    hasher.update(fingerprint.as_bytes());
    hasher.update(b"|");
    hasher.update(credential_id.as_bytes());
    hasher.update(b"|");
    hasher.update(salt.as_bytes());
    let digest = hasher.finalize();
    Address::new(bs58::encode(digest).into_string())
}

/// Stable per-device fingerprint used in address derivation
pub fn device_fingerprint(override_value: &str) -> String {
    if !override_value.is_empty() {
        return override_value.to_string();
    }

    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());

    format!(
        "{}|{}|{}",
        std::env::consts::OS,
        std::env::consts::ARCH,
        user
    )
}

#[async_trait]
impl ProviderCapability for PasskeySigner {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Passkey
    }

    async fn connect(&self) -> Result<Address> {
        let address = self.resolve_credential()?;

        {
            let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
            guard.connected = true;
            guard.address = Some(address.clone());
        }

        info!("Passkey signer connected: {}", address.short());
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

        if was_connected {
            info!("Passkey signer disconnected");
        } else {
            debug!("Passkey signer already disconnected");
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
        let address = self
            .current_address()
            .ok_or(Error::NotConnected(ProviderKind::Passkey))?;

        // Pseudo-signature stand-in; real signing is out of scope here
        let mut hasher = Sha256::new();
        hasher.update(payload.as_bytes());
        hasher.update(address.as_str().as_bytes());
        hasher.update(
            Utc::now()
                .timestamp_nanos_opt()
                .unwrap_or_default()
                .to_le_bytes(),
        );
        let tx_id = TxId::new(bs58::encode(hasher.finalize()).into_string());

        debug!("Passkey signer produced tx {}", tx_id);
        Ok(tx_id)
    }

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::StaticBalanceSource;
    use tempfile::tempdir;

    fn signer_at(path: &std::path::Path) -> PasskeySigner {
        PasskeySigner::new(
            CredentialStore::load(path),
            "test-device".to_string(),
            Arc::new(StaticBalanceSource::default()),
        )
    }

    #[tokio::test]
    async fn test_first_connect_generates_and_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let signer = signer_at(&path);
        assert!(signer.candidate_address().is_none());

        let addr = signer.connect().await.unwrap();
        assert!(signer.is_connected());
        assert!(path.exists());

        // A fresh adapter over the same store reuses the derived address
        let signer2 = signer_at(&path);
        assert_eq!(signer2.candidate_address(), Some(addr.clone()));
        assert_eq!(signer2.connect().await.unwrap(), addr);
    }

    #[tokio::test]
    async fn test_candidate_does_not_auto_activate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let signer = signer_at(&path);
        signer.connect().await.unwrap();
        drop(signer);

        let signer = signer_at(&path);
        assert!(signer.candidate_address().is_some());
        assert!(!signer.is_connected());
        assert_eq!(signer.current_address(), None);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let dir = tempdir().unwrap();
        let signer = signer_at(&dir.path().join("credentials.json"));

        signer.connect().await.unwrap();
        signer.disconnect().await.unwrap();
        signer.disconnect().await.unwrap();
        assert!(!signer.is_connected());
    }

    #[tokio::test]
    async fn test_sign_requires_connection() {
        let dir = tempdir().unwrap();
        let signer = signer_at(&dir.path().join("credentials.json"));

        let err = signer
            .sign_and_send(&Payload::new(vec![9]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected(ProviderKind::Passkey)));
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let a = derive_address("dev", "cred", "salt").unwrap();
        let b = derive_address("dev", "cred", "salt").unwrap();
        let c = derive_address("dev", "cred", "other").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_fingerprint_override() {
        assert_eq!(device_fingerprint("pinned"), "pinned");
        assert!(!device_fingerprint("").is_empty());
    }
}
