//! WebSocket extension host bridge
//!
//! Talks a small JSON request/response protocol to a companion signer
//! process. Requests carry a uuid and are answered with a matching id;
//! pushes (no id) report signer-side events such as an external disconnect
//! or an account switch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::HostConfig;
use crate::error::{Error, Result};
use crate::provider::types::{Address, Payload, ProviderKind, TxId};

use super::{ExtensionHost, HostEvent};

/// Request sent to the signer process
#[derive(Debug, Clone, Serialize)]
struct SignerRequest {
    id: String,
    method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<serde_json::Value>,
}

/// Reply to one of our requests
#[derive(Debug, Clone, Deserialize)]
struct SignerReply {
    id: String,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<WireError>,
}

/// Error payload inside a reply
#[derive(Debug, Clone, Deserialize)]
struct WireError {
    code: String,
    #[serde(default)]
    message: Option<String>,
}

/// Event pushed by the signer without a preceding request
#[derive(Debug, Clone, Deserialize)]
struct SignerPush {
    event: String,
    #[serde(default)]
    address: Option<String>,
}

type PendingMap = DashMap<String, oneshot::Sender<Result<serde_json::Value>>>;

/// Extension host backed by a WebSocket signer bridge
pub struct WsExtensionHost {
    config: HostConfig,
    out_tx: mpsc::Sender<String>,
    out_rx: Mutex<Option<mpsc::Receiver<String>>>,
    pending: Arc<PendingMap>,
    connected: Arc<AtomicBool>,
    events: broadcast::Sender<HostEvent>,
    shutdown: broadcast::Sender<()>,
}

impl WsExtensionHost {
    /// Create a new bridge; call `start` to open the connection
    pub fn new(config: HostConfig) -> Self {
        let (out_tx, out_rx) = mpsc::channel(64);
        let (events, _) = broadcast::channel(16);
        let (shutdown, _) = broadcast::channel(1);

        Self {
            config,
            out_tx,
            out_rx: Mutex::new(Some(out_rx)),
            pending: Arc::new(DashMap::new()),
            connected: Arc::new(AtomicBool::new(false)),
            events,
            shutdown,
        }
    }

    /// Start the connection task with automatic reconnects
    pub async fn start(&self) -> Result<()> {
        info!("Starting signer bridge...");
        info!("URL: {}", self.config.ws_url);

        let out_rx = self
            .out_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let mut out_rx =
            out_rx.ok_or_else(|| Error::Internal("signer bridge already started".to_string()))?;

        let config = self.config.clone();
        let pending = Arc::clone(&self.pending);
        let connected = Arc::clone(&self.connected);
        let events = self.events.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut reconnect_attempts = 0u32;

            loop {
                if shutdown_rx.try_recv().is_ok() {
                    info!("Signer bridge shutting down");
                    break;
                }

                match Self::connect_and_stream(
                    &config,
                    &mut out_rx,
                    &pending,
                    &connected,
                    &events,
                    &mut shutdown_rx,
                )
                .await
                {
                    Ok(true) => {
                        info!("Signer bridge shutting down");
                        break;
                    }
                    Ok(false) => {
                        // Clean disconnect
                        reconnect_attempts = 0;
                    }
                    Err(e) => {
                        error!("Signer bridge error: {}", e);
                        reconnect_attempts += 1;

                        if config.max_reconnect_attempts > 0
                            && reconnect_attempts >= config.max_reconnect_attempts
                        {
                            error!(
                                "Max reconnect attempts ({}) reached",
                                config.max_reconnect_attempts
                            );
                            break;
                        }
                    }
                }

                connected.store(false, Ordering::SeqCst);
                fail_pending(&pending);

                let delay = Duration::from_millis(config.reconnect_delay_ms);
                warn!("Reconnecting signer bridge in {:?}...", delay);
                sleep(delay).await;
            }

            connected.store(false, Ordering::SeqCst);
            fail_pending(&pending);
        });

        Ok(())
    }

    /// Stop the connection task
    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }

    /// Connect once and pump messages until the connection drops
    ///
    /// Returns Ok(true) when shutdown was requested.
    async fn connect_and_stream(
        config: &HostConfig,
        out_rx: &mut mpsc::Receiver<String>,
        pending: &PendingMap,
        connected: &AtomicBool,
        events: &broadcast::Sender<HostEvent>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<bool> {
        info!("Connecting to signer bridge...");

        let url = url::Url::parse(&config.ws_url)
            .map_err(|e| Error::Config(format!("Invalid signer ws_url: {}", e)))?;

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::HostConnection(format!("WebSocket connect failed: {}", e)))?;

        info!("Connected to signer bridge");
        connected.store(true, Ordering::SeqCst);

        let (mut write, mut read) = ws_stream.split();

        let ping_interval = Duration::from_secs(config.ping_interval_secs);
        let mut ping_timer = tokio::time::interval(ping_interval);

        loop {
            tokio::select! {
                // Ping to keep connection alive
                _ = ping_timer.tick() => {
                    if let Err(e) = write.send(Message::Ping(vec![])).await {
                        error!("Failed to send ping: {}", e);
                        break;
                    }
                    debug!("Sent ping");
                }

                // Forward outbound requests
                outbound = out_rx.recv() => {
                    match outbound {
                        Some(json) => {
                            if let Err(e) = write.send(Message::Text(json)).await {
                                error!("Failed to send request: {}", e);
                                break;
                            }
                        }
                        None => break,
                    }
                }

                // Receive messages
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            Self::handle_message(&text, pending, events);
                        }
                        Some(Ok(Message::Pong(_))) => {
                            debug!("Received pong");
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("Signer bridge closed by server");
                            break;
                        }
                        Some(Err(e)) => {
                            error!("Signer bridge error: {}", e);
                            break;
                        }
                        None => {
                            info!("Signer bridge stream ended");
                            break;
                        }
                        _ => {}
                    }
                }

                // Shutdown requested
                _ = shutdown_rx.recv() => {
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }

    /// Handle one incoming text frame
    fn handle_message(text: &str, pending: &PendingMap, events: &broadcast::Sender<HostEvent>) {
        // Try parsing as a reply to one of our requests
        if let Ok(reply) = serde_json::from_str::<SignerReply>(text) {
            match pending.remove(&reply.id) {
                Some((_, tx)) => {
                    let outcome = match reply.error {
                        Some(wire) => Err(map_wire_error(wire)),
                        None => Ok(reply.result.unwrap_or(serde_json::Value::Null)),
                    };
                    let _ = tx.send(outcome);
                }
                None => debug!("Reply for unknown request: {}", reply.id),
            }
            return;
        }

        // Try parsing as a signer push
        if let Ok(push) = serde_json::from_str::<SignerPush>(text) {
            match push.event.as_str() {
                "connected" => match push.address.map(Address::new) {
                    Some(Ok(address)) => {
                        info!("Signer reported an external connect as {}", address.short());
                        let _ = events.send(HostEvent::Connected(address));
                    }
                    _ => warn!("connected push without a valid address"),
                },
                "disconnected" => {
                    info!("Signer reported an external disconnect");
                    let _ = events.send(HostEvent::Disconnected);
                }
                "account_changed" => match push.address.map(Address::new) {
                    Some(Ok(address)) => {
                        info!("Signer switched account to {}", address.short());
                        let _ = events.send(HostEvent::AccountChanged(address));
                    }
                    _ => warn!("account_changed push without a valid address"),
                },
                other => debug!("Unknown signer push: {}", other),
            }
            return;
        }

        debug!("Unknown signer message: {}", text);
    }

    /// Send one request and wait for its correlated reply
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::HostConnection(
                "signer bridge is not connected".to_string(),
            ));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        let request = SignerRequest {
            id: id.clone(),
            method: method.to_string(),
            params,
        };
        let json = serde_json::to_string(&request)?;

        if self.out_tx.send(json).await.is_err() {
            self.pending.remove(&id);
            return Err(Error::HostConnection(
                "signer bridge task stopped".to_string(),
            ));
        }

        let timeout = Duration::from_secs(self.config.request_timeout_secs);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::HostConnection(
                "connection lost while awaiting reply".to_string(),
            )),
            Err(_) => {
                self.pending.remove(&id);
                Err(Error::HostRequest(format!("{} request timed out", method)))
            }
        }
    }
}

#[async_trait]
impl ExtensionHost for WsExtensionHost {
    fn is_available(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn request_connect(&self) -> Result<Address> {
        let result = self.request("connect", None).await?;
        let address = result
            .get("address")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::HostRequest("connect reply missing address".to_string()))?;
        Address::new(address)
    }

    async fn request_disconnect(&self) -> Result<()> {
        self.request("disconnect", None).await?;
        Ok(())
    }

    fn supports_disconnect(&self) -> bool {
        true
    }

    async fn sign_and_send(&self, payload: &Payload) -> Result<TxId> {
        let params = serde_json::json!({
            "payload": BASE64.encode(payload.as_bytes()),
        });
        let result = self.request("sign_and_send", Some(params)).await?;
        let tx_id = result
            .get("tx_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::HostRequest("sign reply missing tx_id".to_string()))?;
        Ok(TxId::new(tx_id))
    }

    fn subscribe_events(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }
}

/// Map a signer-side error code to our taxonomy
fn map_wire_error(wire: WireError) -> Error {
    let message = wire.message.unwrap_or_else(|| wire.code.clone());
    match wire.code.as_str() {
        "user_rejected" => Error::UserRejected(ProviderKind::Extension),
        "unavailable" => Error::ProviderUnavailable(ProviderKind::Extension),
        "not_connected" => Error::NotConnected(ProviderKind::Extension),
        _ => Error::HostRequest(message),
    }
}

/// Fail every in-flight request after a connection loss
fn fail_pending(pending: &PendingMap) {
    let ids: Vec<String> = pending.iter().map(|entry| entry.key().clone()).collect();
    for id in ids {
        if let Some((_, tx)) = pending.remove(&id) {
            let _ = tx.send(Err(Error::HostConnection(
                "signer bridge connection lost".to_string(),
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let request = SignerRequest {
            id: "abc".to_string(),
            method: "connect".to_string(),
            params: None,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"id":"abc","method":"connect"}"#);
    }

    #[test]
    fn test_reply_parsing() {
        let json = r#"{"id":"abc","result":{"address":"4Nd1mYvH6PzVZQKVXJMXGyCkkJZf2u1Vi2B86Wk71u2b"}}"#;
        let reply: SignerReply = serde_json::from_str(json).unwrap();
        assert_eq!(reply.id, "abc");
        assert!(reply.error.is_none());
        assert!(reply.result.is_some());
    }

    #[test]
    fn test_wire_error_mapping() {
        let err = map_wire_error(WireError {
            code: "user_rejected".to_string(),
            message: None,
        });
        assert!(matches!(err, Error::UserRejected(ProviderKind::Extension)));

        let err = map_wire_error(WireError {
            code: "weird".to_string(),
            message: Some("boom".to_string()),
        });
        assert!(matches!(err, Error::HostRequest(m) if m == "boom"));
    }

    #[test]
    fn test_push_parsing() {
        let json = r#"{"event":"account_changed","address":"4Nd1mYvH6PzVZQKVXJMXGyCkkJZf2u1Vi2B86Wk71u2b"}"#;
        let push: SignerPush = serde_json::from_str(json).unwrap();
        assert_eq!(push.event, "account_changed");
        assert!(push.address.is_some());
    }

    #[tokio::test]
    async fn test_request_fails_when_not_connected() {
        let host = WsExtensionHost::new(HostConfig::default());
        let err = host.request_connect().await.unwrap_err();
        assert!(matches!(err, Error::HostConnection(_)));
    }
}
