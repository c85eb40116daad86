//! Reconciliation watcher
//!
//! Periodically aligns the published session with what the adapters
//! actually report, and reacts to adapter events without waiting for the
//! next poll. Each trigger runs the orchestrator's single reconciliation
//! pass, which skips on its own when an operation is in flight.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::WatcherConfig;
use crate::error::Result;
use crate::provider::types::{AdapterEvent, ProviderKind};
use crate::session::SessionOrchestrator;

/// Watches adapter reality and nudges the session back in line
pub struct ReconciliationWatcher {
    orchestrator: Arc<SessionOrchestrator>,
    config: WatcherConfig,
    /// Shutdown signal
    shutdown: broadcast::Sender<()>,
}

impl ReconciliationWatcher {
    pub fn new(orchestrator: Arc<SessionOrchestrator>, config: WatcherConfig) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            orchestrator,
            config,
            shutdown,
        }
    }

    /// Start the watcher loop
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            info!("Reconciliation watcher disabled");
            return Ok(());
        }

        info!(
            "Starting reconciliation watcher with {}ms poll interval",
            self.config.poll_interval_ms
        );

        let orchestrator = self.orchestrator.clone();
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut ext_rx = self.orchestrator.adapter_events(ProviderKind::Extension);
        let mut pk_rx = self.orchestrator.adapter_events(ProviderKind::Passkey);
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut interval = interval(poll_interval);
            let mut ext_alive = true;
            let mut pk_alive = true;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        Self::run_pass(&orchestrator).await;
                    }
                    event = ext_rx.recv(), if ext_alive => {
                        if Self::event_triggers_pass(event, &mut ext_alive) {
                            Self::run_pass(&orchestrator).await;
                        }
                    }
                    event = pk_rx.recv(), if pk_alive => {
                        if Self::event_triggers_pass(event, &mut pk_alive) {
                            Self::run_pass(&orchestrator).await;
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Reconciliation watcher shutting down");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// Stop the watcher
    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }

    async fn run_pass(orchestrator: &Arc<SessionOrchestrator>) {
        if let Err(e) = orchestrator.reconcile().await {
            warn!("Reconciliation pass failed: {}", e);
        }
    }

    fn event_triggers_pass(
        event: std::result::Result<AdapterEvent, broadcast::error::RecvError>,
        alive: &mut bool,
    ) -> bool {
        match event {
            Ok(event) => {
                debug!("Reconciling after adapter event: {:?}", event);
                true
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Adapter event stream lagged by {} event(s)", skipped);
                true
            }
            Err(broadcast::error::RecvError::Closed) => {
                *alive = false;
                false
            }
        }
    }
}
