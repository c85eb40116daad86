//! CLI command implementations

use anyhow::Result;
use dialoguer::Confirm;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::balance::{BalanceSource, RpcBalanceSource, StaticBalanceSource};
use crate::config::{Config, HostMode, WatcherConfig};
use crate::host::{ExtensionHost, SimulatedExtensionHost, WsExtensionHost};
use crate::provider::passkey::device_fingerprint;
use crate::provider::types::{Address, BalanceSet, Payload, ProviderKind, Session};
use crate::provider::{AdapterRegistry, ExtensionSigner, PasskeySigner, ProviderCapability};
use crate::reconcile::ReconciliationWatcher;
use crate::session::SessionOrchestrator;
use crate::store::CredentialStore;

/// Assembled service: the orchestrator plus the handles commands talk to
struct Runtime {
    orchestrator: Arc<SessionOrchestrator>,
    watcher: ReconciliationWatcher,
    host: Arc<dyn ExtensionHost>,
    passkey: Arc<PasskeySigner>,
}

/// Wire adapters, orchestrator and watcher from the configuration
async fn build_runtime(config: &Config) -> Result<Runtime> {
    let host: Arc<dyn ExtensionHost> = match config.host.mode {
        HostMode::Simulated => {
            info!("Using simulated extension host");
            Arc::new(SimulatedExtensionHost::new(demo_address()))
        }
        HostMode::Websocket => {
            info!("Using WebSocket signer bridge at {}", config.host.ws_url);
            let ws = Arc::new(WsExtensionHost::new(config.host.clone()));
            ws.start().await?;
            ws
        }
    };

    let source: Arc<dyn BalanceSource> = Arc::new(RpcBalanceSource::new(config.rpc.clone()));

    let extension = Arc::new(ExtensionSigner::new(host.clone(), source.clone()));

    let store = CredentialStore::load(Path::new(&config.store.path));
    let fingerprint = device_fingerprint(&config.store.device_fingerprint);
    let passkey = Arc::new(PasskeySigner::new(store, fingerprint, source));

    let registry = AdapterRegistry::new(extension, passkey.clone());
    let orchestrator = Arc::new(SessionOrchestrator::new(registry, &config.session));
    let watcher = ReconciliationWatcher::new(orchestrator.clone(), config.watcher.clone());

    Ok(Runtime {
        orchestrator,
        watcher,
        host,
        passkey,
    })
}

/// Account the simulated signer resolves to
fn demo_address() -> Address {
    Address::new("DemoSigner111111111111111111111111111111111").expect("valid demo address")
}

/// Start the session service and keep it running until Ctrl+C
pub async fn run(config: &Config) -> Result<()> {
    info!("Starting wallet session service...");

    let runtime = build_runtime(config).await?;
    runtime.watcher.start().await?;

    // Keep balances of an active session current in the background
    if config.session.balance_refresh_secs > 0 {
        let orchestrator = runtime.orchestrator.clone();
        let period = Duration::from_secs(config.session.balance_refresh_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if orchestrator.session().is_active() {
                    if let Err(e) = orchestrator.refresh_balances().await {
                        warn!("Periodic balance refresh failed: {}", e);
                    }
                }
            }
        });
    }

    // Narrate session transitions in the log
    {
        let mut rx = runtime.orchestrator.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let session = rx.borrow_and_update().clone();
                match (&session.active, &session.address) {
                    (Some(kind), Some(address)) => {
                        info!("Session: {} active as {}", kind, address.short());
                    }
                    _ if session.is_connecting => info!("Session: connecting..."),
                    _ => info!("Session: no active provider"),
                }
            }
        });
    }

    info!("Service ready. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    runtime.watcher.stop();
    runtime.orchestrator.disconnect().await?;
    Ok(())
}

/// Connect the given provider and print the resulting session
pub async fn connect(config: &Config, provider: &str) -> Result<()> {
    let kind: ProviderKind = provider.parse()?;
    let runtime = build_runtime(config).await?;

    match runtime.orchestrator.connect(kind).await? {
        Some(address) => {
            println!("Connected {} as {}", kind, address);
            runtime.orchestrator.refresh_balances().await?;
            let balances = runtime.orchestrator.balances();
            if !balances.stale {
                println!("Balance: {:.4} SOL", balances.native_sol());
            }
        }
        None => println!("Another operation is in flight; nothing was connected."),
    }
    Ok(())
}

/// Disconnect both providers and clear any signer-side session
pub async fn disconnect(config: &Config) -> Result<()> {
    let runtime = build_runtime(config).await?;

    // A fresh process holds no session of its own, but the disconnect
    // still asks the signer to release anything it kept open.
    runtime.orchestrator.disconnect().await?;
    println!("Disconnected.");
    Ok(())
}

/// Show session, lock and provider status
pub async fn status(config: &Config) -> Result<()> {
    let runtime = build_runtime(config).await?;
    runtime.orchestrator.reconcile().await?;

    let session = runtime.orchestrator.session();
    println!("\n=== WALLET SESSION STATUS ===\n");
    print_session(&session);
    println!(
        "  pending:    {}",
        runtime.orchestrator.pending_operation()
    );

    println!("\nProviders:");
    println!(
        "  extension: {}",
        if runtime.host.is_available() {
            "available"
        } else {
            "unavailable"
        }
    );
    match runtime.passkey.candidate_address() {
        Some(address) => println!("  passkey:   credential on file ({})", address.short()),
        None => println!("  passkey:   no credential yet"),
    }

    Ok(())
}

/// Fetch and print balances for an address
///
/// Falls back to the persisted passkey address when none is given.
pub async fn balances(config: &Config, address: Option<String>) -> Result<()> {
    let target = match address {
        Some(raw) => Address::new(raw)?,
        None => {
            let store = CredentialStore::load(Path::new(&config.store.path));
            let fingerprint = device_fingerprint(&config.store.device_fingerprint);
            let signer =
                PasskeySigner::new(store, fingerprint, Arc::new(StaticBalanceSource::default()));
            signer.candidate_address().ok_or_else(|| {
                anyhow::anyhow!("No address given and no passkey credential on file")
            })?
        }
    };

    // Direct source fetch; an explicit query should surface its errors
    // instead of degrading to stale values
    let source = RpcBalanceSource::new(config.rpc.clone());
    let set = source.fetch(&target).await?;

    println!("\nBalances for {}", target);
    println!("  SOL: {:.6}", set.native_sol());
    if set.tokens.is_empty() {
        println!("  (no token accounts)");
    }
    for token in &set.tokens {
        println!("  {}: {}", token.mint, token.ui_amount());
    }
    Ok(())
}

/// Connect, sign and submit one payload, then disconnect
pub async fn send(config: &Config, provider: &str, payload: &str, force: bool) -> Result<()> {
    let kind: ProviderKind = provider.parse()?;

    if !force {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Sign and submit a {} byte payload through {}?",
                payload.len(),
                kind
            ))
            .default(false)
            .interact()?;

        if !confirmed {
            info!("Send cancelled by user");
            return Ok(());
        }
    }

    let runtime = build_runtime(config).await?;
    let address = match runtime.orchestrator.connect(kind).await? {
        Some(address) => address,
        None => anyhow::bail!("Another operation is in flight"),
    };
    info!("Connected {} as {}", kind, address.short());

    let tx = runtime
        .orchestrator
        .sign_and_send(&Payload::new(payload.as_bytes().to_vec()))
        .await?;
    println!("Submitted: {}", tx);

    runtime.orchestrator.disconnect().await?;
    Ok(())
}

/// Show current configuration (secrets masked)
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}

/// Interactive walkthrough of the coordination scenarios against a
/// simulated signer
pub async fn demo(config: &Config) -> Result<()> {
    println!("\n=== WALLET SESSION DEMO ===\n");
    println!("Everything below runs against an in-process simulated signer.");
    println!("Nothing leaves this machine.\n");

    // Always the simulated host here, whatever the config says, so every
    // step stays scriptable
    let host = Arc::new(SimulatedExtensionHost::new(demo_address()));
    let source = Arc::new(StaticBalanceSource::new(BalanceSet {
        native_lamports: 2_500_000_000,
        ..Default::default()
    }));

    let extension = Arc::new(ExtensionSigner::new(host.clone(), source.clone()));
    let store = CredentialStore::load(Path::new(&config.store.path));
    let fingerprint = device_fingerprint(&config.store.device_fingerprint);
    let passkey = Arc::new(PasskeySigner::new(store, fingerprint, source.clone()));

    let registry = AdapterRegistry::new(extension.clone(), passkey);
    let orchestrator = Arc::new(SessionOrchestrator::new(registry, &config.session));
    let watcher = ReconciliationWatcher::new(
        orchestrator.clone(),
        WatcherConfig {
            enabled: true,
            poll_interval_ms: 200,
        },
    );
    watcher.start().await?;

    if step("Connect the extension signer")? {
        orchestrator.connect(ProviderKind::Extension).await?;
        orchestrator.refresh_balances().await?;
        print_session(&orchestrator.session());
    }

    if step("Fire a second connect while one is still in flight")? {
        host.set_latency(Duration::from_millis(800));
        let first = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.connect(ProviderKind::Extension).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        match orchestrator.connect(ProviderKind::Passkey).await? {
            Some(_) => println!("  unexpected: second intent was accepted"),
            None => println!("  second intent rejected while the first was in flight"),
        }

        first.await??;
        host.set_latency(Duration::ZERO);
        print_session(&orchestrator.session());
    }

    if step("Switch to the passkey signer")? {
        orchestrator.connect(ProviderKind::Passkey).await?;
        print_session(&orchestrator.session());
    }

    if step("Let the extension connect behind the orchestrator's back")? {
        // The conflict resolution republishes the session, so one change
        // after the event means the watcher has run
        let mut rx = orchestrator.subscribe();
        host.simulate_external_connect();
        let _ = tokio::time::timeout(Duration::from_secs(2), rx.changed()).await;

        println!("  conflict resolved by the watcher; the active provider stays:");
        println!("  extension forced back off: {}", !extension.is_connected());
        print_session(&orchestrator.session());
    }

    if step("Disconnect the signer from its own popup")? {
        orchestrator.connect(ProviderKind::Extension).await?;
        host.simulate_external_disconnect();
        wait_for_session(&orchestrator, |s| s.active.is_none()).await;
        println!("  watcher demoted the vanished provider:");
        print_session(&orchestrator.session());
    }

    if step("Degrade balances when the RPC fails")? {
        orchestrator.connect(ProviderKind::Passkey).await?;
        orchestrator.refresh_balances().await?;
        source.set_failing(true);
        orchestrator.refresh_balances().await?;
        source.set_failing(false);
        println!("  fetch failed; last-known values stay, flagged stale:");
        print_session(&orchestrator.session());
    }

    watcher.stop();
    orchestrator.disconnect().await?;
    println!("\nDemo finished.");
    Ok(())
}

fn step(prompt: &str) -> Result<bool> {
    let confirmed = Confirm::new()
        .with_prompt(format!("\n{}?", prompt))
        .default(true)
        .interact()?;
    Ok(confirmed)
}

/// Wait briefly for the watcher to converge; prints regardless
async fn wait_for_session(
    orchestrator: &Arc<SessionOrchestrator>,
    predicate: impl FnMut(&Session) -> bool,
) {
    let mut rx = orchestrator.subscribe();
    let _ = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(predicate)).await;
}

fn print_session(session: &Session) {
    println!(
        "  active:     {}",
        session
            .active
            .map(|k| k.to_string())
            .unwrap_or_else(|| "none".into())
    );
    println!(
        "  address:    {}",
        session
            .address
            .as_ref()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".into())
    );
    println!(
        "  balance:    {:.4} SOL{}",
        session.balances.native_sol(),
        if session.balances.stale { " (stale)" } else { "" }
    );
    if session.is_connecting {
        println!("  connecting: yes");
    }
    if let Some(error) = &session.last_error {
        println!("  last error: {}", error);
    }
}
