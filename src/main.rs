//! Wallet Session Manager - coordinates extension and passkey signers
//!
//! One provider is active at a time; every connect starts from a clean
//! slate and a reconciliation watcher keeps the published session honest
//! when the signer changes state on its own.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;

// Use the library crate
use wallet_session::cli::commands;
use wallet_session::config::Config;

/// Wallet session manager for extension and passkey signers
#[derive(Parser)]
#[command(name = "wsm")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the session service (orchestrator plus watcher)
    Run,

    /// Connect a provider and make it active
    Connect {
        /// Provider to connect: extension or passkey
        provider: String,
    },

    /// Disconnect everything and clear the session
    Disconnect,

    /// Show session, lock and provider status
    Status,

    /// Show balances for an address
    Balances {
        /// Address to query (default: the persisted passkey address)
        address: Option<String>,
    },

    /// Sign and submit a payload through a provider
    Send {
        /// Payload text to sign
        payload: String,

        /// Provider to submit through: extension or passkey
        #[arg(long, default_value = "extension")]
        provider: String,

        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },

    /// Show current configuration (secrets masked)
    Config,

    /// Interactive walkthrough against a simulated signer
    Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wallet_session=info".parse().unwrap()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Execute command
    let result = match cli.command {
        Commands::Run => commands::run(&config).await,
        Commands::Connect { provider } => commands::connect(&config, &provider).await,
        Commands::Disconnect => commands::disconnect(&config).await,
        Commands::Status => commands::status(&config).await,
        Commands::Balances { address } => commands::balances(&config, address).await,
        Commands::Send {
            payload,
            provider,
            force,
        } => commands::send(&config, &provider, &payload, force).await,
        Commands::Config => commands::show_config(&config),
        Commands::Demo => commands::demo(&config).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
