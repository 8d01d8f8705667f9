//! keygated - Keygate peer admission daemon
//!
//! Runs the expiration sweep and interface syncs for the configured
//! WireGuard overlays, and offers one-shot commands for moving peers
//! through their lifecycle.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use keygate::{Config, NetworkManager, Peer, Registries};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "keygated")]
#[command(about = "Keygate peer admission daemon")]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(
        short,
        long,
        global = true,
        env = "KEYGATE_CONFIG",
        default_value = "/etc/keygate/config.json"
    )]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon until interrupted
    Run,

    /// Register a peer with a network
    Register {
        #[command(flatten)]
        target: PeerTarget,

        /// Peer metadata as key=value, repeatable
        #[arg(long = "meta", value_parser = parse_meta)]
        meta: Vec<(String, String)>,
    },

    /// Approve a staged peer
    Approve(PeerTarget),

    /// Disapprove an approved peer
    Disapprove(PeerTarget),

    /// Activate an approved peer
    Activate(PeerTarget),

    /// Deactivate a peer
    Deactivate(PeerTarget),

    /// Print a network's configuration and state as JSON
    Show {
        /// Network ID
        #[arg(short, long)]
        network: String,
    },

    /// Run one expiration sweep and print what lapsed
    Sweep,

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "/etc/keygate/config.json")]
        output: PathBuf,
    },
}

#[derive(Args)]
struct PeerTarget {
    /// Network ID
    #[arg(short, long)]
    network: String,

    /// Peer public key
    #[arg(short, long)]
    key: String,
}

fn parse_meta(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::from_default_env()
        .add_directive("keygate=info".parse()?)
        .add_directive("keygated=info".parse()?);
    if cli.log_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    match cli.command {
        Commands::Run => run_daemon(&cli.config).await?,
        Commands::Register { target, meta } => {
            let manager = load_manager(&cli.config).await?;
            let mut peer = Peer::new(target.key.as_str());
            peer.info = meta.into_iter().collect::<BTreeMap<_, _>>();
            let result = manager.register(&target.network, peer).await;
            finish(&manager, result, "registered", &target).await?;
        }
        Commands::Approve(target) => {
            let manager = load_manager(&cli.config).await?;
            let result = manager.approve(&target.network, &target.key).await;
            finish(&manager, result, "approved", &target).await?;
        }
        Commands::Disapprove(target) => {
            let manager = load_manager(&cli.config).await?;
            let result = manager.disapprove(&target.network, &target.key).await;
            finish(&manager, result, "disapproved", &target).await?;
        }
        Commands::Activate(target) => {
            let manager = load_manager(&cli.config).await?;
            let result = manager.activate(&target.network, &target.key).await;
            finish(&manager, result, "activated", &target).await?;
        }
        Commands::Deactivate(target) => {
            let manager = load_manager(&cli.config).await?;
            let result = manager.deactivate(&target.network, &target.key).await;
            finish(&manager, result, "deactivated", &target).await?;
        }
        Commands::Show { network } => show_network(&cli.config, &network).await?,
        Commands::Sweep => sweep(&cli.config).await?,
        Commands::InitConfig { output } => init_config(&output)?,
    }

    Ok(())
}

async fn load_manager(config_path: &Path) -> anyhow::Result<NetworkManager> {
    let config = Config::from_file(config_path)?;
    let registries = Registries::builtin()?;
    let manager = NetworkManager::new(&config, &registries)
        .await
        .with_context(|| format!("failed to start from {}", config_path.display()))?;
    Ok(manager)
}

/// Drains pending syncs before reporting the operation's outcome.
async fn finish(
    manager: &NetworkManager,
    result: keygate::Result<()>,
    verb: &str,
    target: &PeerTarget,
) -> anyhow::Result<()> {
    manager.shutdown().await;
    result?;
    println!("Peer {} {verb} on {}", target.key, target.network);
    Ok(())
}

async fn run_daemon(config_path: &Path) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "starting keygated");

    let manager = Arc::new(load_manager(config_path).await?);
    for net in manager.networks() {
        info!(
            network = %net.id,
            name = %net.name,
            approve = %net.approve_mode,
            activate = %net.activate_mode,
            "managing network"
        );
    }

    let expiry = manager.start_expiry().await;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");

    if let Some(handle) = expiry {
        handle.stop();
    }
    manager.shutdown().await;
    Ok(())
}

async fn show_network(config_path: &Path, network: &str) -> anyhow::Result<()> {
    let manager = load_manager(config_path).await?;
    let net = manager.get_net(network).await?;
    let out = serde_json::json!({
        "config": net.config(),
        "state": &net.state,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    manager.shutdown().await;
    Ok(())
}

async fn sweep(config_path: &Path) -> anyhow::Result<()> {
    let manager = load_manager(config_path).await?;
    let report = manager.process_expirations().await;
    manager.shutdown().await;

    if report.networks.is_empty() && report.errors.is_empty() {
        println!("Nothing has lapsed");
        return Ok(());
    }

    for (network, lapsed) in &report.networks {
        println!("{network}:");
        for key in &lapsed.approvals {
            println!("  approval lapsed: {key}");
        }
        for key in &lapsed.activations {
            println!("  activation lapsed: {key}");
        }
    }
    for (network, error) in &report.errors {
        println!("{network}: sweep failed: {error}");
    }

    if !report.errors.is_empty() {
        anyhow::bail!("{} network(s) could not be swept", report.errors.len());
    }
    Ok(())
}

fn init_config(output: &Path) -> anyhow::Result<()> {
    let config = Config::sample();
    let content = serde_json::to_string_pretty(&config)?;

    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    std::fs::write(output, content)
        .with_context(|| format!("failed to write {}", output.display()))?;

    println!("Config written to {}", output.display());
    println!();
    println!("Edit the networks and addressers, then run:");
    println!("  keygated run --config {}", output.display());

    Ok(())
}
