//! ClickSync agent entry point.
//!
//! ```text
//! clicksync                          Run with clicksync.toml (or defaults)
//! clicksync --role follower          Override the configured role
//! clicksync --port 6000              Override the follower port
//! clicksync --peer Podium            Prefer a follower by name
//! clicksync --config <path>          Load a custom config TOML
//! clicksync --gen-config             Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use clicksync::agent::Agent;
use clicksync::config::ClickSyncConfig;
use clicksync_core::{Orchestrator, Role};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "clicksync", about = "Drive slides on another machine over the LAN")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "clicksync.toml")]
    config: PathBuf,

    /// Role for this machine: controller or follower.
    #[arg(short, long)]
    role: Option<Role>,

    /// Follower listen port.
    #[arg(short, long)]
    port: Option<String>,

    /// Name of the follower to dial first.
    #[arg(long)]
    peer: Option<String>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&ClickSyncConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    // Load config, then init tracing at its level.
    let mut config = ClickSyncConfig::load(&cli.config);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    config.apply_overrides(cli.role, cli.port, cli.peer);
    let session = config.session_settings();
    let lifecycle = config.lifecycle_settings()?;
    let discovery = config.discovery()?;

    info!("clicksync v{}", env!("CARGO_PKG_VERSION"));
    info!("role: {}", session.role);
    if session.role == Role::Follower {
        info!("port: {}", session.port.trim());
        info!("instance name: {}", lifecycle.instance_name);
    }

    let (orchestrator, events) = Orchestrator::spawn(discovery, lifecycle);
    Agent::new(orchestrator, events, session).run().await?;

    Ok(())
}
