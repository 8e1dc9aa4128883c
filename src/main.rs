//! vless-relay - VLESS over WebSocket relay
//!
//! Serves VLESS clients over WebSocket and relays their TCP and DNS traffic.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use std::net::SocketAddr;
use std::path::PathBuf;

use vless_relay::{server, RelayConfig, UserId};

#[derive(Parser)]
#[command(name = "vless-relay")]
#[command(version)]
#[command(about = "VLESS over WebSocket relay", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept WebSocket clients and relay their traffic
    Serve {
        /// Listen address
        #[arg(short, long)]
        bind: Option<SocketAddr>,

        /// Accepted user identity
        #[arg(short, long, env = "VLESS_UUID")]
        uuid: Option<String>,

        /// Comma-separated fallback hosts for silent destinations
        #[arg(short, long, env = "PROXYIP")]
        fallback: Option<String>,
    },

    /// Print a fresh random identity
    GenId,

    /// Load and validate a configuration file
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    match cli.command {
        Commands::Serve {
            bind,
            uuid,
            fallback,
        } => {
            run_server(cli.config, bind, uuid, fallback).await?;
        }
        Commands::GenId => {
            println!("{}", UserId::random());
        }
        Commands::CheckConfig => {
            check_config(cli.config)?;
        }
    }

    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<RelayConfig> {
    match path {
        Some(path) => RelayConfig::from_file(&path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(RelayConfig::default()),
    }
}

async fn run_server(
    config_path: Option<PathBuf>,
    bind: Option<SocketAddr>,
    uuid: Option<String>,
    fallback: Option<String>,
) -> Result<()> {
    let mut config = load_config(config_path)?;

    if let Some(bind) = bind {
        config.listen_addr = bind;
    }
    if let Some(uuid) = uuid {
        config.user_id = uuid;
    }
    if let Some(fallback) = fallback {
        config.set_fallback_hosts(&fallback);
    }

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    info!("Starting VLESS relay on {}", config.listen_addr);
    if config.fallback.hosts.is_empty() {
        info!("No fallback hosts configured");
    } else {
        info!(
            "Fallback hosts ({:?}): {}",
            config.fallback.mode,
            config.fallback.hosts.join(", ")
        );
    }
    info!("DNS over HTTPS via {}", config.dns.endpoint);

    server::serve(&config).await.context("relay server failed")?;
    Ok(())
}

fn check_config(config_path: Option<PathBuf>) -> Result<()> {
    let path = config_path.context("check-config needs --config FILE")?;
    let config = load_config(Some(path))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    println!("Configuration OK");
    println!("  listen:    {}", config.listen_addr);
    println!("  user id:   {}", config.user_id);
    println!(
        "  ws path:   {}",
        config.ws_path.as_deref().unwrap_or("(any)")
    );
    println!(
        "  fallback:  {:?} [{}]",
        config.fallback.mode,
        config.fallback.hosts.join(", ")
    );
    println!(
        "  dns:       {} (timeout {:?})",
        config.dns.endpoint, config.dns.timeout
    );
    Ok(())
}
