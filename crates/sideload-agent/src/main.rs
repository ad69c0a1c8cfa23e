//! Sideloading Agent
//!
//! Runs the mutual-TLS control-plane agent until Ctrl+C or SIGTERM.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use sideload_agent::{AgentConfig, AgentState, SideloadServer, shutdown_signal};

/// Sideloading Agent - push files to the device and run the managed application
#[derive(Parser, Debug)]
#[command(name = "sideload-agent")]
#[command(about = "Mutual-TLS agent for sideloading files and controlling the managed application")]
struct Args {
    /// JSON config file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on [default: 0.0.0.0:8123]
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Sandbox directory for synchronized files [default: ./sideloaded]
    #[arg(long)]
    sideload_dir: Option<PathBuf>,

    /// Default install directory searched for entrypoints [default: /panorama]
    #[arg(long)]
    default_app_dir: Option<PathBuf>,

    /// Server certificate chain (PEM)
    #[arg(long)]
    server_cert: Option<PathBuf>,

    /// Server private key (PEM)
    #[arg(long)]
    server_key: Option<PathBuf>,

    /// Trust roots for client certificates (PEM)
    #[arg(long)]
    client_ca: Option<PathBuf>,

    /// Shell used for main.sh entrypoints
    #[arg(long)]
    shell: Option<PathBuf>,

    /// Interpreter used for main.py entrypoints
    #[arg(long)]
    python: Option<PathBuf>,

    /// Largest accepted upload in bytes
    #[arg(long)]
    max_upload_bytes: Option<usize>,

    /// Leave the managed application running when the agent exits
    #[arg(long)]
    keep_app_running: bool,
}

impl Args {
    fn into_config(self) -> anyhow::Result<AgentConfig> {
        let mut config = match &self.config {
            Some(path) => AgentConfig::from_file(path)?,
            None => AgentConfig::default(),
        };

        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(dir) = self.sideload_dir {
            config.sideload_dir = dir;
        }
        if let Some(dir) = self.default_app_dir {
            config.default_app_dir = dir;
        }
        if let Some(path) = self.server_cert {
            config.server_cert = path;
        }
        if let Some(path) = self.server_key {
            config.server_key = path;
        }
        if let Some(path) = self.client_ca {
            config.client_ca = path;
        }
        if let Some(shell) = self.shell {
            config.shell = shell;
        }
        if let Some(python) = self.python {
            config.python = python;
        }
        if let Some(max) = self.max_upload_bytes {
            config.max_upload_bytes = max;
        }
        if self.keep_app_running {
            config.stop_app_on_shutdown = false;
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = Args::parse().into_config()?;
    tracing::debug!(?config, "Loaded configuration");

    let state = Arc::new(AgentState::from_config(&config));
    let server = SideloadServer::bind(&config, Arc::clone(&state))
        .await
        .context("failed to start sideloading agent")?;

    server.run(shutdown_signal()).await?;

    if config.stop_app_on_shutdown {
        state.processes.shutdown().await;
    }

    Ok(())
}
