//! Agency RPC daemon - hosts the JSON-RPC runtime over WebSocket.
//!
//! Loads an optional config file (listen address, heartbeat interval, token
//! table, spec document), registers the declared methods and events, and
//! serves until interrupted.

mod auth;
mod config;
mod operations;

use crate::auth::TokenAuthenticator;
use crate::config::{load_spec, DaemonConfig};
use agency_rpc::{RpcServer, ServerEvent};
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// How long to wait for connections to wind down on exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "agency-rpcd")]
#[command(about = "WebSocket JSON-RPC host for agency")]
struct Args {
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (0 = auto-assign)
    #[arg(short, long)]
    port: Option<u16>,

    /// Spec document declaring methods and events
    #[arg(long)]
    spec: Option<PathBuf>,

    /// Seconds between heartbeat probes (0 disables)
    #[arg(long)]
    ping_interval_secs: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Args {
    fn apply(&self, config: &mut DaemonConfig) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(spec) = &self.spec {
            config.spec = Some(spec.clone());
        }
        if let Some(secs) = self.ping_interval_secs {
            config.ping_interval_secs = secs;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting agency RPC daemon");

    let mut config = match &args.config {
        Some(path) => DaemonConfig::load(path)?,
        None => DaemonConfig::default(),
    };
    args.apply(&mut config);

    let authenticator = TokenAuthenticator::new(config.tokens.clone());
    if authenticator.is_empty() {
        warn!("No login tokens configured; every rpc.login will be rejected");
    } else {
        info!("Loaded {} login tokens", authenticator.len());
    }

    let server = RpcServer::new(config.server_config()).with_authenticator(Arc::new(authenticator));
    operations::register_builtins(&server)?;

    if let Some(path) = &config.spec {
        let spec = load_spec(path)?;
        server.register_spec(&spec, operations::resolve, |name, meta| {
            info!("Registered event {} (scopes {:?})", name, meta.scopes);
        })?;
        info!(
            "Registered {} methods and {} events from {}",
            spec.methods.len(),
            spec.events.len(),
            path.display()
        );
    }

    tokio::spawn(log_events(server.events()));

    let handle = server.listen(config.listen_addr()?).await?;

    // Print port for supervisors to read (intentional stdout)
    println!("RPC_PORT={}", handle.port());

    info!("RPC daemon running on {}", handle.addr());

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, handle.close())
        .await
        .is_err()
    {
        warn!("Timed out waiting for connections to close");
    }

    Ok(())
}

async fn log_events(mut events: broadcast::Receiver<ServerEvent>) {
    loop {
        match events.recv().await {
            Ok(ServerEvent::Connection { id }) => info!("Client connected: {}", id),
            Ok(ServerEvent::Authenticated { id, user }) => info!("Client {} logged in as {}", id, user),
            Ok(ServerEvent::Disconnect { id }) => info!("Client disconnected: {}", id),
            Ok(ServerEvent::Error(message)) => warn!("Server error: {}", message),
            Ok(ServerEvent::Listening(_)) | Ok(ServerEvent::Close) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Event log skipped {} events", skipped)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
