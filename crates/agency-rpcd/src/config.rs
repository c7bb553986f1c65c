//! Daemon configuration file.
//!
//! The file is JSON; every field is optional and command-line flags win over
//! file values.

use agency_rpc::{RpcSpec, Scopes, ServerConfig};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What a login token grants.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TokenGrant {
    pub user: String,
    #[serde(default)]
    pub scopes: Scopes,
}

/// Settings read from `--config`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub host: String,
    pub port: u16,
    /// Seconds between heartbeat probes (0 disables)
    pub ping_interval_secs: u64,
    /// Spec document to register at startup
    pub spec: Option<PathBuf>,
    /// Login token → identity
    pub tokens: HashMap<String, TokenGrant>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            ping_interval_secs: ServerConfig::default().ping_interval.as_secs(),
            spec: None,
            tokens: HashMap::new(),
        }
    }
}

impl DaemonConfig {
    /// Read a config file. A relative `spec` path is resolved against the
    /// file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut config: DaemonConfig = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config {}", path.display()))?;

        if let (Some(spec), Some(dir)) = (config.spec.as_mut(), path.parent()) {
            if spec.is_relative() {
                *spec = dir.join(&*spec);
            }
        }
        Ok(config)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            ..ServerConfig::default()
        }
    }
}

/// Load and sanity-check a spec document.
pub fn load_spec(path: &Path) -> Result<RpcSpec> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read spec {}", path.display()))?;
    let spec: RpcSpec = serde_json::from_str(&raw)
        .with_context(|| format!("invalid spec {}", path.display()))?;

    if spec.methods.is_empty() && spec.events.is_empty() {
        bail!("spec {} declares no methods or events", path.display());
    }
    Ok(spec)
}
