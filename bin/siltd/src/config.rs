//! Persisted user configuration.
//!
//! Created on first run with a random node id and a random free TCP port
//! in [30000, 30100]; the HTTP port is derived as `8000 + tcp % 1000`.

use std::net::TcpListener;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use silt_core::NodeId;
use tracing::info;

const PORT_RANGE: (u16, u16) = (30000, 30100);

/// Persisted per-user configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserConfig {
    /// Node identity, stable across restarts.
    pub node_id: NodeId,
    /// TCP port the RPC listener binds.
    pub tcp_port: u16,
    /// HTTP port reserved for the local adapter.
    pub http_port: u16,
    /// Relay to attach to, empty for directly reachable nodes.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub relay: String,
    /// Blockstore root directory.
    pub blockstore_path: PathBuf,
}

impl UserConfig {
    /// Loads the config at `path`, creating it with fresh defaults when
    /// missing or unreadable.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(raw) => match serde_json::from_slice(&raw) {
                Ok(config) => Ok(config),
                Err(e) => {
                    info!(path = %path.display(), error = %e, "config unreadable, regenerating");
                    Self::create_at(path)
                }
            },
            Err(_) => Self::create_at(path),
        }
    }

    fn create_at(path: &Path) -> Result<Self> {
        let config = Self::generate(path)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create config dir {}", parent.display()))?;
        }
        let pretty = serde_json::to_vec_pretty(&config)?;
        std::fs::write(path, pretty)
            .with_context(|| format!("write config {}", path.display()))?;
        info!(path = %path.display(), "wrote fresh config");
        Ok(config)
    }

    fn generate(path: &Path) -> Result<Self> {
        let tcp_port = random_free_port()?;
        let blockstore_path = path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("blockstore");
        Ok(Self {
            node_id: NodeId::random(),
            tcp_port,
            http_port: 8000 + tcp_port % 1000,
            relay: String::new(),
            blockstore_path,
        })
    }
}

/// Default config path: `<user config dir>/silt/config.json`.
pub fn default_config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("no user config directory")?;
    Ok(base.join("silt").join("config.json"))
}

/// Picks a free TCP port in the configured range by probing bindings.
fn random_free_port() -> Result<u16> {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    for _ in 0..30 {
        let port = rng.gen_range(PORT_RANGE.0..=PORT_RANGE.1);
        if let Ok(listener) = TcpListener::bind(("0.0.0.0", port)) {
            drop(listener);
            return Ok(port);
        }
    }
    anyhow::bail!(
        "no free port in range {}-{}",
        PORT_RANGE.0,
        PORT_RANGE.1
    )
}
