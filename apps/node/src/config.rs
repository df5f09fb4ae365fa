//! Node configuration.
//!
//! Stored as TOML:
//! - Linux: `~/.config/busfile/node.toml`
//! - Windows: `%APPDATA%/busfile/node.toml`
//!
//! ```toml
//! node_id = 10
//! bind = "0.0.0.0:9400"
//! root = "/var/lib/busfile"
//!
//! [peers]
//! 20 = "192.168.1.20:9400"
//! ```

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use busfile_client::{ClientConfig, DEFAULT_RESPONSE_TIMEOUT};
use busfile_protocol::{DEFAULT_SESSION_CAPACITY, NodeId};
use busfile_server::{DEFAULT_SESSION_TIMEOUT, ServerConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node id of this node on the bus.
    #[serde(default = "default_node_id")]
    pub node_id: NodeId,

    /// Local UDP address.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Directory served by `serve`.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Concurrent file sessions on the server.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Idle seconds before a server session may be reclaimed (0 = never).
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,

    /// Seconds a client waits for each response.
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,

    /// Node id to UDP address.
    #[serde(default)]
    pub peers: BTreeMap<String, SocketAddr>,
}

fn default_node_id() -> NodeId {
    NodeId::MIN
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9400))
}

fn default_root() -> PathBuf {
    PathBuf::from("./busfile")
}

fn default_capacity() -> usize {
    DEFAULT_SESSION_CAPACITY
}

fn default_session_timeout_secs() -> u64 {
    DEFAULT_SESSION_TIMEOUT.as_secs()
}

fn default_response_timeout_secs() -> u64 {
    DEFAULT_RESPONSE_TIMEOUT.as_secs()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            bind: default_bind(),
            root: default_root(),
            capacity: default_capacity(),
            session_timeout_secs: default_session_timeout_secs(),
            response_timeout_secs: default_response_timeout_secs(),
            peers: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Loads `path`, or the default location when `None`.
    ///
    /// A missing default file is created with default values; a missing
    /// explicit file is an error.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => {
                let path = config_path()?;
                if path.exists() {
                    Self::load_from(&path)
                } else {
                    let config = Config::default();
                    config.save(&path)?;
                    Ok(config)
                }
            }
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        config.peers()?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Parses the peer table keys into node ids.
    pub fn peers(&self) -> anyhow::Result<HashMap<NodeId, SocketAddr>> {
        self.peers
            .iter()
            .map(|(id, addr)| {
                let node: NodeId = id
                    .parse()
                    .with_context(|| format!("peer key {id:?}"))?;
                Ok((node, *addr))
            })
            .collect()
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            capacity: self.capacity,
            session_timeout: (self.session_timeout_secs > 0)
                .then(|| Duration::from_secs(self.session_timeout_secs)),
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            response_timeout: Duration::from_secs(self.response_timeout_secs),
        }
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let appdata = std::env::var("APPDATA").context("APPDATA is not set")?;
        Ok(PathBuf::from(appdata).join("busfile").join("node.toml"))
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home)
            .join(".config")
            .join("busfile")
            .join("node.toml"))
    }
}
