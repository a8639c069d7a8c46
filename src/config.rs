//! Node configuration, loaded from a TOML file.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::peers::PeerKind;

fn default_host() -> String {
    "0.0.0.0".to_string()
}

/// Where the node accepts inbound replication connections. Absent means the
/// node only dials out.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Listen {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
}

impl Listen {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .with_context(|| format!("resolving listen address {}:{}", self.host, self.port))?
            .next()
            .with_context(|| format!("listen address {}:{} resolves to nothing", self.host, self.port))
    }
}

/// One allow-listed peer.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerConfig {
    /// Path to the peer's certificate in PEM form.
    pub cert: PathBuf,
    #[serde(rename = "type")]
    pub kind: PeerKind,
    /// `host:port` to dial. Absent means we only accept this peer inbound.
    #[serde(default)]
    pub connect: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Directory holding the log and view databases and the writer ids.
    pub data_dir: PathBuf,
    #[serde(default)]
    pub listen: Option<Listen>,
    /// This node's own certificate and key, PEM.
    pub tls_cert: PathBuf,
    pub tls_key: PathBuf,
    /// Disables all TLS verification and treats every connection as a lab
    /// peer. Test setups only.
    #[serde(default)]
    pub insecure: bool,
    /// Accept inbound connections but never dial out.
    #[serde(default)]
    pub introvert: bool,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }
}
