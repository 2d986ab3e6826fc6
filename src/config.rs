//! Configuration types for nzb-connect
//!
//! Configuration is a YAML file with `vpn`, `servers`, `paths`, `web`,
//! `postprocess`, and `engine` sections. [`SharedConfig`] wraps the loaded
//! [`Config`] for runtime mutation (server CRUD, VPN settings) with
//! save-back to the original file.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use utoipa::ToSchema;

/// Top-level configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// VPN mode and tunnel settings
    #[serde(default)]
    pub vpn: VpnConfig,

    /// NNTP servers to download from
    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    /// Filesystem locations
    #[serde(default)]
    pub paths: PathsConfig,

    /// Control-plane settings
    #[serde(default)]
    pub web: WebConfig,

    /// Archive extraction settings
    #[serde(default)]
    pub postprocess: PostProcessConfig,

    /// Download engine tuning
    #[serde(default)]
    pub engine: EngineConfig,
}

/// VPN configuration
///
/// `protocol` selects the coordinator mode: `"wireguard"` or `"openvpn"`
/// for managed mode (the agent owns the tunnel through an external
/// connector), empty for passive mode (monitor a pre-existing interface).
#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct VpnConfig {
    /// Whether VPN coordination is active at all
    #[serde(default)]
    pub enabled: bool,

    /// "wireguard", "openvpn", or "" (passive)
    #[serde(default)]
    pub protocol: String,

    /// Interface to monitor in passive mode
    #[serde(default)]
    pub interface: String,

    /// Last explicit connect/disconnect decision. `None` means connect on
    /// start; `Some(false)` is recorded when the user disconnects so a
    /// restart stays disconnected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_connect: Option<bool>,

    /// WireGuard tunnel settings (managed mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wireguard: Option<WireGuardConfig>,

    /// OpenVPN tunnel settings (managed mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openvpn: Option<OpenVpnConfig>,
}

/// WireGuard tunnel settings, consumed by the external connector
#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct WireGuardConfig {
    /// Local private key (secret — never echoed by the API)
    #[serde(default)]
    pub private_key: String,
    /// Tunnel address with prefix, e.g. "10.2.0.2/32"
    #[serde(default)]
    pub address: String,
    /// DNS server inside the tunnel
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dns: String,
    /// Local listen port (0 = ephemeral)
    #[serde(default)]
    pub listen_port: u16,
    /// Peer public key
    #[serde(default)]
    pub peer_public_key: String,
    /// Peer endpoint, host:port
    #[serde(default)]
    pub peer_endpoint: String,
    /// Optional preshared key (secret)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub preshared_key: String,
    /// AllowedIPs for the peer (default routes everything)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub allowed_ips: String,
    /// Persistent keepalive interval in seconds (0 = off)
    #[serde(default)]
    pub persistent_keepalive: u16,
}

/// OpenVPN tunnel settings, consumed by the external connector
#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct OpenVpnConfig {
    /// Remote server host
    #[serde(default)]
    pub remote_host: String,
    /// Remote server port
    #[serde(default)]
    pub remote_port: u16,
    /// "udp" or "tcp"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
    /// "userpass" or "certificate"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth_type: String,
    /// Username (secret)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    /// Password (secret)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    /// CA certificate, PEM (secret)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca_cert: String,
    /// Client certificate, PEM (secret)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_cert: String,
    /// Client key, PEM (secret)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_key: String,
    /// tls-auth key, PEM (secret)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tls_auth: String,
    /// Cipher override
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cipher: String,
    /// HMAC auth digest override
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth: String,
    /// Compression setting
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub compress: String,
    /// "tun" or "tap"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_type: String,
}

/// NNTP server configuration
///
/// Identity is keyed by `id`; `name` is the display name and unique per
/// installation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ServerConfig {
    /// Stable identity
    #[serde(default)]
    pub id: String,

    /// Display name (unique)
    #[serde(default)]
    pub name: String,

    /// Hostname
    pub host: String,

    /// Port (0 = default for the TLS setting: 563 with TLS, 119 without)
    #[serde(default)]
    pub port: u16,

    /// Use implicit TLS
    #[serde(default)]
    pub tls: bool,

    /// Username for AUTHINFO
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Password for AUTHINFO
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Desired connection count (clamped to 1..=50 by the pool)
    #[serde(default = "default_connections")]
    pub connections: usize,

    /// Whether this server participates in downloads
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ServerConfig {
    /// `host:port` address string for dialing
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Filesystem locations
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PathsConfig {
    /// In-progress downloads land in `<incomplete>/<job-name>/`
    #[serde(default)]
    pub incomplete: PathBuf,

    /// Extracted results land in `<complete>/<job-name>/`
    #[serde(default)]
    pub complete: PathBuf,

    /// Scratch space
    #[serde(default)]
    pub temp: PathBuf,

    /// SQLite queue database
    #[serde(default)]
    pub database: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let mut cfg = Self {
            incomplete: PathBuf::new(),
            complete: PathBuf::new(),
            temp: PathBuf::new(),
            database: PathBuf::new(),
        };
        cfg.apply_defaults();
        cfg
    }
}

impl PathsConfig {
    fn apply_defaults(&mut self) {
        let home = std::env::var_os("HOME").map(PathBuf::from);
        let base = |fallback: &str, rel: &[&str]| -> PathBuf {
            match &home {
                Some(h) => rel.iter().fold(h.clone(), |p, s| p.join(s)),
                None => PathBuf::from(fallback),
            }
        };
        if self.incomplete.as_os_str().is_empty() {
            self.incomplete = base(
                "/downloads/incomplete",
                &["Downloads", "nzb-connect", "incomplete"],
            );
        }
        if self.complete.as_os_str().is_empty() {
            self.complete = base(
                "/downloads/complete",
                &["Downloads", "nzb-connect", "complete"],
            );
        }
        if self.temp.as_os_str().is_empty() {
            self.temp = base("/tmp/nzb-connect", &[".cache", "nzb-connect", "tmp"]);
        }
        if self.database.as_os_str().is_empty() {
            self.database = self.temp.join("queue.db");
        }
    }

    /// Create the incomplete/complete/temp directories if missing
    pub async fn ensure_directories(&self) -> Result<()> {
        for dir in [&self.incomplete, &self.complete, &self.temp] {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!("failed to create directory '{}': {e}", dir.display()),
                ))
            })?;
        }
        Ok(())
    }
}

/// Control-plane settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebConfig {
    /// Listen port for the HTTP control plane
    #[serde(default = "default_web_port")]
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: default_web_port(),
        }
    }
}

/// Archive extraction settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PostProcessConfig {
    /// Path to the unrar binary
    #[serde(default = "default_unrar")]
    pub unrar: PathBuf,

    /// Path to the 7z binary
    #[serde(default = "default_sevenzip")]
    pub sevenzip: PathBuf,

    /// Path to the unzip binary
    #[serde(default = "default_unzip")]
    pub unzip: PathBuf,

    /// Remove archive volumes after successful extraction
    #[serde(default = "default_true")]
    pub delete_archives: bool,
}

impl Default for PostProcessConfig {
    fn default() -> Self {
        Self {
            unrar: default_unrar(),
            sevenzip: default_sevenzip(),
            unzip: default_unzip(),
            delete_archives: true,
        }
    }
}

/// Download engine tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-file segment fetch parallelism
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

fn default_connections() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_web_port() -> u16 {
    6789
}

fn default_workers() -> usize {
    8
}

fn default_unrar() -> PathBuf {
    PathBuf::from("unrar")
}

fn default_sevenzip() -> PathBuf {
    PathBuf::from("7z")
}

fn default_unzip() -> PathBuf {
    PathBuf::from("unzip")
}

impl Config {
    /// Fill in the defaults that depend on other fields
    pub fn apply_defaults(&mut self) {
        self.paths.apply_defaults();
        for server in &mut self.servers {
            if server.connections == 0 {
                server.connections = default_connections();
            }
            if server.port == 0 {
                server.port = if server.tls { 563 } else { 119 };
            }
            if server.name.is_empty() {
                server.name = server.host.clone();
            }
        }
        if self.engine.workers == 0 {
            self.engine.workers = default_workers();
        }
    }
}

/// Runtime-shared configuration with save-back
///
/// Server CRUD and VPN updates from the admin API mutate the config behind
/// a read-write lock and persist it to the file it was loaded from.
#[derive(Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<Config>>,
    path: Option<PathBuf>,
}

impl SharedConfig {
    /// Load from a YAML file, applying defaults
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("failed to read config file '{}': {e}", path.display()),
            key: None,
        })?;
        let mut config: Config = serde_yaml::from_str(&data).map_err(|e| Error::Config {
            message: format!("failed to parse config file '{}': {e}", path.display()),
            key: None,
        })?;
        config.apply_defaults();
        Ok(Self {
            inner: Arc::new(RwLock::new(config)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Wrap an in-memory config (no save-back), for embedding and tests
    pub fn from_config(mut config: Config) -> Self {
        config.apply_defaults();
        Self {
            inner: Arc::new(RwLock::new(config)),
            path: None,
        }
    }

    /// Persist the current config back to its file, if file-backed
    pub async fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let config = self.inner.read().await;
        let data = serde_yaml::to_string(&*config).map_err(|e| Error::Config {
            message: format!("failed to serialize config: {e}"),
            key: None,
        })?;
        tokio::fs::write(path, data).await.map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("failed to write config file '{}': {e}", path.display()),
            ))
        })
    }

    /// Clone the full current configuration
    pub async fn snapshot(&self) -> Config {
        self.inner.read().await.clone()
    }

    /// Clone the current server list
    pub async fn servers(&self) -> Vec<ServerConfig> {
        self.inner.read().await.servers.clone()
    }

    /// Add a server, generating an id and defaulting the name if needed
    pub async fn add_server(&self, mut server: ServerConfig) -> ServerConfig {
        if server.id.is_empty() {
            server.id = uuid::Uuid::new_v4().simple().to_string();
        }
        if server.name.is_empty() {
            server.name = server.host.clone();
        }
        if server.connections == 0 {
            server.connections = default_connections();
        }
        if server.port == 0 {
            server.port = if server.tls { 563 } else { 119 };
        }
        let mut config = self.inner.write().await;
        config.servers.push(server.clone());
        server
    }

    /// Replace a server matched by id or name, keeping its original id.
    /// Returns false if no server matched.
    pub async fn update_server(&self, id: &str, mut server: ServerConfig) -> bool {
        let mut config = self.inner.write().await;
        for existing in &mut config.servers {
            if existing.id == id || existing.name == id {
                server.id = existing.id.clone();
                if server.port == 0 {
                    server.port = if server.tls { 563 } else { 119 };
                }
                if server.connections == 0 {
                    server.connections = default_connections();
                }
                *existing = server;
                return true;
            }
        }
        false
    }

    /// Remove a server matched by id or name. Returns false if none matched.
    pub async fn delete_server(&self, id: &str) -> bool {
        let mut config = self.inner.write().await;
        let before = config.servers.len();
        config.servers.retain(|s| s.id != id && s.name != id);
        config.servers.len() != before
    }

    /// Find a server by id or name
    pub async fn find_server(&self, id: &str) -> Option<ServerConfig> {
        self.inner
            .read()
            .await
            .servers
            .iter()
            .find(|s| s.id == id || s.name == id)
            .cloned()
    }

    /// Clone the VPN section
    pub async fn vpn(&self) -> VpnConfig {
        self.inner.read().await.vpn.clone()
    }

    /// Replace the VPN section
    pub async fn set_vpn(&self, vpn: VpnConfig) {
        self.inner.write().await.vpn = vpn;
    }

    /// Record the user's explicit connect/disconnect decision
    pub async fn set_vpn_auto_connect(&self, auto: bool) {
        self.inner.write().await.vpn.auto_connect = Some(auto);
    }
}
