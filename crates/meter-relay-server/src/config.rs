//! Relay configuration: TOML file + CLI overrides.

use meter_relay_core::{MeterHandle, RelayError, RelayResult};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub directory: DirectorySection,
    #[serde(default)]
    pub device: DeviceSection,
    #[serde(default)]
    pub auth: AuthSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cert: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            cert: None,
            key: None,
            max_sessions: default_max_sessions(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

/// `[session]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// 0 disables the idle timeout.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_teardown_grace")]
    pub teardown_grace_ms: u64,
    #[serde(default = "default_read_buffer")]
    pub read_buffer_bytes: usize,
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
    /// Client input queued for a device that has not drained it yet.
    #[serde(default = "default_input_backlog")]
    pub input_backlog: usize,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: default_handshake_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            teardown_grace_ms: default_teardown_grace(),
            read_buffer_bytes: default_read_buffer(),
            command_buffer: default_command_buffer(),
            outbound_buffer: default_outbound_buffer(),
            input_backlog: default_input_backlog(),
        }
    }
}

/// `[directory]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectorySection {
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    /// JSON inventory file.
    #[serde(default)]
    pub file: Option<String>,
    /// HTTP inventory endpoint.
    #[serde(default)]
    pub url: Option<String>,
    /// Fixed inventory, for bench setups.
    #[serde(default)]
    pub meters: Vec<MeterHandle>,
}

impl Default for DirectorySection {
    fn default() -> Self {
        Self {
            refresh_secs: default_refresh_secs(),
            max_age_secs: default_max_age_secs(),
            file: None,
            url: None,
            meters: Vec::new(),
        }
    }
}

/// How device streams are opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceMode {
    /// TCP bridge to the agent's port.
    #[default]
    Tcp,
    /// Local shell in a pseudo-terminal (development only).
    LocalPty,
}

/// `[device]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceSection {
    #[serde(default)]
    pub mode: DeviceMode,
    #[serde(default = "default_device_host")]
    pub host: String,
    #[serde(default = "default_true")]
    pub verify_pid: bool,
    #[serde(default)]
    pub shell: Option<String>,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            mode: DeviceMode::default(),
            host: default_device_host(),
            verify_pid: true,
            shell: None,
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    /// Shared secret expected as the `token` query parameter on upgrade.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// Empty = any non-empty user id.
    #[serde(default)]
    pub allowed_users: Vec<String>,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts_per_minute: u32,
    #[serde(default = "default_max_sessions_per_user")]
    pub max_sessions_per_user: usize,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            token: None,
            allowed_origins: Vec::new(),
            allowed_users: Vec::new(),
            connect_attempts_per_minute: default_connect_attempts(),
            max_sessions_per_user: default_max_sessions_per_user(),
        }
    }
}

fn default_bind() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}
fn default_port() -> u16 {
    8022
}
fn default_max_sessions() -> usize {
    256
}
fn default_max_frame_bytes() -> usize {
    1_048_576
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_idle_timeout() -> u64 {
    1800
}
fn default_teardown_grace() -> u64 {
    2000
}
fn default_read_buffer() -> usize {
    8192
}
fn default_command_buffer() -> usize {
    64
}
fn default_outbound_buffer() -> usize {
    256
}
fn default_input_backlog() -> usize {
    1024
}
fn default_refresh_secs() -> u64 {
    5
}
fn default_max_age_secs() -> u64 {
    30
}
fn default_device_host() -> String {
    "127.0.0.1".to_string()
}
fn default_connect_attempts() -> u32 {
    20
}
fn default_max_sessions_per_user() -> usize {
    4
}
fn default_true() -> bool {
    true
}

/// Where the device directory gets its meters from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InventoryConfig {
    File(PathBuf),
    Url(String),
    Static(Vec<MeterHandle>),
    None,
}

/// Values given on the command line; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bind: Option<IpAddr>,
    pub port: Option<u16>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub max_sessions: Option<usize>,
    pub handshake_timeout_secs: Option<u64>,
    pub inventory_file: Option<String>,
    pub inventory_url: Option<String>,
    pub local_pty: bool,
}

/// Resolved relay configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub max_sessions: usize,
    pub max_frame_bytes: usize,
    pub handshake_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub teardown_grace: Duration,
    pub read_buffer_bytes: usize,
    pub command_buffer: usize,
    pub outbound_buffer: usize,
    pub input_backlog: usize,
    pub refresh_interval: Duration,
    pub max_age: Duration,
    pub inventory: InventoryConfig,
    pub device_mode: DeviceMode,
    pub device_host: String,
    pub verify_pid: bool,
    pub shell: Option<String>,
    pub auth_token: Option<String>,
    pub allowed_origins: Vec<String>,
    pub allowed_users: Vec<String>,
    pub connect_attempts_per_minute: u32,
    pub max_sessions_per_user: usize,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: &ConfigOverrides) -> RelayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, overrides)
    }

    /// Merge a parsed file with CLI overrides and validate the result.
    pub fn resolve(file: ConfigFile, overrides: &ConfigOverrides) -> RelayResult<Self> {
        let cert = overrides.cert.clone().or(file.server.cert);
        let key = overrides.key.clone().or(file.server.key);
        if cert.is_some() != key.is_some() {
            return Err(RelayError::Config(
                "TLS needs both a certificate and a key".into(),
            ));
        }

        let inventory = resolve_inventory(
            overrides.inventory_file.clone().or(file.directory.file),
            overrides.inventory_url.clone().or(file.directory.url),
            file.directory.meters,
        )?;

        let handshake_secs = overrides
            .handshake_timeout_secs
            .unwrap_or(file.session.handshake_timeout_secs);
        if handshake_secs == 0 {
            return Err(RelayError::Config("handshake timeout must be positive".into()));
        }
        if file.directory.refresh_secs == 0 {
            return Err(RelayError::Config("directory refresh interval must be positive".into()));
        }
        if file.directory.max_age_secs < file.directory.refresh_secs {
            return Err(RelayError::Config(
                "directory max_age_secs must not be shorter than refresh_secs".into(),
            ));
        }
        if file.session.read_buffer_bytes == 0
            || file.session.command_buffer == 0
            || file.session.outbound_buffer == 0
            || file.session.input_backlog == 0
        {
            return Err(RelayError::Config("session buffers must be non-zero".into()));
        }

        let device_mode = if overrides.local_pty {
            DeviceMode::LocalPty
        } else {
            file.device.mode
        };

        Ok(Self {
            bind: overrides.bind.unwrap_or(file.server.bind),
            port: overrides.port.unwrap_or(file.server.port),
            cert_path: cert.as_deref().map(expand_tilde_str),
            key_path: key.as_deref().map(expand_tilde_str),
            max_sessions: overrides.max_sessions.unwrap_or(file.server.max_sessions),
            max_frame_bytes: file.server.max_frame_bytes,
            handshake_timeout: Duration::from_secs(handshake_secs),
            idle_timeout: match file.session.idle_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            teardown_grace: Duration::from_millis(file.session.teardown_grace_ms),
            read_buffer_bytes: file.session.read_buffer_bytes,
            command_buffer: file.session.command_buffer,
            outbound_buffer: file.session.outbound_buffer,
            input_backlog: file.session.input_backlog,
            refresh_interval: Duration::from_secs(file.directory.refresh_secs),
            max_age: Duration::from_secs(file.directory.max_age_secs),
            inventory,
            device_mode,
            device_host: file.device.host,
            verify_pid: file.device.verify_pid,
            shell: file.device.shell,
            auth_token: file.auth.token,
            allowed_origins: file.auth.allowed_origins,
            allowed_users: file.auth.allowed_users,
            connect_attempts_per_minute: file.auth.connect_attempts_per_minute,
            max_sessions_per_user: file.auth.max_sessions_per_user,
        })
    }

    pub fn tls_enabled(&self) -> bool {
        self.cert_path.is_some() && self.key_path.is_some()
    }
}

/// Parse a TOML document into a [`ConfigFile`].
pub fn parse(content: &str) -> RelayResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| RelayError::Config(format!("config parse error: {e}")))
}

fn resolve_inventory(
    file: Option<String>,
    url: Option<String>,
    meters: Vec<MeterHandle>,
) -> RelayResult<InventoryConfig> {
    let configured = [file.is_some(), url.is_some(), !meters.is_empty()]
        .iter()
        .filter(|set| **set)
        .count();
    if configured > 1 {
        return Err(RelayError::Config(
            "configure only one inventory source (file, url or meters)".into(),
        ));
    }
    Ok(match (file, url) {
        (Some(path), _) => InventoryConfig::File(expand_tilde_str(&path)),
        (_, Some(url)) => InventoryConfig::Url(url),
        _ if !meters.is_empty() => InventoryConfig::Static(meters),
        _ => InventoryConfig::None,
    })
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ServerConfig::resolve(ConfigFile::default(), &ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.port, 8022);
        assert_eq!(cfg.handshake_timeout, Duration::from_secs(10));
        assert_eq!(cfg.idle_timeout, Some(Duration::from_secs(1800)));
        assert_eq!(cfg.input_backlog, 1024);
        assert_eq!(cfg.device_mode, DeviceMode::Tcp);
        assert_eq!(cfg.inventory, InventoryConfig::None);
        assert!(!cfg.tls_enabled());
    }

    #[test]
    fn file_values_and_cli_overrides() {
        let file = parse(
            r#"
            [server]
            port = 9000
            max_sessions = 8

            [session]
            handshake_timeout_secs = 3
            idle_timeout_secs = 0
            input_backlog = 16

            [directory]
            file = "/var/lib/meters/inventory.json"

            [device]
            mode = "local-pty"

            [auth]
            allowed_users = ["op-1"]
            "#,
        )
        .unwrap();
        let overrides = ConfigOverrides {
            port: Some(9100),
            ..Default::default()
        };
        let cfg = ServerConfig::resolve(file, &overrides).unwrap();
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.max_sessions, 8);
        assert_eq!(cfg.handshake_timeout, Duration::from_secs(3));
        assert_eq!(cfg.idle_timeout, None);
        assert_eq!(cfg.input_backlog, 16);
        assert_eq!(cfg.device_mode, DeviceMode::LocalPty);
        assert_eq!(cfg.allowed_users, vec!["op-1".to_string()]);
        assert_eq!(
            cfg.inventory,
            InventoryConfig::File(PathBuf::from("/var/lib/meters/inventory.json"))
        );
    }

    #[test]
    fn static_meters() {
        let file = parse(
            r#"
            [[directory.meters]]
            meterId = "M-001"
            port = 9001
            pid = 4242
            "#,
        )
        .unwrap();
        let cfg = ServerConfig::resolve(file, &ConfigOverrides::default()).unwrap();
        assert_eq!(
            cfg.inventory,
            InventoryConfig::Static(vec![MeterHandle::new("M-001", 9001, 4242)])
        );
    }

    #[test]
    fn two_inventory_sources_rejected() {
        let file = parse(
            r#"
            [directory]
            file = "inventory.json"
            url = "http://inventory.local/meters"
            "#,
        )
        .unwrap();
        assert!(ServerConfig::resolve(file, &ConfigOverrides::default()).is_err());
    }

    #[test]
    fn cert_without_key_rejected() {
        let overrides = ConfigOverrides {
            cert: Some("cert.pem".into()),
            ..Default::default()
        };
        assert!(ServerConfig::resolve(ConfigFile::default(), &overrides).is_err());
    }

    #[test]
    fn max_age_shorter_than_refresh_rejected() {
        let file = parse(
            r#"
            [directory]
            refresh_secs = 10
            max_age_secs = 5
            "#,
        )
        .unwrap();
        assert!(ServerConfig::resolve(file, &ConfigOverrides::default()).is_err());
    }

    #[test]
    fn bad_toml_is_config_error() {
        assert!(matches!(parse("[server\nport = "), Err(RelayError::Config(_))));
    }
}
