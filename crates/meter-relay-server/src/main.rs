//! meter-relay: remote-access relay for meter device shells.
//!
//! Accepts WebSocket connections from the dashboard terminal, resolves the
//! requested meter through the device directory, and bridges the browser
//! terminal to the meter agent's shell.

mod auth;
mod config;
mod device;
mod directory;
mod gateway;
mod server;
mod session;
#[cfg(test)]
mod testing;
mod transport;

use clap::Parser;
use config::{ConfigOverrides, DeviceMode, InventoryConfig, ServerConfig};
use device::{LocalPtyConnector, TcpDeviceConnector};
use directory::{FileInventory, HttpInventory, InventorySource, StaticInventory};
use meter_relay_core::{DeviceConnector, RelayResult};
use server::RelayServer;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// meter-relay: browser terminal relay for meter devices
#[derive(Parser, Debug)]
#[command(name = "meter-relay", version, about = "Remote-access relay for meter device shells")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    bind: Option<IpAddr>,

    /// TLS certificate (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.meter-relay/config.toml")]
    config: String,

    /// Generate self-signed certificate for development
    #[arg(long)]
    generate_cert: bool,

    /// JSON inventory file listing reachable meters
    #[arg(long, conflicts_with = "inventory_url")]
    inventory_file: Option<String>,

    /// HTTP endpoint returning the meter inventory
    #[arg(long)]
    inventory_url: Option<String>,

    /// Device handshake timeout in seconds
    #[arg(long)]
    handshake_timeout: Option<u64>,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Open a local shell instead of dialing meter agents (development only)
    #[arg(long)]
    local_pty: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting meter-relay");

    let (cert, key) = if cli.generate_cert {
        match generate_self_signed_cert() {
            Ok((c, k)) => {
                info!(cert = %c.display(), key = %k.display(), "generated self-signed certificate");
                (
                    Some(c.to_string_lossy().into_owned()),
                    Some(k.to_string_lossy().into_owned()),
                )
            }
            Err(e) => {
                error!(error = %e, "failed to generate self-signed certificate");
                std::process::exit(1);
            }
        }
    } else {
        (cli.cert.clone(), cli.key.clone())
    };

    let overrides = ConfigOverrides {
        bind: cli.bind,
        port: cli.port,
        cert,
        key,
        max_sessions: cli.max_sessions,
        handshake_timeout_secs: cli.handshake_timeout,
        inventory_file: cli.inventory_file.clone(),
        inventory_url: cli.inventory_url.clone(),
        local_pty: cli.local_pty,
    };

    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(Some(&config_path), &overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let tls_config = match (&server_config.cert_path, &server_config.key_path) {
        (Some(cert), Some(key)) => match load_tls_config(cert, key) {
            Ok(cfg) => Some(Arc::new(cfg)),
            Err(e) => {
                error!(error = %e, "failed to load TLS config");
                std::process::exit(1);
            }
        },
        _ => {
            warn!("TLS disabled, serving plain ws://");
            None
        }
    };

    let inventory = match build_inventory(&server_config) {
        Ok(source) => source,
        Err(e) => {
            error!(error = %e, "failed to set up inventory source");
            std::process::exit(1);
        }
    };
    let connector = build_connector(&server_config);

    let relay = RelayServer::new(server_config, connector, inventory);
    if let Err(e) = relay.run(tls_config, shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}

fn build_connector(config: &ServerConfig) -> Arc<dyn DeviceConnector> {
    match config.device_mode {
        DeviceMode::Tcp => {
            info!(host = %config.device_host, verify_pid = config.verify_pid, "device mode: tcp");
            Arc::new(TcpDeviceConnector::new(
                config.device_host.clone(),
                config.verify_pid,
            ))
        }
        DeviceMode::LocalPty => {
            warn!("device mode: local-pty, every meter opens a local shell");
            Arc::new(LocalPtyConnector::new(config.shell.clone()))
        }
    }
}

fn build_inventory(config: &ServerConfig) -> RelayResult<Option<Arc<dyn InventorySource>>> {
    let source: Arc<dyn InventorySource> = match &config.inventory {
        InventoryConfig::File(path) => Arc::new(FileInventory::new(path.clone())),
        InventoryConfig::Url(url) => {
            Arc::new(HttpInventory::new(url.clone(), config.refresh_interval)?)
        }
        InventoryConfig::Static(meters) => Arc::new(StaticInventory::new(meters.clone())),
        InventoryConfig::None => return Ok(None),
    };
    Ok(Some(source))
}

/// Load TLS certificate and key from PEM files, returning a rustls ServerConfig.
fn load_tls_config(
    cert_path: &Path,
    key_path: &Path,
) -> Result<rustls::ServerConfig, Box<dyn std::error::Error>> {
    let cert_pem = std::fs::read(cert_path)
        .map_err(|e| format!("cannot read cert {}: {e}", cert_path.display()))?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| format!("cannot read key {}: {e}", key_path.display()))?;

    let certs: Vec<rustls::pki_types::CertificateDer<'static>> =
        rustls_pemfile::certs(&mut &cert_pem[..]).collect::<Result<Vec<_>, _>>()?;

    let key = rustls_pemfile::private_key(&mut &key_pem[..])?.ok_or("no private key found in PEM")?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut tls_config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    // WebSocket upgrade runs over HTTP/1.1.
    tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(tls_config)
}

/// Generate a self-signed certificate for development use.
fn generate_self_signed_cert() -> Result<(PathBuf, PathBuf), Box<dyn std::error::Error>> {
    let relay_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".meter-relay");
    std::fs::create_dir_all(&relay_dir)?;

    let cert_path = relay_dir.join("cert.pem");
    let key_path = relay_dir.join("key.pem");

    let mut params = rcgen::CertificateParams::new(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ])?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "meter-relay dev cert");

    let key_pair = rcgen::KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    std::fs::write(&cert_path, cert.pem())?;
    std::fs::write(&key_path, key_pair.serialize_pem())?;

    Ok((cert_path, key_path))
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler, waiting for Ctrl+C only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_overrides() {
        let cli = Cli::try_parse_from([
            "meter-relay",
            "--port",
            "9443",
            "--inventory-file",
            "/etc/meters.json",
            "--local-pty",
        ])
        .unwrap();
        assert_eq!(cli.port, Some(9443));
        assert_eq!(cli.inventory_file.as_deref(), Some("/etc/meters.json"));
        assert!(cli.local_pty);
        assert_eq!(cli.config, "~/.meter-relay/config.toml");
    }

    #[test]
    fn cli_rejects_two_inventories() {
        let parsed = Cli::try_parse_from([
            "meter-relay",
            "--inventory-file",
            "a.json",
            "--inventory-url",
            "http://inventory.local/meters",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn generated_cert_loads() {
        let dir = std::env::temp_dir().join(format!("meter-relay-tls-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .self_signed(&key_pair)
            .unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();

        let tls = load_tls_config(&cert_path, &key_path).unwrap();
        assert_eq!(tls.alpn_protocols, vec![b"http/1.1".to_vec()]);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn connector_follows_device_mode() {
        let overrides = ConfigOverrides {
            local_pty: true,
            ..Default::default()
        };
        let cfg = ServerConfig::resolve(config::ConfigFile::default(), &overrides).unwrap();
        assert_eq!(cfg.device_mode, DeviceMode::LocalPty);
        let _connector = build_connector(&cfg);
        assert!(build_inventory(&cfg).unwrap().is_none());
    }
}
