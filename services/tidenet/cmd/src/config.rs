//! Configuration for the tidenet binary.
//!
//! Values come from a YAML file, then `TIDENET_*` environment variables,
//! then command-line flags (applied in `main`).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tide_net::{client_config, server_config, Limits, TlsOptions};
use tracing::{info, warn};

/// Default listen URL of the echo server
pub const DEFAULT_LISTEN: &str = "tcp://0.0.0.0:9000";
/// Default target of the ping-pong client
pub const DEFAULT_CONNECT: &str = "tcp://127.0.0.1:9000";

/// Binary configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TideConfig {
    /// Transport limits applied to every server and client
    pub limits: Limits,
    /// URL the echo server listens on
    pub listen: String,
    /// URL the ping-pong clients connect to
    pub connect: String,
    /// Certificate material for `tls://` URLs
    pub tls: TlsConfig,
}

/// PEM file locations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Server certificate chain
    pub cert_file: Option<PathBuf>,
    /// Server private key
    pub key_file: Option<PathBuf>,
    /// CA used by clients to verify the server, and by the server to require client certificates
    pub ca_file: Option<PathBuf>,
    /// SNI override for clients
    pub server_name: Option<String>,
}

impl Default for TideConfig {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            listen: DEFAULT_LISTEN.to_string(),
            connect: DEFAULT_CONNECT.to_string(),
            tls: TlsConfig::default(),
        }
    }
}

impl TideConfig {
    /// Load from `config_path` if it exists, then apply environment overrides
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config: Self = serde_yaml::from_str(&content)
                    .with_context(|| format!("failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `TIDENET_*` overrides read through `lookup`
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = lookup("TIDENET_LISTEN") {
            info!("Listen URL overridden by environment: {}", listen);
            self.listen = listen;
        }

        if let Some(connect) = lookup("TIDENET_CONNECT") {
            info!("Connect URL overridden by environment: {}", connect);
            self.connect = connect;
        }

        if let Some(raw) = lookup("TIDENET_SEND_TIMEOUT_MS") {
            match raw.parse::<u64>() {
                Ok(ms) => {
                    self.limits.send_timeout_ms = ms;
                    info!("Send timeout overridden by environment: {}ms", ms);
                }
                Err(_) => warn!("Ignoring TIDENET_SEND_TIMEOUT_MS={:?}", raw),
            }
        }

        if let Some(raw) = lookup("TIDENET_MAX_CONNECTIONS") {
            match raw.parse::<usize>() {
                Ok(max) => {
                    self.limits.max_connections = max;
                    info!("Max connections overridden by environment: {}", max);
                }
                Err(_) => warn!("Ignoring TIDENET_MAX_CONNECTIONS={:?}", raw),
            }
        }
    }
}

impl TlsConfig {
    /// Build the listener side; `None` when no certificate is configured
    pub fn server_options(&self) -> Result<Option<TlsOptions>> {
        let (Some(cert_file), Some(key_file)) = (&self.cert_file, &self.key_file) else {
            return Ok(None);
        };
        let cert = read_pem(cert_file)?;
        let key = read_pem(key_file)?;
        let ca = self.ca_file.as_deref().map(read_pem).transpose()?;
        Ok(Some(TlsOptions {
            server: Some(server_config(&cert, &key, ca.as_deref())?),
            ..TlsOptions::default()
        }))
    }

    /// Build the connecting side; `None` when no CA is configured
    pub fn client_options(&self) -> Result<Option<TlsOptions>> {
        let Some(ca_file) = &self.ca_file else {
            return Ok(None);
        };
        let ca = read_pem(ca_file)?;
        Ok(Some(TlsOptions {
            client: Some(client_config(&ca)?),
            server_name: self.server_name.clone(),
            ..TlsOptions::default()
        }))
    }
}

fn read_pem(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {:?}", path))
}
