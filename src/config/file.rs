//! TOML configuration file loading
//!
//! Supports `~/.config/omni/beacon/gateway.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfigFile {
    /// Directory holding the device identity and token cache
    #[serde(default)]
    pub state_dir: Option<String>,

    /// Gateway server configuration
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Gateway client configuration
    #[serde(default)]
    pub client: ClientFileConfig,
}

/// Server configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerFileConfig {
    pub bind: Option<String>,
    pub port: Option<u16>,
    /// Shared bearer token
    pub token: Option<String>,
    pub password: Option<String>,
    pub tick_interval_ms: Option<u64>,
    pub max_buffered_bytes: Option<usize>,
    pub handshake_timeout_ms: Option<u64>,
}

/// Client configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientFileConfig {
    /// `ws://` or `wss://` gateway URL
    pub url: Option<String>,
    pub token: Option<String>,
    pub password: Option<String>,
    /// Expected SHA-256 certificate fingerprint for `wss://`
    pub tls_fingerprint: Option<String>,
    pub role: Option<String>,
    pub scopes: Option<Vec<String>>,
}

/// Load a TOML config file
///
/// A missing file yields the defaults.
///
/// # Errors
///
/// Returns error if the file exists but cannot be read or parsed
pub fn load_config_file(path: &Path) -> Result<GatewayConfigFile> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        return Ok(GatewayConfigFile::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config = toml::from_str(&content)?;
    tracing::info!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Return the config file path: `~/.config/omni/beacon/gateway.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("beacon")
            .join("gateway.toml")
    })
}
