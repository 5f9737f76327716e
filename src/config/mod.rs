//! Configuration management for the gateway and its client
//!
//! Sources, lowest precedence first: built-in defaults, the TOML file
//! (see [`file`]), then `BEACON_*` environment variables.

pub mod file;

use std::path::{Path, PathBuf};

use secrecy::SecretString;

pub use file::{GatewayConfigFile, config_file_path, load_config_file};

use crate::protocol::{DEFAULT_ROLE, HANDSHAKE_TIMEOUT_MS, MAX_BUFFERED_BYTES, TICK_INTERVAL_MS};
use crate::{Error, Result};

/// Default gateway port
pub const DEFAULT_PORT: u16 = 18789;

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,

    /// Client configuration
    pub client: ClientConfig,

    /// Directory holding the device identity and token cache
    pub state_dir: PathBuf,
}

/// Gateway server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind
    pub bind: String,

    /// Port to listen on
    pub port: u16,

    /// Shared bearer token (from `BEACON_GATEWAY_TOKEN`)
    pub token: Option<SecretString>,

    /// Shared password (from `BEACON_GATEWAY_PASSWORD`)
    pub password: Option<SecretString>,

    pub tick_interval_ms: u64,
    pub max_buffered_bytes: usize,
    pub handshake_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            token: None,
            password: None,
            tick_interval_ms: TICK_INTERVAL_MS,
            max_buffered_bytes: MAX_BUFFERED_BYTES,
            handshake_timeout_ms: HANDSHAKE_TIMEOUT_MS,
        }
    }
}

/// Gateway client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    pub token: Option<SecretString>,
    pub password: Option<SecretString>,
    pub tls_fingerprint: Option<String>,
    pub role: String,
    pub scopes: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: format!("ws://127.0.0.1:{DEFAULT_PORT}"),
            token: None,
            password: None,
            tls_fingerprint: None,
            role: DEFAULT_ROLE.to_string(),
            scopes: Vec::new(),
        }
    }
}

impl Config {
    /// Load from the config file (explicit or default path) and environment
    ///
    /// # Errors
    ///
    /// Returns error if the file is malformed or a value fails validation
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path.map(Path::to_path_buf).or_else(config_file_path) {
            Some(path) => load_config_file(&path)?,
            None => GatewayConfigFile::default(),
        };
        Self::from_sources(file, |key| std::env::var(key).ok())
    }

    /// Build from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a numeric variable does not parse or a value is out
    /// of range
    pub fn from_sources<F>(file: GatewayConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = ServerConfig::default();
        let fs = file.server;
        let server = ServerConfig {
            bind: env("BEACON_BIND").or(fs.bind).unwrap_or(defaults.bind),
            port: parse_env(&env, "BEACON_PORT")?
                .or(fs.port)
                .unwrap_or(defaults.port),
            token: secret(env("BEACON_GATEWAY_TOKEN").or(fs.token)),
            password: secret(env("BEACON_GATEWAY_PASSWORD").or(fs.password)),
            tick_interval_ms: parse_env(&env, "BEACON_TICK_INTERVAL_MS")?
                .or(fs.tick_interval_ms)
                .unwrap_or(defaults.tick_interval_ms),
            max_buffered_bytes: parse_env(&env, "BEACON_MAX_BUFFERED_BYTES")?
                .or(fs.max_buffered_bytes)
                .unwrap_or(defaults.max_buffered_bytes),
            handshake_timeout_ms: parse_env(&env, "BEACON_HANDSHAKE_TIMEOUT_MS")?
                .or(fs.handshake_timeout_ms)
                .unwrap_or(defaults.handshake_timeout_ms),
        };

        let fc = file.client;
        let client_defaults = ClientConfig::default();
        let client = ClientConfig {
            url: env("BEACON_GATEWAY_URL")
                .or(fc.url)
                .unwrap_or(client_defaults.url),
            token: secret(env("BEACON_GATEWAY_TOKEN").or(fc.token)),
            password: secret(env("BEACON_GATEWAY_PASSWORD").or(fc.password)),
            tls_fingerprint: env("BEACON_TLS_FINGERPRINT")
                .or(fc.tls_fingerprint)
                .filter(|f| !f.trim().is_empty()),
            role: env("BEACON_ROLE")
                .or(fc.role)
                .unwrap_or(client_defaults.role),
            scopes: env("BEACON_SCOPES")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .or(fc.scopes)
                .unwrap_or_default(),
        };

        let state_dir = env("BEACON_STATE_DIR")
            .or(file.state_dir)
            .map_or_else(default_state_dir, PathBuf::from);

        let config = Self {
            server,
            client,
            state_dir,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.server.tick_interval_ms < 1_000 {
            return Err(Error::Config(format!(
                "tick interval must be at least 1000ms, got {}",
                self.server.tick_interval_ms
            )));
        }
        if self.server.handshake_timeout_ms == 0 {
            return Err(Error::Config("handshake timeout must be positive".to_string()));
        }
        if self.server.max_buffered_bytes == 0 {
            return Err(Error::Config("max buffered bytes must be positive".to_string()));
        }
        let url = url::Url::parse(&self.client.url)
            .map_err(|e| Error::Config(format!("invalid gateway url {}: {e}", self.client.url)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::Config(format!(
                "gateway url must be ws:// or wss://, got {}",
                self.client.url
            )));
        }
        Ok(())
    }

    /// Device identity file
    #[must_use]
    pub fn identity_path(&self) -> PathBuf {
        self.state_dir.join("identity").join("device.json")
    }

    /// Device token cache file
    #[must_use]
    pub fn device_auth_path(&self) -> PathBuf {
        self.state_dir.join("identity").join("device-auth.json")
    }
}

fn default_state_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".local/share/omni/beacon"),
        |d| d.data_dir().join("omni").join("beacon"),
    )
}

fn secret(value: Option<String>) -> Option<SecretString> {
    value
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::from)
}

fn parse_env<T, F>(env: &F, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    env(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| Error::Config(format!("invalid {key}: {e}")))
        })
        .transpose()
}
