//! Server configuration.
//!
//! Defaults live in `ServerConfig::default`. A flat `KEY: VALUE` file can override them
//! (all whitespace is stripped from both sides, unknown keys are ignored), and the binary
//! layers command-line flags on top of that.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::constants::{DEFAULT_PORT, MAX_CONNECTIONS};
use crate::reactor::TriggerMode;
use crate::worker_pool::default_workers;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(60_000);
pub const DEFAULT_ROOT: &str = "resources";
pub const DEFAULT_POOL_SIZE: usize = 8;
pub const DEFAULT_LOG_SIZE: usize = 1024;
pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
}

/// Credential-store connection settings. Recorded and logged; the bundled store is
/// in-process so only `pool_size` affects behavior.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreSettings {
    pub url: String,
    pub user: String,
    pub password: String,
    pub schema: String,
    pub pool_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_addr: IpAddr,
    /// 0 binds an ephemeral port. Values loaded from files or flags are already
    /// normalized by [`normalize_port`].
    pub port: u16,
    /// Idle timeout; zero disables eviction.
    pub timeout: Duration,
    pub trigger: TriggerMode,
    pub root: PathBuf,
    pub open_linger: bool,
    pub max_connections: usize,
    pub workers: usize,
    pub log_size: usize,
    pub log_level: String,
    pub store: StoreSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            timeout: DEFAULT_TIMEOUT,
            trigger: TriggerMode::default(),
            root: PathBuf::from(".").join(DEFAULT_ROOT),
            open_linger: false,
            max_connections: MAX_CONNECTIONS,
            workers: default_workers(),
            log_size: DEFAULT_LOG_SIZE,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            store: StoreSettings {
                pool_size: DEFAULT_POOL_SIZE,
                ..StoreSettings::default()
            },
        }
    }
}

/// Ports below 1024 (0 included) are replaced with the default.
pub fn normalize_port(port: u32) -> u16 {
    match u16::try_from(port) {
        Ok(p) if p >= 1024 => p,
        _ => DEFAULT_PORT,
    }
}

/// Connection ceiling kept within `1..=MAX_CONNECTIONS`.
pub fn clamp_connections(n: usize) -> usize {
    n.clamp(1, MAX_CONNECTIONS)
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Apply `KEY: VALUE` lines on top of the defaults.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for (key, value) in parse_pairs(text) {
            config.apply(&key, &value)?;
        }
        Ok(config)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "PORT" => self.port = normalize_port(number(key, value)?),
            "TIMEOUT" => self.timeout = Duration::from_millis(number(key, value)?),
            "TRIGMODE" => self.trigger = TriggerMode::from_code(number(key, value)?),
            // Resolved against the working directory, like the default.
            "PATH" => self.root = PathBuf::from(".").join(value.trim_start_matches('/')),
            "OPENLINGER" => self.open_linger = flag(key, value)?,
            "MAXCONN" => self.max_connections = clamp_connections(number(key, value)?),
            "THREADNUM" => self.workers = number::<usize>(key, value)?.max(1),
            "LOGSIZE" => self.log_size = number(key, value)?,
            "LOGLEVEL" => self.log_level = value.to_ascii_lowercase(),
            "DB_URL" => self.store.url = value.to_string(),
            "USER" => self.store.user = value.to_string(),
            "PASS" => self.store.password = value.to_string(),
            "SCHEMA" => self.store.schema = value.to_string(),
            "POOL_SIZE" => self.store.pool_size = number::<usize>(key, value)?.max(1),
            _ => debug!(key, "ignoring unknown config key"),
        }
        Ok(())
    }
}

fn parse_pairs(text: &str) -> impl Iterator<Item = (String, String)> + '_ {
    text.lines().filter_map(|line| {
        let (key, value) = line.split_once(':')?;
        let key: String = key.chars().filter(|c| !c.is_whitespace()).collect();
        let value: String = value.chars().filter(|c| !c.is_whitespace()).collect();
        if key.is_empty() || key.starts_with('#') {
            return None;
        }
        Some((key, value))
    })
}

fn number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| invalid(key, value))
}

fn flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}
