//! Replica configuration.
//!
//! Everything is environment-driven (the deployment runs one replica per
//! container); binaries layer CLI flags on top. Timeouts that only tests
//! tune are plain fields with defaults.

use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;

pub const DEFAULT_CLIENT_PORT: u16 = 5556;
pub const DEFAULT_REPLICATION_PORT: u16 = 6000;
pub const DEFAULT_ELECTION_PORT: u16 = 6001;
pub const DEFAULT_REGISTRY_PORT: u16 = 5559;
pub const DEFAULT_SYNC_INTERVAL: u64 = 10;
pub const DEFAULT_COORDINATOR_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {var}={value}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Unique replica identifier; also the default advertised host in a
    /// name-per-container deployment.
    pub server_name: String,
    pub data_dir: PathBuf,

    /// Host the three listeners bind on.
    pub bind_host: String,
    /// Host peers should dial; advertised to the registry together with the
    /// actually-bound ports.
    pub advertise_host: String,
    pub client_port: u16,
    pub replication_port: u16,
    pub election_port: u16,

    pub registry_addr: String,
    pub proxy_pub_addr: String,
    pub proxy_sub_addr: String,

    /// Processed mutations between replication pushes (and Berkeley cycles
    /// when coordinator).
    pub sync_interval: u64,
    pub coordinator_timeout: Duration,

    pub heartbeat_interval: Duration,
    pub list_refresh_interval: Duration,
    pub monitor_interval: Duration,
    pub replication_timeout: Duration,
    pub berkeley_timeout: Duration,
    pub election_timeout: Duration,
    pub announcement_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let server_name = default_server_name();
        Self {
            advertise_host: server_name.clone(),
            server_name,
            data_dir: PathBuf::from("/data"),
            bind_host: "0.0.0.0".to_string(),
            client_port: DEFAULT_CLIENT_PORT,
            replication_port: DEFAULT_REPLICATION_PORT,
            election_port: DEFAULT_ELECTION_PORT,
            registry_addr: format!("reference:{DEFAULT_REGISTRY_PORT}"),
            proxy_pub_addr: "proxy:5557".to_string(),
            proxy_sub_addr: "proxy:5558".to_string(),
            sync_interval: DEFAULT_SYNC_INTERVAL,
            coordinator_timeout: Duration::from_secs(DEFAULT_COORDINATOR_TIMEOUT_SECS),
            heartbeat_interval: Duration::from_secs(5),
            list_refresh_interval: Duration::from_secs(20),
            monitor_interval: Duration::from_secs(5),
            replication_timeout: Duration::from_secs(3),
            berkeley_timeout: Duration::from_secs(2),
            election_timeout: Duration::from_secs(5),
            announcement_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Defaults overridden by the recognized environment options.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        apply_env_overrides(&mut config)?;
        Ok(config)
    }

    pub fn client_bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.client_port)
    }

    pub fn replication_bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.replication_port)
    }

    pub fn election_bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.election_port)
    }
}

fn default_server_name() -> String {
    let suffix: u16 = rand::thread_rng().gen_range(1000..10000);
    format!("server_{suffix}")
}

pub fn apply_env_overrides(config: &mut Config) -> Result<(), ConfigError> {
    if let Some(value) = env_trimmed("SERVER_NAME") {
        config.advertise_host = value.clone();
        config.server_name = value;
    }
    if let Some(value) = env_trimmed("DATA_DIR") {
        config.data_dir = PathBuf::from(value);
    }
    if let Some(value) = env_trimmed("BIND_HOST") {
        config.bind_host = value;
    }
    if let Some(value) = env_trimmed("ADVERTISE_HOST") {
        config.advertise_host = value;
    }
    if let Some(value) = env_trimmed("REGISTRY_ADDR") {
        config.registry_addr = value;
    }
    if let Some(value) = env_trimmed("PROXY_PUB_ADDR") {
        config.proxy_pub_addr = value;
    }
    if let Some(value) = env_trimmed("PROXY_SUB_ADDR") {
        config.proxy_sub_addr = value;
    }

    if let Some(port) = parse_env("CLIENT_PORT")? {
        config.client_port = port;
    }
    if let Some(port) = parse_env("REPLICATION_PORT")? {
        config.replication_port = port;
    }
    if let Some(port) = parse_env("ELECTION_PORT")? {
        config.election_port = port;
    }
    if let Some(interval) = parse_env::<u64>("SYNC_INTERVAL")? {
        if interval == 0 {
            return Err(ConfigError::Invalid {
                var: "SYNC_INTERVAL",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        config.sync_interval = interval;
    }
    if let Some(secs) = parse_env::<u64>("COORDINATOR_TIMEOUT_SECS")? {
        config.coordinator_timeout = Duration::from_secs(secs);
    }

    Ok(())
}

fn env_trimmed(var: &str) -> Option<String> {
    let raw = std::env::var(var).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    let Some(raw) = env_trimmed(var) else {
        return Ok(None);
    };
    raw.parse::<T>()
        .map(Some)
        .map_err(|err| ConfigError::Invalid {
            var,
            value: raw,
            reason: err.to_string(),
        })
}
