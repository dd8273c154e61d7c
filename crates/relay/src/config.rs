use std::{fs::read_to_string, net::SocketAddr, path::{Path, PathBuf}, str::FromStr};

use anyhow::Result;
use serde::Deserialize;

/// A byte size with the `N[B|KB|MB|GB]` suffix grammar. A bare number is
/// plain bytes.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(try_from = "String")]
pub struct Size(pub u64);

impl FromStr for Size {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        let (digits, multiplier) = if let Some(it) = value.strip_suffix("GB") {
            (it, 1024 * 1024 * 1024)
        } else if let Some(it) = value.strip_suffix("MB") {
            (it, 1024 * 1024)
        } else if let Some(it) = value.strip_suffix("KB") {
            (it, 1024)
        } else if let Some(it) = value.strip_suffix('B') {
            (it, 1)
        } else {
            (value, 1)
        };

        let number: u64 = digits
            .trim()
            .parse()
            .map_err(|_| format!("invalid size: {value}"))?;

        Ok(Self(number * multiplier))
    }
}

impl TryFrom<String> for Size {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Identity {
    #[serde(default = "Identity::key_file")]
    pub key_file: PathBuf,
}

impl Identity {
    fn key_file() -> PathBuf {
        PathBuf::from("relay.key")
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            key_file: Self::key_file(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Network {
    ///
    /// Listen multiaddresses for the relay transport.
    ///
    #[serde(default = "Network::listen")]
    pub listen: Vec<String>,
}

impl Network {
    fn listen() -> Vec<String> {
        vec!["/ip4/0.0.0.0/tcp/4001".to_string()]
    }
}

impl Default for Network {
    fn default() -> Self {
        Self {
            listen: Self::listen(),
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Discovery {
    ///
    /// Private network namespace served by the relay's DHT.
    ///
    #[serde(default)]
    pub network: Option<String>,
}

impl Discovery {
    pub fn namespace(&self) -> &str {
        self.network.as_deref().unwrap_or("peerup")
    }
}

///
/// Resource limits applied to reservations and circuits.
///
/// Per-circuit bandwidth is bounded by the transfer cap; a relay exists
/// to carry interactive service traffic, not bulk backups.
///
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Resources {
    #[serde(default = "Resources::max_reservations")]
    pub max_reservations: usize,
    #[serde(default = "Resources::max_reservations_per_peer")]
    pub max_reservations_per_peer: usize,
    #[serde(default = "Resources::reservation_duration")]
    pub reservation_duration: u64,
    #[serde(default = "Resources::max_circuits")]
    pub max_circuits: usize,
    #[serde(default = "Resources::max_circuits_per_peer")]
    pub max_circuits_per_peer: usize,
    #[serde(default = "Resources::max_circuit_duration")]
    pub max_circuit_duration: u64,
    #[serde(default = "Resources::max_circuit_bytes")]
    pub max_circuit_bytes: Size,
}

impl Resources {
    fn max_reservations() -> usize {
        512
    }

    fn max_reservations_per_peer() -> usize {
        8
    }

    fn reservation_duration() -> u64 {
        3600
    }

    fn max_circuits() -> usize {
        256
    }

    fn max_circuits_per_peer() -> usize {
        16
    }

    fn max_circuit_duration() -> u64 {
        30 * 60
    }

    fn max_circuit_bytes() -> Size {
        Size(512 * 1024 * 1024)
    }
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            max_reservations: Self::max_reservations(),
            max_reservations_per_peer: Self::max_reservations_per_peer(),
            reservation_duration: Self::reservation_duration(),
            max_circuits: Self::max_circuits(),
            max_circuits_per_peer: Self::max_circuits_per_peer(),
            max_circuit_duration: Self::max_circuit_duration(),
            max_circuit_bytes: Self::max_circuit_bytes(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Health {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "Health::listen")]
    pub listen: SocketAddr,
}

impl Health {
    fn listen() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }
}

impl Default for Health {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: Self::listen(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Metrics {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "Metrics::listen_address")]
    pub listen_address: SocketAddr,
}

impl Metrics {
    fn listen_address() -> SocketAddr {
        "127.0.0.1:9090".parse().unwrap()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_address: Self::listen_address(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Audit {
    #[serde(default = "Audit::enabled")]
    pub enabled: bool,
}

impl Audit {
    fn enabled() -> bool {
        true
    }
}

impl Default for Audit {
    fn default() -> Self {
        Self {
            enabled: Self::enabled(),
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Telemetry {
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default)]
    pub audit: Audit,
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub identity: Identity,
    #[serde(default)]
    pub network: Network,
    #[serde(default)]
    pub discovery: Discovery,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub health: Health,
    #[serde(default)]
    pub telemetry: Telemetry,
    #[serde(default)]
    pub log: Log,
}

impl Config {
    ///
    /// Load the configuration, falling back to defaults when no file is
    /// given.
    ///
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Ok(match path {
            Some(path) => toml::from_str(&read_to_string(path)?)?,
            None => Self::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_suffixes_parse() {
        assert_eq!("128".parse::<Size>().unwrap(), Size(128));
        assert_eq!("128B".parse::<Size>().unwrap(), Size(128));
        assert_eq!("128KB".parse::<Size>().unwrap(), Size(128 * 1024));
        assert_eq!("2MB".parse::<Size>().unwrap(), Size(2 * 1024 * 1024));
        assert_eq!("1GB".parse::<Size>().unwrap(), Size(1024 * 1024 * 1024));
        assert!("12TB".parse::<Size>().is_err());
        assert!("lots".parse::<Size>().is_err());
    }

    #[test]
    fn resources_deserialize_with_suffixes() {
        let config: Config = toml::from_str(
            r#"
[resources]
max-circuit-bytes = "64MB"
max-circuits = 32
"#,
        )
        .unwrap();

        assert_eq!(config.resources.max_circuit_bytes, Size(64 * 1024 * 1024));
        assert_eq!(config.resources.max_circuits, 32);
        assert_eq!(config.discovery.namespace(), "peerup");
    }
}
