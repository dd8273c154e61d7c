use std::{collections::BTreeMap, fs::read_to_string, path::{Path, PathBuf}, time::Duration};

use anyhow::{Context, Result, bail, ensure};
use libp2p::{Multiaddr, PeerId, multiaddr::Protocol};
use serde::{Deserialize, Serialize};

/// Highest configuration version this binary understands. A file carrying
/// a greater version was written by a newer binary and is rejected rather
/// than half-interpreted.
pub const CONFIG_VERSION: u32 = 1;

/// Default namespace when `discovery.network` is not set.
pub const DEFAULT_NAMESPACE: &str = "peerup";

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Identity {
    ///
    /// Path of the device key file, relative to the config directory.
    ///
    /// Created on first start; must stay mode 0600.
    ///
    #[serde(default = "Identity::key_file")]
    pub key_file: PathBuf,
}

impl Identity {
    fn key_file() -> PathBuf {
        PathBuf::from("identity.key")
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            key_file: Self::key_file(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Network {
    ///
    /// Transport listen multiaddresses, e.g. `/ip4/0.0.0.0/tcp/0`.
    ///
    /// At least one is required. A port of 0 lets the OS pick.
    ///
    pub listen_addresses: Vec<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Relay {
    ///
    /// Relay server multiaddresses, each ending in `/p2p/<relay peer id>`.
    ///
    /// At least one relay is required: without one the node is unreachable
    /// from behind NAT.
    ///
    pub addresses: Vec<String>,
    ///
    /// Seconds between reservation refreshes on each relay.
    ///
    #[serde(default = "Relay::reservation_interval")]
    pub reservation_interval: u64,
}

impl Relay {
    fn reservation_interval() -> u64 {
        120
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Discovery {
    ///
    /// Rendezvous string advertised on the DHT so peers of the same
    /// network can find this node.
    ///
    pub rendezvous: String,
    ///
    /// Private network namespace. Nodes in different namespaces cannot see
    /// each other even when they share relays.
    ///
    #[serde(default)]
    pub network: Option<String>,
}

impl Discovery {
    pub fn namespace(&self) -> &str {
        self.network.as_deref().unwrap_or(DEFAULT_NAMESPACE)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Security {
    ///
    /// Path of the authorized-peer file, relative to the config directory.
    /// Required while connection gating is enabled.
    ///
    #[serde(default)]
    pub authorized_keys_file: Option<PathBuf>,
    ///
    /// Connection gating. Turning this off accepts every peer and is only
    /// meant for debugging; the daemon warns loudly at startup.
    ///
    #[serde(default = "Security::gating")]
    pub gating: bool,
}

impl Security {
    fn gating() -> bool {
        true
    }
}

impl Default for Security {
    fn default() -> Self {
        Self {
            authorized_keys_file: Some(PathBuf::from("authorized_keys")),
            gating: Self::gating(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct PingPong {
    #[serde(default = "PingPong::id")]
    pub id: String,
}

impl PingPong {
    fn id() -> String {
        "/peerup/ping-pong/1.0.0".to_string()
    }
}

impl Default for PingPong {
    fn default() -> Self {
        Self { id: Self::id() }
    }
}

#[derive(Deserialize, Serialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Protocols {
    #[serde(default)]
    pub ping_pong: PingPong,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct ServiceBinding {
    #[serde(default = "ServiceBinding::enabled")]
    pub enabled: bool,
    ///
    /// Local TCP address the service listens on, e.g. `localhost:22`.
    ///
    pub local_address: String,
    ///
    /// Custom protocol identifier. Defaults to
    /// `/peerup/service/<name>/1.0.0`.
    ///
    #[serde(default)]
    pub protocol: Option<String>,
    ///
    /// Per-service allow-list of peer ids. When absent, every authorized
    /// peer may use the service.
    ///
    #[serde(default)]
    pub allow: Option<Vec<String>>,
}

impl ServiceBinding {
    fn enabled() -> bool {
        true
    }
}

#[derive(Deserialize, Serialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Admin {
    ///
    /// Admin socket path. Defaults to `admin.sock` beside the config.
    ///
    #[serde(default)]
    pub socket: Option<PathBuf>,
    ///
    /// Let CLI subcommands spin up a short-lived node when the daemon is
    /// not running. Off by default.
    ///
    #[serde(default)]
    pub allow_direct: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy)]
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

#[derive(Deserialize, Serialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default = "Config::version")]
    pub version: u32,
    #[serde(default)]
    pub identity: Identity,
    pub network: Network,
    pub relay: Relay,
    pub discovery: Discovery,
    #[serde(default)]
    pub security: Security,
    #[serde(default)]
    pub protocols: Protocols,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceBinding>,
    #[serde(default)]
    pub names: BTreeMap<String, String>,
    #[serde(default)]
    pub admin: Admin,
    #[serde(default)]
    pub log: Log,
}

/// One configured relay, resolved to a dialable address and its peer id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayDescriptor {
    /// Full multiaddress including the `/p2p/<peer>` suffix.
    pub address: Multiaddr,
    pub peer: PeerId,
}

impl RelayDescriptor {
    pub fn parse(value: &str) -> Result<Self> {
        let address: Multiaddr = value
            .parse()
            .with_context(|| format!("invalid relay address {value:?}"))?;

        let peer = match address.iter().last() {
            Some(Protocol::P2p(peer)) => peer,
            _ => bail!("relay address {value:?} must end in /p2p/<relay peer id>"),
        };

        Ok(Self { address, peer })
    }
}

/// A validated service binding ready to be registered on the host.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub protocol: String,
    pub local_address: String,
    pub enabled: bool,
    pub allow: Option<Vec<PeerId>>,
}

/// Service names are a DNS label subset; anything else could smuggle
/// separators into the derived protocol identifier.
pub fn valid_service_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|it| it.is_ascii_lowercase() || it.is_ascii_digit() || "-_.".contains(it))
}

pub fn service_protocol_id(name: &str) -> String {
    format!("/peerup/service/{name}/1.0.0")
}

impl Config {
    fn version() -> u32 {
        CONFIG_VERSION
    }

    ///
    /// Load and validate the configuration at `path`.
    ///
    /// The file SHOULD be mode 0600; loose permissions produce a warning.
    ///
    pub fn load(path: &Path) -> Result<Self> {
        let content = read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;

        service::fs::warn_loose_mode(path);
        Self::parse(&content)
    }

    /// Parse and validate configuration content. Used by `load` and by the
    /// commit-confirmed `apply` to vet a candidate before it touches disk.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.version <= CONFIG_VERSION,
            "config version {} is newer than this binary supports ({})",
            self.version,
            CONFIG_VERSION
        );

        ensure!(
            !self.network.listen_addresses.is_empty(),
            "network.listen-addresses must contain at least one address"
        );
        self.listen_addresses()?;

        ensure!(
            !self.relay.addresses.is_empty(),
            "relay.addresses must contain at least one relay; removing the last relay would make the node unreachable"
        );
        self.relays()?;

        ensure!(
            !self.discovery.rendezvous.is_empty(),
            "discovery.rendezvous must not be empty"
        );

        if let Some(namespace) = &self.discovery.network {
            ensure!(
                valid_service_name(namespace),
                "invalid network namespace {namespace:?}: lowercase letters, digits, '-', '_' and '.' only"
            );
        }

        let ping = &self.protocols.ping_pong.id;
        ensure!(!ping.is_empty(), "protocols.ping-pong.id must not be empty");
        ensure!(
            ping.starts_with('/'),
            "protocols.ping-pong.id must start with '/'"
        );

        if self.security.gating {
            ensure!(
                self.security.authorized_keys_file.is_some(),
                "security.authorized-keys-file is required when connection gating is enabled"
            );
        }

        self.service_specs()?;
        self.name_bindings()?;

        Ok(())
    }

    pub fn listen_addresses(&self) -> Result<Vec<Multiaddr>> {
        self.network
            .listen_addresses
            .iter()
            .map(|it| {
                it.parse()
                    .with_context(|| format!("invalid listen address {it:?}"))
            })
            .collect()
    }

    pub fn relays(&self) -> Result<Vec<RelayDescriptor>> {
        self.relay
            .addresses
            .iter()
            .map(|it| RelayDescriptor::parse(it))
            .collect()
    }

    pub fn reservation_interval(&self) -> Duration {
        Duration::from_secs(self.relay.reservation_interval.max(1))
    }

    pub fn service_specs(&self) -> Result<Vec<ServiceSpec>> {
        let mut specs = Vec::with_capacity(self.services.len());

        for (name, binding) in &self.services {
            ensure!(
                valid_service_name(name),
                "invalid service name {name:?}: lowercase letters, digits, '-', '_' and '.' only"
            );
            ensure!(
                !binding.local_address.is_empty(),
                "service {name:?} has an empty local-address"
            );

            let allow = match &binding.allow {
                None => None,
                Some(peers) => Some(
                    peers
                        .iter()
                        .map(|it| {
                            it.parse().with_context(|| {
                                format!("service {name:?} allow-list has invalid peer id {it:?}")
                            })
                        })
                        .collect::<Result<Vec<PeerId>>>()?,
                ),
            };

            specs.push(ServiceSpec {
                name: name.clone(),
                protocol: binding
                    .protocol
                    .clone()
                    .unwrap_or_else(|| service_protocol_id(name)),
                local_address: binding.local_address.clone(),
                enabled: binding.enabled,
                allow,
            });
        }

        Ok(specs)
    }

    /// The `names` map with its values parsed into peer ids.
    pub fn name_bindings(&self) -> Result<BTreeMap<String, PeerId>> {
        self.names
            .iter()
            .map(|(name, peer)| {
                Ok((
                    name.clone(),
                    peer.parse()
                        .with_context(|| format!("names.{name} has invalid peer id {peer:?}"))?,
                ))
            })
            .collect()
    }

    pub fn key_file_in(&self, dir: &Path) -> PathBuf {
        dir.join(&self.identity.key_file)
    }

    pub fn authorized_keys_file_in(&self, dir: &Path) -> Option<PathBuf> {
        self.security
            .authorized_keys_file
            .as_ref()
            .map(|it| dir.join(it))
    }

    pub fn admin_socket_in(&self, dir: &Path) -> PathBuf {
        match &self.admin.socket {
            Some(socket) => dir.join(socket),
            None => dir.join("admin.sock"),
        }
    }
}

pub mod edit {
    //! Comment-preserving edits of the live config document.
    //!
    //! Join and `relay add` rewrite the operator's file; going through a
    //! document model keeps their comments and formatting intact instead
    //! of regenerating (or string-splicing) the whole file.

    use std::{fs, path::Path};

    use anyhow::{Context, Result, bail};
    use libp2p::PeerId;
    use toml_edit::{DocumentMut, Item, Table, value};

    use service::fs::write_atomic;

    fn load(path: &Path) -> Result<DocumentMut> {
        fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?
            .parse()
            .context("parse config document")
    }

    fn store(path: &Path, document: &DocumentMut) -> Result<()> {
        write_atomic(path, document.to_string().as_bytes(), 0o600)?;
        Ok(())
    }

    /// Point `names.<name>` at `peer`, creating the table if needed.
    pub fn set_name_binding(path: &Path, name: &str, peer: &PeerId) -> Result<()> {
        let mut document = load(path)?;

        let names = document.entry("names").or_insert(Item::Table(Table::new()));
        names
            .as_table_mut()
            .context("names is not a table")?
            .insert(name, value(peer.to_base58()));

        store(path, &document)
    }

    /// Append a relay address unless it is already present. Returns
    /// whether the document changed.
    pub fn add_relay_address(path: &Path, address: &str) -> Result<bool> {
        let mut document = load(path)?;

        let relay = document.entry("relay").or_insert(Item::Table(Table::new()));
        let addresses = relay
            .as_table_mut()
            .context("relay is not a table")?
            .entry("addresses")
            .or_insert(value(toml_edit::Array::new()));
        let array = addresses
            .as_array_mut()
            .context("relay.addresses is not an array")?;

        if array.iter().any(|it| it.as_str() == Some(address)) {
            return Ok(false);
        }

        array.push(address);
        store(path, &document)?;
        Ok(true)
    }

    /// Remove a relay address. Refuses to remove the last one: a node
    /// without relays is unreachable.
    pub fn remove_relay_address(path: &Path, address: &str) -> Result<()> {
        let mut document = load(path)?;

        let array = document
            .get_mut("relay")
            .and_then(|it| it.get_mut("addresses"))
            .and_then(|it| it.as_array_mut())
            .context("relay.addresses is not an array")?;

        let Some(position) = array.iter().position(|it| it.as_str() == Some(address))
        else {
            bail!("relay {address:?} is not configured");
        };

        if array.len() == 1 {
            bail!("refusing to remove the last relay; the node would become unreachable");
        }

        array.remove(position);
        store(path, &document)
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(services: &str) -> String {
        format!(
            r#"
version = 1

[network]
listen-addresses = ["/ip4/0.0.0.0/tcp/0"]

[relay]
addresses = ["/ip4/203.0.113.7/tcp/4001/p2p/{relay}"]

[discovery]
rendezvous = "net-a"

{services}
"#,
            relay = PeerId::random().to_base58(),
            services = services,
        )
    }

    #[test]
    fn minimal_config_loads() {
        let config = Config::parse(&base("")).unwrap();

        assert_eq!(config.discovery.namespace(), DEFAULT_NAMESPACE);
        assert_eq!(config.reservation_interval(), Duration::from_secs(120));
        assert_eq!(config.relays().unwrap().len(), 1);
    }

    #[test]
    fn slash_in_service_name_is_rejected() {
        let bad = base("[services.\"foo/bar\"]\nlocal-address = \"localhost:22\"\n");
        let error = Config::parse(&bad).unwrap_err().to_string();
        assert!(error.contains("foo/bar"), "{error}");

        let good = base("[services.foobar]\nlocal-address = \"localhost:22\"\n");
        let config = Config::parse(&good).unwrap();
        let specs = config.service_specs().unwrap();
        assert_eq!(specs[0].protocol, "/peerup/service/foobar/1.0.0");
    }

    #[test]
    fn uppercase_and_whitespace_names_are_rejected() {
        for name in ["Foo", "foo bar", "foo\nbar"] {
            let bad = base(&format!(
                "[services.{name:?}]\nlocal-address = \"localhost:22\"\n"
            ));
            assert!(Config::parse(&bad).is_err(), "{name:?} should be rejected");
        }
    }

    #[test]
    fn future_version_is_rejected() {
        let bad = base("").replace("version = 1", "version = 99");
        let error = Config::parse(&bad).unwrap_err().to_string();
        assert!(error.contains("newer"), "{error}");
    }

    #[test]
    fn empty_relay_list_is_rejected() {
        let content = r#"
[network]
listen-addresses = ["/ip4/0.0.0.0/tcp/0"]

[relay]
addresses = []

[discovery]
rendezvous = "net-a"
"#;
        let error = Config::parse(content).unwrap_err().to_string();
        assert!(error.contains("at least one relay"), "{error}");
    }

    #[test]
    fn relay_without_peer_id_is_rejected() {
        let content = r#"
[network]
listen-addresses = ["/ip4/0.0.0.0/tcp/0"]

[relay]
addresses = ["/ip4/203.0.113.7/tcp/4001"]

[discovery]
rendezvous = "net-a"
"#;
        let error = Config::parse(content).unwrap_err().to_string();
        assert!(error.contains("/p2p/"), "{error}");
    }

    #[test]
    fn gating_requires_authorized_keys_file() {
        let bad = base("[security]\ngating = true\n");
        let error = Config::parse(&bad).unwrap_err().to_string();
        assert!(error.contains("authorized-keys-file"), "{error}");
    }

    #[test]
    fn custom_protocol_and_disabled_flag_survive() {
        let config = Config::parse(&base(
            "[services.git]\nlocal-address = \"127.0.0.1:9418\"\nenabled = false\nprotocol = \"/custom/git/2.0.0\"\n",
        ))
        .unwrap();

        let specs = config.service_specs().unwrap();
        assert_eq!(specs[0].protocol, "/custom/git/2.0.0");
        assert!(!specs[0].enabled);
    }

    #[test]
    fn reservation_interval_has_a_floor() {
        let mut config = Config::parse(&base("")).unwrap();
        config.relay.reservation_interval = 0;

        assert_eq!(config.reservation_interval(), Duration::from_secs(1));
    }

    #[test]
    fn name_bindings_parse() {
        let peer = PeerId::random();
        let config = Config::parse(&base(&format!(
            "[names]\nhome = \"{}\"\n",
            peer.to_base58()
        )))
        .unwrap();

        assert_eq!(config.name_bindings().unwrap()["home"], peer);

        let bad = base("[names]\nhome = \"not-a-peer\"\n");
        assert!(Config::parse(&bad).is_err());
    }
}
