use std::time::Duration;

use anyhow::Result;
use libp2p::{
    StreamProtocol, identify,
    identity::Keypair,
    kad::{self, store::MemoryStore},
    ping, relay,
    swarm::NetworkBehaviour,
};

/// Bound on a single DHT lookup.
pub const DHT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// The composed behaviour of the node host.
///
/// Kademlia runs under a namespaced protocol id, so nodes of different
/// private networks never exchange routing information even when they
/// share a relay as bootstrap.
#[derive(NetworkBehaviour)]
pub struct Behaviour {
    pub kad: kad::Behaviour<MemoryStore>,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    pub relay_client: relay::client::Behaviour,
    pub stream: libp2p_stream::Behaviour,
}

impl Behaviour {
    pub fn new(
        keypair: &Keypair,
        relay_client: relay::client::Behaviour,
        kad_protocol: StreamProtocol,
    ) -> Self {
        let peer_id = keypair.public().to_peer_id();

        let mut kad_config = kad::Config::new(kad_protocol);
        kad_config.set_query_timeout(DHT_QUERY_TIMEOUT);

        Self {
            kad: kad::Behaviour::with_config(
                peer_id,
                MemoryStore::new(peer_id),
                kad_config,
            ),
            identify: identify::Behaviour::new(identify::Config::new(
                "/peerup/id/1.0.0".to_string(),
                keypair.public(),
            )),
            ping: ping::Behaviour::default(),
            relay_client,
            stream: libp2p_stream::Behaviour::new(),
        }
    }
}

/// The DHT protocol id for a network namespace.
pub fn kad_protocol(namespace: &str) -> Result<StreamProtocol> {
    Ok(StreamProtocol::try_from_owned(format!(
        "/{namespace}/kad/1.0.0"
    ))?)
}
