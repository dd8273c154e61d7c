//! Turning a user-typed target into a live connection.
//!
//! Resolution first consults the config's name map, then accepts a raw
//! peer id. Connecting tries, in order: an existing connection, addresses
//! learned from the private DHT, and finally synthesized relay-circuit
//! addresses through every configured relay. Only when all of that fails
//! does the caller see `cannot reach peer`.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::{Result, anyhow, bail};
use libp2p::{Multiaddr, PeerId};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use service::short_peer;

use crate::{
    config::RelayDescriptor,
    network::NetworkHandle,
    relay::circuit_addr_for,
};

/// How often the rendezvous advertisement is refreshed.
const ADVERTISE_INTERVAL: Duration = Duration::from_secs(60);

/// Resolve `target` against the name map, falling back to parsing it as a
/// peer id.
pub fn resolve_name(names: &BTreeMap<String, PeerId>, target: &str) -> Result<PeerId> {
    if let Some(peer) = names.get(target) {
        return Ok(*peer);
    }

    target
        .parse()
        .map_err(|_| anyhow!("cannot resolve target {target:?}"))
}

pub struct Discovery {
    handle: NetworkHandle,
    relays: Vec<RelayDescriptor>,
    names: BTreeMap<String, PeerId>,
    rendezvous: String,
}

impl Discovery {
    pub fn new(
        handle: NetworkHandle,
        relays: Vec<RelayDescriptor>,
        names: BTreeMap<String, PeerId>,
        rendezvous: String,
    ) -> Self {
        Self {
            handle,
            relays,
            names,
            rendezvous,
        }
    }

    pub fn resolve_target(&self, target: &str) -> Result<PeerId> {
        resolve_name(&self.names, target)
    }

    pub fn names(&self) -> &BTreeMap<String, PeerId> {
        &self.names
    }

    /// Ensure a connection to `peer` exists, dialing through the DHT and
    /// the relays as needed.
    pub async fn connect(&self, peer: PeerId) -> Result<()> {
        if self.handle.is_connected(peer).await {
            return Ok(());
        }

        let addrs = self.handle.find_peer(peer).await;
        if !addrs.is_empty() && self.handle.dial(peer, addrs).await.is_ok() {
            return Ok(());
        }

        let circuits: Vec<Multiaddr> = self
            .relays
            .iter()
            .map(|it| circuit_addr_for(it, peer))
            .collect();
        if self.handle.dial(peer, circuits).await.is_ok() {
            return Ok(());
        }

        bail!("cannot reach peer {}", short_peer(&peer))
    }

    /// Seed the DHT routing table with the configured relays and kick off
    /// a bootstrap. The relays are the only bootstrap peers on purpose:
    /// a private namespace must never leak onto a public DHT.
    pub async fn bootstrap(&self) {
        for relay in &self.relays {
            let _ = self
                .handle
                .add_address(relay.peer, relay.address.clone())
                .await;
        }

        let _ = self.handle.bootstrap().await;
        self.advertise().await;
    }

    /// Publish the rendezvous string as a provider record.
    pub async fn advertise(&self) {
        if let Err(error) = self
            .handle
            .advertise(self.rendezvous.as_bytes().to_vec())
            .await
        {
            log::debug!("advertise {:?}: {error}", self.rendezvous);
        }
    }

    /// Advertise at bring-up and once a minute thereafter.
    pub fn spawn_advertiser(
        self: Arc<Self>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ADVERTISE_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.bootstrap().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_win_over_raw_peer_ids() {
        let home = PeerId::random();
        let names = BTreeMap::from([("home".to_string(), home)]);

        assert_eq!(resolve_name(&names, "home").unwrap(), home);

        let raw = PeerId::random();
        assert_eq!(
            resolve_name(&names, &raw.to_base58()).unwrap(),
            raw
        );
    }

    #[test]
    fn unknown_targets_report_cleanly() {
        let error = resolve_name(&BTreeMap::new(), "office")
            .unwrap_err()
            .to_string();
        assert_eq!(error, "cannot resolve target \"office\"");
    }
}
