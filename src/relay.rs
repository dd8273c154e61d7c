//! The circuit-relay reservation keep-alive.
//!
//! Per configured relay the client walks a small state machine:
//! DISCONNECTED → CONNECTED on a successful dial, CONNECTED → RESERVED
//! once the relay accepts a reservation (observed as a `/p2p-circuit`
//! listen address on the host). A background ticker re-dials and
//! re-reserves on every refresh interval; losing every relay degrades the
//! health report but never kills the daemon.

use std::{sync::Arc, time::Duration};

use ahash::AHashMap;
use libp2p::{Multiaddr, PeerId, multiaddr::Protocol};
use parking_lot::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use service::short_peer;

use crate::{config::RelayDescriptor, network::NetworkHandle};

/// How long the long-running daemon waits after bring-up before it
/// inspects its addresses for the circuit marker.
pub const DAEMON_GRACE: Duration = Duration::from_secs(5);

/// Shorter grace for short-lived invite flows.
pub const INVITE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Disconnected,
    Connected,
    Reserved,
}

impl RelayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Reserved => "reserved",
        }
    }
}

/// The circuit listen address on `relay`: `<relay>/p2p-circuit`.
pub fn circuit_addr(relay: &RelayDescriptor) -> Multiaddr {
    let mut addr = relay.address.clone();
    addr.push(Protocol::P2pCircuit);
    addr
}

/// A dialable relayed address for `target` through `relay`.
pub fn circuit_addr_for(relay: &RelayDescriptor, target: PeerId) -> Multiaddr {
    let mut addr = circuit_addr(relay);
    addr.push(Protocol::P2p(target));
    addr
}

pub struct RelayClient {
    handle: NetworkHandle,
    relays: Vec<RelayDescriptor>,
    states: Arc<RwLock<AHashMap<PeerId, RelayState>>>,
}

impl RelayClient {
    pub fn new(handle: NetworkHandle, relays: Vec<RelayDescriptor>) -> Self {
        let states = relays
            .iter()
            .map(|it| (it.peer, RelayState::Disconnected))
            .collect();

        Self {
            handle,
            relays,
            states: Arc::new(RwLock::new(states)),
        }
    }

    /// Dial every configured relay and request reservations, then wait
    /// `grace` and read back which circuits actually came up.
    pub async fn bring_up(&self, grace: Duration) {
        self.refresh().await;
        tokio::time::sleep(grace).await;
        self.update_states().await;

        for (peer, state) in self.states() {
            log::info!("relay {}: {}", short_peer(&peer), state.as_str());
        }

        if !self.reachable() {
            log::warn!(
                "no relay reservation is live yet; the node may be unreachable from behind NAT"
            );
        }
    }

    /// One refresh pass over every relay: reconnect where the connection
    /// dropped, re-request the reservation where it is missing.
    pub async fn refresh(&self) {
        for relay in &self.relays {
            let connected = self.handle.is_connected(relay.peer).await;

            if !connected {
                if let Err(error) = self
                    .handle
                    .dial(relay.peer, vec![relay.address.clone()])
                    .await
                {
                    log::warn!("relay {} unreachable: {error}", short_peer(&relay.peer));
                    continue;
                }
            }

            if !self.handle.has_reservation(&relay.peer) {
                if let Err(error) = self.handle.listen_on(circuit_addr(relay)).await {
                    log::warn!(
                        "relay {} refused circuit listen: {error}",
                        short_peer(&relay.peer)
                    );
                }
            }
        }

        self.update_states().await;
    }

    async fn update_states(&self) {
        let addrs = self.handle.listen_addrs().await;

        for relay in &self.relays {
            let reserved = self.handle.has_reservation(&relay.peer)
                || has_circuit_through(&addrs, &relay.peer);

            let state = if reserved {
                RelayState::Reserved
            } else if self.handle.is_connected(relay.peer).await {
                RelayState::Connected
            } else {
                RelayState::Disconnected
            };

            self.states.write().insert(relay.peer, state);
        }
    }

    /// Spawn the background ticker that keeps reservations alive.
    pub fn spawn_refresher(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick fires immediately; bring-up already ran.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => self.refresh().await,
                }
            }
        })
    }

    /// Reachability health: at least one live reservation.
    pub fn reachable(&self) -> bool {
        self.states
            .read()
            .values()
            .any(|it| *it == RelayState::Reserved)
    }

    /// Current state per relay, in configuration order.
    pub fn states(&self) -> Vec<(PeerId, RelayState)> {
        let states = self.states.read();
        self.relays
            .iter()
            .map(|it| {
                (
                    it.peer,
                    states.get(&it.peer).copied().unwrap_or(RelayState::Disconnected),
                )
            })
            .collect()
    }

    pub fn relays(&self) -> &[RelayDescriptor] {
        &self.relays
    }
}

fn has_circuit_through(addrs: &[Multiaddr], relay: &PeerId) -> bool {
    addrs.iter().any(|addr| {
        addr.iter().any(|it| matches!(it, Protocol::P2pCircuit))
            && addr.iter().any(|it| it == Protocol::P2p(*relay))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay() -> RelayDescriptor {
        let peer = PeerId::random();
        RelayDescriptor {
            address: format!("/ip4/203.0.113.7/tcp/4001/p2p/{peer}")
                .parse()
                .unwrap(),
            peer,
        }
    }

    #[test]
    fn circuit_addresses_end_in_the_right_suffixes() {
        let relay = relay();
        let target = PeerId::random();

        let listen = circuit_addr(&relay);
        assert!(matches!(listen.iter().last(), Some(Protocol::P2pCircuit)));

        let dial = circuit_addr_for(&relay, target);
        assert!(matches!(dial.iter().last(), Some(Protocol::P2p(it)) if it == target));
        assert!(dial.iter().any(|it| matches!(it, Protocol::P2pCircuit)));
    }

    #[test]
    fn circuit_marker_detection_matches_the_relay() {
        let relay = relay();
        let other = PeerId::random();

        let addr = circuit_addr(&relay);
        assert!(has_circuit_through(std::slice::from_ref(&addr), &relay.peer));
        assert!(!has_circuit_through(std::slice::from_ref(&addr), &other));
        assert!(!has_circuit_through(&[relay.address.clone()], &relay.peer));
    }
}
