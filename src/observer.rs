use std::sync::Arc;

use libp2p::PeerId;

use service::{
    gate::{Decision, DecisionHook, Direction},
    short_peer,
};

use crate::statistics::Statistics;

/// Consumes decision and session events and turns them into log lines and
/// counter updates. The daemon hands its hook to the gate and calls the
/// session methods from the proxy.
#[derive(Clone)]
pub struct Observer {
    statistics: Statistics,
}

impl Observer {
    pub fn new(statistics: Statistics) -> Self {
        Self { statistics }
    }

    /// The gate's decision callback. Constructed once at bring-up.
    pub fn decision_hook(&self) -> DecisionHook {
        let statistics = self.statistics.clone();

        Arc::new(move |peer: &PeerId, direction: Direction, decision: Decision| {
            statistics.gate_decision(decision == Decision::Accept);

            match decision {
                Decision::Accept => log::debug!(
                    "gate: peer={}, direction={:?}, result=accept",
                    short_peer(peer),
                    direction
                ),
                Decision::Reject => log::info!(
                    "gate: peer={}, direction={:?}, result=reject",
                    short_peer(peer),
                    direction
                ),
            }
        })
    }

    pub fn stream_opened(&self, service: &str, peer: &PeerId) {
        log::info!("proxy open: service={:?}, peer={}", service, short_peer(peer));
    }

    pub fn stream_closed(&self, service: &str, peer: &PeerId, received: u64, sent: u64) {
        log::info!(
            "proxy closed: service={:?}, peer={}, received={}, sent={}",
            service,
            short_peer(peer),
            received,
            sent
        );
    }

    pub fn stream_rejected(&self, service: &str, peer: &PeerId) {
        log::warn!(
            "proxy rejected: service={:?}, peer={}, reason=not authorized",
            service,
            short_peer(peer)
        );
    }

    pub fn paired(&self, peer: &PeerId, name: &str) {
        log::info!("paired: peer={}, name={:?}", short_peer(peer), name);
    }

    pub fn invalid_invite(&self, peer: &PeerId) {
        // Deliberately vague: do not leak whether the token, the peer or
        // the relay was wrong.
        log::warn!("invalid invite code from {}", short_peer(peer));
    }
}
