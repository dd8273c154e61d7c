//! The connection gate.
//!
//! The transport consults `allowed` twice for every peer: once when the
//! connection is established and again when a protocol stream opens. Both
//! checks go through the same authorization query; the second exists
//! because a relayed connection can surface after the first decision was
//! made.
//!
//! Every decision can be observed through an optional hook. The hook is a
//! plain function value so a daemon with telemetry disabled constructs the
//! gate without paying for it.

use std::sync::Arc;

use libp2p_identity::PeerId;

use crate::authorized::AuthorizedPeers;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject,
}

/// The authorization query the gate is polymorphic over.
pub trait Authorizer: Send + Sync {
    fn is_authorized(&self, peer: &PeerId) -> bool;
}

impl Authorizer for AuthorizedPeers {
    fn is_authorized(&self, peer: &PeerId) -> bool {
        self.contains(peer)
    }
}

pub type DecisionHook = Arc<dyn Fn(&PeerId, Direction, Decision) + Send + Sync>;
pub type PairingWindow = Arc<dyn Fn() -> bool + Send + Sync>;

pub struct Gate<A> {
    authorizer: Arc<A>,
    enabled: bool,
    hook: Option<DecisionHook>,
    pairing: Option<PairingWindow>,
}

impl<A: Authorizer> Gate<A> {
    pub fn new(authorizer: Arc<A>, enabled: bool) -> Self {
        Self {
            authorizer,
            enabled,
            hook: None,
            pairing: None,
        }
    }

    /// Observe every decision, typically for metrics and audit.
    pub fn with_hook(mut self, hook: DecisionHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// While the window reports true, unknown inbound peers are admitted at
    /// the connection level so a pairing stream can reach the invite
    /// handler. Non-invite handlers still re-check membership themselves.
    pub fn with_pairing_window(mut self, window: PairingWindow) -> Self {
        self.pairing = Some(window);
        self
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// The gating decision for `peer`.
    pub fn allowed(&self, peer: &PeerId, direction: Direction) -> Decision {
        let decision = self.decide(peer, direction);

        if let Some(hook) = &self.hook {
            hook(peer, direction, decision);
        }

        decision
    }

    fn decide(&self, peer: &PeerId, direction: Direction) -> Decision {
        if !self.enabled {
            return Decision::Accept;
        }

        if self.authorizer.is_authorized(peer) {
            return Decision::Accept;
        }

        if direction == Direction::Inbound
            && self.pairing.as_ref().is_some_and(|window| window())
        {
            return Decision::Accept;
        }

        Decision::Reject
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    struct FixedSet(Vec<PeerId>);

    impl Authorizer for FixedSet {
        fn is_authorized(&self, peer: &PeerId) -> bool {
            self.0.contains(peer)
        }
    }

    #[test]
    fn members_pass_strangers_do_not() {
        let member = PeerId::random();
        let stranger = PeerId::random();
        let gate = Gate::new(Arc::new(FixedSet(vec![member])), true);

        assert_eq!(gate.allowed(&member, Direction::Inbound), Decision::Accept);
        assert_eq!(gate.allowed(&stranger, Direction::Inbound), Decision::Reject);
        assert_eq!(gate.allowed(&stranger, Direction::Outbound), Decision::Reject);
    }

    #[test]
    fn disabled_gate_accepts_everything() {
        let gate = Gate::new(Arc::new(FixedSet(Vec::new())), false);

        assert_eq!(
            gate.allowed(&PeerId::random(), Direction::Inbound),
            Decision::Accept
        );
    }

    #[test]
    fn pairing_window_admits_unknown_inbound_only() {
        let open = Arc::new(AtomicBool::new(true));
        let window = open.clone();
        let gate = Gate::new(Arc::new(FixedSet(Vec::new())), true)
            .with_pairing_window(Arc::new(move || window.load(Ordering::Relaxed)));

        let stranger = PeerId::random();
        assert_eq!(gate.allowed(&stranger, Direction::Inbound), Decision::Accept);
        assert_eq!(gate.allowed(&stranger, Direction::Outbound), Decision::Reject);

        open.store(false, Ordering::Relaxed);
        assert_eq!(gate.allowed(&stranger, Direction::Inbound), Decision::Reject);
    }

    #[test]
    fn hook_sees_every_decision() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let gate = Gate::new(Arc::new(FixedSet(Vec::new())), true).with_hook(Arc::new(
            move |_, _, decision| {
                if decision == Decision::Reject {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            },
        ));

        gate.allowed(&PeerId::random(), Direction::Inbound);
        gate.allowed(&PeerId::random(), Direction::Inbound);

        assert_eq!(seen.load(Ordering::Relaxed), 2);
    }
}
