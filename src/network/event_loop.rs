use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use futures::StreamExt;
use libp2p::{
    Multiaddr, PeerId,
    core::ConnectedPoint,
    identify, kad,
    relay,
    swarm::{Swarm, SwarmEvent, dial_opts::DialOpts},
};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use service::{
    authorized::AuthorizedPeers,
    gate::{Decision, Direction, Gate},
    short_peer,
};

use super::{
    Command,
    behaviour::{Behaviour, BehaviourEvent},
};

/// The single task that owns the swarm.
struct EventLoop {
    gate: Arc<Gate<AuthorizedPeers>>,
    reservations: Arc<RwLock<AHashSet<PeerId>>>,
    pending_dials: AHashMap<PeerId, Vec<oneshot::Sender<Result<(), String>>>>,
    pending_lookups: AHashMap<kad::QueryId, (PeerId, oneshot::Sender<Vec<Multiaddr>>)>,
}

pub(crate) async fn run(
    mut swarm: Swarm<Behaviour>,
    mut cmd_rx: mpsc::Receiver<Command>,
    gate: Arc<Gate<AuthorizedPeers>>,
    reservations: Arc<RwLock<AHashSet<PeerId>>>,
    shutdown: CancellationToken,
) {
    let mut state = EventLoop {
        gate,
        reservations,
        pending_dials: AHashMap::new(),
        pending_lookups: AHashMap::new(),
    };

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = swarm.select_next_some() => state.on_swarm_event(&mut swarm, event),
            command = cmd_rx.recv() => match command {
                Some(command) => state.on_command(&mut swarm, command),
                None => break,
            },
        }
    }
}

impl EventLoop {
    fn on_swarm_event(&mut self, swarm: &mut Swarm<Behaviour>, event: SwarmEvent<BehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                log::info!("listening on {address}");
            }

            SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                // Authorization happens before any protocol handler runs
                // for this peer; handlers re-check on their own because a
                // relayed connection can surface after this decision.
                if matches!(endpoint, ConnectedPoint::Listener { .. })
                    && self.gate.allowed(&peer_id, Direction::Inbound) == Decision::Reject
                {
                    let _ = swarm.disconnect_peer_id(peer_id);
                    self.fail_dials(&peer_id, "rejected by gate");
                    return;
                }

                if let Some(waiters) = self.pending_dials.remove(&peer_id) {
                    for tx in waiters {
                        let _ = tx.send(Ok(()));
                    }
                }
            }

            SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                // The reservation lives on the relay connection; when the
                // last connection to the relay drops, so does reachability
                // through it, until the refresher re-reserves.
                if num_established == 0 && self.reservations.write().remove(&peer_id) {
                    log::warn!("relay connection lost: relay={}", short_peer(&peer_id));
                }
            }

            SwarmEvent::OutgoingConnectionError { peer_id: Some(peer_id), error, .. } => {
                self.fail_dials(&peer_id, &error.to_string());
            }

            SwarmEvent::Behaviour(BehaviourEvent::RelayClient(
                relay::client::Event::ReservationReqAccepted { relay_peer_id, .. },
            )) => {
                log::info!("relay reservation accepted: relay={}", short_peer(&relay_peer_id));
                self.reservations.write().insert(relay_peer_id);
            }

            SwarmEvent::Behaviour(BehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                for addr in info.listen_addrs {
                    swarm.behaviour_mut().kad.add_address(&peer_id, addr);
                }
            }

            SwarmEvent::Behaviour(BehaviourEvent::Kad(kad::Event::OutboundQueryProgressed {
                id,
                result,
                step,
                ..
            })) => {
                self.on_query_progressed(id, result, step.last);
            }

            _ => {}
        }
    }

    fn on_query_progressed(&mut self, id: kad::QueryId, result: kad::QueryResult, last: bool) {
        match result {
            kad::QueryResult::GetClosestPeers(result) => {
                if !last {
                    return;
                }

                let Some((target, tx)) = self.pending_lookups.remove(&id) else {
                    return;
                };

                let peers = match result {
                    Ok(kad::GetClosestPeersOk { peers, .. }) => peers,
                    Err(kad::GetClosestPeersError::Timeout { peers, .. }) => peers,
                };

                let addrs = peers
                    .into_iter()
                    .find(|it| it.peer_id == target)
                    .map(|it| it.addrs)
                    .unwrap_or_default();

                let _ = tx.send(addrs);
            }

            kad::QueryResult::StartProviding(result) => match result {
                Ok(_) => log::debug!("rendezvous advertised"),
                Err(error) => log::debug!("rendezvous advertisement failed: {error}"),
            },

            kad::QueryResult::Bootstrap(result) => {
                if let Err(error) = result {
                    log::debug!("dht bootstrap: {error}");
                }
            }

            _ => {}
        }
    }

    fn on_command(&mut self, swarm: &mut Swarm<Behaviour>, command: Command) {
        match command {
            Command::Dial { peer, addrs, tx } => {
                if swarm.is_connected(&peer) {
                    let _ = tx.send(Ok(()));
                    return;
                }

                let opts = DialOpts::peer_id(peer).addresses(addrs).build();
                match swarm.dial(opts) {
                    Ok(_) => self.pending_dials.entry(peer).or_default().push(tx),
                    Err(error) => {
                        let _ = tx.send(Err(error.to_string()));
                    }
                }
            }

            Command::ListenOn { addr, tx } => {
                let _ = tx.send(
                    swarm
                        .listen_on(addr)
                        .map(|_| ())
                        .map_err(|it| it.to_string()),
                );
            }

            Command::FindPeer { peer, tx } => {
                let id = swarm.behaviour_mut().kad.get_closest_peers(peer);
                self.pending_lookups.insert(id, (peer, tx));
            }

            Command::Advertise { key, tx } => {
                let _ = tx.send(
                    swarm
                        .behaviour_mut()
                        .kad
                        .start_providing(kad::RecordKey::new(&key))
                        .map(|_| ())
                        .map_err(|it| it.to_string()),
                );
            }

            Command::AddAddress { peer, addr } => {
                swarm.behaviour_mut().kad.add_address(&peer, addr);
            }

            Command::Bootstrap => {
                let _ = swarm.behaviour_mut().kad.bootstrap();
            }

            Command::ListenAddrs { tx } => {
                let addrs = swarm
                    .listeners()
                    .cloned()
                    .chain(swarm.external_addresses().cloned())
                    .collect();
                let _ = tx.send(addrs);
            }

            Command::IsConnected { peer, tx } => {
                let _ = tx.send(swarm.is_connected(&peer));
            }

            Command::ConnectedPeers { tx } => {
                let _ = tx.send(swarm.connected_peers().cloned().collect());
            }

            Command::Disconnect { peer } => {
                let _ = swarm.disconnect_peer_id(peer);
            }
        }
    }

    fn fail_dials(&mut self, peer: &PeerId, reason: &str) {
        if let Some(waiters) = self.pending_dials.remove(peer) {
            for tx in waiters {
                let _ = tx.send(Err(reason.to_string()));
            }
        }
    }
}
