//! The consumer half: local TCP listeners bridged onto remote services.
//!
//! Opening the peer stream retries on a bounded exponential backoff so a
//! transient relay drop does not kill the user's TCP session; the local
//! connection is only reset once the whole budget is spent.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use ahash::AHashMap;
use anyhow::{Result, bail};
use libp2p::PeerId;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::{compat::FuturesAsyncReadCompatExt, sync::CancellationToken};

use service::short_peer;

use crate::{
    discovery::Discovery,
    network::NetworkHandle,
    observer::Observer,
    proxy::pipe,
    statistics::{Statistics, Stats, StatisticsReporter},
};

/// Delays between stream-open retries.
pub const OPEN_RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// Bound on each individual open attempt.
pub const OPEN_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Open a stream to `peer`, re-establishing the connection (possibly over
/// a fresh relay circuit) and retrying on the backoff ladder.
pub async fn open_with_retry(
    handle: &NetworkHandle,
    discovery: &Discovery,
    peer: PeerId,
    protocol: &str,
) -> Result<libp2p::Stream> {
    let mut delays = OPEN_RETRY_DELAYS.iter();

    loop {
        let attempt = async {
            discovery.connect(peer).await?;
            tokio::time::timeout(OPEN_ATTEMPT_TIMEOUT, handle.open_stream(peer, protocol))
                .await
                .map_err(|_| anyhow::anyhow!("stream open timed out"))?
        };

        match attempt.await {
            Ok(stream) => return Ok(stream),
            Err(error) => match delays.next() {
                Some(delay) => {
                    log::debug!(
                        "stream open to {} failed ({error}), retrying in {delay:?}",
                        short_peer(&peer)
                    );
                    tokio::time::sleep(*delay).await;
                }
                None => return Err(error),
            },
        }
    }
}

struct ForwardEntry {
    target: PeerId,
    service: String,
    cancel: CancellationToken,
}

/// Live local listeners, keyed by their bound address. Driven by the
/// admin `proxy.connect` / `proxy.disconnect` operations.
pub struct ForwardManager {
    handle: NetworkHandle,
    discovery: Arc<Discovery>,
    statistics: Statistics,
    observer: Observer,
    shutdown: CancellationToken,
    forwards: Mutex<AHashMap<SocketAddr, ForwardEntry>>,
}

impl ForwardManager {
    pub fn new(
        handle: NetworkHandle,
        discovery: Arc<Discovery>,
        statistics: Statistics,
        observer: Observer,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            handle,
            discovery,
            statistics,
            observer,
            shutdown,
            forwards: Mutex::new(AHashMap::new()),
        }
    }

    /// Bind `local` and forward every accepted connection to `service` on
    /// `target`. Returns the actually bound address.
    pub async fn connect(
        &self,
        local: SocketAddr,
        target: PeerId,
        service: &str,
        protocol: String,
    ) -> Result<SocketAddr> {
        let listener = TcpListener::bind(local).await?;
        let bound = listener.local_addr()?;

        let mut forwards = self.forwards.lock();
        if forwards.contains_key(&bound) {
            bail!("local address {bound} is already forwarded");
        }

        let cancel = self.shutdown.child_token();
        forwards.insert(
            bound,
            ForwardEntry {
                target,
                service: service.to_string(),
                cancel: cancel.clone(),
            },
        );
        drop(forwards);

        log::info!(
            "forward {bound} -> {} service {service:?}",
            short_peer(&target)
        );

        tokio::spawn(run_listener(
            listener,
            target,
            protocol,
            self.handle.clone(),
            self.discovery.clone(),
            self.statistics.reporter(service),
            self.observer.clone(),
            service.to_string(),
            cancel,
        ));

        Ok(bound)
    }

    pub fn disconnect(&self, local: SocketAddr) -> Result<()> {
        let Some(entry) = self.forwards.lock().remove(&local) else {
            bail!("no forward bound on {local}");
        };

        entry.cancel.cancel();
        log::info!("forward {local} -> {} stopped", short_peer(&entry.target));
        Ok(())
    }

    pub fn list(&self) -> Vec<(SocketAddr, PeerId, String)> {
        self.forwards
            .lock()
            .iter()
            .map(|(local, entry)| (*local, entry.target, entry.service.clone()))
            .collect()
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_listener(
    listener: TcpListener,
    target: PeerId,
    protocol: String,
    handle: NetworkHandle,
    discovery: Arc<Discovery>,
    reporter: StatisticsReporter,
    observer: Observer,
    service: String,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((tcp, from)) => {
                    log::debug!("forward accept: from={from}, service={service:?}");

                    let handle = handle.clone();
                    let discovery = discovery.clone();
                    let reporter = reporter.clone();
                    let observer = observer.clone();
                    let protocol = protocol.clone();
                    let service = service.clone();

                    tokio::spawn(async move {
                        forward_one(
                            tcp, target, &protocol, &handle, &discovery, reporter,
                            observer, &service,
                        )
                        .await;
                    });
                }
                Err(error) => {
                    // Not the shutdown signal: keep the listener alive.
                    log::warn!("forward listener error ({error}), continuing");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            },
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn forward_one(
    tcp: TcpStream,
    target: PeerId,
    protocol: &str,
    handle: &NetworkHandle,
    discovery: &Discovery,
    reporter: StatisticsReporter,
    observer: Observer,
    service: &str,
) {
    let stream = match open_with_retry(handle, discovery, target, protocol).await {
        Ok(stream) => stream,
        Err(error) => {
            // Retry budget exhausted; dropping the socket resets the
            // local client.
            log::warn!(
                "cannot open {protocol:?} to {}: {error}",
                short_peer(&target)
            );
            reporter.send(&[Stats::StreamsFailed(1)]);
            return;
        }
    };

    observer.stream_opened(service, &target);
    reporter.send(&[Stats::StreamsOpened(1)]);

    match pipe(tcp, stream.compat()).await {
        Ok((sent, received)) => {
            reporter.send(&[
                Stats::SendBytes(sent as usize),
                Stats::ReceivedBytes(received as usize),
            ]);
            observer.stream_closed(service, &target, received, sent);
        }
        Err(error) => {
            reporter.send(&[Stats::StreamsFailed(1)]);
            log::debug!("forward session ended with error: {error}");
        }
    }
}
