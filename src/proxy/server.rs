//! The exposer half: inbound peer streams bridged onto local TCP
//! services.

use std::sync::Arc;

use futures::StreamExt;
use libp2p::PeerId;
use tokio::net::TcpStream;
use tokio_util::{compat::FuturesAsyncReadCompatExt, sync::CancellationToken};

use service::{authorized::AuthorizedPeers, short_peer};

use crate::{
    config::ServiceSpec,
    network::NetworkHandle,
    observer::Observer,
    proxy::{LOCAL_DIAL_TIMEOUT, pipe},
    statistics::{Statistics, Stats, StatisticsReporter},
};

pub struct Exposer {
    spec: ServiceSpec,
    authorized: Arc<AuthorizedPeers>,
    gating: bool,
    observer: Observer,
    reporter: StatisticsReporter,
}

impl Exposer {
    /// Register the stream handler for one enabled binding and spawn its
    /// accept loop.
    pub fn spawn(
        spec: ServiceSpec,
        handle: &NetworkHandle,
        authorized: Arc<AuthorizedPeers>,
        gating: bool,
        observer: Observer,
        statistics: &Statistics,
        shutdown: CancellationToken,
    ) -> anyhow::Result<tokio::task::JoinHandle<()>> {
        let mut incoming = handle.accept(&spec.protocol)?;

        log::info!(
            "service {:?} exposed: protocol={:?}, local={:?}",
            spec.name,
            spec.protocol,
            spec.local_address
        );

        let exposer = Self {
            reporter: statistics.reporter(&spec.name),
            spec,
            authorized,
            gating,
            observer,
        };

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = incoming.next() => match accepted {
                        Some((peer, stream)) => exposer.on_stream(peer, stream),
                        None => break,
                    },
                }
            }
        }))
    }

    fn on_stream(&self, peer: PeerId, stream: libp2p::Stream) {
        // The gate already ran at the connection level; this re-check is
        // deliberate, a relayed connection may have surfaced after that
        // decision.
        if !self.authorize(&peer) {
            self.observer.stream_rejected(&self.spec.name, &peer);
            drop(stream);
            return;
        }

        let spec = self.spec.clone();
        let observer = self.observer.clone();
        let reporter = self.reporter.clone();

        tokio::spawn(async move {
            serve_one(spec, peer, stream, observer, reporter).await;
        });
    }

    fn authorize(&self, peer: &PeerId) -> bool {
        if self.gating && !self.authorized.contains(peer) {
            return false;
        }

        match &self.spec.allow {
            Some(allow) => allow.contains(peer),
            None => true,
        }
    }
}

async fn serve_one(
    spec: ServiceSpec,
    peer: PeerId,
    stream: libp2p::Stream,
    observer: Observer,
    reporter: StatisticsReporter,
) {
    let local = match tokio::time::timeout(
        LOCAL_DIAL_TIMEOUT,
        TcpStream::connect(&spec.local_address),
    )
    .await
    {
        Ok(Ok(local)) => local,
        Ok(Err(error)) => {
            log::warn!(
                "service {:?}: local dial {:?} failed: {error}",
                spec.name,
                spec.local_address
            );
            reporter.send(&[Stats::StreamsFailed(1)]);
            return;
        }
        Err(_) => {
            log::warn!(
                "service {:?}: local dial {:?} timed out",
                spec.name,
                spec.local_address
            );
            reporter.send(&[Stats::StreamsFailed(1)]);
            return;
        }
    };

    observer.stream_opened(&spec.name, &peer);
    reporter.send(&[Stats::StreamsOpened(1)]);

    match pipe(local, stream.compat()).await {
        Ok((sent, received)) => {
            reporter.send(&[Stats::SendBytes(sent as usize), Stats::ReceivedBytes(received as usize)]);
            observer.stream_closed(&spec.name, &peer, received, sent);
        }
        Err(error) => {
            reporter.send(&[Stats::StreamsFailed(1)]);
            log::debug!(
                "service {:?}: session with {} ended with error: {error}",
                spec.name,
                short_peer(&peer)
            );
        }
    }
}
