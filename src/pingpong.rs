//! The configured ping-pong protocol.
//!
//! A trivial echo stream used by the admin `ping` operation to check that
//! a target is reachable and authorized, and to measure the round trip.

use std::{sync::Arc, time::Duration};

use anyhow::{Result, ensure};
use libp2p::PeerId;
use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::{compat::FuturesAsyncReadCompatExt, sync::CancellationToken};

use futures::StreamExt;

use service::{authorized::AuthorizedPeers, short_peer};

use crate::{discovery::Discovery, network::NetworkHandle};

const PAYLOAD_LEN: usize = 32;
const PING_TIMEOUT: Duration = Duration::from_secs(15);

/// Echo every authorized peer's bytes back at them.
pub fn spawn_responder(
    handle: &NetworkHandle,
    protocol: &str,
    authorized: Arc<AuthorizedPeers>,
    gating: bool,
    shutdown: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let mut incoming = handle.accept(protocol)?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = incoming.next() => match accepted {
                    Some((peer, stream)) => {
                        if gating && !authorized.contains(&peer) {
                            log::info!("ping rejected: peer={}", short_peer(&peer));
                            drop(stream);
                            continue;
                        }

                        tokio::spawn(echo(stream));
                    }
                    None => break,
                },
            }
        }
    }))
}

async fn echo(stream: libp2p::Stream) {
    let (mut read, mut write) = tokio::io::split(stream.compat());
    if tokio::io::copy(&mut read, &mut write).await.is_ok() {
        let _ = write.shutdown().await;
    }
}

/// Round-trip a random payload to `target` and report the elapsed time.
pub async fn ping(
    handle: &NetworkHandle,
    discovery: &Discovery,
    target: PeerId,
    protocol: &str,
) -> Result<Duration> {
    let exchange = async {
        discovery.connect(target).await?;
        let stream = handle.open_stream(target, protocol).await?;
        let mut stream = stream.compat();

        let mut payload = [0u8; PAYLOAD_LEN];
        rand::rngs::OsRng.fill_bytes(&mut payload);

        let started = std::time::Instant::now();
        stream.write_all(&payload).await?;
        stream.shutdown().await?;

        let mut reply = [0u8; PAYLOAD_LEN];
        stream.read_exact(&mut reply).await?;
        ensure!(reply == payload, "ping reply did not match");

        Ok(started.elapsed())
    };

    tokio::time::timeout(PING_TIMEOUT, exchange)
        .await
        .map_err(|_| anyhow::anyhow!("ping to {} timed out", short_peer(&target)))?
}
