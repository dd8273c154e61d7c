//! The TCP ↔ peer-stream proxy.
//!
//! Both halves meet in [`pipe`]: two concurrent copy directions over one
//! pair of endpoints. When one direction reads EOF it shuts down only the
//! write side of the opposite endpoint and lets the other direction
//! finish naturally, so half-close semantics survive end to end. Any copy
//! error tears both sides down.

pub mod client;
pub mod server;

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Bound on dialing the local TCP side of a binding.
pub const LOCAL_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the symmetric copy loop between two byte streams.
///
/// Returns `(a_to_b, b_to_a)` byte counts once both directions are done.
pub async fn pipe<A, B>(a: A, b: B) -> std::io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut read_a, mut write_a) = tokio::io::split(a);
    let (mut read_b, mut write_b) = tokio::io::split(b);

    let a_to_b = async {
        let copied = tokio::io::copy(&mut read_a, &mut write_b).await?;
        write_b.shutdown().await?;
        Ok::<u64, std::io::Error>(copied)
    };

    let b_to_a = async {
        let copied = tokio::io::copy(&mut read_b, &mut write_a).await?;
        write_a.shutdown().await?;
        Ok::<u64, std::io::Error>(copied)
    };

    tokio::try_join!(a_to_b, b_to_a)
}
