//! Authenticated pairing over a short out-of-band code.
//!
//! The inviter registers a one-time token and hands the operator a code
//! carrying it (plus relay, peer id and namespace). The joiner dials the
//! inviter and both sides run an X25519 exchange whose session key is
//! bound to the token: a joiner with the wrong token derives a key that
//! cannot decrypt anything, and the inviter reports nothing more specific
//! than `invalid invite code`. On success both sides add each other to
//! their authorized sets under the exchanged friendly names.
//!
//! The response is followed by an explicit half-close and a read to EOF,
//! so the last frame is flushed through the relay before the stream goes
//! away.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use ahash::AHashMap;
use anyhow::{Context, Result, bail};
use futures::StreamExt;
use libp2p::PeerId;
use parking_lot::Mutex;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::{compat::FuturesAsyncReadCompatExt, sync::CancellationToken};

use codec::{
    MAX_FRAME, TOKEN_LEN,
    crypto::SessionCrypto,
    invite::InviteCode,
    pairing::{HELLO_LEN, Handshake, Hello},
};
use service::authorized::AuthorizedPeers;

use crate::{config::RelayDescriptor, network::NetworkHandle, observer::Observer};

pub const INVITE_PROTOCOL: &str = "/peerup/invite/1.0.0";

/// Default invite lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);

/// Bound on one complete pairing exchange.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(60);

/// Bound on draining the stream to EOF after the half-close.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

struct PendingInvite {
    label: String,
    deadline: Instant,
}

/// Outstanding invites. Tokens are single-use and expire after their TTL.
#[derive(Default)]
pub struct InviteRegistry {
    pending: Mutex<AHashMap<[u8; TOKEN_LEN], PendingInvite>>,
}

impl InviteRegistry {
    /// Create a fresh token valid for `ttl`, labelled with the name the
    /// joiner will know this node by.
    pub fn register(&self, label: &str, ttl: Duration) -> [u8; TOKEN_LEN] {
        let mut token = [0u8; TOKEN_LEN];
        rand::rngs::OsRng.fill_bytes(&mut token);

        self.pending.lock().insert(
            token,
            PendingInvite {
                label: label.to_string(),
                deadline: Instant::now() + ttl,
            },
        );

        token
    }

    /// Whether any unexpired invite is outstanding. Consulted by the
    /// gate's pairing window.
    pub fn has_active(&self) -> bool {
        let mut pending = self.pending.lock();
        pending.retain(|_, it| it.deadline > Instant::now());
        !pending.is_empty()
    }

    fn candidates(&self) -> Vec<[u8; TOKEN_LEN]> {
        let mut pending = self.pending.lock();
        pending.retain(|_, it| it.deadline > Instant::now());
        pending.keys().copied().collect()
    }

    /// Consume a token, returning its label. Single-use: the second call
    /// for the same token returns None.
    fn consume(&self, token: &[u8; TOKEN_LEN]) -> Option<String> {
        let mut pending = self.pending.lock();
        let invite = pending.remove(token)?;
        (invite.deadline > Instant::now()).then_some(invite.label)
    }
}

/// Build the transmissible code for a fresh invite.
pub fn generate(
    registry: &InviteRegistry,
    relays: &[RelayDescriptor],
    inviter: PeerId,
    namespace: &str,
    label: &str,
    ttl: Duration,
) -> Result<String> {
    let relay = relays.first().context("at least one relay is required")?;
    let token = registry.register(label, ttl);

    Ok(InviteCode {
        token,
        relay: relay.address.clone(),
        inviter,
        namespace: namespace.to_string(),
    }
    .encode())
}

/// A completed pairing, seen from the inviter.
#[derive(Debug)]
pub struct Paired {
    /// The joiner's friendly name, now in the authorized set.
    pub name: String,
    /// Short authentication code to compare out-of-band.
    pub short_code: String,
}

/// A completed pairing, seen from the joiner.
#[derive(Debug)]
pub struct Joined {
    pub inviter_name: String,
    pub short_code: String,
}

/// Friendly names end up as comments in the authorized-keys file; reject
/// anything that could break its line format.
fn checked_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty()
        || name.len() > 64
        || name.chars().any(|it| it.is_control() || it == '#')
    {
        bail!("invalid name {name:?}");
    }

    Ok(name.to_string())
}

async fn write_frame<S>(stream: &mut S, bytes: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_u16(bytes.len() as u16).await?;
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let len = stream.read_u16().await? as usize;
    if len > MAX_FRAME {
        bail!("frame of {len} bytes exceeds limit");
    }

    let mut bytes = vec![0u8; len];
    stream.read_exact(&mut bytes).await?;
    Ok(bytes)
}

/// Half-close the write side, then read until the remote closes too.
async fn drain<S>(stream: &mut S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _ = stream.shutdown().await;

    let eof = async {
        let mut sink = [0u8; 256];
        while let Ok(read) = stream.read(&mut sink).await {
            if read == 0 {
                break;
            }
        }
    };
    let _ = tokio::time::timeout(DRAIN_TIMEOUT, eof).await;
}

/// The inviter's side of one pairing stream.
///
/// Which outstanding token the joiner holds is discovered by trial
/// decryption: the token is bound into the session key, so exactly the
/// matching invite can open the first frame.
pub async fn inviter_exchange<S>(
    stream: &mut S,
    peer: PeerId,
    registry: &InviteRegistry,
    authorized: &AuthorizedPeers,
) -> Result<Paired>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut hello = [0u8; HELLO_LEN];
    stream.read_exact(&mut hello).await?;
    let remote = Hello::decode(&hello)?;

    let handshake = Handshake::new();
    stream.write_all(&handshake.hello().encode()).await?;
    stream.flush().await?;

    let shared = handshake.finish(&remote);
    let frame = read_frame(stream).await?;

    let mut matched = None;
    for token in registry.candidates() {
        let crypto = SessionCrypto::derive(&shared, &token);
        if let Ok(plaintext) = crypto.open(&frame) {
            matched = Some((token, crypto, plaintext));
            break;
        }
    }

    let Some((token, crypto, plaintext)) = matched else {
        bail!("invalid invite code");
    };

    let joiner_name = checked_name(std::str::from_utf8(&plaintext)?)?;
    let Some(label) = registry.consume(&token) else {
        bail!("invalid invite code");
    };

    match authorized.add(peer, Some(joiner_name.clone())) {
        Ok(_) => {}
        Err(service::Error::AlreadyAuthorized) => {
            log::debug!("pairing peer was already authorized");
        }
        Err(error) => return Err(error.into()),
    }

    let reply = crypto.seal(format!("OK {label}").as_bytes())?;
    write_frame(stream, &reply).await?;
    drain(stream).await;

    Ok(Paired {
        name: joiner_name,
        short_code: crypto.short_code(),
    })
}

/// The joiner's side of one pairing stream.
pub async fn joiner_exchange<S>(
    stream: &mut S,
    token: &[u8; TOKEN_LEN],
    our_name: &str,
) -> Result<Joined>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let handshake = Handshake::new();
    stream.write_all(&handshake.hello().encode()).await?;
    stream.flush().await?;

    let mut hello = [0u8; HELLO_LEN];
    stream.read_exact(&mut hello).await?;
    let remote = Hello::decode(&hello)?;

    let crypto = SessionCrypto::derive(&handshake.finish(&remote), token);
    write_frame(stream, &crypto.seal(our_name.as_bytes())?).await?;

    let frame = read_frame(stream).await?;
    let Ok(plaintext) = crypto.open(&frame) else {
        bail!("invalid invite code");
    };

    let reply = String::from_utf8(plaintext).context("malformed pairing response")?;
    let Some(inviter_name) = reply.strip_prefix("OK ") else {
        bail!("malformed pairing response");
    };
    let inviter_name = checked_name(inviter_name)?;

    drain(stream).await;

    Ok(Joined {
        inviter_name,
        short_code: crypto.short_code(),
    })
}

/// Accept loop for `/peerup/invite/1.0.0`.
///
/// This is the one handler that unknown peers may reach; everything it
/// does is protected by the token-bound session key instead of the
/// authorized set.
pub fn spawn_inviter(
    handle: &NetworkHandle,
    registry: Arc<InviteRegistry>,
    authorized: Arc<AuthorizedPeers>,
    observer: Observer,
    shutdown: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let mut incoming = handle.accept(INVITE_PROTOCOL)?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = incoming.next() => match accepted {
                    Some((peer, stream)) => {
                        let registry = registry.clone();
                        let authorized = authorized.clone();
                        let observer = observer.clone();

                        tokio::spawn(async move {
                            let mut stream = stream.compat();
                            let exchange = inviter_exchange(
                                &mut stream, peer, &registry, &authorized,
                            );

                            match tokio::time::timeout(EXCHANGE_TIMEOUT, exchange).await {
                                Ok(Ok(paired)) => {
                                    observer.paired(&peer, &paired.name);
                                    log::info!(
                                        "pairing code {}: the joining side must display the same code",
                                        paired.short_code
                                    );
                                }
                                // One message for every failure mode; the
                                // cause must not leak to the network.
                                Ok(Err(_)) | Err(_) => observer.invalid_invite(&peer),
                            }
                        });
                    }
                    None => break,
                },
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authorized_in(dir: &tempfile::TempDir) -> Arc<AuthorizedPeers> {
        Arc::new(AuthorizedPeers::load(&dir.path().join("authorized_keys")).unwrap())
    }

    /// Each side owns its duplex end in its own task, so a side that
    /// bails out drops its end and the other side sees EOF instead of
    /// hanging.
    async fn run_exchange(
        registry: Arc<InviteRegistry>,
        authorized: Arc<AuthorizedPeers>,
        token: [u8; TOKEN_LEN],
        joiner: PeerId,
    ) -> (Result<Paired>, Result<Joined>) {
        let (inviter_end, joiner_end) = tokio::io::duplex(1024);

        let inviter_task = tokio::spawn(async move {
            let mut stream = inviter_end;
            inviter_exchange(&mut stream, joiner, &registry, &authorized).await
        });
        let joiner_task = tokio::spawn(async move {
            let mut stream = joiner_end;
            joiner_exchange(&mut stream, &token, "laptop").await
        });

        (inviter_task.await.unwrap(), joiner_task.await.unwrap())
    }

    #[tokio::test]
    async fn matching_tokens_pair_both_sides() {
        let dir = tempfile::tempdir().unwrap();
        let authorized = authorized_in(&dir);
        let registry = Arc::new(InviteRegistry::default());
        let token = registry.register("home", DEFAULT_TTL);
        let joiner = PeerId::random();

        let (paired, joined) =
            run_exchange(registry.clone(), authorized.clone(), token, joiner).await;

        let paired = paired.unwrap();
        let joined = joined.unwrap();

        assert_eq!(paired.name, "laptop");
        assert_eq!(joined.inviter_name, "home");
        assert_eq!(paired.short_code, joined.short_code);

        assert!(authorized.contains(&joiner));
        assert_eq!(authorized.label_of(&joiner).as_deref(), Some("laptop"));
    }

    #[tokio::test]
    async fn wrong_token_is_an_invalid_invite() {
        let dir = tempfile::tempdir().unwrap();
        let authorized = authorized_in(&dir);
        let registry = Arc::new(InviteRegistry::default());
        let _token = registry.register("home", DEFAULT_TTL);
        let joiner = PeerId::random();

        let (paired, joined) =
            run_exchange(registry.clone(), authorized.clone(), [0xEE; TOKEN_LEN], joiner)
                .await;

        assert_eq!(paired.unwrap_err().to_string(), "invalid invite code");
        assert!(joined.is_err());
        assert!(!authorized.contains(&joiner));
        // The real invite stays outstanding.
        assert!(registry.has_active());
    }

    #[tokio::test]
    async fn tokens_are_single_use() {
        let dir = tempfile::tempdir().unwrap();
        let authorized = authorized_in(&dir);
        let registry = Arc::new(InviteRegistry::default());
        let token = registry.register("home", DEFAULT_TTL);

        let first = PeerId::random();
        let (paired, _) =
            run_exchange(registry.clone(), authorized.clone(), token, first).await;
        paired.unwrap();
        assert!(!registry.has_active());

        let second = PeerId::random();
        let (paired, joined) =
            run_exchange(registry.clone(), authorized.clone(), token, second).await;
        assert!(paired.is_err());
        assert!(joined.is_err());
        assert!(!authorized.contains(&second));
    }

    #[tokio::test]
    async fn expired_invites_do_not_pair() {
        let dir = tempfile::tempdir().unwrap();
        let authorized = authorized_in(&dir);
        let registry = Arc::new(InviteRegistry::default());
        let token = registry.register("home", Duration::ZERO);

        assert!(!registry.has_active());

        let joiner = PeerId::random();
        let (paired, _) =
            run_exchange(registry.clone(), authorized.clone(), token, joiner).await;
        assert!(paired.is_err());
        assert!(!authorized.contains(&joiner));
    }

    #[test]
    fn generated_codes_decode_to_the_registered_token() {
        let registry = InviteRegistry::default();
        let inviter = PeerId::random();
        let relay_peer = PeerId::random();
        let relays = vec![RelayDescriptor {
            address: format!("/ip4/203.0.113.7/tcp/4001/p2p/{relay_peer}")
                .parse()
                .unwrap(),
            peer: relay_peer,
        }];

        let code =
            generate(&registry, &relays, inviter, "home-net", "home", DEFAULT_TTL).unwrap();

        let decoded = match InviteCode::decode(&code).unwrap() {
            codec::invite::Invite::V2(decoded) => decoded,
            other => panic!("expected v2, got {other:?}"),
        };

        assert_eq!(decoded.inviter, inviter);
        assert_eq!(decoded.namespace, "home-net");
        assert!(registry.consume(&decoded.token).is_some());
    }

    #[test]
    fn hostile_names_are_rejected() {
        assert!(checked_name("laptop").is_ok());
        assert!(checked_name("  laptop  ").is_ok());
        assert!(checked_name("").is_err());
        assert!(checked_name("a\nb").is_err());
        assert!(checked_name("a#b").is_err());
        assert!(checked_name(&"x".repeat(80)).is_err());
    }
}
