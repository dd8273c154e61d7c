//! Trust core of the peerup node.
//!
//! Everything that decides *who* may talk to the node lives here: the
//! long-lived device identity, the authorized-peer set backed by a plain
//! text file, and the connection gate consulted by the transport. The crate
//! performs no network IO; the daemon wires it into the swarm.

pub mod authorized;
pub mod fs;
pub mod gate;
pub mod identity;

use std::path::PathBuf;

use libp2p_identity::PeerId;

#[derive(Debug)]
pub enum Error {
    AlreadyAuthorized,
    PeerNotFound,
    InvalidPeerId(String),
    LineTooLong(usize),
    InsecureFile { path: PathBuf, mode: u32 },
    MalformedKey(String),
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyAuthorized => write!(f, "already authorized"),
            Self::PeerNotFound => write!(f, "peer not found"),
            Self::InvalidPeerId(it) => write!(f, "invalid peer id: {it}"),
            Self::LineTooLong(line) => {
                write!(f, "line {line} exceeds the 512 byte limit")
            }
            Self::InsecureFile { path, mode } => write!(
                f,
                "insecure permissions on {} (mode {:04o}): run `chmod 600 {}`",
                path.display(),
                mode,
                path.display()
            ),
            Self::MalformedKey(it) => write!(f, "malformed key material: {it}"),
            Self::Io(it) => write!(f, "{it}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Render a peer id the way it appears in user output: a 16 character
/// prefix of the base58 form followed by an ellipsis.
///
/// # Test
///
/// ```
/// use libp2p_identity::PeerId;
///
/// let peer = PeerId::random();
/// let short = peerup_service::short_peer(&peer);
///
/// assert_eq!(short.chars().count(), 17);
/// assert!(short.ends_with('…'));
/// ```
pub fn short_peer(peer: &PeerId) -> String {
    let base58 = peer.to_base58();
    let prefix: String = base58.chars().take(16).collect();
    format!("{prefix}…")
}
