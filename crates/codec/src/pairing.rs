//! The pairing handshake frames.
//!
//! Both sides open the `/peerup/invite/1.0.0` stream with a fixed 33 byte
//! hello: the version byte followed by an ephemeral X25519 public key.
//! The shared secret never depends on who speaks first, so the same code
//! drives the inviter and the joiner.

use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::{Error, VERSION};

pub const HELLO_LEN: usize = 33;

/// The public half of one side's handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub public: [u8; 32],
}

impl Hello {
    pub fn encode(&self) -> [u8; HELLO_LEN] {
        let mut bytes = [0u8; HELLO_LEN];
        bytes[0] = VERSION;
        bytes[1..].copy_from_slice(&self.public);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != HELLO_LEN {
            return Err(Error::InvalidInput);
        }

        if bytes[0] != VERSION {
            return Err(Error::UnsupportedVersion(bytes[0]));
        }

        Ok(Self {
            public: bytes[1..].try_into()?,
        })
    }
}

/// One side of the ephemeral Diffie-Hellman exchange.
pub struct Handshake {
    secret: EphemeralSecret,
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            secret: EphemeralSecret::random_from_rng(rand::rngs::OsRng),
        }
    }

    pub fn hello(&self) -> Hello {
        Hello {
            public: PublicKey::from(&self.secret).to_bytes(),
        }
    }

    /// Consume the ephemeral secret and produce the shared secret bytes.
    pub fn finish(self, remote: &Hello) -> [u8; 32] {
        self.secret
            .diffie_hellman(&PublicKey::from(remote.public))
            .to_bytes()
    }
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SessionCrypto;

    #[test]
    fn both_sides_agree_on_the_secret() {
        let left = Handshake::new();
        let right = Handshake::new();

        let left_hello = left.hello();
        let right_hello = right.hello();

        assert_eq!(left.finish(&right_hello), right.finish(&left_hello));
    }

    #[test]
    fn hello_round_trip() {
        let handshake = Handshake::new();
        let hello = handshake.hello();

        assert_eq!(Hello::decode(&hello.encode()).unwrap(), hello);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut bytes = Handshake::new().hello().encode();
        bytes[0] = 0x01;

        assert!(matches!(
            Hello::decode(&bytes),
            Err(Error::UnsupportedVersion(0x01))
        ));
    }

    #[test]
    fn full_exchange_with_mismatched_tokens_fails_closed() {
        let inviter = Handshake::new();
        let joiner = Handshake::new();
        let inviter_hello = inviter.hello();
        let joiner_hello = joiner.hello();

        let token = [5u8; 8];
        let inviter_crypto = SessionCrypto::derive(&inviter.finish(&joiner_hello), &token);
        let joiner_crypto =
            SessionCrypto::derive(&joiner.finish(&inviter_hello), &[6u8; 8]);

        let frame = joiner_crypto.seal(b"laptop").unwrap();
        assert!(inviter_crypto.open(&frame).is_err());
    }
}
