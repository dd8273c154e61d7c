//! The invite code.
//!
//! A v2 code packs everything a joiner needs to find and authenticate an
//! inviter: the one-time token, the relay to dial through, the inviter's
//! peer id and the network namespace. The binary layout is
//!
//! ```text
//! 0x02 ‖ token (8) ‖ u16 len ‖ relay multiaddr ‖ u16 len ‖ peer id ‖ u16 len ‖ namespace
//! ```
//!
//! encoded with the URL-safe base64 alphabet, unpadded, so the code pastes
//! cleanly into chats and terminals. v1 legacy codes are a bare hex token;
//! they are still accepted inbound but never produced.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::{BufMut, BytesMut};
use libp2p_identity::PeerId;
use multiaddr::Multiaddr;

use crate::{Error, TOKEN_LEN, VERSION};

/// A decoded invite, either version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invite {
    /// Legacy cleartext token. Relay and inviter must be known out-of-band.
    V1 { token: [u8; TOKEN_LEN] },
    V2(InviteCode),
}

impl Invite {
    pub fn token(&self) -> &[u8; TOKEN_LEN] {
        match self {
            Self::V1 { token } => token,
            Self::V2(code) => &code.token,
        }
    }
}

/// The full v2 invite payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteCode {
    pub token: [u8; TOKEN_LEN],
    pub relay: Multiaddr,
    pub inviter: PeerId,
    pub namespace: String,
}

impl InviteCode {
    /// Encode to the human-transmissible form.
    ///
    /// # Test
    ///
    /// ```
    /// use libp2p_identity::PeerId;
    /// use peerup_codec::invite::{Invite, InviteCode};
    ///
    /// let code = InviteCode {
    ///     token: [7; 8],
    ///     relay: "/ip4/203.0.113.7/tcp/4001".parse().unwrap(),
    ///     inviter: PeerId::random(),
    ///     namespace: "home-net".to_string(),
    /// };
    ///
    /// let encoded = code.encode();
    /// assert_eq!(InviteCode::decode(&encoded).unwrap(), Invite::V2(code));
    /// ```
    pub fn encode(&self) -> String {
        let relay = self.relay.to_vec();
        let inviter = self.inviter.to_bytes();
        let namespace = self.namespace.as_bytes();

        let mut bytes = BytesMut::with_capacity(
            1 + TOKEN_LEN + 6 + relay.len() + inviter.len() + namespace.len(),
        );
        bytes.put_u8(VERSION);
        bytes.put_slice(&self.token);
        bytes.put_u16(relay.len() as u16);
        bytes.put_slice(&relay);
        bytes.put_u16(inviter.len() as u16);
        bytes.put_slice(&inviter);
        bytes.put_u16(namespace.len() as u16);
        bytes.put_slice(namespace);

        URL_SAFE_NO_PAD.encode(&bytes)
    }

    /// Decode either invite version from its textual form.
    ///
    /// Anything that decodes to a buffer starting with the v2 version byte
    /// is parsed as v2; otherwise the text is read as a v1 hex token.
    pub fn decode(code: &str) -> Result<Invite, Error> {
        let code = code.trim();

        if let Ok(bytes) = URL_SAFE_NO_PAD.decode(code) {
            if bytes.first() == Some(&VERSION) {
                return Self::parse_v2(&bytes[1..]).map(Invite::V2);
            }
        }

        let raw = hex::decode(code).map_err(|_| Error::InvalidInput)?;
        if raw.len() != TOKEN_LEN {
            return Err(Error::InvalidInput);
        }

        let mut token = [0u8; TOKEN_LEN];
        token.copy_from_slice(&raw);
        Ok(Invite::V1 { token })
    }

    fn parse_v2(mut bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < TOKEN_LEN {
            return Err(Error::InvalidInput);
        }

        let mut token = [0u8; TOKEN_LEN];
        token.copy_from_slice(&bytes[..TOKEN_LEN]);
        bytes = &bytes[TOKEN_LEN..];

        let relay = Multiaddr::try_from(take(&mut bytes)?.to_vec())
            .map_err(|_| Error::InvalidInput)?;
        let inviter =
            PeerId::from_bytes(take(&mut bytes)?).map_err(|_| Error::InvalidInput)?;
        let namespace = std::str::from_utf8(take(&mut bytes)?)?.to_string();

        if !bytes.is_empty() {
            return Err(Error::InvalidInput);
        }

        Ok(Self {
            token,
            relay,
            inviter,
            namespace,
        })
    }
}

fn take<'a>(bytes: &mut &'a [u8]) -> Result<&'a [u8], Error> {
    if bytes.len() < 2 {
        return Err(Error::InvalidInput);
    }

    let len = u16::from_be_bytes(bytes[..2].try_into()?) as usize;
    if bytes.len() < 2 + len {
        return Err(Error::InvalidInput);
    }

    let taken = &bytes[2..2 + len];
    *bytes = &bytes[2 + len..];
    Ok(taken)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v2_round_trip_is_lossless() {
        let code = InviteCode {
            token: *b"\x01\x02\x03\x04\x05\x06\x07\x08",
            relay: "/ip4/198.51.100.4/tcp/4001".parse().unwrap(),
            inviter: PeerId::random(),
            namespace: "alpha".to_string(),
        };

        let decoded = InviteCode::decode(&code.encode()).unwrap();
        assert_eq!(decoded, Invite::V2(code));
    }

    #[test]
    fn empty_namespace_round_trips() {
        let code = InviteCode {
            token: [0; 8],
            relay: "/dns4/relay.example.net/tcp/4001".parse().unwrap(),
            inviter: PeerId::random(),
            namespace: String::new(),
        };

        assert_eq!(InviteCode::decode(&code.encode()).unwrap(), Invite::V2(code));
    }

    #[test]
    fn v1_hex_token_is_accepted() {
        let decoded = InviteCode::decode("00ff00ff00ff00ff").unwrap();
        assert_eq!(
            decoded,
            Invite::V1 {
                token: [0x00, 0xff, 0x00, 0xff, 0x00, 0xff, 0x00, 0xff]
            }
        );
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(InviteCode::decode("not an invite").is_err());
        assert!(InviteCode::decode("00ff").is_err());
        assert!(InviteCode::decode("").is_err());
    }

    #[test]
    fn truncated_v2_payload_is_rejected() {
        let code = InviteCode {
            token: [9; 8],
            relay: "/ip4/127.0.0.1/tcp/1".parse().unwrap(),
            inviter: PeerId::random(),
            namespace: "n".to_string(),
        };

        let encoded = code.encode();
        let bytes = URL_SAFE_NO_PAD.decode(&encoded).unwrap();
        let truncated = URL_SAFE_NO_PAD.encode(&bytes[..bytes.len() - 3]);

        assert!(InviteCode::decode(&truncated).is_err());
    }
}
