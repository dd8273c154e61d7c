//! Session crypto for the pairing exchange.
//!
//! The session key is derived from the Diffie-Hellman shared secret with
//! the invite token as the HKDF info input. A joiner holding the wrong
//! token therefore derives a key that cannot decrypt anything the inviter
//! sends, and the failure is indistinguishable from any other bad code.

use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit},
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use crate::{Error, TOKEN_LEN};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

/// Authenticated encryption for one pairing session.
pub struct SessionCrypto {
    cipher: ChaCha20Poly1305,
    key: [u8; KEY_LEN],
}

impl SessionCrypto {
    /// Derive the session key from the shared secret, bound to `token`.
    pub fn derive(shared_secret: &[u8; 32], token: &[u8; TOKEN_LEN]) -> Self {
        let mut key = [0u8; KEY_LEN];
        Hkdf::<Sha256>::new(None, shared_secret)
            .expand(token, &mut key)
            .expect("32 bytes is a valid hkdf output length");

        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
            key,
        }
    }

    /// Encrypt `plaintext` into a self-contained frame: a fresh random
    /// nonce followed by the ciphertext and tag.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::InvalidInput)?;

        let mut frame = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        frame.extend_from_slice(&nonce);
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    /// Decrypt a frame produced by `seal`. Any tampering, truncation or
    /// key mismatch yields `DecryptFailed` and nothing else.
    pub fn open(&self, frame: &[u8]) -> Result<Vec<u8>, Error> {
        if frame.len() < NONCE_LEN {
            return Err(Error::DecryptFailed);
        }

        self.cipher
            .decrypt(Nonce::from_slice(&frame[..NONCE_LEN]), &frame[NONCE_LEN..])
            .map_err(|_| Error::DecryptFailed)
    }

    /// A six digit short authentication code both ends display after the
    /// handshake. Equal codes mean equal session keys.
    pub fn short_code(&self) -> String {
        let mut out = [0u8; 4];
        Hkdf::<Sha256>::new(None, &self.key)
            .expand(b"short auth code", &mut out)
            .expect("4 bytes is a valid hkdf output length");

        format!("{:06}", u32::from_be_bytes(out) % 1_000_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: [u8; 32] = [0x42; 32];
    const TOKEN: [u8; TOKEN_LEN] = [1, 2, 3, 4, 5, 6, 7, 8];

    #[test]
    fn seal_open_round_trip() {
        let crypto = SessionCrypto::derive(&SECRET, &TOKEN);
        let frame = crypto.seal(b"laptop").unwrap();

        assert_eq!(crypto.open(&frame).unwrap(), b"laptop");
    }

    #[test]
    fn wrong_token_cannot_open() {
        let sealer = SessionCrypto::derive(&SECRET, &TOKEN);
        let opener = SessionCrypto::derive(&SECRET, &[9; TOKEN_LEN]);

        let frame = sealer.seal(b"laptop").unwrap();
        assert!(matches!(opener.open(&frame), Err(Error::DecryptFailed)));
    }

    #[test]
    fn tampered_frame_cannot_open() {
        let crypto = SessionCrypto::derive(&SECRET, &TOKEN);
        let mut frame = crypto.seal(b"laptop").unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;

        assert!(matches!(crypto.open(&frame), Err(Error::DecryptFailed)));
        assert!(matches!(crypto.open(&frame[..4]), Err(Error::DecryptFailed)));
    }

    #[test]
    fn short_codes_match_for_matching_keys() {
        let left = SessionCrypto::derive(&SECRET, &TOKEN);
        let right = SessionCrypto::derive(&SECRET, &TOKEN);
        let other = SessionCrypto::derive(&SECRET, &[9; TOKEN_LEN]);

        assert_eq!(left.short_code(), right.short_code());
        assert_eq!(left.short_code().len(), 6);
        assert_ne!(left.short_code(), other.short_code());
    }
}
