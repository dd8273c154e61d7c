//! The device identity store.
//!
//! A node is its Ed25519 keypair: the peer id every other device knows it
//! by is derived from the public half. The private key is persisted in the
//! libp2p protobuf encoding, and the store refuses to load a key file that
//! is readable by anyone but the owner.

use std::{fs, path::Path};

use libp2p_identity::{Keypair, PeerId};

use crate::{Error, fs::write_atomic};

const KEY_FILE_MODE: u32 = 0o600;

/// The long-lived identity of this device.
#[derive(Clone, Debug)]
pub struct Identity {
    keypair: Keypair,
}

impl Identity {
    /// Load the identity from `path`, or generate and persist a fresh
    /// Ed25519 keypair when the file does not exist.
    ///
    /// Loading fails when the file has group or other permission bits set,
    /// or when the key material does not decode. Generation writes through
    /// a temporary file so a crash cannot leave a half-written key behind.
    pub fn load_or_create(path: &Path) -> Result<Self, Error> {
        if path.exists() {
            return Self::load(path);
        }

        let keypair = Keypair::generate_ed25519();
        let encoded = keypair
            .to_protobuf_encoding()
            .map_err(|it| Error::MalformedKey(it.to_string()))?;

        write_atomic(path, &encoded, KEY_FILE_MODE)?;
        Ok(Self { keypair })
    }

    fn load(path: &Path) -> Result<Self, Error> {
        crate::fs::require_secret_mode(path)?;

        let keypair = Keypair::from_protobuf_encoding(&fs::read(path)?)
            .map_err(|it| Error::MalformedKey(it.to_string()))?;

        Ok(Self { keypair })
    }

    /// The peer id derived from the public key. Stable across calls for the
    /// same key material.
    pub fn peer_id(&self) -> PeerId {
        self.keypair.public().to_peer_id()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// Convenience wrapper: the peer id stored at `path` without keeping
    /// the identity around.
    pub fn peer_id_at(path: &Path) -> Result<PeerId, Error> {
        Ok(Self::load_or_create(path)?.peer_id())
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, os::unix::fs::PermissionsExt};

    use super::*;

    #[test]
    fn created_identity_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");

        let first = Identity::load_or_create(&path).unwrap().peer_id();
        let second = Identity::load_or_create(&path).unwrap().peer_id();

        assert_eq!(first, second);
        assert_eq!(Identity::peer_id_at(&path).unwrap(), first);
    }

    #[test]
    fn key_file_is_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");

        Identity::load_or_create(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn loose_permissions_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");

        Identity::load_or_create(&path).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let error = Identity::load_or_create(&path).unwrap_err();
        let message = error.to_string();
        assert!(message.contains("identity.key"));
        assert!(message.contains("chmod 600"));
    }

    #[test]
    fn garbage_key_material_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");

        fs::write(&path, b"not a key").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();

        assert!(matches!(
            Identity::load_or_create(&path),
            Err(Error::MalformedKey(_))
        ));
    }
}
