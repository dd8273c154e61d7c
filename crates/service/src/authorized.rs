//! The authorized-peer set.
//!
//! A line-oriented text file is the single source of truth for inbound
//! authorization. A non-empty line carries a peer id and an optional
//! `# comment` label; `#+ key=value` lines immediately below an entry
//! attach attributes to it. Blank lines and full-line comments survive
//! every edit, so the file remains pleasant to maintain by hand.
//!
//! Mutations write the whole file through a temporary sibling and rename,
//! and only then update the in-memory set: a failed write leaves both
//! views unchanged. Reads go through an index and never touch the disk.

use std::{
    path::{Path, PathBuf},
    str::FromStr,
};

use ahash::AHashMap;
use libp2p_identity::PeerId;
use parking_lot::RwLock;

use crate::{Error, fs::write_atomic};

/// Maximum accepted length of a single line, in bytes.
pub const MAX_LINE: usize = 512;

const FILE_MODE: u32 = 0o600;

/// One peer in the authorized set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedEntry {
    pub peer: PeerId,
    pub label: Option<String>,
    pub attrs: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
enum Line {
    Blank,
    Comment(String),
    Entry(AuthorizedEntry),
}

#[derive(Default)]
struct Inner {
    lines: Vec<Line>,
    index: AHashMap<PeerId, usize>,
}

impl Inner {
    fn parse(content: &str) -> Result<Self, Error> {
        let mut inner = Self::default();

        for (number, raw) in content.lines().enumerate() {
            if raw.len() > MAX_LINE {
                return Err(Error::LineTooLong(number + 1));
            }

            let trimmed = raw.trim();
            if trimmed.is_empty() {
                inner.lines.push(Line::Blank);
            } else if let Some(rest) = trimmed.strip_prefix("#+") {
                // Attribute lines bind to the entry above them. A stray
                // attribute with no entry is kept as a plain comment so a
                // hand-edited file never fails to load over it.
                let attr = rest
                    .trim()
                    .split_once('=')
                    .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()));

                match (attr, inner.last_entry_mut()) {
                    (Some(attr), Some(entry)) => entry.attrs.push(attr),
                    _ => inner.lines.push(Line::Comment(raw.to_string())),
                }
            } else if trimmed.starts_with('#') {
                inner.lines.push(Line::Comment(raw.to_string()));
            } else {
                let (head, label) = match trimmed.split_once('#') {
                    Some((head, label)) => (head.trim(), Some(label.trim().to_string())),
                    None => (trimmed, None),
                };

                let peer = PeerId::from_str(head)
                    .map_err(|_| Error::InvalidPeerId(head.to_string()))?;
                if inner.index.contains_key(&peer) {
                    return Err(Error::AlreadyAuthorized);
                }

                inner.index.insert(peer, inner.lines.len());
                inner.lines.push(Line::Entry(AuthorizedEntry {
                    peer,
                    label: label.filter(|it| !it.is_empty()),
                    attrs: Vec::new(),
                }));
            }
        }

        Ok(inner)
    }

    fn last_entry_mut(&mut self) -> Option<&mut AuthorizedEntry> {
        self.lines.iter_mut().rev().find_map(|line| match line {
            Line::Entry(entry) => Some(entry),
            _ => None,
        })
    }

    fn render(&self) -> String {
        let mut out = String::new();

        for line in &self.lines {
            match line {
                Line::Blank => out.push('\n'),
                Line::Comment(text) => {
                    out.push_str(text);
                    out.push('\n');
                }
                Line::Entry(entry) => {
                    out.push_str(&entry.peer.to_base58());
                    if let Some(label) = &entry.label {
                        out.push_str(" # ");
                        out.push_str(label);
                    }
                    out.push('\n');

                    for (key, value) in &entry.attrs {
                        out.push_str(&format!("#+ {key}={value}\n"));
                    }
                }
            }
        }

        out
    }

    fn reindex(&mut self) {
        self.index.clear();
        for (position, line) in self.lines.iter().enumerate() {
            if let Line::Entry(entry) = line {
                self.index.insert(entry.peer, position);
            }
        }
    }
}

/// The in-memory authorized-peer set, kept in lockstep with its backing
/// file.
pub struct AuthorizedPeers {
    path: PathBuf,
    inner: RwLock<Inner>,
}

impl AuthorizedPeers {
    /// Load the set from `path`, creating an empty file when it does not
    /// exist. An empty file is a valid set of zero peers.
    pub fn load(path: &Path) -> Result<Self, Error> {
        if !path.exists() {
            write_atomic(path, b"", FILE_MODE)?;
        }

        crate::fs::warn_loose_mode(path);
        let inner = Inner::parse(&std::fs::read_to_string(path)?)?;

        Ok(Self {
            path: path.to_path_buf(),
            inner: RwLock::new(inner),
        })
    }

    /// Append `peer` to the set. Fails with `already authorized` when the
    /// peer is present, leaving file and memory untouched.
    pub fn add(&self, peer: PeerId, label: Option<String>) -> Result<(), Error> {
        let mut inner = self.inner.write();
        if inner.index.contains_key(&peer) {
            return Err(Error::AlreadyAuthorized);
        }

        let mut next = Inner {
            lines: inner.lines.clone(),
            index: AHashMap::new(),
        };
        next.lines.push(Line::Entry(AuthorizedEntry {
            peer,
            label,
            attrs: Vec::new(),
        }));
        next.reindex();

        write_atomic(&self.path, next.render().as_bytes(), FILE_MODE)?;
        *inner = next;
        Ok(())
    }

    /// Remove `peer` and its attribute lines. Fails with `peer not found`
    /// when absent.
    pub fn remove(&self, peer: &PeerId) -> Result<(), Error> {
        let mut inner = self.inner.write();
        let position = *inner.index.get(peer).ok_or(Error::PeerNotFound)?;

        let mut next = Inner {
            lines: inner.lines.clone(),
            index: AHashMap::new(),
        };
        next.lines.remove(position);
        next.reindex();

        write_atomic(&self.path, next.render().as_bytes(), FILE_MODE)?;
        *inner = next;
        Ok(())
    }

    /// Set attribute `key` to `value` on the entry for `peer`, replacing
    /// an existing value for the same key.
    pub fn set_attr(&self, peer: &PeerId, key: &str, value: &str) -> Result<(), Error> {
        let mut inner = self.inner.write();
        let position = *inner.index.get(peer).ok_or(Error::PeerNotFound)?;

        let mut next = Inner {
            lines: inner.lines.clone(),
            index: AHashMap::new(),
        };
        if let Line::Entry(entry) = &mut next.lines[position] {
            match entry.attrs.iter_mut().find(|(it, _)| it == key) {
                Some((_, existing)) => *existing = value.to_string(),
                None => entry.attrs.push((key.to_string(), value.to_string())),
            }
        }
        next.reindex();

        write_atomic(&self.path, next.render().as_bytes(), FILE_MODE)?;
        *inner = next;
        Ok(())
    }

    /// All entries in file order.
    pub fn list(&self) -> Vec<AuthorizedEntry> {
        self.inner
            .read()
            .lines
            .iter()
            .filter_map(|line| match line {
                Line::Entry(entry) => Some(entry.clone()),
                _ => None,
            })
            .collect()
    }

    /// The hot-path membership query used by the connection gate.
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.inner.read().index.contains_key(peer)
    }

    pub fn label_of(&self, peer: &PeerId) -> Option<String> {
        let inner = self.inner.read();
        let position = *inner.index.get(peer)?;
        match &inner.lines[position] {
            Line::Entry(entry) => entry.label.clone(),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-read the backing file and atomically swap the live set. A parse
    /// error leaves the live set unchanged and surfaces a warning.
    pub fn reload(&self) -> Result<usize, Error> {
        let content = std::fs::read_to_string(&self.path)?;
        match Inner::parse(&content) {
            Ok(next) => {
                let count = next.index.len();
                *self.inner.write() = next;
                Ok(count)
            }
            Err(error) => {
                log::warn!(
                    "reload of {} failed, keeping previous set: {error}",
                    self.path.display()
                );
                Err(error)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn set_in(dir: &tempfile::TempDir) -> AuthorizedPeers {
        AuthorizedPeers::load(&dir.path().join("authorized_keys")).unwrap()
    }

    #[test]
    fn empty_file_is_zero_peers() {
        let dir = tempfile::tempdir().unwrap();
        let set = set_in(&dir);

        assert!(set.is_empty());
        assert!(set.list().is_empty());
    }

    #[test]
    fn add_then_remove_restores_original_content() {
        let dir = tempfile::tempdir().unwrap();
        let set = set_in(&dir);

        let keep = PeerId::random();
        set.add(keep, Some("desk".to_string())).unwrap();
        let original = fs::read_to_string(set.path()).unwrap();

        let transient = PeerId::random();
        set.add(transient, None).unwrap();
        set.remove(&transient).unwrap();

        assert_eq!(fs::read_to_string(set.path()).unwrap(), original);
    }

    #[test]
    fn duplicate_add_fails_and_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let set = set_in(&dir);

        let peer = PeerId::random();
        set.add(peer, Some("laptop".to_string())).unwrap();
        let before = fs::read_to_string(set.path()).unwrap();

        assert!(matches!(set.add(peer, None), Err(Error::AlreadyAuthorized)));
        assert_eq!(fs::read_to_string(set.path()).unwrap(), before);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn remove_unknown_peer_fails() {
        let dir = tempfile::tempdir().unwrap();
        let set = set_in(&dir);

        assert!(matches!(
            set.remove(&PeerId::random()),
            Err(Error::PeerNotFound)
        ));
    }

    #[test]
    fn comments_and_blank_lines_survive_edits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");

        let anchor = PeerId::random();
        let content = format!("# devices at home\n\n{} # nas\n", anchor.to_base58());
        fs::write(&path, &content).unwrap();

        let set = AuthorizedPeers::load(&path).unwrap();
        let added = PeerId::random();
        set.add(added, Some("phone".to_string())).unwrap();
        set.remove(&added).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), content);
    }

    #[test]
    fn attributes_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let set = set_in(&dir);

        let peer = PeerId::random();
        set.add(peer, Some("laptop".to_string())).unwrap();
        set.set_attr(&peer, "verified", "9f31c2").unwrap();
        set.set_attr(&peer, "verified", "aa00bb").unwrap();

        let reloaded = AuthorizedPeers::load(set.path()).unwrap();
        let entries = reloaded.list();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].attrs,
            vec![("verified".to_string(), "aa00bb".to_string())]
        );
    }

    #[test]
    fn reload_keeps_live_set_on_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let set = set_in(&dir);

        let peer = PeerId::random();
        set.add(peer, None).unwrap();

        fs::write(set.path(), "not a peer id\n").unwrap();
        assert!(set.reload().is_err());
        assert!(set.contains(&peer));
    }

    #[test]
    fn overlong_line_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");

        fs::write(&path, format!("# {}\n", "x".repeat(600))).unwrap();
        assert!(matches!(
            AuthorizedPeers::load(&path),
            Err(Error::LineTooLong(1))
        ));
    }

    #[test]
    fn list_preserves_file_order() {
        let dir = tempfile::tempdir().unwrap();
        let set = set_in(&dir);

        let peers: Vec<PeerId> = (0..4).map(|_| PeerId::random()).collect();
        for (position, peer) in peers.iter().enumerate() {
            set.add(*peer, Some(format!("device-{position}"))).unwrap();
        }

        let listed: Vec<PeerId> = set.list().into_iter().map(|it| it.peer).collect();
        assert_eq!(listed, peers);
    }
}
