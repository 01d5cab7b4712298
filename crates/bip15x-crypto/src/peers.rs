//! Authorized peer list.
//!
//! A responder only accepts an `authpropose` for identities listed here.
//!
//! # File Format
//!
//! ```json
//! { "version": 1, "peers": { "indexer-eu": "<peer id>", "wallet": "<peer id>" } }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use bip15x_common::{Error, Result};
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// Current file format version.
pub const PEERS_FILE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizedPeers {
    version: u32,
    #[serde(default)]
    peers: BTreeMap<String, PeerId>,
}

impl Default for AuthorizedPeers {
    fn default() -> Self {
        Self {
            version: PEERS_FILE_VERSION,
            peers: BTreeMap::new(),
        }
    }
}

impl AuthorizedPeers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `path`, or start empty if the file does not exist yet.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::not_found(path.display()),
            _ => Error::Io(e),
        })?;
        let peers: Self = serde_json::from_str(&raw)?;
        if peers.version != PEERS_FILE_VERSION {
            return Err(Error::config(format!(
                "unsupported peer list version {} in {}",
                peers.version,
                path.display()
            )));
        }
        Ok(peers)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Add or replace a named peer. Returns the previous ID under that name.
    pub fn insert(&mut self, name: impl Into<String>, id: PeerId) -> Option<PeerId> {
        self.peers.insert(name.into(), id)
    }

    pub fn remove(&mut self, name: &str) -> Option<PeerId> {
        self.peers.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&PeerId> {
        self.peers.get(name)
    }

    /// Name under which `key` is authorized, if any.
    pub fn name_of(&self, key: &PublicKey) -> Option<&str> {
        let id = PeerId::from_public_key(key);
        self.peers
            .iter()
            .find(|(_, peer)| **peer == id)
            .map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PeerId)> {
        self.peers.iter().map(|(name, id)| (name.as_str(), id))
    }

    /// Public keys of every authorized peer.
    pub fn public_keys(&self) -> Result<Vec<PublicKey>> {
        self.peers
            .values()
            .map(|id| id.to_public_key().map_err(Error::crypto))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKeypair;

    fn peer() -> IdentityKeypair {
        crate::context::init();
        IdentityKeypair::generate().unwrap()
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_peers.json");

        let alice = peer();
        let bob = peer();
        let mut peers = AuthorizedPeers::new();
        peers.insert("alice", alice.peer_id());
        peers.insert("bob", bob.peer_id());
        peers.save(&path).unwrap();

        let loaded = AuthorizedPeers::load(&path).unwrap();
        assert_eq!(loaded, peers);
        assert_eq!(loaded.name_of(bob.public_key()), Some("bob"));
        assert_eq!(loaded.public_keys().unwrap().len(), 2);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.json");

        assert!(AuthorizedPeers::load_or_default(&path).unwrap().is_empty());
        assert!(matches!(
            AuthorizedPeers::load(&path),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");
        fs::write(&path, r#"{ "version": 9, "peers": {} }"#).unwrap();

        assert!(matches!(AuthorizedPeers::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_invalid_peer_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");
        fs::write(&path, r#"{ "version": 1, "peers": { "x": "AAAA" } }"#).unwrap();

        assert!(matches!(
            AuthorizedPeers::load(&path),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_insert_replace_remove() {
        let mut peers = AuthorizedPeers::new();
        let first = peer().peer_id();
        let second = peer().peer_id();

        assert_eq!(peers.insert("node", first.clone()), None);
        assert_eq!(peers.insert("node", second.clone()), Some(first));
        assert_eq!(peers.get("node"), Some(&second));
        assert_eq!(peers.len(), 1);
        assert_eq!(peers.remove("node"), Some(second));
        assert!(peers.is_empty());
    }
}
