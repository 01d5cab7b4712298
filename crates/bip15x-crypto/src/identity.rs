//! Long-lived secp256k1 identity keys and peer IDs.
//!
//! A **peer ID** is the base64url-encoded compressed public key
//! (33 bytes → 44 characters). It names a peer independently of any
//! session's ephemeral keys and is what BIP150 authentication proves.
//!
//! # Example
//!
//! ```
//! use bip15x_crypto::identity::IdentityKeypair;
//!
//! bip15x_crypto::context::init();
//! let keypair = IdentityKeypair::generate().unwrap();
//! println!("Peer ID: {}", keypair.peer_id());
//! assert_eq!(keypair.peer_id().as_str().len(), 44);
//! ```

use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use secp256k1::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::session::PUBKEY_LEN;

/// Peer ID: base64url-encoded compressed secp256k1 public key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    pub fn from_public_key(key: &PublicKey) -> Self {
        Self(URL_SAFE_NO_PAD.encode(key.serialize()))
    }

    /// Parse a peer ID, checking that it encodes a valid curve point.
    pub fn parse(s: &str) -> Result<Self> {
        let id = Self(s.to_string());
        id.to_public_key()?;
        Ok(id)
    }

    pub fn to_public_key(&self) -> Result<PublicKey> {
        let bytes = URL_SAFE_NO_PAD
            .decode(&self.0)
            .context("invalid base64url encoding")?;

        if bytes.len() != PUBKEY_LEN {
            anyhow::bail!(
                "invalid peer ID length: expected {} bytes, got {}",
                PUBKEY_LEN,
                bytes.len()
            );
        }

        PublicKey::from_slice(&bytes).context("peer ID is not a valid secp256k1 point")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PeerId {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

/// secp256k1 identity keypair.
///
/// The secret key is erased on drop.
#[derive(Clone)]
pub struct IdentityKeypair {
    secret: SecretKey,
    public: PublicKey,
}

impl IdentityKeypair {
    /// Generate a new random keypair.
    pub fn generate() -> Result<Self> {
        let secp = crate::context::get()?;
        let (secret, public) = secp.generate_keypair(&mut rand::thread_rng());
        Ok(Self { secret, public })
    }

    /// Create from raw secret key bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        let secp = crate::context::get()?;
        let secret = SecretKey::from_slice(bytes).context("invalid secret key")?;
        let public = PublicKey::from_secret_key(&*secp, &secret);
        Ok(Self { secret, public })
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public)
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn public_key_bytes(&self) -> [u8; PUBKEY_LEN] {
        self.public.serialize()
    }

    /// Get the private key bytes.
    ///
    /// # Security
    /// Handle with care! These bytes can recreate the identity.
    pub fn private_key_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.secret_bytes())
    }

    pub(crate) fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    /// Save keypair to files.
    ///
    /// Private key is saved with restricted permissions (0600 on Unix).
    pub fn save(&self, private_path: impl AsRef<Path>, public_path: impl AsRef<Path>) -> Result<()> {
        let private_path = private_path.as_ref();

        fs::write(private_path, &self.private_key_bytes()[..])
            .with_context(|| format!("failed to write {}", private_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(private_path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(private_path, perms)?;
        }

        fs::write(public_path.as_ref(), self.public_key_bytes())
            .with_context(|| format!("failed to write {}", public_path.as_ref().display()))?;

        Ok(())
    }

    /// Load keypair from private key file.
    pub fn load(private_path: impl AsRef<Path>) -> Result<Self> {
        let bytes = Zeroizing::new(fs::read(private_path).context("failed to read private key")?);

        if bytes.len() != 32 {
            anyhow::bail!("invalid private key length: expected 32 bytes");
        }

        let mut key_bytes = Zeroizing::new([0u8; 32]);
        key_bytes.copy_from_slice(&bytes);
        Self::from_bytes(&key_bytes)
    }

    /// Load only the public key (for verification).
    pub fn load_public(public_path: impl AsRef<Path>) -> Result<PublicIdentity> {
        let bytes = fs::read(public_path).context("failed to read public key")?;
        PublicIdentity::from_bytes(&bytes)
    }
}

impl Drop for IdentityKeypair {
    fn drop(&mut self) {
        self.secret.non_secure_erase();
    }
}

impl fmt::Debug for IdentityKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeypair")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

/// Public identity (public key only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicIdentity {
    key: PublicKey,
}

impl PublicIdentity {
    /// Create from a compressed public key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PUBKEY_LEN {
            anyhow::bail!(
                "invalid public key length: expected {} bytes, got {}",
                PUBKEY_LEN,
                bytes.len()
            );
        }
        let key = PublicKey::from_slice(bytes).context("invalid public key")?;
        Ok(Self { key })
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.key)
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> IdentityKeypair {
        crate::context::init();
        IdentityKeypair::generate().unwrap()
    }

    #[test]
    fn test_keypair_generation() {
        let keypair = keypair();
        assert_eq!(keypair.peer_id().as_str().len(), 44);
        assert!(matches!(keypair.public_key_bytes()[0], 0x02 | 0x03));
    }

    #[test]
    fn test_peer_id_roundtrip() {
        let keypair = keypair();
        let peer_id = keypair.peer_id();

        let parsed = PeerId::parse(peer_id.as_str()).unwrap();
        assert_eq!(parsed, peer_id);
        assert_eq!(&parsed.to_public_key().unwrap(), keypair.public_key());
    }

    #[test]
    fn test_peer_id_rejects_garbage() {
        assert!(PeerId::parse("not base64 !!").is_err());
        assert!(PeerId::parse(&URL_SAFE_NO_PAD.encode([2u8; 32])).is_err());
        assert!(PeerId::parse(&URL_SAFE_NO_PAD.encode([0u8; 33])).is_err());
    }

    #[test]
    fn test_peer_id_serde() {
        let peer_id = keypair().peer_id();
        let json = serde_json::to_string(&peer_id).unwrap();
        assert_eq!(json, format!("\"{}\"", peer_id));
        let back: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, peer_id);
        assert!(serde_json::from_str::<PeerId>("\"AAAA\"").is_err());
    }

    #[test]
    fn test_keypair_bytes_roundtrip() {
        let keypair = keypair();
        let restored = IdentityKeypair::from_bytes(&keypair.private_key_bytes()).unwrap();
        assert_eq!(restored.public_key_bytes(), keypair.public_key_bytes());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let private_path = dir.path().join("identity.key");
        let public_path = dir.path().join("identity.pub");

        let keypair = keypair();
        keypair.save(&private_path, &public_path).unwrap();

        let loaded = IdentityKeypair::load(&private_path).unwrap();
        assert_eq!(loaded.peer_id(), keypair.peer_id());

        let public = IdentityKeypair::load_public(&public_path).unwrap();
        assert_eq!(public.peer_id(), keypair.peer_id());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&private_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_zero_secret_rejected() {
        crate::context::init();
        assert!(IdentityKeypair::from_bytes(&[0u8; 32]).is_err());
    }
}
