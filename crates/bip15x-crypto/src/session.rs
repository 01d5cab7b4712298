//! One direction of an encrypted channel.
//!
//! A [`Session`] owns an ephemeral secp256k1 keypair, derives a [`KeySet`]
//! and session ID from one ECDH exchange, and then seals or opens packets
//! for a single traffic direction. Rekeying is a one-way hash ratchet over
//! the current keys; the session ID and sequence number survive it.

use std::fmt;

use bip15x_common::helpers::short_fingerprint;
use secp256k1::ecdh::shared_secret_point;
use secp256k1::{PublicKey, SecretKey};
use zeroize::Zeroizing;

use crate::cipher::{self, KeySet, AAD_LEN, PACKET_OVERHEAD};
use crate::error::{ChannelError, Result};
use crate::hashes::{hkdf_sha256, INFO_DATA_KEY, INFO_LENGTH_KEY, INFO_SESSION_ID};

/// Length of a compressed secp256k1 public key.
pub const PUBKEY_LEN: usize = 33;
/// Length of a session ID.
pub const SESSION_ID_LEN: usize = 32;
/// Largest payload a 4-byte length field can declare.
const MAX_PACKET_PAYLOAD: u64 = u32::MAX as u64;

/// Traffic direction a session protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionDirection {
    Incoming,
    Outgoing,
}

/// Negotiable AEAD suites. The suite byte travels in `encinit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CipherSuite {
    #[default]
    ChaCha20Poly1305OpenSsh = 0,
}

impl CipherSuite {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Plaintext bytes one key may protect before a rekey is required.
    pub fn max_bytes_per_key(self) -> u64 {
        match self {
            CipherSuite::ChaCha20Poly1305OpenSsh => 1_000_000_000,
        }
    }
}

impl TryFrom<u8> for CipherSuite {
    type Error = ChannelError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CipherSuite::ChaCha20Poly1305OpenSsh),
            other => Err(ChannelError::UnsupportedCipherSuite(other)),
        }
    }
}

/// True iff `buf` is the 33-byte all-zero rekey signal.
pub fn is_zero_rekey_signal(buf: &[u8]) -> bool {
    buf.len() == PUBKEY_LEN && buf.iter().all(|&b| b == 0)
}

/// Keys and identifier produced by the handshake.
struct Established {
    keys: KeySet,
    session_id: Zeroizing<[u8; SESSION_ID_LEN]>,
}

/// Unidirectional cryptographic ratchet.
pub struct Session {
    direction: SessionDirection,
    /// Used for exactly one ECDH, then erased.
    ephemeral_secret: Option<SecretKey>,
    ephemeral_public: PublicKey,
    cipher_suite: CipherSuite,
    established: Option<Established>,
    seq: u32,
    bytes_since_rekey: u64,
    saw_encinit: bool,
    saw_encack: bool,
}

impl Session {
    /// Create a session with a fresh ephemeral keypair.
    pub fn new(direction: SessionDirection) -> Result<Self> {
        let secp = crate::context::get()?;
        let (secret, public) = secp.generate_keypair(&mut rand::thread_rng());

        Ok(Self {
            direction,
            ephemeral_secret: Some(secret),
            ephemeral_public: public,
            cipher_suite: CipherSuite::default(),
            established: None,
            seq: 0,
            bytes_since_rekey: 0,
            saw_encinit: false,
            saw_encack: false,
        })
    }

    pub fn direction(&self) -> SessionDirection {
        self.direction
    }

    /// Our ephemeral public key, compressed.
    pub fn ephemeral_public_key(&self) -> [u8; PUBKEY_LEN] {
        self.ephemeral_public.serialize()
    }

    pub fn cipher_suite(&self) -> CipherSuite {
        self.cipher_suite
    }

    /// Session ID, available once the shared keys are derived.
    pub fn session_id(&self) -> Option<&[u8; SESSION_ID_LEN]> {
        self.established.as_ref().map(|e| &*e.session_id)
    }

    /// Current key material, available once the shared keys are derived.
    pub fn keys(&self) -> Option<&KeySet> {
        self.established.as_ref().map(|e| &e.keys)
    }

    pub fn sequence_number(&self) -> u32 {
        self.seq
    }

    pub fn bytes_since_rekey(&self) -> u64 {
        self.bytes_since_rekey
    }

    pub fn is_established(&self) -> bool {
        self.established.is_some()
    }

    /// Whether the ephemeral private key has been erased.
    pub fn ephemeral_secret_wiped(&self) -> bool {
        self.ephemeral_secret.is_none()
    }

    pub fn saw_encinit(&self) -> bool {
        self.saw_encinit
    }

    pub fn saw_encack(&self) -> bool {
        self.saw_encack
    }

    pub(crate) fn mark_encinit(&mut self) {
        self.saw_encinit = true;
    }

    pub(crate) fn mark_encack(&mut self) {
        self.saw_encack = true;
    }

    /// Run ECDH against the peer's ephemeral key and derive the keyset and
    /// session ID.
    ///
    /// The ephemeral private key is consumed and erased whether or not the
    /// derivation succeeds past the ECDH step; a second call fails with
    /// [`ChannelError::InvalidHandshake`].
    pub fn derive_shared_keys(&mut self, peer_public_key: &[u8], cipher_suite: u8) -> Result<()> {
        let suite = CipherSuite::try_from(cipher_suite)?;

        if peer_public_key.len() != PUBKEY_LEN {
            return Err(ChannelError::InvalidPeerKey);
        }
        let peer =
            PublicKey::from_slice(peer_public_key).map_err(|_| ChannelError::InvalidPeerKey)?;

        let mut secret = self
            .ephemeral_secret
            .take()
            .ok_or(ChannelError::InvalidHandshake)?;
        let point = Zeroizing::new(shared_secret_point(&peer, &secret));
        secret.non_secure_erase();

        // x-coordinate || suite byte
        let mut ikm = Zeroizing::new([0u8; 33]);
        ikm[..32].copy_from_slice(&point[..32]);
        ikm[32] = suite.as_byte();

        let keys = KeySet::new(
            hkdf_sha256(&ikm[..], INFO_DATA_KEY),
            hkdf_sha256(&ikm[..], INFO_LENGTH_KEY),
        );
        let session_id = Zeroizing::new(hkdf_sha256(&ikm[..], INFO_SESSION_ID));

        tracing::debug!(
            direction = ?self.direction,
            sid = %short_fingerprint(&session_id[..]),
            "session keys derived"
        );

        self.cipher_suite = suite;
        self.established = Some(Established { keys, session_id });
        Ok(())
    }

    /// Erase the ephemeral private key if it is still held.
    pub(crate) fn wipe_ephemeral(&mut self) {
        if let Some(mut secret) = self.ephemeral_secret.take() {
            secret.non_secure_erase();
        }
    }

    /// Advance the key ratchet one step.
    pub fn rekey(&mut self) -> Result<()> {
        let established = self
            .established
            .as_mut()
            .ok_or(ChannelError::NotEstablished)?;
        established.keys.ratchet(&established.session_id);
        self.bytes_since_rekey = 0;

        tracing::debug!(direction = ?self.direction, seq = self.seq, "session rekeyed");
        Ok(())
    }

    /// True once the current key has carried more than the suite allows.
    pub fn rekey_needed(&self) -> bool {
        self.bytes_since_rekey > self.cipher_suite.max_bytes_per_key()
    }

    fn next_seq(&mut self) -> Result<u32> {
        let seq = self.seq;
        self.seq = seq.checked_add(1).ok_or(ChannelError::NonceExhausted)?;
        Ok(seq)
    }

    /// Seal one packet. `aad` is the 4-byte plaintext length field and
    /// must equal `plaintext.len()`.
    pub fn seal(&mut self, aad: &[u8; AAD_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
        if self.established.is_none() {
            return Err(ChannelError::NotEstablished);
        }
        let declared = u32::from_le_bytes(*aad) as usize;
        if declared != plaintext.len() {
            return Err(ChannelError::LengthMismatch {
                declared,
                actual: plaintext.len(),
            });
        }
        let seq = self.next_seq()?;
        self.bytes_since_rekey += plaintext.len() as u64;

        let keys = self.keys().ok_or(ChannelError::NotEstablished)?;
        Ok(cipher::seal(keys, seq, aad, plaintext))
    }

    /// Decrypt the length field of the next packet without consuming it.
    pub fn decrypt_length(&self, aad: &[u8; AAD_LEN]) -> Result<u32> {
        let keys = self.keys().ok_or(ChannelError::NotEstablished)?;
        Ok(cipher::decrypt_length(keys, self.seq, aad))
    }

    /// Open one packet.
    ///
    /// The length field is recovered first and must match the ciphertext
    /// actually supplied. Returns the plaintext length field followed by the
    /// payload.
    pub fn open(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        if packet.len() < PACKET_OVERHEAD {
            return Err(ChannelError::LengthMismatch {
                declared: PACKET_OVERHEAD,
                actual: packet.len(),
            });
        }

        let mut aad = [0u8; AAD_LEN];
        aad.copy_from_slice(&packet[..AAD_LEN]);
        let declared = self.decrypt_length(&aad)? as usize;
        let actual = packet.len() - PACKET_OVERHEAD;
        if declared != actual {
            return Err(ChannelError::LengthMismatch { declared, actual });
        }
        // An honest peer stops sealing once over the limit, so at most one
        // frame plus the rekey signal can arrive past it.
        if self.bytes_since_rekey > self.cipher_suite.max_bytes_per_key() + MAX_PACKET_PAYLOAD {
            tracing::warn!(
                bytes = self.bytes_since_rekey,
                "peer kept sending past the per-key byte limit"
            );
            return Err(ChannelError::RekeyRequired);
        }

        let keys = self.keys().ok_or(ChannelError::NotEstablished)?;
        let plaintext = cipher::open(keys, self.seq, packet)?;
        self.next_seq()?;
        self.bytes_since_rekey += actual as u64;

        if self.rekey_needed() {
            tracing::warn!(
                bytes = self.bytes_since_rekey,
                "peer exceeded the per-key byte limit without rekeying"
            );
        }
        Ok(plaintext)
    }

    #[cfg(test)]
    pub(crate) fn set_bytes_since_rekey(&mut self, bytes: u64) {
        self.bytes_since_rekey = bytes;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.wipe_ephemeral();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("direction", &self.direction)
            .field("cipher_suite", &self.cipher_suite)
            .field("established", &self.is_established())
            .field("seq", &self.seq)
            .field("bytes_since_rekey", &self.bytes_since_rekey)
            .field("saw_encinit", &self.saw_encinit)
            .field("saw_encack", &self.saw_encack)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_pair() -> (Session, Session) {
        crate::context::init();
        let mut sender = Session::new(SessionDirection::Outgoing).unwrap();
        let mut receiver = Session::new(SessionDirection::Incoming).unwrap();

        let sender_pub = sender.ephemeral_public_key();
        let receiver_pub = receiver.ephemeral_public_key();
        receiver.derive_shared_keys(&sender_pub, 0).unwrap();
        sender.derive_shared_keys(&receiver_pub, 0).unwrap();
        (sender, receiver)
    }

    fn frame(payload: &[u8]) -> [u8; AAD_LEN] {
        (payload.len() as u32).to_le_bytes()
    }

    #[test]
    fn test_ecdh_is_commutative() {
        let (sender, receiver) = session_pair();
        assert_eq!(sender.session_id(), receiver.session_id());
        assert_eq!(
            sender.keys().unwrap().to_bytes(),
            receiver.keys().unwrap().to_bytes()
        );
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let (mut sender, mut receiver) = session_pair();
        let payload = b"getblocks";
        let packet = sender.seal(&frame(payload), payload).unwrap();
        let opened = receiver.open(&packet).unwrap();
        assert_eq!(&opened[AAD_LEN..], payload);
    }

    #[test]
    fn test_sequence_number_advances_per_operation() {
        let (mut sender, mut receiver) = session_pair();
        for i in 0..25u32 {
            assert_eq!(sender.sequence_number(), i);
            let packet = sender.seal(&frame(b"x"), b"x").unwrap();
            receiver.open(&packet).unwrap();
        }
        assert_eq!(sender.sequence_number(), 25);
        assert_eq!(receiver.sequence_number(), 25);
        assert_eq!(sender.bytes_since_rekey(), 25);
    }

    #[test]
    fn test_derive_requires_supported_suite() {
        crate::context::init();
        let mut session = Session::new(SessionDirection::Incoming).unwrap();
        let peer = Session::new(SessionDirection::Outgoing).unwrap();
        assert_eq!(
            session.derive_shared_keys(&peer.ephemeral_public_key(), 1),
            Err(ChannelError::UnsupportedCipherSuite(1))
        );
        assert!(!session.ephemeral_secret_wiped());
    }

    #[test]
    fn test_derive_rejects_bad_keys() {
        crate::context::init();
        let mut session = Session::new(SessionDirection::Incoming).unwrap();

        assert_eq!(
            session.derive_shared_keys(&[0x02; 32], 0),
            Err(ChannelError::InvalidPeerKey)
        );
        // Valid prefix, x-coordinate not on the curve.
        let mut off_curve = [0xffu8; PUBKEY_LEN];
        off_curve[0] = 0x02;
        assert_eq!(
            session.derive_shared_keys(&off_curve, 0),
            Err(ChannelError::InvalidPeerKey)
        );
        assert_eq!(
            session.derive_shared_keys(&[0u8; PUBKEY_LEN], 0),
            Err(ChannelError::InvalidPeerKey)
        );
    }

    #[test]
    fn test_ephemeral_key_used_once() {
        let (mut sender, _receiver) = session_pair();
        assert!(sender.ephemeral_secret_wiped());

        let other = Session::new(SessionDirection::Incoming).unwrap();
        assert_eq!(
            sender.derive_shared_keys(&other.ephemeral_public_key(), 0),
            Err(ChannelError::InvalidHandshake)
        );
    }

    #[test]
    fn test_rekey_keeps_session_id_and_sequence() {
        let (mut sender, _receiver) = session_pair();
        let sid = *sender.session_id().unwrap();
        sender.seal(&frame(b"abc"), b"abc").unwrap();
        let keys_before = sender.keys().unwrap().to_bytes();

        for _ in 0..5 {
            sender.rekey().unwrap();
        }

        assert_eq!(sender.session_id(), Some(&sid));
        assert_eq!(sender.sequence_number(), 1);
        assert_eq!(sender.bytes_since_rekey(), 0);
        assert_ne!(sender.keys().unwrap().to_bytes(), keys_before);
    }

    #[test]
    fn test_rekey_synchronizes_peers() {
        let (mut sender, mut receiver) = session_pair();
        sender.rekey().unwrap();

        let packet = sender.seal(&frame(b"after"), b"after").unwrap();
        // The stale length key yields a garbage length or a bad tag.
        assert!(matches!(
            receiver.open(&packet),
            Err(ChannelError::LengthMismatch { .. } | ChannelError::AuthenticationFailed)
        ));
        assert_eq!(receiver.sequence_number(), 0);

        receiver.rekey().unwrap();
        let opened = receiver.open(&packet).unwrap();
        assert_eq!(&opened[AAD_LEN..], b"after");
    }

    #[test]
    fn test_rekey_needed_threshold() {
        let (mut sender, _receiver) = session_pair();
        sender.set_bytes_since_rekey(1_000_000_000);
        assert!(!sender.rekey_needed());
        sender.set_bytes_since_rekey(1_000_000_001);
        assert!(sender.rekey_needed());
        sender.rekey().unwrap();
        assert!(!sender.rekey_needed());
    }

    #[test]
    fn test_length_mismatch_before_decrypt() {
        let (mut sender, mut receiver) = session_pair();
        let packet = sender.seal(&frame(b"hello"), b"hello").unwrap();
        let truncated = &packet[..packet.len() - 1];
        assert_eq!(
            receiver.open(truncated),
            Err(ChannelError::LengthMismatch {
                declared: 5,
                actual: 4
            })
        );
        assert_eq!(receiver.sequence_number(), 0);
    }

    #[test]
    fn test_seal_rejects_wrong_length_field() {
        let (mut sender, mut receiver) = session_pair();
        assert_eq!(
            sender.seal(&frame(b"too long"), b"hi"),
            Err(ChannelError::LengthMismatch {
                declared: 8,
                actual: 2
            })
        );
        assert_eq!(sender.sequence_number(), 0);
        assert_eq!(sender.bytes_since_rekey(), 0);

        // The link is still usable.
        let packet = sender.seal(&frame(b"hi"), b"hi").unwrap();
        assert_eq!(&receiver.open(&packet).unwrap()[AAD_LEN..], b"hi");
    }

    #[test]
    fn test_open_fails_closed_when_peer_never_rekeys() {
        let (mut sender, mut receiver) = session_pair();
        let packet = sender.seal(&frame(b"late"), b"late").unwrap();
        let limit = CipherSuite::default().max_bytes_per_key();

        receiver.set_bytes_since_rekey(limit + MAX_PACKET_PAYLOAD + 1);
        assert_eq!(receiver.open(&packet), Err(ChannelError::RekeyRequired));
        assert_eq!(receiver.sequence_number(), 0);

        // One overrunning frame plus the rekey signal is still tolerated.
        receiver.set_bytes_since_rekey(limit + MAX_PACKET_PAYLOAD);
        assert_eq!(&receiver.open(&packet).unwrap()[AAD_LEN..], b"late");
    }

    #[test]
    fn test_zero_rekey_signal() {
        assert!(is_zero_rekey_signal(&[0u8; 33]));
        assert!(!is_zero_rekey_signal(&[0u8; 32]));
        assert!(!is_zero_rekey_signal(&[0u8; 34]));
        let mut almost = [0u8; 33];
        almost[32] = 1;
        assert!(!is_zero_rekey_signal(&almost));
    }

    #[test]
    fn test_unestablished_session_refuses_traffic() {
        crate::context::init();
        let mut session = Session::new(SessionDirection::Outgoing).unwrap();
        assert_eq!(
            session.seal(&frame(b"x"), b"x"),
            Err(ChannelError::NotEstablished)
        );
        assert_eq!(session.rekey(), Err(ChannelError::NotEstablished));
        assert_eq!(session.sequence_number(), 0);
    }
}
