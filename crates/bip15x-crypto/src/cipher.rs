//! `chacha20-poly1305@openssh.com` packet AEAD.
//!
//! # Wire Format
//!
//! ```text
//! [4 bytes: encrypted length] [N bytes: encrypted payload] [16 bytes: Poly1305 tag]
//! ```
//!
//! Two ChaCha20 instances (original 64-bit nonce variant) are keyed from a
//! [`KeySet`]. The length key encrypts only the 4-byte length field, so a
//! receiver can learn how many bytes to read before the rest of the packet
//! has arrived. The data key produces the Poly1305 one-time key from block 0
//! and encrypts the payload from block 1 onwards. The tag covers the
//! encrypted length and the encrypted payload.
//!
//! The nonce is the session sequence number, little-endian, zero-extended
//! to 64 bits.

use std::fmt;

use bip15x_common::helpers::constant_time_eq;
use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::{ChaCha20Legacy, Key, LegacyNonce};
use poly1305::universal_hash::KeyInit;
use poly1305::Poly1305;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{ChannelError, Result};

/// Length of one subkey.
pub const SUBKEY_LEN: usize = 32;
/// Length of a full keyset (data key + length key).
pub const KEYSET_LEN: usize = 2 * SUBKEY_LEN;
/// Length of the encrypted length field (the associated data).
pub const AAD_LEN: usize = 4;
/// Length of the Poly1305 tag.
pub const TAG_LEN: usize = 16;
/// Bytes a sealed packet adds on top of its payload.
pub const PACKET_OVERHEAD: usize = AAD_LEN + TAG_LEN;

/// Byte offset of ChaCha20 block 1, where payload encryption starts.
const PAYLOAD_BLOCK_OFFSET: u64 = 64;

/// Symmetric key material for one traffic direction.
///
/// Overwritten when dropped. The only mutation after derivation is
/// [`KeySet::ratchet`].
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeySet {
    data_key: [u8; SUBKEY_LEN],
    length_key: [u8; SUBKEY_LEN],
}

impl KeySet {
    pub(crate) fn new(data_key: [u8; SUBKEY_LEN], length_key: [u8; SUBKEY_LEN]) -> Self {
        Self {
            data_key,
            length_key,
        }
    }

    /// Key for the payload stream and the Poly1305 one-time key (bytes 0..32).
    pub fn data_key(&self) -> &[u8; SUBKEY_LEN] {
        &self.data_key
    }

    /// Key for the length field (bytes 32..64).
    pub fn length_key(&self) -> &[u8; SUBKEY_LEN] {
        &self.length_key
    }

    /// The 64-byte OpenSSH key layout: data key followed by length key.
    pub fn to_bytes(&self) -> Zeroizing<[u8; KEYSET_LEN]> {
        let mut out = Zeroizing::new([0u8; KEYSET_LEN]);
        out[..SUBKEY_LEN].copy_from_slice(&self.data_key);
        out[SUBKEY_LEN..].copy_from_slice(&self.length_key);
        out
    }

    /// Advance both subkeys one ratchet step:
    /// `key = Hash256(session_id || key)`.
    pub(crate) fn ratchet(&mut self, session_id: &[u8; 32]) {
        let mut next = crate::hashes::hash256(&[&session_id[..], &self.data_key[..]]);
        self.data_key.copy_from_slice(&next);
        next.zeroize();

        let mut next = crate::hashes::hash256(&[&session_id[..], &self.length_key[..]]);
        self.length_key.copy_from_slice(&next);
        next.zeroize();
    }
}

impl fmt::Debug for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeySet(<redacted>)")
    }
}

fn nonce(seq: u32) -> [u8; 8] {
    u64::from(seq).to_le_bytes()
}

fn stream(key: &[u8; SUBKEY_LEN], nonce: &[u8; 8]) -> ChaCha20Legacy {
    ChaCha20Legacy::new(Key::from_slice(key), LegacyNonce::from_slice(nonce))
}

fn poly_key(keys: &KeySet, nonce: &[u8; 8]) -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    stream(keys.data_key(), nonce).apply_keystream(&mut key[..]);
    key
}

fn compute_tag(poly_key: &[u8; 32], data: &[u8]) -> [u8; TAG_LEN] {
    Poly1305::new(poly1305::Key::from_slice(poly_key))
        .compute_unpadded(data)
        .into()
}

/// Decrypt only the length field of the packet with sequence number `seq`.
pub fn decrypt_length(keys: &KeySet, seq: u32, aad: &[u8; AAD_LEN]) -> u32 {
    let mut buf = *aad;
    stream(keys.length_key(), &nonce(seq)).apply_keystream(&mut buf);
    u32::from_le_bytes(buf)
}

/// Seal `aad || plaintext` and append the tag.
///
/// `aad` is the plaintext length field; it is encrypted with the length key
/// and authenticated together with the payload.
pub fn seal(keys: &KeySet, seq: u32, aad: &[u8; AAD_LEN], plaintext: &[u8]) -> Vec<u8> {
    let nonce = nonce(seq);
    let mut packet = Vec::with_capacity(PACKET_OVERHEAD + plaintext.len());
    packet.extend_from_slice(aad);
    packet.extend_from_slice(plaintext);

    stream(keys.length_key(), &nonce).apply_keystream(&mut packet[..AAD_LEN]);

    let mut main = stream(keys.data_key(), &nonce);
    let mut one_time = Zeroizing::new([0u8; 32]);
    main.apply_keystream(&mut one_time[..]);
    main.seek(PAYLOAD_BLOCK_OFFSET);
    main.apply_keystream(&mut packet[AAD_LEN..]);

    let tag = compute_tag(&one_time, &packet);
    packet.extend_from_slice(&tag);
    packet
}

/// Verify and decrypt a sealed packet.
///
/// Returns the decrypted length field followed by the payload. The tag is
/// checked before anything is decrypted.
pub fn open(keys: &KeySet, seq: u32, packet: &[u8]) -> Result<Vec<u8>> {
    if packet.len() < PACKET_OVERHEAD {
        return Err(ChannelError::LengthMismatch {
            declared: PACKET_OVERHEAD,
            actual: packet.len(),
        });
    }

    let nonce = nonce(seq);
    let (body, tag) = packet.split_at(packet.len() - TAG_LEN);

    let one_time = poly_key(keys, &nonce);
    let expected = compute_tag(&one_time, body);
    if !constant_time_eq(&expected, tag) {
        return Err(ChannelError::AuthenticationFailed);
    }

    let mut plaintext = body.to_vec();
    stream(keys.length_key(), &nonce).apply_keystream(&mut plaintext[..AAD_LEN]);

    let mut main = stream(keys.data_key(), &nonce);
    main.seek(PAYLOAD_BLOCK_OFFSET);
    main.apply_keystream(&mut plaintext[AAD_LEN..]);

    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> KeySet {
        KeySet::new([0x11; 32], [0x22; 32])
    }

    fn aad_for(payload: &[u8]) -> [u8; AAD_LEN] {
        (payload.len() as u32).to_le_bytes()
    }

    #[test]
    fn test_seal_open() {
        let keys = keys();
        let payload = b"hello encrypted world";
        let packet = seal(&keys, 0, &aad_for(payload), payload);
        assert_eq!(packet.len(), payload.len() + PACKET_OVERHEAD);

        let opened = open(&keys, 0, &packet).unwrap();
        assert_eq!(&opened[..AAD_LEN], &aad_for(payload));
        assert_eq!(&opened[AAD_LEN..], payload);
    }

    #[test]
    fn test_length_decrypts_independently() {
        let keys = keys();
        let payload = vec![0xab; 1000];
        let packet = seal(&keys, 9, &aad_for(&payload), &payload);
        let aad: [u8; AAD_LEN] = packet[..AAD_LEN].try_into().unwrap();

        assert_eq!(decrypt_length(&keys, 9, &aad), 1000);
        assert_ne!(decrypt_length(&keys, 10, &aad), 1000);
    }

    #[test]
    fn test_wrong_sequence_fails() {
        let keys = keys();
        let packet = seal(&keys, 1, &aad_for(b"x"), b"x");
        assert_eq!(
            open(&keys, 2, &packet),
            Err(ChannelError::AuthenticationFailed)
        );
    }

    #[test]
    fn test_every_bit_flip_detected() {
        let keys = keys();
        let payload = b"tamper";
        let packet = seal(&keys, 3, &aad_for(payload), payload);

        for byte in 0..packet.len() {
            for bit in 0..8 {
                let mut tampered = packet.clone();
                tampered[byte] ^= 1 << bit;
                assert_eq!(
                    open(&keys, 3, &tampered),
                    Err(ChannelError::AuthenticationFailed),
                    "flip at byte {byte} bit {bit} not detected"
                );
            }
        }
    }

    #[test]
    fn test_short_packet_rejected() {
        let keys = keys();
        assert!(matches!(
            open(&keys, 0, &[0u8; PACKET_OVERHEAD - 1]),
            Err(ChannelError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_ratchet_changes_both_subkeys() {
        let mut keys = keys();
        let before = keys.to_bytes();
        keys.ratchet(&[0x33; 32]);
        let after = keys.to_bytes();

        assert_ne!(before[..SUBKEY_LEN], after[..SUBKEY_LEN]);
        assert_ne!(before[SUBKEY_LEN..], after[SUBKEY_LEN..]);
        assert_eq!(
            keys.data_key(),
            &crate::hashes::hash256(&[&[0x33u8; 32][..], &[0x11u8; 32][..]])
        );
    }

    #[test]
    fn test_seal_known_answer() {
        let payload: Vec<u8> = (0..100).collect();
        let packet = seal(&keys(), 7, &aad_for(&payload), &payload);
        assert_eq!(
            hex::encode(&packet),
            concat!(
                "ad5222e2836595b1126cc8fec0581cd30847407c710b71df092a6d5392aa5094",
                "57d4327f4587b6420d864edb2c6456d81b9279157cc0457bbe4c747191a3e00d",
                "96edf8bdb693c0da16c9f04714b5c1162b2033e178f5e28fa0654cfda9c249b6",
                "bd9cc99ca644f69b70ff76a0c2b47233bc92b8773c9e880b",
            )
        );
    }

    #[test]
    fn test_ratchet_known_answer() {
        let mut keys = keys();
        keys.ratchet(&[0x33; 32]);
        assert_eq!(
            hex::encode(&keys.to_bytes()[..]),
            concat!(
                "4d94e8a0fadf21c75e291bc8c101d71030abee191f13c6ee57c06cef2df46102",
                "bd4ee8fbdcd5f32d10abd91bd0e65a4a86ec13dfa528ccadddd24bdd10217c6b",
            )
        );
    }

    #[test]
    fn test_debug_redacts() {
        assert_eq!(format!("{:?}", keys()), "KeySet(<redacted>)");
    }
}
