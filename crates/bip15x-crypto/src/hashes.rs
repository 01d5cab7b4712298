//! Hash constructions shared by the key schedule, the ratchet and BIP150.

use hkdf::Hkdf;
use sha2::{Digest, Sha256};

/// HKDF salt for every BIP151 derivation.
pub const HKDF_SALT: &[u8] = b"bitcoinecdh";

/// HKDF info labels.
pub const INFO_DATA_KEY: &[u8] = b"BitcoinK2";
pub const INFO_LENGTH_KEY: &[u8] = b"BitcoinK1";
pub const INFO_SESSION_ID: &[u8] = b"BitcoinSessionID";

/// Double SHA-256 over the concatenation of `parts`.
pub fn hash256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let first = hasher.finalize();
    Sha256::digest(first).into()
}

/// HKDF-SHA256 with the BIP151 salt, 32 bytes of output.
pub fn hkdf_sha256(ikm: &[u8], info: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), ikm);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash256_empty() {
        // Well-known double SHA-256 of the empty string.
        let expected: [u8; 32] = [
            0x5d, 0xf6, 0xe0, 0xe2, 0x76, 0x13, 0x59, 0xd3, 0x0a, 0x82, 0x75, 0x05, 0x8e, 0x29,
            0x9f, 0xcc, 0x03, 0x81, 0x53, 0x45, 0x45, 0xf5, 0x5c, 0xf4, 0x3e, 0x41, 0x98, 0x3f,
            0x5d, 0x4c, 0x94, 0x56,
        ];
        assert_eq!(hash256(&[]), expected);
    }

    #[test]
    fn test_hash256_concatenates_parts() {
        assert_eq!(hash256(&[&b"ab"[..], &b"cd"[..]]), hash256(&[&b"abcd"[..]]));
        assert_ne!(hash256(&[&b"abcd"[..]]), hash256(&[&b"abce"[..]]));
    }

    #[test]
    fn test_hkdf_labels_separate_outputs() {
        let ikm = [7u8; 33];
        let k2 = hkdf_sha256(&ikm, INFO_DATA_KEY);
        let k1 = hkdf_sha256(&ikm, INFO_LENGTH_KEY);
        let sid = hkdf_sha256(&ikm, INFO_SESSION_ID);
        assert_ne!(k1, k2);
        assert_ne!(k1, sid);
        assert_ne!(k2, sid);
        assert_eq!(k2, hkdf_sha256(&ikm, INFO_DATA_KEY));
    }

    #[test]
    fn test_hkdf_known_answer() {
        assert_eq!(
            hex::encode(hkdf_sha256(&[0x44; 33], INFO_SESSION_ID)),
            "4b8ffbaf260bc61fabdc1059165e687eb7ead6c4528b949b2d24899dc075a8bf"
        );
    }
}
