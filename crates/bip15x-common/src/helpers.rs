//! Common helper functions for bip15x.

/// Performs a constant-time comparison of two byte strings.
///
/// Used for authentication tags and challenge hashes so that a mismatch
/// does not leak how many leading bytes were correct.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (lhs, rhs) in a.iter().zip(b.iter()) {
        diff |= lhs ^ rhs;
    }
    diff == 0
}

/// Short hex fingerprint of an identifier, safe for log lines.
pub fn short_fingerprint(bytes: &[u8]) -> String {
    bytes.iter().take(4).map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq_identical() {
        assert!(constant_time_eq(b"tag123", b"tag123"));
        assert!(constant_time_eq(b"", b""));
        assert!(constant_time_eq(&[0u8; 16], &[0u8; 16]));
    }

    #[test]
    fn test_constant_time_eq_different() {
        assert!(!constant_time_eq(b"tag123", b"tag124"));
        assert!(!constant_time_eq(&[0x80], &[0x00]));
        assert!(!constant_time_eq(b"", b"a"));
    }

    #[test]
    fn test_constant_time_eq_different_lengths() {
        assert!(!constant_time_eq(b"short", b"much_longer_value"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }

    #[test]
    fn test_short_fingerprint() {
        assert_eq!(short_fingerprint(&[0xde, 0xad, 0xbe, 0xef, 0x01]), "deadbeef");
        assert_eq!(short_fingerprint(&[0x0a]), "0a");
    }
}
