//! Protocol errors for the encrypted channel.
//!
//! Every variant is fatal for the link it was raised on: the transport is
//! expected to drop the connection rather than retry or degrade.

use thiserror::Error;

/// Result alias for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;

/// Errors raised by sessions, connections, the message codec and the
/// peer authenticator.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    /// Malformed, off-curve or wrong-length public key.
    #[error("invalid peer public key")]
    InvalidPeerKey,

    #[error("unsupported cipher suite {0:#04x}")]
    UnsupportedCipherSuite(u8),

    /// Duplicate or malformed handshake message.
    #[error("invalid handshake message")]
    InvalidHandshake,

    /// encack arrived before the matching encinit.
    #[error("handshake message out of order")]
    OutOfOrder,

    #[error("unexpected message")]
    UnexpectedMessage,

    #[error("length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("rekey signal not expected here")]
    RekeyNotExpectedHere,

    /// A key has carried its byte budget. Raised when sealing more
    /// application data, or when the peer keeps sending without rekeying.
    #[error("rekey required: per-key byte limit exceeded")]
    RekeyRequired,

    /// The 32-bit sequence number would wrap and reuse a nonce.
    #[error("sequence number exhausted")]
    NonceExhausted,

    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("session not established")]
    NotEstablished,

    #[error("crypto context not initialized")]
    ContextNotInitialized,
}
