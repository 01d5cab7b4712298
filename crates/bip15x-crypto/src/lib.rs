//! Encrypted and authenticated peer channel (BIP151 / BIP150).
//!
//! This crate provides:
//! - Ephemeral secp256k1 ECDH handshake (`encinit` / `encack`) per direction
//! - OpenSSH-style ChaCha20-Poly1305 packet sealing with a hidden length field
//! - In-band key ratcheting without renegotiation
//! - Identity challenge/response bound to the session ID
//!
//! # Design
//!
//! A [`Connection`] owns two independent [`Session`]s, one per direction.
//! Each session runs its own ECDH exchange and derives, via HKDF-SHA256, a
//! 64-byte keyset and a session ID. Once both halves are done the connection
//! seals outbound [`Message`]s and opens inbound ones. After the handshake
//! [`auth::PeerAuth`] proves long-lived identities over the encrypted link.
//!
//! Call [`context::init`] once at process start.

#![forbid(unsafe_code)]

pub mod auth;
pub mod cipher;
pub mod connection;
pub mod context;
pub mod error;
pub mod hashes;
pub mod identity;
pub mod message;
pub mod peers;
pub mod session;

pub use auth::PeerAuth;
pub use cipher::KeySet;
pub use connection::{Connection, HandshakeState, Inbound};
pub use error::{ChannelError, Result};
pub use identity::{IdentityKeypair, PeerId, PublicIdentity};
pub use message::Message;
pub use peers::AuthorizedPeers;
pub use session::{CipherSuite, Session, SessionDirection};
