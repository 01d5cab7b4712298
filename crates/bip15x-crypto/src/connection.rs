//! Encrypted link between two peers.
//!
//! A [`Connection`] pairs an incoming and an outgoing [`Session`] and drives
//! the four-message BIP151 handshake over them.
//!
//! # Handshake
//!
//! ```text
//! Peer A                                   Peer B
//!   |  encinit  (A.out pubkey || suite)      |   B can decrypt A -> B
//!   |--------------------------------------->|
//!   |  encack   (B.in pubkey)                |   A can encrypt A -> B
//!   |<---------------------------------------|
//!   |  encinit  (B.out pubkey || suite)      |   A can decrypt B -> A
//!   |<---------------------------------------|
//!   |  encack   (A.in pubkey)                |   B can encrypt B -> A
//!   |--------------------------------------->|
//! ```
//!
//! The two halves are independent and may interleave in any order.
//!
//! After the handshake the same `encack` command, carrying 33 zero bytes and
//! sent encrypted, tells the receiver to ratchet its incoming keys.

use bytes::Bytes;

use crate::cipher::AAD_LEN;
use crate::error::{ChannelError, Result};
use crate::message::{command, Message};
use crate::session::{
    is_zero_rekey_signal, CipherSuite, Session, SessionDirection, PUBKEY_LEN, SESSION_ID_LEN,
};

/// Length of an `encinit` payload: pubkey || cipher suite.
pub const ENCINIT_LEN: usize = PUBKEY_LEN + 1;
/// Length of an `encack` payload: pubkey, or the all-zero rekey signal.
pub const ENCACK_LEN: usize = PUBKEY_LEN;

/// Result of opening an inbound packet with [`Connection::open_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// An application (or BIP150) message.
    Message(Message),
    /// The peer rotated its outgoing keys; ours were ratcheted to match.
    Rekeyed,
}

/// Handshake state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Empty,
    /// Our outgoing half still waits for the peer's `encack`.
    HandshakingOut,
    /// Our outgoing half is done; the incoming half is still pending.
    HandshakingIn,
    Established,
}

/// Both directions of one peer link.
#[derive(Debug)]
pub struct Connection {
    inbound: Session,
    outbound: Session,
}

impl Connection {
    /// Create a connection with fresh ephemeral keys for both directions.
    pub fn new() -> Result<Self> {
        Ok(Self {
            inbound: Session::new(SessionDirection::Incoming)?,
            outbound: Session::new(SessionDirection::Outgoing)?,
        })
    }

    pub fn inbound(&self) -> &Session {
        &self.inbound
    }

    pub fn outbound(&self) -> &Session {
        &self.outbound
    }

    /// Build our `encinit`: outgoing ephemeral pubkey followed by the suite.
    pub fn outgoing_encinit(&mut self) -> [u8; ENCINIT_LEN] {
        self.outbound.mark_encinit();

        let mut msg = [0u8; ENCINIT_LEN];
        msg[..PUBKEY_LEN].copy_from_slice(&self.outbound.ephemeral_public_key());
        msg[PUBKEY_LEN] = CipherSuite::default().as_byte();
        msg
    }

    /// Apply the peer's `encinit` to our incoming session.
    pub fn process_encinit(&mut self, msg: &[u8]) -> Result<()> {
        if msg.len() != ENCINIT_LEN {
            tracing::warn!(len = msg.len(), "encinit with bad length");
            return Err(ChannelError::InvalidHandshake);
        }
        if self.inbound.saw_encinit() {
            tracing::warn!("duplicate encinit rejected");
            return Err(ChannelError::InvalidHandshake);
        }

        self.inbound
            .derive_shared_keys(&msg[..PUBKEY_LEN], msg[PUBKEY_LEN])?;
        self.inbound.mark_encinit();
        tracing::debug!("incoming session ready");
        Ok(())
    }

    /// Build our `encack`: the incoming session's ephemeral pubkey.
    ///
    /// The incoming ephemeral private key is erased; the shared secret was
    /// already derived from the peer's `encinit`.
    pub fn incoming_encack(&mut self) -> Result<[u8; ENCACK_LEN]> {
        if !self.inbound.saw_encinit() {
            return Err(ChannelError::OutOfOrder);
        }
        if self.inbound.saw_encack() {
            return Err(ChannelError::InvalidHandshake);
        }

        self.inbound.mark_encack();
        let msg = self.inbound.ephemeral_public_key();
        self.inbound.wipe_ephemeral();
        Ok(msg)
    }

    /// Apply an `encack`.
    ///
    /// With `on_outgoing` set this completes our outgoing session during the
    /// handshake. Otherwise it must be the all-zero rekey signal, and the
    /// incoming session is ratcheted.
    pub fn process_encack(&mut self, msg: &[u8], on_outgoing: bool) -> Result<()> {
        if on_outgoing {
            if !self.outbound.saw_encinit() {
                return Err(ChannelError::OutOfOrder);
            }
            if self.outbound.saw_encack() {
                return Err(ChannelError::InvalidHandshake);
            }
            if is_zero_rekey_signal(msg) {
                tracing::warn!("rekey signal received before handshake completed");
                return Err(ChannelError::RekeyNotExpectedHere);
            }

            let suite = self.outbound.cipher_suite().as_byte();
            self.outbound.derive_shared_keys(msg, suite)?;
            self.outbound.mark_encack();
            tracing::debug!("outgoing session ready");
            return Ok(());
        }

        if !is_zero_rekey_signal(msg) {
            tracing::warn!(len = msg.len(), "non-zero encack outside the handshake");
            return Err(ChannelError::UnexpectedMessage);
        }
        self.inbound.rekey()
    }

    pub fn is_complete(&self) -> bool {
        self.incoming_complete() && self.outgoing_complete()
    }

    /// Whether our `encinit` has been answered.
    pub fn outgoing_complete(&self) -> bool {
        self.outbound.saw_encinit() && self.outbound.saw_encack()
    }

    /// Whether we have answered the peer's `encinit`.
    pub fn incoming_complete(&self) -> bool {
        self.inbound.saw_encinit() && self.inbound.saw_encack()
    }

    pub fn state(&self) -> HandshakeState {
        if self.is_complete() {
            HandshakeState::Established
        } else if !self.inbound.saw_encinit() && !self.outbound.saw_encinit() {
            HandshakeState::Empty
        } else if !self.outgoing_complete() {
            HandshakeState::HandshakingOut
        } else {
            HandshakeState::HandshakingIn
        }
    }

    /// Session ID for one direction.
    pub fn session_id(&self, direction: SessionDirection) -> Option<&[u8; SESSION_ID_LEN]> {
        match direction {
            SessionDirection::Incoming => self.inbound.session_id(),
            SessionDirection::Outgoing => self.outbound.session_id(),
        }
    }

    /// Seal an encoded frame whose first four bytes are its length field.
    pub fn seal(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        if self.outbound.rekey_needed() {
            return Err(ChannelError::RekeyRequired);
        }
        self.seal_frame(frame)
    }

    fn seal_frame(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        if frame.len() < AAD_LEN {
            return Err(ChannelError::LengthMismatch {
                declared: AAD_LEN,
                actual: frame.len(),
            });
        }
        let (aad, body) = frame.split_at(AAD_LEN);
        let mut header = [0u8; AAD_LEN];
        header.copy_from_slice(aad);
        self.outbound.seal(&header, body)
    }

    /// Open a sealed packet, returning the plaintext frame (length field
    /// included).
    pub fn open(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        self.inbound.open(packet)
    }

    /// Length of the payload of the next inbound packet, from its first
    /// four bytes alone.
    pub fn peek_length(&self, aad: &[u8; AAD_LEN]) -> Result<u32> {
        self.inbound.decrypt_length(aad)
    }

    pub fn seal_message(&mut self, msg: &Message) -> Result<Vec<u8>> {
        let frame = msg.encode()?;
        self.seal(&frame)
    }

    /// Open a packet and decode its message. An in-band rekey signal is
    /// applied here and reported as [`Inbound::Rekeyed`].
    pub fn open_message(&mut self, packet: &[u8]) -> Result<Inbound> {
        let frame = self.open(packet)?;
        let msg = Message::decode(frame)?;
        if msg.is(command::ENCACK) {
            self.process_encack(&msg.payload, false)?;
            return Ok(Inbound::Rekeyed);
        }
        Ok(Inbound::Message(msg))
    }

    pub fn rekey_needed(&self) -> bool {
        self.outbound.rekey_needed()
    }

    /// Ratchet the outgoing keys.
    ///
    /// Returns the rekey notification already sealed under the old key; the
    /// caller must send it before any packet sealed afterwards.
    pub fn rekey_outgoing(&mut self) -> Result<Vec<u8>> {
        let signal = Message::new(command::ENCACK, Bytes::from_static(&[0u8; ENCACK_LEN]));
        let packet = self.seal_frame(&signal.encode()?)?;
        self.outbound.rekey()?;
        Ok(packet)
    }
}
