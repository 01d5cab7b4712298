//! BIP150 peer authentication over an established [`Connection`].
//!
//! Every value is bound to a session ID, so a transcript captured from one
//! key exchange is useless on any other. Values sent A -> B use A's outgoing
//! session ID; B checks them against its incoming one (the two are equal).
//!
//! # Exchange
//!
//! ```text
//! Initiator                                    Responder
//!     |  authchallenge  H(sid || 'i' || R)          |  "are you R?"
//!     |-------------------------------------------->|
//!     |  authreply      sig_R(sid)                  |  proves R
//!     |<--------------------------------------------|
//!     |  authpropose    H(sid || 'p' || I)          |  "I might be I"
//!     |-------------------------------------------->|
//!     |  authchallenge  H(sid || 'r' || I)          |  I is authorized
//!     |<--------------------------------------------|
//!     |  authreply      sig_I(sid)                  |  proves I
//!     |-------------------------------------------->|
//! ```
//!
//! The responder only learns which key the initiator holds if that key is
//! already in its authorized set.

use secp256k1::ecdsa::Signature;
use secp256k1::PublicKey;

use bip15x_common::helpers::constant_time_eq;

use crate::connection::Connection;
use crate::error::{ChannelError, Result};
use crate::hashes::hash256;
use crate::identity::IdentityKeypair;
use crate::message::{command, Message};
use crate::session::{SessionDirection, SESSION_ID_LEN};

/// Length of a challenge or propose hash.
pub const AUTH_HASH_LEN: usize = 32;
/// Length of a compact ECDSA reply.
pub const SIGNATURE_LEN: usize = 64;

/// Domain byte mixed into each auth hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthStep {
    InitiatorChallenge = b'i',
    Propose = b'p',
    ResponderChallenge = b'r',
}

/// `Hash256(session_id || step || key)`.
pub fn auth_string(
    session_id: &[u8; SESSION_ID_LEN],
    step: AuthStep,
    key: &PublicKey,
) -> [u8; AUTH_HASH_LEN] {
    hash256(&[&session_id[..], &[step as u8][..], &key.serialize()[..]])
}

fn check_auth_string(
    session_id: &[u8; SESSION_ID_LEN],
    step: AuthStep,
    payload: &[u8],
    key: &PublicKey,
) -> bool {
    payload.len() == AUTH_HASH_LEN && constant_time_eq(payload, &auth_string(session_id, step, key))
}

/// Whether `payload` is the initiator's challenge for `key`.
pub fn check_challenge(session_id: &[u8; SESSION_ID_LEN], payload: &[u8], key: &PublicKey) -> bool {
    check_auth_string(session_id, AuthStep::InitiatorChallenge, payload, key)
}

/// Whether `payload` proposes `key`.
pub fn check_propose(session_id: &[u8; SESSION_ID_LEN], payload: &[u8], key: &PublicKey) -> bool {
    check_auth_string(session_id, AuthStep::Propose, payload, key)
}

/// Whether `payload` is the responder's challenge for `key`.
pub fn check_responder_challenge(
    session_id: &[u8; SESSION_ID_LEN],
    payload: &[u8],
    key: &PublicKey,
) -> bool {
    check_auth_string(session_id, AuthStep::ResponderChallenge, payload, key)
}

/// Responder's challenge for an authorized key.
pub fn challenge_for(session_id: &[u8; SESSION_ID_LEN], key: &PublicKey) -> [u8; AUTH_HASH_LEN] {
    auth_string(session_id, AuthStep::ResponderChallenge, key)
}

/// Compact ECDSA signature over the session ID with the identity key.
pub fn reply(
    session_id: &[u8; SESSION_ID_LEN],
    identity: &IdentityKeypair,
) -> Result<[u8; SIGNATURE_LEN]> {
    let secp = crate::context::get()?;
    let digest = secp256k1::Message::from_digest(*session_id);
    Ok(secp
        .sign_ecdsa(&digest, identity.secret_key())
        .serialize_compact())
}

/// Verify a compact reply against `key`.
///
/// The signature must survive low-S normalization and a DER round trip
/// before it is verified. Fails only if the context is gone.
pub fn check_reply(session_id: &[u8; SESSION_ID_LEN], sig: &[u8], key: &PublicKey) -> Result<bool> {
    let secp = crate::context::get()?;
    if sig.len() != SIGNATURE_LEN {
        return Ok(false);
    }

    let Ok(mut sig) = Signature::from_compact(sig) else {
        return Ok(false);
    };
    sig.normalize_s();
    let Ok(sig) = Signature::from_der(&sig.serialize_der()) else {
        return Ok(false);
    };

    let digest = secp256k1::Message::from_digest(*session_id);
    Ok(secp.verify_ecdsa(&digest, &sig, key).is_ok())
}

/// Which side of the exchange we play.
#[derive(Debug, Clone)]
pub enum AuthRole {
    /// We opened the link and expect the responder to hold `expected`.
    Initiator { expected: PublicKey },
    /// We accept any of the `authorized` keys.
    Responder { authorized: Vec<PublicKey> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Start,
    AwaitReply,
    AwaitPropose,
    AwaitChallenge,
    Done,
    Failed,
}

/// One side of the BIP150 exchange for a single connection.
#[derive(Debug)]
pub struct PeerAuth {
    identity: IdentityKeypair,
    role: AuthRole,
    stage: Stage,
    candidate: Option<PublicKey>,
    peer: Option<PublicKey>,
}

impl PeerAuth {
    pub fn initiator(identity: IdentityKeypair, expected: PublicKey) -> Self {
        Self::new(identity, AuthRole::Initiator { expected })
    }

    pub fn responder(identity: IdentityKeypair, authorized: Vec<PublicKey>) -> Self {
        Self::new(identity, AuthRole::Responder { authorized })
    }

    fn new(identity: IdentityKeypair, role: AuthRole) -> Self {
        Self {
            identity,
            role,
            stage: Stage::Start,
            candidate: None,
            peer: None,
        }
    }

    /// Whether the peer's identity has been verified.
    pub fn is_authenticated(&self) -> bool {
        self.peer.is_some()
    }

    /// Whether our side has nothing left to send or receive.
    pub fn is_finished(&self) -> bool {
        self.stage == Stage::Done
    }

    /// The peer's verified identity key.
    pub fn peer_key(&self) -> Option<&PublicKey> {
        self.peer.as_ref()
    }

    /// First message of the exchange. Only the initiator has one.
    pub fn start(&mut self, conn: &Connection) -> Result<Option<Message>> {
        let AuthRole::Initiator { expected } = &self.role else {
            return Ok(None);
        };
        if self.stage != Stage::Start {
            return Err(ChannelError::UnexpectedMessage);
        }

        let (_, out_sid) = session_ids(conn)?;
        let challenge = auth_string(&out_sid, AuthStep::InitiatorChallenge, expected);
        self.stage = Stage::AwaitReply;
        Ok(Some(Message::new(command::AUTHCHALLENGE, challenge.to_vec())))
    }

    /// Process one inbound auth message and return our response, if any.
    ///
    /// Any failure leaves the exchange failed; the link should be dropped.
    pub fn handle(&mut self, conn: &Connection, msg: &Message) -> Result<Option<Message>> {
        let result = self.step(conn, msg);
        if let Err(e) = &result {
            tracing::warn!(
                command = msg.command_str().unwrap_or("<binary>"),
                error = %e,
                "peer authentication failed"
            );
            self.stage = Stage::Failed;
        }
        result
    }

    fn step(&mut self, conn: &Connection, msg: &Message) -> Result<Option<Message>> {
        let (in_sid, out_sid) = session_ids(conn)?;
        let own = *self.identity.public_key();

        match (&self.role, self.stage) {
            (AuthRole::Initiator { expected }, Stage::AwaitReply) if msg.is(command::AUTHREPLY) => {
                if !check_reply(&in_sid, &msg.payload, expected)? {
                    return Err(ChannelError::AuthenticationFailed);
                }
                self.peer = Some(*expected);
                tracing::debug!("responder identity verified");

                let propose = auth_string(&out_sid, AuthStep::Propose, &own);
                self.stage = Stage::AwaitChallenge;
                Ok(Some(Message::new(command::AUTHPROPOSE, propose.to_vec())))
            }
            (AuthRole::Initiator { .. }, Stage::AwaitChallenge)
                if msg.is(command::AUTHCHALLENGE) =>
            {
                if !check_responder_challenge(&in_sid, &msg.payload, &own) {
                    return Err(ChannelError::AuthenticationFailed);
                }
                let sig = reply(&out_sid, &self.identity)?;
                self.stage = Stage::Done;
                Ok(Some(Message::new(command::AUTHREPLY, sig.to_vec())))
            }
            (AuthRole::Responder { .. }, Stage::Start) if msg.is(command::AUTHCHALLENGE) => {
                if !check_challenge(&in_sid, &msg.payload, &own) {
                    return Err(ChannelError::AuthenticationFailed);
                }
                let sig = reply(&out_sid, &self.identity)?;
                self.stage = Stage::AwaitPropose;
                Ok(Some(Message::new(command::AUTHREPLY, sig.to_vec())))
            }
            (AuthRole::Responder { authorized }, Stage::AwaitPropose)
                if msg.is(command::AUTHPROPOSE) =>
            {
                let key = authorized
                    .iter()
                    .find(|key| check_propose(&in_sid, &msg.payload, key))
                    .copied()
                    .ok_or(ChannelError::AuthenticationFailed)?;

                self.candidate = Some(key);
                self.stage = Stage::AwaitReply;
                Ok(Some(Message::new(
                    command::AUTHCHALLENGE,
                    challenge_for(&out_sid, &key).to_vec(),
                )))
            }
            (AuthRole::Responder { .. }, Stage::AwaitReply) if msg.is(command::AUTHREPLY) => {
                let key = self.candidate.ok_or(ChannelError::UnexpectedMessage)?;
                if !check_reply(&in_sid, &msg.payload, &key)? {
                    return Err(ChannelError::AuthenticationFailed);
                }
                self.peer = Some(key);
                self.stage = Stage::Done;
                tracing::debug!("initiator identity verified");
                Ok(None)
            }
            _ => Err(ChannelError::UnexpectedMessage),
        }
    }
}

/// Whether `msg` belongs to the authentication exchange.
pub fn is_auth_message(msg: &Message) -> bool {
    msg.is(command::AUTHCHALLENGE) || msg.is(command::AUTHREPLY) || msg.is(command::AUTHPROPOSE)
}

fn session_ids(conn: &Connection) -> Result<([u8; SESSION_ID_LEN], [u8; SESSION_ID_LEN])> {
    if !conn.is_complete() {
        return Err(ChannelError::NotEstablished);
    }
    let incoming = conn
        .session_id(SessionDirection::Incoming)
        .ok_or(ChannelError::NotEstablished)?;
    let outgoing = conn
        .session_id(SessionDirection::Outgoing)
        .ok_or(ChannelError::NotEstablished)?;
    Ok((*incoming, *outgoing))
}
