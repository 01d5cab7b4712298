//! C ABI for the bip15x encrypted channel.
//!
//! Connections are opaque heap handles created with
//! [`bip15x_connection_new`] and released with [`bip15x_connection_free`].
//! A handle must not be used from two threads at once.
//!
//! Every function returns `0` (or a non-negative value where documented) on
//! success and one of the negative codes in [`codes`] on failure.

#![allow(clippy::missing_safety_doc)]

use std::ffi::{c_char, CStr};
use std::ptr;
use std::slice;

use bip15x_crypto::auth::{self, AuthStep, AUTH_HASH_LEN, SIGNATURE_LEN};
use bip15x_crypto::cipher::{AAD_LEN, TAG_LEN};
use bip15x_crypto::connection::{ENCACK_LEN, ENCINIT_LEN};
use bip15x_crypto::session::{PUBKEY_LEN, SESSION_ID_LEN};
use bip15x_crypto::{context, ChannelError, Connection, PublicIdentity, SessionDirection};

mod identity;

/// Return codes.
pub mod codes {
    use bip15x_crypto::ChannelError;

    pub const OK: i32 = 0;
    pub const NULL_POINTER: i32 = -1;
    pub const INVALID_ARGUMENT: i32 = -2;
    pub const BUFFER_TOO_SMALL: i32 = -3;
    pub const NO_IDENTITY: i32 = -4;
    pub const IDENTITY_IO: i32 = -5;

    pub const INVALID_PEER_KEY: i32 = -10;
    pub const UNSUPPORTED_CIPHER_SUITE: i32 = -11;
    pub const INVALID_HANDSHAKE: i32 = -12;
    pub const OUT_OF_ORDER: i32 = -13;
    pub const UNEXPECTED_MESSAGE: i32 = -14;
    pub const LENGTH_MISMATCH: i32 = -15;
    pub const AUTHENTICATION_FAILED: i32 = -16;
    pub const REKEY_NOT_EXPECTED_HERE: i32 = -17;
    pub const REKEY_REQUIRED: i32 = -18;
    pub const NONCE_EXHAUSTED: i32 = -19;
    pub const MESSAGE_TOO_LARGE: i32 = -20;
    pub const NOT_ESTABLISHED: i32 = -21;
    pub const CONTEXT_NOT_INITIALIZED: i32 = -22;

    pub fn from_error(err: ChannelError) -> i32 {
        match err {
            ChannelError::InvalidPeerKey => INVALID_PEER_KEY,
            ChannelError::UnsupportedCipherSuite(_) => UNSUPPORTED_CIPHER_SUITE,
            ChannelError::InvalidHandshake => INVALID_HANDSHAKE,
            ChannelError::OutOfOrder => OUT_OF_ORDER,
            ChannelError::UnexpectedMessage => UNEXPECTED_MESSAGE,
            ChannelError::LengthMismatch { .. } => LENGTH_MISMATCH,
            ChannelError::AuthenticationFailed => AUTHENTICATION_FAILED,
            ChannelError::RekeyNotExpectedHere => REKEY_NOT_EXPECTED_HERE,
            ChannelError::RekeyRequired => REKEY_REQUIRED,
            ChannelError::NonceExhausted => NONCE_EXHAUSTED,
            ChannelError::MessageTooLarge(_) => MESSAGE_TOO_LARGE,
            ChannelError::NotEstablished => NOT_ESTABLISHED,
            ChannelError::ContextNotInitialized => CONTEXT_NOT_INITIALIZED,
        }
    }
}

/// Opaque connection handle.
pub struct Bip15xConnection {
    inner: Connection,
}

fn status(result: Result<(), ChannelError>) -> i32 {
    match result {
        Ok(()) => codes::OK,
        Err(e) => {
            log::debug!("channel operation failed: {}", e);
            codes::from_error(e)
        }
    }
}

unsafe fn conn_mut<'a>(conn: *mut Bip15xConnection) -> Option<&'a mut Connection> {
    conn.as_mut().map(|c| &mut c.inner)
}

unsafe fn input<'a>(data: *const u8, len: usize) -> Option<&'a [u8]> {
    if len == 0 {
        return Some(&[]);
    }
    if data.is_null() {
        return None;
    }
    Some(slice::from_raw_parts(data, len))
}

unsafe fn fixed<'a, const N: usize>(data: *const u8) -> Option<&'a [u8; N]> {
    data.cast::<[u8; N]>().as_ref()
}

unsafe fn write_fixed(out: *mut u8, bytes: &[u8]) -> i32 {
    if out.is_null() {
        return codes::NULL_POINTER;
    }
    ptr::copy_nonoverlapping(bytes.as_ptr(), out, bytes.len());
    codes::OK
}

/// Copy `bytes` to `out`, which holds `capacity` bytes. The needed length is
/// always stored in `out_len`, so a caller can retry after `BUFFER_TOO_SMALL`.
unsafe fn write_buffer(bytes: &[u8], out: *mut u8, capacity: usize, out_len: *mut usize) -> i32 {
    if out_len.is_null() {
        return codes::NULL_POINTER;
    }
    *out_len = bytes.len();
    if bytes.len() > capacity {
        return codes::BUFFER_TOO_SMALL;
    }
    write_fixed(out, bytes)
}

#[no_mangle]
pub extern "C" fn bip15x_init() -> i32 {
    // Initialize logger if not already
    let _ = env_logger::try_init();
    if context::init() {
        log::info!("bip15x core (FFI) initialized");
    }
    codes::OK
}

/// Release the curve context and forget the loaded identity. Existing
/// connections keep working.
#[no_mangle]
pub extern "C" fn bip15x_shutdown() -> i32 {
    identity::clear();
    context::shutdown();
    log::info!("bip15x core (FFI) shut down");
    codes::OK
}

#[no_mangle]
pub extern "C" fn bip15x_version() -> *const c_char {
    static VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");
    VERSION.as_ptr() as *const c_char
}

#[no_mangle]
pub unsafe extern "C" fn bip15x_init_identity(storage_path_ptr: *const c_char) -> i32 {
    if storage_path_ptr.is_null() {
        return codes::NULL_POINTER;
    }
    let c_str = CStr::from_ptr(storage_path_ptr);
    let Ok(path_str) = c_str.to_str() else {
        return codes::INVALID_ARGUMENT;
    };

    match identity::init_identity(path_str) {
        Ok(_) => codes::OK,
        Err(e) => {
            log::error!("Failed to init identity: {:#}", e);
            codes::IDENTITY_IO
        }
    }
}

/// Write the 33-byte compressed identity public key to `out`.
#[no_mangle]
pub unsafe extern "C" fn bip15x_get_public_key(out: *mut u8) -> i32 {
    match identity::public_key() {
        Some(key) => write_fixed(out, &key),
        None => codes::NO_IDENTITY,
    }
}

/// Create a connection. Returns null if the library is not initialized.
#[no_mangle]
pub extern "C" fn bip15x_connection_new() -> *mut Bip15xConnection {
    match Connection::new() {
        Ok(inner) => Box::into_raw(Box::new(Bip15xConnection { inner })),
        Err(e) => {
            log::error!("Failed to create connection: {}", e);
            ptr::null_mut()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn bip15x_connection_free(conn: *mut Bip15xConnection) {
    if !conn.is_null() {
        drop(Box::from_raw(conn));
    }
}

/// Write our 34-byte `encinit` to `out`.
#[no_mangle]
pub unsafe extern "C" fn bip15x_get_outgoing_encinit(
    conn: *mut Bip15xConnection,
    out: *mut u8,
) -> i32 {
    let Some(conn) = conn_mut(conn) else {
        return codes::NULL_POINTER;
    };
    if out.is_null() {
        return codes::NULL_POINTER;
    }
    let encinit: [u8; ENCINIT_LEN] = conn.outgoing_encinit();
    write_fixed(out, &encinit)
}

#[no_mangle]
pub unsafe extern "C" fn bip15x_process_encinit(
    conn: *mut Bip15xConnection,
    data: *const u8,
    len: usize,
) -> i32 {
    let (Some(conn), Some(data)) = (conn_mut(conn), input(data, len)) else {
        return codes::NULL_POINTER;
    };
    status(conn.process_encinit(data))
}

/// Write our 33-byte `encack` to `out`.
#[no_mangle]
pub unsafe extern "C" fn bip15x_get_incoming_encack(
    conn: *mut Bip15xConnection,
    out: *mut u8,
) -> i32 {
    let Some(conn) = conn_mut(conn) else {
        return codes::NULL_POINTER;
    };
    if out.is_null() {
        return codes::NULL_POINTER;
    }
    match conn.incoming_encack() {
        Ok(encack) => write_fixed(out, &encack[..ENCACK_LEN]),
        Err(e) => status(Err(e)),
    }
}

#[no_mangle]
pub unsafe extern "C" fn bip15x_process_encack(
    conn: *mut Bip15xConnection,
    data: *const u8,
    len: usize,
    outgoing: bool,
) -> i32 {
    let (Some(conn), Some(data)) = (conn_mut(conn), input(data, len)) else {
        return codes::NULL_POINTER;
    };
    status(conn.process_encack(data, outgoing))
}

/// `1` once both directions are established, `0` before.
#[no_mangle]
pub unsafe extern "C" fn bip15x_is_complete(conn: *mut Bip15xConnection) -> i32 {
    match conn_mut(conn) {
        Some(conn) => i32::from(conn.is_complete()),
        None => codes::NULL_POINTER,
    }
}

/// Seal an encoded frame (length field first). The packet is
/// `frame_len + 16` bytes.
#[no_mangle]
pub unsafe extern "C" fn bip15x_seal(
    conn: *mut Bip15xConnection,
    frame: *const u8,
    frame_len: usize,
    out: *mut u8,
    out_capacity: usize,
    out_len: *mut usize,
) -> i32 {
    let (Some(conn), Some(frame)) = (conn_mut(conn), input(frame, frame_len)) else {
        return codes::NULL_POINTER;
    };
    if out_capacity < frame_len + TAG_LEN {
        if !out_len.is_null() {
            *out_len = frame_len + TAG_LEN;
        }
        return codes::BUFFER_TOO_SMALL;
    }
    match conn.seal(frame) {
        Ok(packet) => write_buffer(&packet, out, out_capacity, out_len),
        Err(e) => status(Err(e)),
    }
}

/// Open a sealed packet into its plaintext frame (`packet_len - 16` bytes).
#[no_mangle]
pub unsafe extern "C" fn bip15x_open(
    conn: *mut Bip15xConnection,
    packet: *const u8,
    packet_len: usize,
    out: *mut u8,
    out_capacity: usize,
    out_len: *mut usize,
) -> i32 {
    let (Some(conn), Some(packet)) = (conn_mut(conn), input(packet, packet_len)) else {
        return codes::NULL_POINTER;
    };
    let needed = packet_len.saturating_sub(TAG_LEN);
    if out_capacity < needed {
        if !out_len.is_null() {
            *out_len = needed;
        }
        return codes::BUFFER_TOO_SMALL;
    }
    match conn.open(packet) {
        Ok(frame) => write_buffer(&frame, out, out_capacity, out_len),
        Err(e) => status(Err(e)),
    }
}

/// Decrypt the length field of the next inbound packet from its first four
/// bytes.
#[no_mangle]
pub unsafe extern "C" fn bip15x_peek_length(
    conn: *mut Bip15xConnection,
    aad: *const u8,
    out_len: *mut u32,
) -> i32 {
    let (Some(conn), Some(aad)) = (conn_mut(conn), fixed::<AAD_LEN>(aad)) else {
        return codes::NULL_POINTER;
    };
    if out_len.is_null() {
        return codes::NULL_POINTER;
    }
    match conn.peek_length(aad) {
        Ok(len) => {
            *out_len = len;
            codes::OK
        }
        Err(e) => status(Err(e)),
    }
}

#[no_mangle]
pub unsafe extern "C" fn bip15x_rekey_needed(conn: *mut Bip15xConnection) -> i32 {
    match conn_mut(conn) {
        Some(conn) => i32::from(conn.rekey_needed()),
        None => codes::NULL_POINTER,
    }
}

/// Ratchet the outgoing keys and write the sealed rekey notification, which
/// must be sent before any later packet.
#[no_mangle]
pub unsafe extern "C" fn bip15x_rekey_outgoing(
    conn: *mut Bip15xConnection,
    out: *mut u8,
    out_capacity: usize,
    out_len: *mut usize,
) -> i32 {
    let Some(conn) = conn_mut(conn) else {
        return codes::NULL_POINTER;
    };
    if out.is_null() || out_len.is_null() {
        return codes::NULL_POINTER;
    }
    // Size check first: the ratchet cannot be undone.
    let needed = bip15x_crypto::Message::new(
        bip15x_crypto::message::command::ENCACK,
        vec![0u8; ENCACK_LEN],
    )
    .encoded_len()
        + TAG_LEN;
    if out_capacity < needed {
        *out_len = needed;
        return codes::BUFFER_TOO_SMALL;
    }
    match conn.rekey_outgoing() {
        Ok(packet) => write_buffer(&packet, out, out_capacity, out_len),
        Err(e) => status(Err(e)),
    }
}

/// Write the 32-byte session ID of one direction.
#[no_mangle]
pub unsafe extern "C" fn bip15x_session_id(
    conn: *mut Bip15xConnection,
    outgoing: bool,
    out: *mut u8,
) -> i32 {
    let Some(conn) = conn_mut(conn) else {
        return codes::NULL_POINTER;
    };
    let direction = if outgoing {
        SessionDirection::Outgoing
    } else {
        SessionDirection::Incoming
    };
    match conn.session_id(direction) {
        Some(sid) => write_fixed(out, &sid[..]),
        None => codes::NOT_ESTABLISHED,
    }
}

fn parse_public_key(bytes: &[u8; PUBKEY_LEN]) -> Option<PublicIdentity> {
    PublicIdentity::from_bytes(bytes).ok()
}

/// `Hash256(session_id || step || pubkey)` for step `'i'`, `'p'` or `'r'`.
#[no_mangle]
pub unsafe extern "C" fn bip15x_auth_string(
    session_id: *const u8,
    step: u8,
    pubkey: *const u8,
    out: *mut u8,
) -> i32 {
    let (Some(sid), Some(pubkey)) = (
        fixed::<SESSION_ID_LEN>(session_id),
        fixed::<PUBKEY_LEN>(pubkey),
    ) else {
        return codes::NULL_POINTER;
    };
    let step = match step {
        b'i' => AuthStep::InitiatorChallenge,
        b'p' => AuthStep::Propose,
        b'r' => AuthStep::ResponderChallenge,
        _ => return codes::INVALID_ARGUMENT,
    };
    let Some(key) = parse_public_key(pubkey) else {
        return codes::INVALID_PEER_KEY;
    };
    let hash: [u8; AUTH_HASH_LEN] = auth::auth_string(sid, step, key.public_key());
    write_fixed(out, &hash)
}

/// Sign `session_id` with the loaded identity, writing a 64-byte compact
/// signature.
#[no_mangle]
pub unsafe extern "C" fn bip15x_auth_reply(session_id: *const u8, out: *mut u8) -> i32 {
    let Some(sid) = fixed::<SESSION_ID_LEN>(session_id) else {
        return codes::NULL_POINTER;
    };
    match identity::with_identity(|keypair| auth::reply(sid, keypair)) {
        Some(Ok(sig)) => write_fixed(out, &sig[..SIGNATURE_LEN]),
        Some(Err(e)) => status(Err(e)),
        None => codes::NO_IDENTITY,
    }
}

/// `1` if `sig` is a valid reply by `pubkey` over `session_id`, `0` if not.
#[no_mangle]
pub unsafe extern "C" fn bip15x_auth_check_reply(
    session_id: *const u8,
    sig: *const u8,
    sig_len: usize,
    pubkey: *const u8,
) -> i32 {
    let (Some(sid), Some(sig), Some(pubkey)) = (
        fixed::<SESSION_ID_LEN>(session_id),
        input(sig, sig_len),
        fixed::<PUBKEY_LEN>(pubkey),
    ) else {
        return codes::NULL_POINTER;
    };
    let Some(key) = parse_public_key(pubkey) else {
        return codes::INVALID_PEER_KEY;
    };
    match auth::check_reply(sid, sig, key.public_key()) {
        Ok(valid) => i32::from(valid),
        Err(e) => status(Err(e)),
    }
}
