//! Plaintext message structure carried inside sealed packets.
//!
//! # Wire Format
//!
//! ```text
//! [4 bytes: total length, LE] [varint: command length] [command]
//! [4 bytes: payload length, LE] [payload]
//! ```
//!
//! The total length counts every byte after itself, so an encoded message
//! can be handed to [`Session::seal`](crate::Session::seal) whole: its first
//! four bytes are the packet's length field.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::cipher::AAD_LEN;
use crate::error::{ChannelError, Result};

/// Well-known commands.
pub mod command {
    pub const ENCINIT: &str = "encinit";
    pub const ENCACK: &str = "encack";
    pub const AUTHCHALLENGE: &str = "authchallenge";
    pub const AUTHREPLY: &str = "authreply";
    pub const AUTHPROPOSE: &str = "authpropose";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub command: Bytes,
    pub payload: Bytes,
}

impl Message {
    pub fn new(command: impl Into<Bytes>, payload: impl Into<Bytes>) -> Self {
        Self {
            command: command.into(),
            payload: payload.into(),
        }
    }

    /// Whether the command equals `name`.
    pub fn is(&self, name: &str) -> bool {
        self.command.as_ref() == name.as_bytes()
    }

    /// Command as text, if it is valid UTF-8.
    pub fn command_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.command).ok()
    }

    pub fn encoded_len(&self) -> usize {
        AAD_LEN + self.body_len()
    }

    fn body_len(&self) -> usize {
        varint_len(self.command.len() as u64) + self.command.len() + 4 + self.payload.len()
    }

    pub fn encode(&self) -> Result<Bytes> {
        let body_len = self.body_len();
        let total = u32::try_from(body_len).map_err(|_| ChannelError::MessageTooLarge(body_len))?;
        let payload_len = u32::try_from(self.payload.len())
            .map_err(|_| ChannelError::MessageTooLarge(self.payload.len()))?;

        let mut buf = BytesMut::with_capacity(AAD_LEN + body_len);
        buf.put_u32_le(total);
        put_varint(&mut buf, self.command.len() as u64);
        buf.put_slice(&self.command);
        buf.put_u32_le(payload_len);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Parse an encoded message. The declared total length must match the
    /// buffer exactly.
    pub fn decode(bytes: impl Into<Bytes>) -> Result<Self> {
        let mut buf: Bytes = bytes.into();
        if buf.len() < AAD_LEN {
            return Err(ChannelError::LengthMismatch {
                declared: AAD_LEN,
                actual: buf.len(),
            });
        }

        let total = buf.get_u32_le() as usize;
        if total != buf.remaining() {
            return Err(ChannelError::LengthMismatch {
                declared: total,
                actual: buf.remaining(),
            });
        }

        let command_len = get_varint(&mut buf)?;
        let command = take(&mut buf, command_len)?;
        if buf.remaining() < 4 {
            return Err(ChannelError::LengthMismatch {
                declared: 4,
                actual: buf.remaining(),
            });
        }
        let payload_len = buf.get_u32_le() as usize;
        if payload_len != buf.remaining() {
            return Err(ChannelError::LengthMismatch {
                declared: payload_len,
                actual: buf.remaining(),
            });
        }

        Ok(Self {
            command,
            payload: buf,
        })
    }
}

fn take(buf: &mut Bytes, len: u64) -> Result<Bytes> {
    match usize::try_from(len) {
        Ok(len) if len <= buf.remaining() => Ok(buf.split_to(len)),
        _ => Err(ChannelError::LengthMismatch {
            declared: usize::try_from(len).unwrap_or(usize::MAX),
            actual: buf.remaining(),
        }),
    }
}

/// Bitcoin CompactSize length.
fn varint_len(n: u64) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

fn put_varint(buf: &mut BytesMut, n: u64) {
    match n {
        0..=0xfc => buf.put_u8(n as u8),
        0xfd..=0xffff => {
            buf.put_u8(0xfd);
            buf.put_u16_le(n as u16);
        }
        0x1_0000..=0xffff_ffff => {
            buf.put_u8(0xfe);
            buf.put_u32_le(n as u32);
        }
        _ => {
            buf.put_u8(0xff);
            buf.put_u64_le(n);
        }
    }
}

fn get_varint(buf: &mut Bytes) -> Result<u64> {
    let short = |needed: usize, buf: &Bytes| ChannelError::LengthMismatch {
        declared: needed,
        actual: buf.remaining(),
    };

    if !buf.has_remaining() {
        return Err(short(1, buf));
    }
    let n = match buf.get_u8() {
        0xfd if buf.remaining() >= 2 => u64::from(buf.get_u16_le()),
        0xfe if buf.remaining() >= 4 => u64::from(buf.get_u32_le()),
        0xff if buf.remaining() >= 8 => buf.get_u64_le(),
        0xfd => return Err(short(2, buf)),
        0xfe => return Err(short(4, buf)),
        0xff => return Err(short(8, buf)),
        n => u64::from(n),
    };
    Ok(n)
}
