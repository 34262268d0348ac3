//! Framing: length-prefix (4 bytes LE) + bincode payload.
//! Datagrams add a magic header; link frames are encrypted per direction.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::identity::{decrypt_wire, encrypt_wire, Direction, WireCryptoError};
use crate::protocol::{Datagram, SessionMessage};

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 1024 * 1024; // 1 MiB
/// Room left in a link frame for the message envelope and AEAD tag.
const FRAME_OVERHEAD: usize = 64;
/// Largest reliable payload that fits in one link frame.
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN as usize - FRAME_OVERHEAD;

pub const DATAGRAM_MAGIC: &[u8; 4] = b"NBY1";
/// Keep datagrams under a typical Ethernet MTU.
pub const MAX_DATAGRAM_LEN: usize = 1400;

/// Encode a value into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(msg).map_err(FrameEncodeError::Encode)?;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
    #[error("encryption failed: {0}")]
    Crypto(#[from] WireCryptoError),
}

/// Decode one frame from the front of `bytes`. Returns the value and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes yet.
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = frame_len(&[bytes[0], bytes[1], bytes[2], bytes[3]])?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let msg = bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((msg, LEN_SIZE + len))
}

/// Read a length prefix, rejecting oversized frames before anything is allocated.
pub fn frame_len(prefix: &[u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_le_bytes(*prefix);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
    #[error("not a nearby datagram")]
    BadMagic,
    #[error("trailing bytes after datagram")]
    Trailing,
    #[error("decryption failed: {0}")]
    Crypto(#[from] WireCryptoError),
}

/// Datagram layout: magic + length-prefixed bincode body.
pub fn encode_datagram(datagram: &Datagram) -> Result<Vec<u8>, FrameEncodeError> {
    let frame = encode_frame(datagram)?;
    if DATAGRAM_MAGIC.len() + frame.len() > MAX_DATAGRAM_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(DATAGRAM_MAGIC.len() + frame.len());
    out.extend_from_slice(DATAGRAM_MAGIC);
    out.extend_from_slice(&frame);
    Ok(out)
}

/// Decode a whole datagram. Foreign traffic on the group fails with `BadMagic`.
pub fn decode_datagram(bytes: &[u8]) -> Result<Datagram, FrameDecodeError> {
    let body = bytes
        .strip_prefix(DATAGRAM_MAGIC.as_slice())
        .ok_or(FrameDecodeError::BadMagic)?;
    let (datagram, used) = decode_frame(body)?;
    if used != body.len() {
        return Err(FrameDecodeError::Trailing);
    }
    Ok(datagram)
}

/// Seal a session message into a link frame: 4 bytes LE length + ciphertext.
pub fn seal_message(
    key: &[u8; 32],
    direction: Direction,
    counter: u64,
    msg: &SessionMessage,
) -> Result<Vec<u8>, FrameEncodeError> {
    let plain = bincode::serialize(msg)?;
    let cipher = encrypt_wire(key, direction, counter, &plain)?;
    if cipher.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + cipher.len());
    out.extend_from_slice(&(cipher.len() as u32).to_le_bytes());
    out.extend_from_slice(&cipher);
    Ok(out)
}

/// Open a link frame body (the bytes after the length prefix).
pub fn open_message(
    key: &[u8; 32],
    direction: Direction,
    counter: u64,
    cipher: &[u8],
) -> Result<SessionMessage, FrameDecodeError> {
    let plain = decrypt_wire(key, direction, counter, cipher)?;
    Ok(bincode::deserialize(&plain)?)
}
