//! Length-prefixed MessagePack framing.
//!
//! On the wire a frame is a big-endian `u32` payload length followed by the
//! payload, a MessagePack map with named fields.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::Frame;

/// Largest payload accepted in either direction (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Bytes taken by the length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    FrameTooLarge(usize),

    /// `decode` was handed a buffer missing this many bytes.
    #[error("frame truncated, {0} more bytes expected")]
    Incomplete(usize),

    #[error("cannot encode frame: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("cannot decode frame: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Payload length announced by the prefix at the start of `data`, if the
/// prefix is complete.
fn announced_len(data: &[u8]) -> Result<Option<usize>, ProtocolError> {
    let Some(prefix) = data.get(..LENGTH_PREFIX_SIZE) else {
        return Ok(None);
    };
    let mut prefix = prefix;
    let len = prefix.get_u32() as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    Ok(Some(len))
}

/// Encode `frame` with its length prefix.
///
/// # Errors
///
/// Fails if serialization fails or the payload is over [`MAX_FRAME_SIZE`].
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Append `frame`, with its length prefix, to `buf`.
///
/// # Errors
///
/// Fails if serialization fails or the payload is over [`MAX_FRAME_SIZE`].
/// `buf` is left untouched on error.
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(frame)?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len as usize <= MAX_FRAME_SIZE)
        .ok_or(ProtocolError::FrameTooLarge(payload.len()))?;

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(len);
    buf.put_slice(&payload);
    Ok(())
}

/// Decode exactly one frame from the start of `data`.
///
/// # Errors
///
/// Returns [`ProtocolError::Incomplete`] if `data` is shorter than the
/// frame it announces.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    let len = announced_len(data)?
        .ok_or(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE.saturating_sub(data.len())))?;
    let end = LENGTH_PREFIX_SIZE + len;
    let payload = data
        .get(LENGTH_PREFIX_SIZE..end)
        .ok_or_else(|| ProtocolError::Incomplete(end - data.len()))?;
    Ok(rmp_serde::from_slice(payload)?)
}

/// Take the next complete frame off the front of `buf`.
///
/// `Ok(None)` means more bytes are needed; `buf` is unchanged in that case.
///
/// # Errors
///
/// Fails on an oversized length prefix or an undecodable payload. The
/// undecodable frame is consumed.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    let Some(len) = announced_len(buf)? else {
        return Ok(None);
    };
    if buf.len() < LENGTH_PREFIX_SIZE + len {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(len);
    Ok(Some(rmp_serde::from_slice(&payload)?))
}
