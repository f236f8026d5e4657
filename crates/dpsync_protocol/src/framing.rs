//! Length-prefixed CBOR framing.
//!
//! Every frame is a 4-byte big-endian length followed by the CBOR encoding
//! of a [`Frame`]. The reader side works either on a blocking [`Read`] or on
//! a growable [`BytesMut`] buffer for callers that read in chunks.

use crate::error::{ProtocolError, ProtocolResult};
use crate::messages::Frame;
use bytes::{Buf, BufMut, BytesMut};
use std::io::{Read, Write};

/// Size of the length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Largest frame body accepted by the decoder (16 MiB).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encodes a frame including its length prefix.
pub fn encode_frame(frame: &Frame) -> ProtocolResult<BytesMut> {
    let mut body = Vec::new();
    ciborium::into_writer(frame, &mut body).map_err(|e| ProtocolError::encode(e.to_string()))?;

    if body.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len: body.len(),
            max: MAX_FRAME_LEN,
        });
    }

    let mut out = BytesMut::with_capacity(LENGTH_PREFIX_LEN + body.len());
    out.put_u32(body.len() as u32);
    out.put_slice(&body);
    Ok(out)
}

/// Decodes one frame from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` does not yet hold a complete frame; the
/// buffer is left untouched in that case.
pub fn decode_frame(buf: &mut BytesMut) -> ProtocolResult<Option<Frame>> {
    if buf.len() < LENGTH_PREFIX_LEN {
        return Ok(None);
    }

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    if buf.len() < LENGTH_PREFIX_LEN + len {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_LEN);
    let body = buf.split_to(len);
    decode_body(&body).map(Some)
}

/// Writes one frame to a blocking writer and flushes it.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> ProtocolResult<()> {
    let bytes = encode_frame(frame)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Reads exactly one frame from a blocking reader.
///
/// A clean close before the first prefix byte surfaces as an
/// `UnexpectedEof` I/O error (see [`ProtocolError::is_eof`]).
pub fn read_frame<R: Read>(reader: &mut R) -> ProtocolResult<Frame> {
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    reader.read_exact(&mut prefix)?;

    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    decode_body(&body)
}

fn decode_body(body: &[u8]) -> ProtocolResult<Frame> {
    ciborium::from_reader(body).map_err(|e| ProtocolError::decode(e.to_string()))
}
