//! Length-prefixed frame codec.
//!
//! `encode_frame` and `decode_frame` are pure: they never interpret the
//! payload. The decoder validates the version byte and the 24-bit length
//! before yielding the payload slice; oversized or truncated frames are
//! rejected without reaching any handler.

use bytes::{BufMut, Bytes, BytesMut};

use super::{ProtocolError, PROTOCOL_VERSION};

/// Frame header: version (1) + type (1) + length (3, big-endian).
pub const FRAME_HEADER_LEN: usize = 5;

/// Hard cap on a whole frame (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Maximum payload a frame may carry.
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - FRAME_HEADER_LEN;

/// Encode one frame.
pub fn encode_frame(msg_type: u8, payload: &[u8]) -> Result<Bytes, ProtocolError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(msg_type);
    let len = payload.len() as u32;
    buf.put_u8((len >> 16) as u8);
    buf.put_u8((len >> 8) as u8);
    buf.put_u8(len as u8);
    buf.put_slice(payload);

    Ok(buf.freeze())
}

/// Decode one frame, returning the message tag and the payload slice.
///
/// The frame must contain exactly the declared payload; trailing bytes are
/// a framing error (the transport delivers one frame per message).
pub fn decode_frame(data: &[u8]) -> Result<(u8, &[u8]), ProtocolError> {
    if data.len() < FRAME_HEADER_LEN {
        return Err(ProtocolError::FrameTooShort(data.len()));
    }

    let version = data[0];
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            got: version,
        });
    }

    let msg_type = data[1];
    let declared =
        ((data[2] as usize) << 16) | ((data[3] as usize) << 8) | (data[4] as usize);
    if declared > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(declared));
    }

    let actual = data.len() - FRAME_HEADER_LEN;
    if actual != declared {
        return Err(ProtocolError::LengthMismatch { declared, actual });
    }

    Ok((msg_type, &data[FRAME_HEADER_LEN..]))
}
