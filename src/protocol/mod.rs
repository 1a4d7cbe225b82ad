//! Binary wire protocol: framing, message taxonomy, codecs.
//!
//! Every message on the stream is one frame:
//! ```text
//! ┌──────────┬──────────┬───────────────┬──────────┐
//! │ version  │ type     │ length        │ payload  │
//! │ 1 byte   │ 1 byte   │ 3 bytes (BE)  │ variable │
//! └──────────┴──────────┴───────────────┴──────────┘
//! ```
//!
//! The payload is a bincode-encoded tagged union (fixed-int little-endian
//! encoding: u32 LE variant tags, length-prefixed strings and byte arrays,
//! one-byte booleans and option markers). The frame `type` byte repeats the
//! variant tag so a router can dispatch without decoding the payload.

pub mod frame;
pub mod message;

pub use frame::{decode_frame, encode_frame, FRAME_HEADER_LEN, MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE};
pub use message::{
    decode_client, decode_server, encode_client, encode_server, ChatEntry, ClientMessage,
    ErrorCode, PeerInfo, PresenceStatus, ServerMessage,
};

/// Protocol version for compatibility checking.
pub const PROTOCOL_VERSION: u8 = 1;

/// Protocol errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame too short: {0} bytes")]
    FrameTooShort(usize),

    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u8, got: u8 },

    #[error("payload too large: {0} bytes (max {MAX_PAYLOAD_SIZE})")]
    PayloadTooLarge(usize),

    #[error("frame length mismatch: header declares {declared} payload bytes, frame has {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("unknown message tag: {0}")]
    UnknownTag(u8),

    #[error("frame tag {tag} does not match payload variant {variant}")]
    TagMismatch { tag: u8, variant: u8 },

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),
}

impl ProtocolError {
    /// Whether this failure is a version disagreement rather than a
    /// malformed message.
    pub fn is_version_mismatch(&self) -> bool {
        matches!(self, ProtocolError::VersionMismatch { .. })
    }
}
