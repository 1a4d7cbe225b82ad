//! Tagged-union message codec for both directions of the stream.
//!
//! Variant tags are stable: the tables below are the wire contract. The
//! payload encoding is bincode's fixed-int little-endian form, so the tag
//! appears twice: once as the frame `type` byte, once as the u32 LE
//! variant index bincode writes. The decoder cross-checks the two.

use serde::{Deserialize, Serialize};

use super::frame::{decode_frame, encode_frame};
use super::ProtocolError;

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Tag 0. Initial handshake with client info.
    Hello {
        protocol_version: u8,
        client_id: Option<String>,
        client_name: String,
        session_token: Option<String>,
    },

    /// Tag 1. Graceful disconnect.
    Goodbye { reason: Option<String> },

    /// Tag 2. Join a project room, optionally requesting the full state.
    JoinProject {
        project_id: String,
        request_state: bool,
    },

    /// Tag 3. Leave the project room.
    LeaveProject { project_id: String },

    /// Tag 4. CRDT sync payload (opaque to the codec).
    SyncMessage {
        project_id: String,
        sync_data: Vec<u8>,
    },

    /// Tag 5. Ask the server for the next sync payload.
    SyncRequest { project_id: String },

    /// Tag 6. Request a file's current content.
    OpenFile {
        project_id: String,
        file_path: String,
    },

    /// Tag 7. Notify that a file was closed.
    CloseFile {
        project_id: String,
        file_path: String,
    },

    /// Tag 8. Replace this peer's cursor position (1-based coordinates).
    CursorUpdate {
        project_id: String,
        file_path: String,
        line: u32,
        column: u32,
        selection_end: Option<(u32, u32)>,
    },

    /// Tag 9. Update presence status and active file.
    PresenceUpdate {
        project_id: String,
        status: PresenceStatus,
        active_file: Option<String>,
    },

    /// Tag 10. Send a chat message.
    ChatMessage {
        project_id: String,
        content: String,
    },

    /// Tag 11. Request voice-chat credentials.
    VoiceJoin { project_id: String },

    /// Tag 12. Leave voice chat.
    VoiceLeave { project_id: String },

    /// Tag 13. Keepalive.
    Ping { timestamp: u64 },
}

impl ClientMessage {
    /// Highest assigned client tag.
    pub const MAX_TAG: u8 = 13;

    /// Stable wire tag for this variant.
    pub fn tag(&self) -> u8 {
        match self {
            ClientMessage::Hello { .. } => 0,
            ClientMessage::Goodbye { .. } => 1,
            ClientMessage::JoinProject { .. } => 2,
            ClientMessage::LeaveProject { .. } => 3,
            ClientMessage::SyncMessage { .. } => 4,
            ClientMessage::SyncRequest { .. } => 5,
            ClientMessage::OpenFile { .. } => 6,
            ClientMessage::CloseFile { .. } => 7,
            ClientMessage::CursorUpdate { .. } => 8,
            ClientMessage::PresenceUpdate { .. } => 9,
            ClientMessage::ChatMessage { .. } => 10,
            ClientMessage::VoiceJoin { .. } => 11,
            ClientMessage::VoiceLeave { .. } => 12,
            ClientMessage::Ping { .. } => 13,
        }
    }

    /// Project id carried by room-scoped variants, if any.
    pub fn project_id(&self) -> Option<&str> {
        match self {
            ClientMessage::JoinProject { project_id, .. }
            | ClientMessage::LeaveProject { project_id }
            | ClientMessage::SyncMessage { project_id, .. }
            | ClientMessage::SyncRequest { project_id }
            | ClientMessage::OpenFile { project_id, .. }
            | ClientMessage::CloseFile { project_id, .. }
            | ClientMessage::CursorUpdate { project_id, .. }
            | ClientMessage::PresenceUpdate { project_id, .. }
            | ClientMessage::ChatMessage { project_id, .. }
            | ClientMessage::VoiceJoin { project_id }
            | ClientMessage::VoiceLeave { project_id } => Some(project_id),
            _ => None,
        }
    }
}

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Tag 0. Handshake response with the assigned identity.
    Welcome {
        protocol_version: u8,
        peer_id: String,
        color: String,
        session_token: String,
        server_time: i64,
    },

    /// Tag 1. Terminal answer to one failed client operation.
    Error {
        code: ErrorCode,
        message: String,
        project_id: Option<String>,
    },

    /// Tag 2. Graceful disconnect acknowledgment.
    Goodbye { reason: Option<String> },

    /// Tag 3. Join confirmation with the current peer set.
    ProjectJoined {
        project_id: String,
        peers: Vec<PeerInfo>,
        document_state: Option<Vec<u8>>,
    },

    /// Tag 4. Another peer joined the project.
    PeerJoined { project_id: String, peer: PeerInfo },

    /// Tag 5. Leave confirmation.
    ProjectLeft { project_id: String },

    /// Tag 6. Another peer left the project.
    PeerLeft {
        project_id: String,
        peer_id: String,
        reason: Option<String>,
    },

    /// Tag 7. CRDT sync payload, relayed or server-generated.
    SyncMessage {
        project_id: String,
        sync_data: Vec<u8>,
        from_peer: Option<String>,
    },

    /// Tag 8. The server has nothing more for this peer.
    SyncComplete { project_id: String },

    /// Tag 9. File content response.
    FileContent {
        project_id: String,
        file_path: String,
        content: String,
        language: String,
        version: u64,
    },

    /// Tag 10. Requested file does not exist in the document.
    FileNotFound {
        project_id: String,
        file_path: String,
    },

    /// Tag 11. Cursor update from another peer.
    CursorBroadcast {
        project_id: String,
        peer_id: String,
        peer_name: String,
        peer_color: String,
        file_path: String,
        line: u32,
        column: u32,
        selection_end: Option<(u32, u32)>,
    },

    /// Tag 12. Presence update from another peer.
    PresenceBroadcast {
        project_id: String,
        peer_id: String,
        peer_name: String,
        status: PresenceStatus,
        active_file: Option<String>,
        last_active: i64,
    },

    /// Tag 13. Chat message fan-out.
    ChatBroadcast {
        project_id: String,
        peer_id: String,
        peer_name: String,
        content: String,
        timestamp: i64,
    },

    /// Tag 14. Recent chat ring, sent after ProjectJoined.
    ChatHistory {
        project_id: String,
        messages: Vec<ChatEntry>,
    },

    /// Tag 15. Voice-chat credentials.
    VoiceToken {
        project_id: String,
        token: String,
        room_name: String,
        server_url: String,
    },

    /// Tag 16. Keepalive response.
    Pong { timestamp: u64, server_time: i64 },

    /// Tag 17. Server statistics.
    Stats {
        active_projects: u32,
        active_peers: u32,
        uptime_seconds: u64,
    },
}

impl ServerMessage {
    /// Highest assigned server tag.
    pub const MAX_TAG: u8 = 17;

    /// Stable wire tag for this variant.
    pub fn tag(&self) -> u8 {
        match self {
            ServerMessage::Welcome { .. } => 0,
            ServerMessage::Error { .. } => 1,
            ServerMessage::Goodbye { .. } => 2,
            ServerMessage::ProjectJoined { .. } => 3,
            ServerMessage::PeerJoined { .. } => 4,
            ServerMessage::ProjectLeft { .. } => 5,
            ServerMessage::PeerLeft { .. } => 6,
            ServerMessage::SyncMessage { .. } => 7,
            ServerMessage::SyncComplete { .. } => 8,
            ServerMessage::FileContent { .. } => 9,
            ServerMessage::FileNotFound { .. } => 10,
            ServerMessage::CursorBroadcast { .. } => 11,
            ServerMessage::PresenceBroadcast { .. } => 12,
            ServerMessage::ChatBroadcast { .. } => 13,
            ServerMessage::ChatHistory { .. } => 14,
            ServerMessage::VoiceToken { .. } => 15,
            ServerMessage::Pong { .. } => 16,
            ServerMessage::Stats { .. } => 17,
        }
    }

    /// Shorthand for an error response.
    pub fn error(
        code: ErrorCode,
        message: impl Into<String>,
        project_id: Option<String>,
    ) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
            project_id,
        }
    }
}

/// Presence status of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PresenceStatus {
    #[default]
    Active,
    Idle,
    Away,
    Offline,
}

/// Information about a peer, as carried in join/peer broadcasts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: String,
    pub name: String,
    pub color: String,
    pub status: PresenceStatus,
    pub active_file: Option<String>,
    pub joined_at: i64,
}

/// One retained chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub peer_id: String,
    pub peer_name: String,
    pub content: String,
    pub timestamp: i64,
}

/// Client-visible error codes. Serialized as a bare u16.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
#[repr(u16)]
pub enum ErrorCode {
    Unknown = 0,
    InvalidMessage = 1,
    Unauthorized = 2,
    ProjectNotFound = 3,
    FileNotFound = 4,
    RateLimited = 5,
    ServerError = 6,
    VersionMismatch = 7,
    ProjectFull = 8,
    AlreadyJoined = 9,
    NotJoined = 10,
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> u16 {
        code as u16
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ErrorCode::Unknown),
            1 => Ok(ErrorCode::InvalidMessage),
            2 => Ok(ErrorCode::Unauthorized),
            3 => Ok(ErrorCode::ProjectNotFound),
            4 => Ok(ErrorCode::FileNotFound),
            5 => Ok(ErrorCode::RateLimited),
            6 => Ok(ErrorCode::ServerError),
            7 => Ok(ErrorCode::VersionMismatch),
            8 => Ok(ErrorCode::ProjectFull),
            9 => Ok(ErrorCode::AlreadyJoined),
            10 => Ok(ErrorCode::NotJoined),
            other => Err(format!("unknown error code: {other}")),
        }
    }
}

/// Fixed-int little-endian bincode configuration; the wire contract
/// depends on it (u32 LE variant tags, u64 LE length prefixes).
fn wire_config() -> impl bincode::config::Config {
    bincode::config::legacy()
}

/// Encode a client message into a complete frame.
pub fn encode_client(msg: &ClientMessage) -> Result<bytes::Bytes, ProtocolError> {
    let payload = bincode::serde::encode_to_vec(msg, wire_config())
        .map_err(|e| ProtocolError::Encode(e.to_string()))?;
    encode_frame(msg.tag(), &payload)
}

/// Decode a client message from a complete frame.
pub fn decode_client(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
    let (tag, payload) = decode_frame(data)?;
    if tag > ClientMessage::MAX_TAG {
        return Err(ProtocolError::UnknownTag(tag));
    }
    let (msg, _): (ClientMessage, usize) =
        bincode::serde::decode_from_slice(payload, wire_config())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
    if msg.tag() != tag {
        return Err(ProtocolError::TagMismatch {
            tag,
            variant: msg.tag(),
        });
    }
    Ok(msg)
}

/// Encode a server message into a complete frame.
pub fn encode_server(msg: &ServerMessage) -> Result<bytes::Bytes, ProtocolError> {
    let payload = bincode::serde::encode_to_vec(msg, wire_config())
        .map_err(|e| ProtocolError::Encode(e.to_string()))?;
    encode_frame(msg.tag(), &payload)
}

/// Decode a server message from a complete frame.
pub fn decode_server(data: &[u8]) -> Result<ServerMessage, ProtocolError> {
    let (tag, payload) = decode_frame(data)?;
    if tag > ServerMessage::MAX_TAG {
        return Err(ProtocolError::UnknownTag(tag));
    }
    let (msg, _): (ServerMessage, usize) =
        bincode::serde::decode_from_slice(payload, wire_config())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
    if msg.tag() != tag {
        return Err(ProtocolError::TagMismatch {
            tag,
            variant: msg.tag(),
        });
    }
    Ok(msg)
}
