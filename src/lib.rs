//! # codecollab-server — multi-tenant collaboration server
//!
//! Real-time collaboration backend for a local-first code editor: clients
//! speak a length-prefixed binary protocol over WebSocket, join a project
//! room, and exchange CRDT sync payloads, presence, chat, and voice
//! credentials.
//!
//! ## Architecture
//!
//! ```text
//! Client A ──┐                      ┌──────────────────────────┐
//! Client B ──┼── /ws/{project_id} ──▶ Connection (per socket)  │
//! Client C ──┘       axum          │   read loop / write loop │
//!                                  └──────────┬───────────────┘
//!                                             │ commands
//!                                  ┌──────────▼───────────────┐
//!                                  │ Room (per project)       │
//!                                  │   Document (CRDT)        │
//!                                  │   presence / chat        │
//!                                  │   broadcast fan-out      │
//!                                  └──────────┬───────────────┘
//!                                             │
//!                                  ┌──────────▼───────────────┐
//!                                  │ CollabStore (RocksDB)    │
//!                                  │   snapshots / changes    │
//!                                  │   sync states / chat     │
//!                                  └──────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — frame + message codecs
//! - [`document`] — CRDT document wrapper and project data model
//! - [`storage`] — durable snapshots, change log, checkpoints
//! - [`presence`] — cursor and status engine
//! - [`room`] — per-project command loop and fan-out bus
//! - [`connection`] — per-socket state machine
//! - [`server`] — room registry, sessions, stats
//! - [`http`] — admin surface and WebSocket upgrade
//! - [`voice`] — credential issuer

pub mod clock;
pub mod config;
pub mod connection;
pub mod document;
pub mod http;
pub mod presence;
pub mod protocol;
pub mod room;
pub mod server;
pub mod storage;
pub mod voice;

pub use config::Config;
pub use document::{Document, PeerSyncState};
pub use protocol::{ClientMessage, ErrorCode, PresenceStatus, ServerMessage, PROTOCOL_VERSION};
pub use room::{Room, RoomConfig, RoomError, RoomHandle};
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use storage::{CollabStore, StoreConfig};
pub use voice::{CredentialIssuer, LiveKitIssuer};
