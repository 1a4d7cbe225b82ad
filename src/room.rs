//! Per-project room: the only mutator of a document.
//!
//! ```text
//! Connection A ──┐  commands (mpsc)   ┌────────────────────────┐
//! Connection B ──┼────────────────────▶  Room task             │
//! Connection C ──┘                    │   Document (CRDT)      │
//!        ▲                            │   PresenceTable        │
//!        │   envelopes (broadcast)    │   chat ring            │
//!        └────────────────────────────│   per-peer sync states │
//!                                     └──────────┬─────────────┘
//!                                                │
//!                                          CollabStore
//! ```
//!
//! One task per room serializes every command, so document mutations and the
//! broadcasts they produce have a total order. Fan-out frames are encoded
//! once and published as [`Envelope`]s; each connection filters by target.
//! A subscriber that stops draining falls behind on its broadcast buffer and
//! is disconnected with `RateLimited`; the publisher is never blocked.
//!
//! Change batches are durable (`append_changes`) before any broadcast of
//! their effects. On a storage failure the in-memory document is reloaded
//! from the store so the failed mutation is visible to no one.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::clock::unix_secs;
use crate::document::{Document, DocumentError, PeerSyncState};
use crate::presence::{CursorPosition, PeerPresence, PresenceTable};
use crate::protocol::{
    encode_server, ChatEntry, ErrorCode, PeerInfo, PresenceStatus, ServerMessage,
};
use crate::storage::{CollabStore, ProjectMeta, StoreError};
use crate::voice::{CredentialIssuer, VoiceError};

/// Room tunables. Defaults match the protocol contract.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub max_peers: usize,
    pub chat_history_limit: usize,
    pub chat_content_max: usize,
    pub broadcast_capacity: usize,
    pub idle_grace: Duration,
    pub flush_interval: Duration,
    pub flush_batch_threshold: u64,
    pub presence_sweep_interval: Duration,
    pub sync_state_ttl: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_peers: 50,
            chat_history_limit: 200,
            chat_content_max: 4096,
            broadcast_capacity: 1024,
            idle_grace: Duration::from_secs(300),
            flush_interval: Duration::from_secs(30),
            flush_batch_threshold: 64,
            presence_sweep_interval: Duration::from_secs(30),
            sync_state_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Addressing for one fan-out frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    All,
    AllExcept(String),
    Peer(String),
}

/// A pre-encoded frame on the room's broadcast bus.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub target: Target,
    pub frame: Bytes,
}

impl Envelope {
    pub fn is_for(&self, peer_id: &str) -> bool {
        match &self.target {
            Target::All => true,
            Target::AllExcept(excluded) => excluded != peer_id,
            Target::Peer(only) => only == peer_id,
        }
    }
}

/// Room-level failures, mapped onto client-visible error codes.
#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("project is at capacity")]
    Full,

    #[error("peer {0} already joined")]
    AlreadyJoined(String),

    #[error("peer {0} is not in the room")]
    UnknownPeer(String),

    #[error("chat message exceeds {0} bytes")]
    ChatTooLarge(usize),

    #[error("cursor line and column must be >= 1")]
    InvalidCursor,

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("voice error: {0}")]
    Voice(#[from] VoiceError),

    #[error("room is shutting down")]
    ShuttingDown,
}

impl RoomError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RoomError::Full => ErrorCode::ProjectFull,
            RoomError::AlreadyJoined(_) => ErrorCode::AlreadyJoined,
            RoomError::UnknownPeer(_) => ErrorCode::NotJoined,
            RoomError::ChatTooLarge(_) => ErrorCode::InvalidMessage,
            RoomError::InvalidCursor => ErrorCode::InvalidMessage,
            RoomError::Document(DocumentError::BadSyncPayload(_)) => ErrorCode::InvalidMessage,
            RoomError::Document(_) => ErrorCode::ServerError,
            RoomError::Storage(_) => ErrorCode::ServerError,
            RoomError::Voice(_) => ErrorCode::ServerError,
            RoomError::ShuttingDown => ErrorCode::ServerError,
        }
    }
}

/// Everything a connection needs after a successful join.
pub struct JoinReply {
    pub peers: Vec<PeerInfo>,
    pub document_state: Option<Vec<u8>>,
    pub chat_history: Vec<ChatEntry>,
    pub subscription: broadcast::Receiver<Envelope>,
}

/// Live-room info for the admin surface.
#[derive(Debug, Clone)]
pub struct RoomDetails {
    pub peers: Vec<PeerInfo>,
    pub file_count: usize,
    pub folder_count: usize,
}

type Reply<T> = oneshot::Sender<Result<T, RoomError>>;

/// Commands accepted by the room's mailbox.
pub enum RoomCommand {
    Join {
        peer_id: String,
        name: String,
        color: String,
        want_state: bool,
        reply: Reply<JoinReply>,
    },
    Leave {
        peer_id: String,
        reason: Option<String>,
    },
    Sync {
        peer_id: String,
        payload: Vec<u8>,
        reply: Reply<()>,
    },
    SyncRequest {
        peer_id: String,
        reply: Reply<ServerMessage>,
    },
    Cursor {
        peer_id: String,
        position: CursorPosition,
        reply: Reply<()>,
    },
    Presence {
        peer_id: String,
        status: PresenceStatus,
        active_file: Option<String>,
    },
    Chat {
        peer_id: String,
        content: String,
        reply: Reply<()>,
    },
    OpenFile {
        peer_id: String,
        file_path: String,
        reply: Reply<ServerMessage>,
    },
    CloseFile {
        peer_id: String,
        file_path: String,
    },
    Touch {
        peer_id: String,
    },
    Voice {
        peer_id: String,
        join: bool,
        reply: Reply<Option<ServerMessage>>,
    },
    Details {
        reply: Reply<RoomDetails>,
    },
    Shutdown,
}

/// Cheap cloneable handle to a room task.
#[derive(Clone)]
pub struct RoomHandle {
    project_id: String,
    cmd_tx: mpsc::Sender<RoomCommand>,
    peer_count: Arc<AtomicUsize>,
}

impl RoomHandle {
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// True once the room task has exited (evicted or shut down).
    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    pub fn peer_count(&self) -> usize {
        self.peer_count.load(Ordering::Relaxed)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> RoomCommand,
    ) -> Result<T, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| RoomError::ShuttingDown)?;
        rx.await.map_err(|_| RoomError::ShuttingDown)?
    }

    async fn notify(&self, cmd: RoomCommand) {
        let _ = self.cmd_tx.send(cmd).await;
    }

    pub async fn join(
        &self,
        peer_id: &str,
        name: &str,
        color: &str,
        want_state: bool,
    ) -> Result<JoinReply, RoomError> {
        let (peer_id, name, color) =
            (peer_id.to_string(), name.to_string(), color.to_string());
        self.request(move |reply| RoomCommand::Join {
            peer_id,
            name,
            color,
            want_state,
            reply,
        })
        .await
    }

    pub async fn leave(&self, peer_id: &str, reason: Option<String>) {
        self.notify(RoomCommand::Leave {
            peer_id: peer_id.to_string(),
            reason,
        })
        .await;
    }

    pub async fn sync(&self, peer_id: &str, payload: Vec<u8>) -> Result<(), RoomError> {
        let peer_id = peer_id.to_string();
        self.request(move |reply| RoomCommand::Sync {
            peer_id,
            payload,
            reply,
        })
        .await
    }

    pub async fn sync_request(&self, peer_id: &str) -> Result<ServerMessage, RoomError> {
        let peer_id = peer_id.to_string();
        self.request(move |reply| RoomCommand::SyncRequest { peer_id, reply })
            .await
    }

    pub async fn cursor(
        &self,
        peer_id: &str,
        position: CursorPosition,
    ) -> Result<(), RoomError> {
        let peer_id = peer_id.to_string();
        self.request(move |reply| RoomCommand::Cursor {
            peer_id,
            position,
            reply,
        })
        .await
    }

    pub async fn presence(
        &self,
        peer_id: &str,
        status: PresenceStatus,
        active_file: Option<String>,
    ) {
        self.notify(RoomCommand::Presence {
            peer_id: peer_id.to_string(),
            status,
            active_file,
        })
        .await;
    }

    pub async fn chat(&self, peer_id: &str, content: String) -> Result<(), RoomError> {
        let peer_id = peer_id.to_string();
        self.request(move |reply| RoomCommand::Chat {
            peer_id,
            content,
            reply,
        })
        .await
    }

    pub async fn open_file(
        &self,
        peer_id: &str,
        file_path: &str,
    ) -> Result<ServerMessage, RoomError> {
        let (peer_id, file_path) = (peer_id.to_string(), file_path.to_string());
        self.request(move |reply| RoomCommand::OpenFile {
            peer_id,
            file_path,
            reply,
        })
        .await
    }

    pub async fn close_file(&self, peer_id: &str, file_path: &str) {
        self.notify(RoomCommand::CloseFile {
            peer_id: peer_id.to_string(),
            file_path: file_path.to_string(),
        })
        .await;
    }

    pub async fn touch(&self, peer_id: &str) {
        self.notify(RoomCommand::Touch {
            peer_id: peer_id.to_string(),
        })
        .await;
    }

    pub async fn voice(
        &self,
        peer_id: &str,
        join: bool,
    ) -> Result<Option<ServerMessage>, RoomError> {
        let peer_id = peer_id.to_string();
        self.request(move |reply| RoomCommand::Voice {
            peer_id,
            join,
            reply,
        })
        .await
    }

    pub async fn details(&self) -> Result<RoomDetails, RoomError> {
        self.request(|reply| RoomCommand::Details { reply }).await
    }

    pub async fn shutdown(&self) {
        self.notify(RoomCommand::Shutdown).await;
    }
}

/// The room actor. Construct with [`Room::open`], which loads the document
/// from the store and spawns the command loop.
pub struct Room {
    project_id: String,
    name: String,
    config: RoomConfig,
    store: Arc<CollabStore>,
    issuer: Arc<dyn CredentialIssuer>,

    document: Document,
    next_seq: u64,
    presence: PresenceTable,
    sync_states: HashMap<String, PeerSyncState>,
    chat: VecDeque<ChatEntry>,

    broadcast_tx: broadcast::Sender<Envelope>,
    peer_count: Arc<AtomicUsize>,

    dirty: bool,
    chat_dirty: bool,
    pending_batches: u64,
    idle_deadline: Option<tokio::time::Instant>,
}

impl Room {
    /// Open (or lazily create) the project and spawn its command loop.
    pub fn open(
        project_id: &str,
        store: Arc<CollabStore>,
        issuer: Arc<dyn CredentialIssuer>,
        config: RoomConfig,
    ) -> Result<RoomHandle, RoomError> {
        let name = match store.get_meta(project_id)? {
            Some(meta) => meta.name,
            None => {
                let meta = ProjectMeta::new(project_id, project_id);
                store.put_meta(&meta)?;
                meta.name
            }
        };

        let (document, next_seq) = load_document(&store, project_id, &name)?;
        let chat: VecDeque<ChatEntry> = store.load_chat(project_id)?.into();

        let (broadcast_tx, _) = broadcast::channel(config.broadcast_capacity);
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let peer_count = Arc::new(AtomicUsize::new(0));

        let idle_grace = config.idle_grace;
        let mut room = Room {
            project_id: project_id.to_string(),
            name,
            config,
            store,
            issuer,
            document,
            next_seq,
            presence: PresenceTable::new(),
            sync_states: HashMap::new(),
            chat,
            broadcast_tx,
            peer_count: peer_count.clone(),
            dirty: false,
            chat_dirty: false,
            pending_batches: 0,
            idle_deadline: Some(tokio::time::Instant::now() + idle_grace),
        };

        let handle = RoomHandle {
            project_id: room.project_id.clone(),
            cmd_tx,
            peer_count,
        };

        log::info!("room {} opened (next change seq {})", room.project_id, room.next_seq);
        tokio::spawn(async move { room.run(cmd_rx).await });

        Ok(handle)
    }

    async fn run(&mut self, mut rx: mpsc::Receiver<RoomCommand>) {
        let mut flush_timer = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.flush_interval,
            self.config.flush_interval,
        );
        flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut sweep_timer = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.presence_sweep_interval,
            self.config.presence_sweep_interval,
        );
        sweep_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let idle_deadline = self.idle_deadline;
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(RoomCommand::Shutdown) => {
                        log::info!("room {} shutting down", self.project_id);
                        break;
                    }
                    Some(cmd) => {
                        self.handle(cmd);
                        self.rearm_idle();
                    }
                    // Every handle dropped: nothing can reach us again.
                    None => break,
                },
                _ = flush_timer.tick() => self.flush(),
                _ = sweep_timer.tick() => self.sweep_presence(),
                _ = async { tokio::time::sleep_until(idle_deadline.unwrap()).await },
                        if idle_deadline.is_some() => {
                    if self.presence.is_empty() {
                        log::info!(
                            "room {} idle for {:?}, evicting",
                            self.project_id,
                            self.config.idle_grace
                        );
                        break;
                    }
                    self.idle_deadline = None;
                }
            }
        }

        self.teardown(&mut rx);
    }

    fn rearm_idle(&mut self) {
        self.idle_deadline = self
            .presence
            .is_empty()
            .then(|| tokio::time::Instant::now() + self.config.idle_grace);
    }

    fn handle(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::Join {
                peer_id,
                name,
                color,
                want_state,
                reply,
            } => {
                let result = self.handle_join(peer_id, name, color, want_state);
                let _ = reply.send(result);
            }
            RoomCommand::Leave { peer_id, reason } => self.handle_leave(&peer_id, reason),
            RoomCommand::Sync {
                peer_id,
                payload,
                reply,
            } => {
                let _ = reply.send(self.handle_sync(&peer_id, &payload));
            }
            RoomCommand::SyncRequest { peer_id, reply } => {
                let _ = reply.send(self.handle_sync_request(&peer_id));
            }
            RoomCommand::Cursor {
                peer_id,
                position,
                reply,
            } => {
                let _ = reply.send(self.handle_cursor(&peer_id, position));
            }
            RoomCommand::Presence {
                peer_id,
                status,
                active_file,
            } => self.handle_presence(&peer_id, status, active_file),
            RoomCommand::Chat {
                peer_id,
                content,
                reply,
            } => {
                let _ = reply.send(self.handle_chat(&peer_id, content));
            }
            RoomCommand::OpenFile {
                peer_id,
                file_path,
                reply,
            } => {
                let _ = reply.send(self.handle_open_file(&peer_id, &file_path));
            }
            RoomCommand::CloseFile { peer_id, file_path } => {
                self.presence.close_file(&peer_id, &file_path);
                self.presence.touch(&peer_id);
            }
            RoomCommand::Touch { peer_id } => self.presence.touch(&peer_id),
            RoomCommand::Voice {
                peer_id,
                join,
                reply,
            } => {
                let _ = reply.send(self.handle_voice(&peer_id, join));
            }
            RoomCommand::Details { reply } => {
                let _ = reply.send(Ok(RoomDetails {
                    peers: self.presence.snapshot(),
                    file_count: self.document.file_count(),
                    folder_count: self.document.folder_count(),
                }));
            }
            // Handled in the select loop.
            RoomCommand::Shutdown => {}
        }
    }

    fn handle_join(
        &mut self,
        peer_id: String,
        name: String,
        color: String,
        want_state: bool,
    ) -> Result<JoinReply, RoomError> {
        if self.presence.contains(&peer_id) {
            return Err(RoomError::AlreadyJoined(peer_id));
        }
        if self.presence.len() >= self.config.max_peers {
            return Err(RoomError::Full);
        }

        // Restore the checkpointed sync state if one survives.
        let state = match self.store.get_sync_state(&self.project_id, &peer_id, unix_secs()) {
            Ok(Some(bytes)) => PeerSyncState::decode(&bytes).unwrap_or_else(|e| {
                log::warn!("discarding unreadable sync checkpoint for {peer_id}: {e}");
                PeerSyncState::new()
            }),
            Ok(None) => PeerSyncState::new(),
            Err(e) => {
                log::warn!("sync checkpoint load failed for {peer_id}: {e}");
                PeerSyncState::new()
            }
        };

        let peers = self.presence.snapshot_except(&peer_id);
        let document_state = want_state.then(|| self.document.save());

        let presence = PeerPresence::new(peer_id.clone(), name, color);
        let info = presence.info();
        self.presence.insert(presence);
        self.sync_states.insert(peer_id.clone(), state);
        self.peer_count.store(self.presence.len(), Ordering::Relaxed);

        let subscription = self.broadcast_tx.subscribe();
        self.publish(
            Target::AllExcept(peer_id.clone()),
            &ServerMessage::PeerJoined {
                project_id: self.project_id.clone(),
                peer: info,
            },
        );

        log::info!("peer {peer_id} joined project {}", self.project_id);
        Ok(JoinReply {
            peers,
            document_state,
            chat_history: self.chat.iter().cloned().collect(),
            subscription,
        })
    }

    fn handle_leave(&mut self, peer_id: &str, reason: Option<String>) {
        if self.presence.remove(peer_id).is_none() {
            return;
        }

        if let Some(state) = self.sync_states.remove(peer_id) {
            let expires_at = unix_secs() + self.config.sync_state_ttl.as_secs() as i64;
            if let Err(e) =
                self.store
                    .put_sync_state(&self.project_id, peer_id, &state.encode(), expires_at)
            {
                log::warn!("sync checkpoint save failed for {peer_id}: {e}");
            }
        }

        self.issuer.revoke(&self.project_id, peer_id);
        self.peer_count.store(self.presence.len(), Ordering::Relaxed);

        self.publish(
            Target::AllExcept(peer_id.to_string()),
            &ServerMessage::PeerLeft {
                project_id: self.project_id.clone(),
                peer_id: peer_id.to_string(),
                reason,
            },
        );
        log::info!("peer {peer_id} left project {}", self.project_id);
    }

    fn handle_sync(&mut self, peer_id: &str, payload: &[u8]) -> Result<(), RoomError> {
        if !self.presence.contains(peer_id) {
            return Err(RoomError::UnknownPeer(peer_id.to_string()));
        }
        let state = self
            .sync_states
            .get_mut(peer_id)
            .ok_or_else(|| RoomError::UnknownPeer(peer_id.to_string()))?;

        let delta = self.document.apply_remote(state, payload)?;

        // Durability before visibility: a batch that cannot be persisted is
        // rolled back and never broadcast.
        if let Some(batch) = delta {
            let seq = self.next_seq;
            if let Err(e) = self.store.append_changes(&self.project_id, seq, &batch) {
                log::error!(
                    "change append failed for project {}: {e}; rolling back",
                    self.project_id
                );
                self.rollback_document();
                return Err(RoomError::Storage(e));
            }
            self.next_seq += 1;
            self.pending_batches += 1;
            self.dirty = true;
        }

        self.presence.touch(peer_id);

        // Fan out: each member gets its own next payload.
        let others: Vec<String> = self
            .sync_states
            .keys()
            .filter(|p| p.as_str() != peer_id)
            .cloned()
            .collect();
        for other in others {
            if let Some(state) = self.sync_states.get_mut(&other) {
                if let Some(sync_data) = self.document.generate_for(state) {
                    self.publish(
                        Target::Peer(other.clone()),
                        &ServerMessage::SyncMessage {
                            project_id: self.project_id.clone(),
                            sync_data,
                            from_peer: Some(peer_id.to_string()),
                        },
                    );
                }
            }
        }

        // Reply half of the handshake for the originator.
        if let Some(state) = self.sync_states.get_mut(peer_id) {
            if let Some(sync_data) = self.document.generate_for(state) {
                self.publish(
                    Target::Peer(peer_id.to_string()),
                    &ServerMessage::SyncMessage {
                        project_id: self.project_id.clone(),
                        sync_data,
                        from_peer: None,
                    },
                );
            }
        }

        if self.pending_batches >= self.config.flush_batch_threshold {
            self.flush();
        }
        Ok(())
    }

    fn handle_sync_request(&mut self, peer_id: &str) -> Result<ServerMessage, RoomError> {
        let state = self
            .sync_states
            .get_mut(peer_id)
            .ok_or_else(|| RoomError::UnknownPeer(peer_id.to_string()))?;
        self.presence.touch(peer_id);
        Ok(match self.document.generate_for(state) {
            Some(sync_data) => ServerMessage::SyncMessage {
                project_id: self.project_id.clone(),
                sync_data,
                from_peer: None,
            },
            None => ServerMessage::SyncComplete {
                project_id: self.project_id.clone(),
            },
        })
    }

    fn handle_cursor(
        &mut self,
        peer_id: &str,
        position: CursorPosition,
    ) -> Result<(), RoomError> {
        if !position.is_valid() {
            return Err(RoomError::InvalidCursor);
        }
        let (name, color) = match self.presence.get(peer_id) {
            Some(peer) => (peer.name.clone(), peer.color.clone()),
            None => return Err(RoomError::UnknownPeer(peer_id.to_string())),
        };

        let broadcast = ServerMessage::CursorBroadcast {
            project_id: self.project_id.clone(),
            peer_id: peer_id.to_string(),
            peer_name: name,
            peer_color: color,
            file_path: position.file_path.clone(),
            line: position.line,
            column: position.column,
            selection_end: position.selection_end,
        };
        self.presence.set_cursor(peer_id, position);
        self.publish(Target::AllExcept(peer_id.to_string()), &broadcast);
        Ok(())
    }

    fn handle_presence(
        &mut self,
        peer_id: &str,
        status: PresenceStatus,
        active_file: Option<String>,
    ) {
        if !self.presence.set_status(peer_id, status, active_file.clone()) {
            return;
        }
        let name = self
            .presence
            .get(peer_id)
            .map(|p| p.name.clone())
            .unwrap_or_default();
        self.publish(
            Target::AllExcept(peer_id.to_string()),
            &ServerMessage::PresenceBroadcast {
                project_id: self.project_id.clone(),
                peer_id: peer_id.to_string(),
                peer_name: name,
                status,
                active_file,
                last_active: unix_secs(),
            },
        );
    }

    fn handle_chat(&mut self, peer_id: &str, content: String) -> Result<(), RoomError> {
        if content.len() > self.config.chat_content_max {
            return Err(RoomError::ChatTooLarge(self.config.chat_content_max));
        }
        let name = self
            .presence
            .get(peer_id)
            .map(|p| p.name.clone())
            .ok_or_else(|| RoomError::UnknownPeer(peer_id.to_string()))?;

        let entry = ChatEntry {
            peer_id: peer_id.to_string(),
            peer_name: name.clone(),
            content: content.clone(),
            timestamp: unix_secs(),
        };
        self.chat.push_back(entry.clone());
        while self.chat.len() > self.config.chat_history_limit {
            self.chat.pop_front();
        }
        self.chat_dirty = true;
        self.presence.touch(peer_id);

        // Everyone sees the message, the sender included: the server
        // timestamp is authoritative.
        self.publish(
            Target::All,
            &ServerMessage::ChatBroadcast {
                project_id: self.project_id.clone(),
                peer_id: entry.peer_id,
                peer_name: name,
                content,
                timestamp: entry.timestamp,
            },
        );
        Ok(())
    }

    fn handle_open_file(
        &mut self,
        peer_id: &str,
        file_path: &str,
    ) -> Result<ServerMessage, RoomError> {
        if !self.presence.contains(peer_id) {
            return Err(RoomError::UnknownPeer(peer_id.to_string()));
        }
        self.presence.touch(peer_id);
        Ok(match self.document.file(file_path)? {
            Some(file) => ServerMessage::FileContent {
                project_id: self.project_id.clone(),
                file_path: file.path,
                content: file.content,
                language: file.language,
                version: file.version,
            },
            None => ServerMessage::FileNotFound {
                project_id: self.project_id.clone(),
                file_path: file_path.to_string(),
            },
        })
    }

    fn handle_voice(
        &mut self,
        peer_id: &str,
        join: bool,
    ) -> Result<Option<ServerMessage>, RoomError> {
        let name = self
            .presence
            .get(peer_id)
            .map(|p| p.name.clone())
            .ok_or_else(|| RoomError::UnknownPeer(peer_id.to_string()))?;
        self.presence.touch(peer_id);

        if !join {
            self.issuer.revoke(&self.project_id, peer_id);
            return Ok(None);
        }

        let grant = self.issuer.issue_token(&self.project_id, peer_id, &name)?;
        Ok(Some(ServerMessage::VoiceToken {
            project_id: self.project_id.clone(),
            token: grant.token,
            room_name: grant.room_name,
            server_url: grant.server_url,
        }))
    }

    fn sweep_presence(&mut self) {
        for info in self.presence.sweep() {
            self.publish(
                Target::All,
                &ServerMessage::PresenceBroadcast {
                    project_id: self.project_id.clone(),
                    peer_id: info.peer_id.clone(),
                    peer_name: info.name,
                    status: info.status,
                    active_file: info.active_file,
                    last_active: unix_secs(),
                },
            );
        }
    }

    /// Consolidate the change log into a snapshot. Failures are logged and
    /// retried on the next interval; the in-memory document stays
    /// authoritative.
    fn flush(&mut self) {
        if self.dirty {
            let snapshot = self.document.save();
            let up_to = self.next_seq.saturating_sub(1);
            match self.store.compact(&self.project_id, &snapshot, up_to) {
                Ok(deleted) => {
                    log::debug!(
                        "project {} compacted: {deleted} change batches folded into snapshot",
                        self.project_id
                    );
                    self.dirty = false;
                    self.pending_batches = 0;
                }
                Err(e) => log::error!("snapshot flush failed for {}: {e}", self.project_id),
            }
        }
        if self.chat_dirty {
            let entries: Vec<ChatEntry> = self.chat.iter().cloned().collect();
            match self.store.save_chat(&self.project_id, &entries) {
                Ok(()) => self.chat_dirty = false,
                Err(e) => log::warn!("chat flush failed for {}: {e}", self.project_id),
            }
        }
    }

    /// Discard the in-memory document in favor of the persisted state. Peer
    /// sync states are reset so the next handshake re-derives what each
    /// peer has.
    fn rollback_document(&mut self) {
        match load_document(&self.store, &self.project_id, &self.name) {
            Ok((document, next_seq)) => {
                self.document = document;
                self.next_seq = next_seq;
                for state in self.sync_states.values_mut() {
                    *state = PeerSyncState::new();
                }
            }
            Err(e) => {
                log::error!(
                    "rollback reload failed for {}: {e}; state may diverge until restart",
                    self.project_id
                );
            }
        }
    }

    fn teardown(&mut self, rx: &mut mpsc::Receiver<RoomCommand>) {
        // Checkpoint whoever is still connected, then persist everything.
        let expires_at = unix_secs() + self.config.sync_state_ttl.as_secs() as i64;
        for (peer_id, state) in &self.sync_states {
            if let Err(e) =
                self.store
                    .put_sync_state(&self.project_id, peer_id, &state.encode(), expires_at)
            {
                log::warn!("teardown checkpoint failed for {peer_id}: {e}");
            }
        }
        self.dirty = self.dirty || self.next_seq > 0;
        self.flush();

        // Refuse whatever is still queued.
        rx.close();
        while let Ok(cmd) = rx.try_recv() {
            Self::refuse(cmd);
        }
        self.peer_count.store(0, Ordering::Relaxed);
        log::info!("room {} closed", self.project_id);
    }

    fn refuse(cmd: RoomCommand) {
        match cmd {
            RoomCommand::Join { reply, .. } => {
                let _ = reply.send(Err(RoomError::ShuttingDown));
            }
            RoomCommand::Sync { reply, .. } => {
                let _ = reply.send(Err(RoomError::ShuttingDown));
            }
            RoomCommand::SyncRequest { reply, .. } => {
                let _ = reply.send(Err(RoomError::ShuttingDown));
            }
            RoomCommand::Cursor { reply, .. } => {
                let _ = reply.send(Err(RoomError::ShuttingDown));
            }
            RoomCommand::Chat { reply, .. } => {
                let _ = reply.send(Err(RoomError::ShuttingDown));
            }
            RoomCommand::OpenFile { reply, .. } => {
                let _ = reply.send(Err(RoomError::ShuttingDown));
            }
            RoomCommand::Voice { reply, .. } => {
                let _ = reply.send(Err(RoomError::ShuttingDown));
            }
            RoomCommand::Details { reply } => {
                let _ = reply.send(Err(RoomError::ShuttingDown));
            }
            RoomCommand::Leave { .. }
            | RoomCommand::Presence { .. }
            | RoomCommand::CloseFile { .. }
            | RoomCommand::Touch { .. }
            | RoomCommand::Shutdown => {}
        }
    }

    fn publish(&self, target: Target, msg: &ServerMessage) {
        match encode_server(msg) {
            Ok(frame) => {
                // No receivers is normal for an empty room.
                let _ = self.broadcast_tx.send(Envelope { target, frame });
            }
            Err(e) => log::error!("broadcast encode failed in {}: {e}", self.project_id),
        }
    }
}

/// Replay snapshot plus change log. Returns the document and the next
/// change sequence.
///
/// A brand-new project persists its initial snapshot immediately: every
/// later room instance (and every peer bootstrap) must share the same
/// root objects, or concurrent replicas would fork the document roots.
fn load_document(
    store: &CollabStore,
    project_id: &str,
    name: &str,
) -> Result<(Document, u64), RoomError> {
    let snapshot = match store.load_snapshot(project_id)? {
        Some(snapshot) => snapshot,
        None => {
            let mut fresh = Document::new(name)?;
            let snapshot = fresh.save();
            store.save_snapshot(project_id, &snapshot)?;
            snapshot
        }
    };
    let mut document = Document::load(name, &snapshot)?;

    let mut next_seq = 0;
    for (seq, batch) in store.load_changes(project_id)? {
        document.apply_change_batch(&batch)?;
        next_seq = seq + 1;
    }
    // The replayed increments are already persisted; drop them from the
    // incremental buffer so the next drain yields only fresh changes.
    let _ = document.take_change_batch();

    Ok((document, next_seq))
}
