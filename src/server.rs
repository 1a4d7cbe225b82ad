//! Process-wide server state: room registry, sessions, statistics.
//!
//! The registry guarantees at most one live room per project id: a
//! read-lock fast path, then a write-lock double check before opening.
//! Rooms evict themselves (their task exits); the registry lazily replaces
//! closed handles on the next open and prunes them in the maintenance
//! sweep.
//!
//! Sessions bind `(peer_id, color)` to an opaque token so a client that
//! reconnects within the TTL gets its prior identity back.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::clock::unix_secs;
use crate::presence::color_for_index;
use crate::room::{Room, RoomConfig, RoomError, RoomHandle};
use crate::storage::CollabStore;
use crate::voice::CredentialIssuer;

/// Server-wide configuration. Defaults are the protocol contract's values.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub storage_path: PathBuf,
    pub max_peers_per_project: usize,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    pub ping_interval: Duration,
    pub room_idle_grace: Duration,
    pub flush_interval: Duration,
    pub flush_batch_threshold: u64,
    pub session_ttl: Duration,
    pub chat_history_limit: usize,
    pub chat_content_max: usize,
    pub outbound_queue_limit: usize,
    pub broadcast_capacity: usize,
    pub presence_sweep_interval: Duration,
    pub maintenance_interval: Duration,
    /// A socket write blocked longer than this counts as queue overflow.
    pub write_stall_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            storage_path: PathBuf::from("./data/collab"),
            max_peers_per_project: 50,
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(25),
            room_idle_grace: Duration::from_secs(300),
            flush_interval: Duration::from_secs(30),
            flush_batch_threshold: 64,
            session_ttl: Duration::from_secs(24 * 60 * 60),
            chat_history_limit: 200,
            chat_content_max: 4096,
            outbound_queue_limit: 1024,
            broadcast_capacity: 1024,
            presence_sweep_interval: Duration::from_secs(30),
            maintenance_interval: Duration::from_secs(60),
            write_stall_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    pub fn room_config(&self) -> RoomConfig {
        RoomConfig {
            max_peers: self.max_peers_per_project,
            chat_history_limit: self.chat_history_limit,
            chat_content_max: self.chat_content_max,
            broadcast_capacity: self.broadcast_capacity,
            idle_grace: self.room_idle_grace,
            flush_interval: self.flush_interval,
            flush_batch_threshold: self.flush_batch_threshold,
            presence_sweep_interval: self.presence_sweep_interval,
            sync_state_ttl: self.session_ttl,
        }
    }
}

/// Identity resolved during the Hello handshake.
#[derive(Debug, Clone)]
pub struct ServerIdentity {
    pub peer_id: String,
    pub name: String,
    pub color: String,
    pub session_token: String,
    pub resumed: bool,
}

#[derive(Debug, Clone)]
struct Session {
    peer_id: String,
    color: String,
    expires_at: i64,
}

/// Server statistics for the admin surface.
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub active_projects: usize,
    pub active_peers: u64,
    pub uptime_seconds: u64,
}

/// The process-wide server.
pub struct CollabServer {
    config: ServerConfig,
    store: Arc<CollabStore>,
    issuer: Arc<dyn CredentialIssuer>,
    rooms: RwLock<HashMap<String, RoomHandle>>,
    sessions: Mutex<HashMap<String, Session>>,
    peer_index: AtomicU64,
    active_peers: AtomicU64,
    started_at: Instant,
}

impl CollabServer {
    pub fn new(
        config: ServerConfig,
        store: Arc<CollabStore>,
        issuer: Arc<dyn CredentialIssuer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            issuer,
            rooms: RwLock::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            peer_index: AtomicU64::new(0),
            active_peers: AtomicU64::new(0),
            started_at: Instant::now(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CollabStore> {
        &self.store
    }

    /// Resolve the connecting client's identity: restore a session within
    /// TTL, or mint a fresh peer id, palette color, and token.
    pub async fn handshake(
        &self,
        client_name: &str,
        session_token: Option<&str>,
    ) -> ServerIdentity {
        let name = if client_name.trim().is_empty() {
            "Anonymous".to_string()
        } else {
            client_name.to_string()
        };

        if let Some(token) = session_token {
            let sessions = self.sessions.lock().await;
            if let Some(session) = sessions.get(token) {
                if session.expires_at > unix_secs() {
                    return ServerIdentity {
                        peer_id: session.peer_id.clone(),
                        name,
                        color: session.color.clone(),
                        session_token: token.to_string(),
                        resumed: true,
                    };
                }
            }
        }

        let peer_id = Uuid::new_v4().to_string();
        let color = color_for_index(self.peer_index.fetch_add(1, Ordering::Relaxed)).to_string();
        let token = format!(
            "{}{}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple()
        );

        self.sessions.lock().await.insert(
            token.clone(),
            Session {
                peer_id: peer_id.clone(),
                color: color.clone(),
                expires_at: unix_secs() + self.config.session_ttl.as_secs() as i64,
            },
        );

        ServerIdentity {
            peer_id,
            name,
            color,
            session_token: token,
            resumed: false,
        }
    }

    /// Get the live room for a project, opening it from the store if cold.
    pub async fn get_or_open_room(&self, project_id: &str) -> Result<RoomHandle, RoomError> {
        {
            let rooms = self.rooms.read().await;
            if let Some(handle) = rooms.get(project_id) {
                if !handle.is_closed() {
                    return Ok(handle.clone());
                }
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check under the write lock: another task may have won.
        if let Some(handle) = rooms.get(project_id) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
        }

        let handle = Room::open(
            project_id,
            self.store.clone(),
            self.issuer.clone(),
            self.config.room_config(),
        )?;
        rooms.insert(project_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// The live room for a project, if any.
    pub async fn room(&self, project_id: &str) -> Option<RoomHandle> {
        let rooms = self.rooms.read().await;
        rooms
            .get(project_id)
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    pub async fn stats(&self) -> ServerStats {
        let rooms = self.rooms.read().await;
        ServerStats {
            active_projects: rooms.values().filter(|h| !h.is_closed()).count(),
            active_peers: self.active_peers.load(Ordering::Relaxed),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    pub fn connection_opened(&self) {
        self.active_peers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_peers.fetch_sub(1, Ordering::Relaxed);
    }

    /// Periodic housekeeping: prune evicted rooms, expire sessions and
    /// checkpointed sync states.
    pub fn spawn_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(server.config.maintenance_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                server.run_maintenance().await;
            }
        })
    }

    pub async fn run_maintenance(&self) {
        let now = unix_secs();

        {
            let mut rooms = self.rooms.write().await;
            let before = rooms.len();
            rooms.retain(|_, handle| !handle.is_closed());
            let pruned = before - rooms.len();
            if pruned > 0 {
                log::debug!("pruned {pruned} evicted room handles");
            }
        }

        {
            let mut sessions = self.sessions.lock().await;
            sessions.retain(|_, session| session.expires_at > now);
        }

        match self.store.delete_expired_sync_states(now) {
            Ok(0) => {}
            Ok(n) => log::debug!("expired {n} sync-state checkpoints"),
            Err(e) => log::warn!("sync-state expiry sweep failed: {e}"),
        }
    }

    /// Graceful shutdown: ask every room to flush and close.
    pub async fn shutdown(&self) {
        let handles: Vec<RoomHandle> = {
            let rooms = self.rooms.read().await;
            rooms.values().cloned().collect()
        };
        for handle in handles {
            handle.shutdown().await;
        }
        log::info!("server shutdown: all rooms closed");
    }
}

/// Project ids are non-empty, at most 128 bytes, and contain only
/// URL-path-safe characters.
pub fn validate_project_id(project_id: &str) -> bool {
    !project_id.is_empty()
        && project_id.len() <= 128
        && project_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~'))
}
