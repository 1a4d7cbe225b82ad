//! Presence and cursor state for one room.
//!
//! Ephemeral by design: nothing here touches the CRDT or the store. The
//! table is owned exclusively by the room's command loop, which serializes
//! every mutation, so plain collections suffice.
//!
//! Status transitions: clients drive them with `PresenceUpdate`; the server
//! additionally demotes Active → Idle after 60 s without a frame and to
//! Away after 5 min. Offline is only set at disconnect. Cursors are
//! replaced, never merged, and are dropped when the peer leaves.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::clock::{unix_millis, unix_secs};
use crate::protocol::{PeerInfo, PresenceStatus};

/// No activity for this long demotes a peer to Idle.
pub const IDLE_AFTER: Duration = Duration::from_secs(60);

/// No activity for this long demotes a peer to Away.
pub const AWAY_AFTER: Duration = Duration::from_secs(300);

/// Stable peer color palette; a peer's color is `PALETTE[index % len]`.
pub const PALETTE: [&str; 14] = [
    "#3b82f6", // blue
    "#ef4444", // red
    "#22c55e", // green
    "#f59e0b", // amber
    "#8b5cf6", // violet
    "#ec4899", // pink
    "#06b6d4", // cyan
    "#f97316", // orange
    "#14b8a6", // teal
    "#a855f7", // purple
    "#84cc16", // lime
    "#6366f1", // indigo
    "#d946ef", // fuchsia
    "#0ea5e9", // sky
];

/// Color for the nth peer the server has ever welcomed.
pub fn color_for_index(index: u64) -> &'static str {
    PALETTE[(index % PALETTE.len() as u64) as usize]
}

/// A cursor position inside one file. 1-based coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorPosition {
    pub file_path: String,
    pub line: u32,
    pub column: u32,
    pub selection_end: Option<(u32, u32)>,
}

impl CursorPosition {
    /// Zero or "negative" (wrapped) coordinates are invalid.
    pub fn is_valid(&self) -> bool {
        self.line >= 1
            && self.column >= 1
            && self
                .selection_end
                .map_or(true, |(l, c)| l >= 1 && c >= 1)
    }
}

/// One peer's presence entry.
#[derive(Debug, Clone)]
pub struct PeerPresence {
    pub peer_id: String,
    pub name: String,
    pub color: String,
    pub status: PresenceStatus,
    pub active_file: Option<String>,
    pub joined_at: i64,
    pub last_active_ms: i64,
    pub cursor: Option<CursorPosition>,
    last_frame: Instant,
}

impl PeerPresence {
    pub fn new(
        peer_id: impl Into<String>,
        name: impl Into<String>,
        color: impl Into<String>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            name: name.into(),
            color: color.into(),
            status: PresenceStatus::Active,
            active_file: None,
            joined_at: unix_secs(),
            last_active_ms: unix_millis(),
            cursor: None,
            last_frame: Instant::now(),
        }
    }

    /// Record activity. Any frame from the peer counts.
    pub fn touch(&mut self) {
        self.last_active_ms = unix_millis();
        self.last_frame = Instant::now();
        if self.status != PresenceStatus::Offline {
            self.status = PresenceStatus::Active;
        }
    }

    /// Server-side demotion by inactivity. Returns the new status when it
    /// changed.
    fn demote(&mut self) -> Option<PresenceStatus> {
        if self.status == PresenceStatus::Offline {
            return None;
        }
        let elapsed = self.last_frame.elapsed();
        let next = if elapsed >= AWAY_AFTER {
            PresenceStatus::Away
        } else if elapsed >= IDLE_AFTER {
            PresenceStatus::Idle
        } else {
            return None;
        };
        (self.status != next).then(|| {
            self.status = next;
            next
        })
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            peer_id: self.peer_id.clone(),
            name: self.name.clone(),
            color: self.color.clone(),
            status: self.status,
            active_file: self.active_file.clone(),
            joined_at: self.joined_at,
        }
    }
}

/// The room's presence table.
#[derive(Debug, Default)]
pub struct PresenceTable {
    peers: HashMap<String, PeerPresence>,
}

impl PresenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, presence: PeerPresence) {
        self.peers.insert(presence.peer_id.clone(), presence);
    }

    pub fn remove(&mut self, peer_id: &str) -> Option<PeerPresence> {
        self.peers.remove(peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerPresence> {
        self.peers.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &str) -> Option<&mut PeerPresence> {
        self.peers.get_mut(peer_id)
    }

    pub fn touch(&mut self, peer_id: &str) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.touch();
        }
    }

    /// Replace the cursor for `(peer, file)`; also marks the file active.
    pub fn set_cursor(&mut self, peer_id: &str, cursor: CursorPosition) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(peer) => {
                peer.active_file = Some(cursor.file_path.clone());
                peer.cursor = Some(cursor);
                peer.touch();
                true
            }
            None => false,
        }
    }

    /// Client-driven status update.
    pub fn set_status(
        &mut self,
        peer_id: &str,
        status: PresenceStatus,
        active_file: Option<String>,
    ) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(peer) => {
                peer.status = status;
                peer.active_file = active_file;
                peer.last_active_ms = unix_millis();
                peer.last_frame = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Clear the active file if the peer just closed it.
    pub fn close_file(&mut self, peer_id: &str, file_path: &str) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            if peer.active_file.as_deref() == Some(file_path) {
                peer.active_file = None;
            }
            if peer
                .cursor
                .as_ref()
                .is_some_and(|c| c.file_path == file_path)
            {
                peer.cursor = None;
            }
        }
    }

    /// Demote inactive peers; returns the transitions to broadcast.
    pub fn sweep(&mut self) -> Vec<PeerInfo> {
        let mut changed = Vec::new();
        for peer in self.peers.values_mut() {
            if peer.demote().is_some() {
                changed.push(peer.info());
            }
        }
        changed
    }

    /// Every peer except `exclude`.
    pub fn snapshot_except(&self, exclude: &str) -> Vec<PeerInfo> {
        self.peers
            .values()
            .filter(|p| p.peer_id != exclude)
            .map(PeerPresence::info)
            .collect()
    }

    pub fn snapshot(&self) -> Vec<PeerInfo> {
        self.peers.values().map(PeerPresence::info).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_palette_stability() {
        assert_eq!(color_for_index(0), "#3b82f6");
        assert_eq!(color_for_index(14), "#3b82f6");
        assert_eq!(color_for_index(1), color_for_index(15));
        for color in PALETTE {
            assert!(color.starts_with('#'));
            assert_eq!(color.len(), 7);
        }
    }

    #[test]
    fn test_cursor_validation() {
        let mut cursor = CursorPosition {
            file_path: "/a.rs".into(),
            line: 1,
            column: 1,
            selection_end: None,
        };
        assert!(cursor.is_valid());

        cursor.line = 0;
        assert!(!cursor.is_valid());

        cursor.line = 10;
        cursor.selection_end = Some((10, 0));
        assert!(!cursor.is_valid());
    }

    #[test]
    fn test_insert_remove() {
        let mut table = PresenceTable::new();
        table.insert(PeerPresence::new("p1", "Ada", "#3b82f6"));
        assert!(table.contains("p1"));
        assert_eq!(table.len(), 1);

        let removed = table.remove("p1").unwrap();
        assert_eq!(removed.name, "Ada");
        assert!(table.is_empty());
    }

    #[test]
    fn test_cursor_replaced_not_merged() {
        let mut table = PresenceTable::new();
        table.insert(PeerPresence::new("p1", "Ada", "#3b82f6"));

        table.set_cursor(
            "p1",
            CursorPosition {
                file_path: "/a.rs".into(),
                line: 5,
                column: 2,
                selection_end: Some((5, 9)),
            },
        );
        table.set_cursor(
            "p1",
            CursorPosition {
                file_path: "/a.rs".into(),
                line: 8,
                column: 1,
                selection_end: None,
            },
        );

        let peer = table.get("p1").unwrap();
        let cursor = peer.cursor.as_ref().unwrap();
        assert_eq!(cursor.line, 8);
        assert!(cursor.selection_end.is_none());
        assert_eq!(peer.active_file.as_deref(), Some("/a.rs"));
    }

    #[test]
    fn test_close_file_clears_cursor() {
        let mut table = PresenceTable::new();
        table.insert(PeerPresence::new("p1", "Ada", "#3b82f6"));
        table.set_cursor(
            "p1",
            CursorPosition {
                file_path: "/a.rs".into(),
                line: 1,
                column: 1,
                selection_end: None,
            },
        );

        table.close_file("p1", "/a.rs");
        let peer = table.get("p1").unwrap();
        assert!(peer.cursor.is_none());
        assert!(peer.active_file.is_none());
    }

    #[test]
    fn test_demotion_by_inactivity() {
        let mut peer = PeerPresence::new("p1", "Ada", "#3b82f6");
        assert!(peer.demote().is_none());

        peer.last_frame = Instant::now() - IDLE_AFTER;
        assert_eq!(peer.demote(), Some(PresenceStatus::Idle));
        // Already idle; no repeated transition.
        assert!(peer.demote().is_none());

        peer.last_frame = Instant::now() - AWAY_AFTER;
        assert_eq!(peer.demote(), Some(PresenceStatus::Away));
    }

    #[test]
    fn test_touch_promotes_back_to_active() {
        let mut peer = PeerPresence::new("p1", "Ada", "#3b82f6");
        peer.last_frame = Instant::now() - IDLE_AFTER;
        peer.demote();
        assert_eq!(peer.status, PresenceStatus::Idle);

        peer.touch();
        assert_eq!(peer.status, PresenceStatus::Active);
    }

    #[test]
    fn test_sweep_reports_transitions() {
        let mut table = PresenceTable::new();
        table.insert(PeerPresence::new("fresh", "Ada", "#3b82f6"));
        let mut stale = PeerPresence::new("stale", "Bob", "#ef4444");
        stale.last_frame = Instant::now() - IDLE_AFTER;
        table.insert(stale);

        let changed = table.sweep();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].peer_id, "stale");
        assert_eq!(changed[0].status, PresenceStatus::Idle);
    }

    #[test]
    fn test_snapshot_except() {
        let mut table = PresenceTable::new();
        table.insert(PeerPresence::new("p1", "Ada", "#3b82f6"));
        table.insert(PeerPresence::new("p2", "Bob", "#ef4444"));

        let others = table.snapshot_except("p1");
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].peer_id, "p2");
        assert_eq!(table.snapshot().len(), 2);
    }
}
