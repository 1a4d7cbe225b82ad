//! Room-level integration: command semantics, fan-out policy, backpressure.

use std::sync::Arc;
use std::time::Duration;

use codecollab_server::document::{Document, PeerSyncState};
use codecollab_server::protocol::{decode_server, ServerMessage};
use codecollab_server::room::{Envelope, Room, RoomConfig, RoomHandle};
use codecollab_server::storage::{CollabStore, StoreConfig};
use codecollab_server::voice::{CredentialIssuer, LiveKitIssuer};
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::timeout;

fn open_room(config: RoomConfig) -> (TempDir, Arc<CollabStore>, RoomHandle) {
    let dir = TempDir::new().unwrap();
    let store =
        Arc::new(CollabStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
    let issuer: Arc<dyn CredentialIssuer> = Arc::new(LiveKitIssuer::unconfigured());
    let handle = Room::open("proj", store.clone(), issuer, config).unwrap();
    (dir, store, handle)
}

/// Next decoded message addressed to `peer_id` on this subscription.
async fn recv_for(rx: &mut broadcast::Receiver<Envelope>, peer_id: &str) -> ServerMessage {
    loop {
        let env = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("broadcast timeout")
            .expect("broadcast closed");
        if env.is_for(peer_id) {
            return decode_server(&env.frame).unwrap();
        }
    }
}

/// Drain any sync messages queued for `peer_id` into its replica.
async fn drain_sync(
    rx: &mut broadcast::Receiver<Envelope>,
    peer_id: &str,
    doc: &mut Document,
    state: &mut PeerSyncState,
) {
    loop {
        let env = match timeout(Duration::from_millis(200), rx.recv()).await {
            Ok(Ok(env)) => env,
            _ => return,
        };
        if !env.is_for(peer_id) {
            continue;
        }
        if let Ok(ServerMessage::SyncMessage { sync_data, .. }) = decode_server(&env.frame) {
            doc.apply_remote(state, &sync_data).unwrap();
        }
    }
}

/// Run the anti-entropy loop for one client replica against the room.
async fn sync_client(
    room: &RoomHandle,
    rx: &mut broadcast::Receiver<Envelope>,
    peer_id: &str,
    doc: &mut Document,
    state: &mut PeerSyncState,
) {
    for _ in 0..30 {
        if let Some(payload) = doc.generate_for(state) {
            room.sync(peer_id, payload).await.unwrap();
        }
        drain_sync(rx, peer_id, doc, state).await;

        if doc.generate_for(state).is_none() {
            match room.sync_request(peer_id).await.unwrap() {
                ServerMessage::SyncComplete { .. } => return,
                ServerMessage::SyncMessage { sync_data, .. } => {
                    doc.apply_remote(state, &sync_data).unwrap();
                }
                other => panic!("unexpected sync reply: {other:?}"),
            }
        }
    }
    panic!("client {peer_id} did not converge");
}

#[tokio::test]
async fn test_two_replicas_converge_through_room() {
    let (_dir, _store, room) = open_room(RoomConfig::default());

    let mut a = room.join("a", "Ada", "#3b82f6", true).await.unwrap();
    let mut doc_a = Document::load("proj", &a.document_state.take().unwrap()).unwrap();
    let mut state_a = PeerSyncState::new();

    doc_a.create_file("/src/main.rs", None).unwrap();
    doc_a.set_file_content("/src/main.rs", "fn main() {}").unwrap();
    sync_client(&room, &mut a.subscription, "a", &mut doc_a, &mut state_a).await;

    // Second replica bootstraps from the (now populated) room state.
    let mut b = room.join("b", "Bob", "#ef4444", true).await.unwrap();
    let mut doc_b = Document::load("proj", &b.document_state.take().unwrap()).unwrap();
    let mut state_b = PeerSyncState::new();
    sync_client(&room, &mut b.subscription, "b", &mut doc_b, &mut state_b).await;

    let file = doc_b.file("/src/main.rs").unwrap().unwrap();
    assert_eq!(file.content, "fn main() {}");
    assert_eq!(file.language, "rust");
    assert_eq!(
        doc_a.file("/src/main.rs").unwrap().unwrap().content,
        doc_b.file("/src/main.rs").unwrap().unwrap().content
    );
}

#[tokio::test]
async fn test_edit_relayed_to_other_peer_with_attribution() {
    let (_dir, _store, room) = open_room(RoomConfig::default());

    let mut a = room.join("a", "Ada", "#3b82f6", true).await.unwrap();
    let mut doc_a = Document::load("proj", &a.document_state.take().unwrap()).unwrap();
    let mut state_a = PeerSyncState::new();
    sync_client(&room, &mut a.subscription, "a", &mut doc_a, &mut state_a).await;

    let mut b = room.join("b", "Bob", "#ef4444", true).await.unwrap();
    let mut doc_b = Document::load("proj", &b.document_state.take().unwrap()).unwrap();
    let mut state_b = PeerSyncState::new();
    sync_client(&room, &mut b.subscription, "b", &mut doc_b, &mut state_b).await;

    // A edits; B's copy of the fan-out names A as the origin.
    doc_a.create_file("/note.md", None).unwrap();
    let payload = doc_a.generate_for(&mut state_a).unwrap();
    room.sync("a", payload).await.unwrap();

    let mut saw_from_a = false;
    for _ in 0..10 {
        let env = timeout(Duration::from_secs(1), b.subscription.recv())
            .await
            .expect("no fan-out for b")
            .unwrap();
        if !env.is_for("b") {
            continue;
        }
        if let ServerMessage::SyncMessage {
            sync_data,
            from_peer,
            ..
        } = decode_server(&env.frame).unwrap()
        {
            saw_from_a |= from_peer.as_deref() == Some("a");
            doc_b.apply_remote(&mut state_b, &sync_data).unwrap();
            if doc_b.file("/note.md").unwrap().is_some() {
                break;
            }
            if let Some(p) = doc_b.generate_for(&mut state_b) {
                room.sync("b", p).await.unwrap();
            }
        }
    }
    assert!(saw_from_a, "fan-out did not carry the originating peer");
    sync_client(&room, &mut b.subscription, "b", &mut doc_b, &mut state_b).await;
    assert!(doc_b.file("/note.md").unwrap().is_some());
}

#[tokio::test]
async fn test_backpressure_isolates_stalled_subscriber() {
    let config = RoomConfig {
        broadcast_capacity: 8,
        ..RoomConfig::default()
    };
    let (_dir, _store, room) = open_room(config);

    let mut p1 = room.join("p1", "A", "#111111", false).await.unwrap();
    let mut p2 = room.join("p2", "B", "#222222", false).await.unwrap();
    let p3 = room.join("p3", "C", "#333333", false).await.unwrap();
    let mut p4 = room.join("p4", "D", "#444444", false).await.unwrap();

    // Drain the join notifications for the live subscribers.
    for _ in 0..3 {
        recv_for(&mut p1.subscription, "p1").await;
    }
    for _ in 0..2 {
        recv_for(&mut p2.subscription, "p2").await;
    }

    // p3 never drains its subscription. Everyone else keeps up with a
    // burst far past the per-subscriber buffer.
    let mut stalled = p3.subscription;
    for i in 0..40 {
        room.chat("p1", format!("burst {i}")).await.unwrap();
        for (rx, id) in [
            (&mut p1.subscription, "p1"),
            (&mut p2.subscription, "p2"),
            (&mut p4.subscription, "p4"),
        ] {
            match recv_for(rx, id).await {
                ServerMessage::ChatBroadcast { content, .. } => {
                    assert_eq!(content, format!("burst {i}"));
                }
                other => panic!("expected ChatBroadcast, got {other:?}"),
            }
        }
    }

    // The stalled subscriber observes overflow, not the publisher.
    match stalled.recv().await {
        Err(broadcast::error::RecvError::Lagged(n)) => assert!(n > 0),
        other => panic!("expected lag for stalled subscriber, got {other:?}"),
    }

    // Room is still healthy for everyone else.
    room.chat("p2", "after burst".into()).await.unwrap();
    match recv_for(&mut p1.subscription, "p1").await {
        ServerMessage::ChatBroadcast { content, .. } => assert_eq!(content, "after burst"),
        other => panic!("expected ChatBroadcast, got {other:?}"),
    }
}

#[tokio::test]
async fn test_presence_update_broadcast() {
    let (_dir, _store, room) = open_room(RoomConfig::default());

    let mut p1 = room.join("p1", "Ada", "#3b82f6", false).await.unwrap();
    room.join("p2", "Bob", "#ef4444", false).await.unwrap();
    recv_for(&mut p1.subscription, "p1").await; // PeerJoined p2

    room.presence(
        "p2",
        codecollab_server::PresenceStatus::Away,
        Some("/src/lib.rs".into()),
    )
    .await;

    match recv_for(&mut p1.subscription, "p1").await {
        ServerMessage::PresenceBroadcast {
            peer_id,
            status,
            active_file,
            ..
        } => {
            assert_eq!(peer_id, "p2");
            assert_eq!(status, codecollab_server::PresenceStatus::Away);
            assert_eq!(active_file.as_deref(), Some("/src/lib.rs"));
        }
        other => panic!("expected PresenceBroadcast, got {other:?}"),
    }
}

#[tokio::test]
async fn test_peer_left_checkpoint_and_broadcast() {
    let (_dir, store, room) = open_room(RoomConfig::default());

    let mut p1 = room.join("p1", "Ada", "#3b82f6", false).await.unwrap();
    room.join("p2", "Bob", "#ef4444", false).await.unwrap();
    recv_for(&mut p1.subscription, "p1").await; // PeerJoined p2

    // Advance p2's sync handshake so the checkpoint is non-trivial.
    let _ = room.sync_request("p2").await.unwrap();

    room.leave("p2", Some("window closed".into())).await;
    match recv_for(&mut p1.subscription, "p1").await {
        ServerMessage::PeerLeft {
            peer_id, reason, ..
        } => {
            assert_eq!(peer_id, "p2");
            assert_eq!(reason.as_deref(), Some("window closed"));
        }
        other => panic!("expected PeerLeft, got {other:?}"),
    }

    // The sync state survives the departure, keyed by (project, peer).
    let now = codecollab_server::clock::unix_secs();
    let checkpoint = store.get_sync_state("proj", "p2", now).unwrap();
    assert!(checkpoint.is_some());
}

#[tokio::test]
async fn test_open_file_roundtrip() {
    let (_dir, _store, room) = open_room(RoomConfig::default());

    let mut a = room.join("a", "Ada", "#3b82f6", true).await.unwrap();
    let mut doc_a = Document::load("proj", &a.document_state.take().unwrap()).unwrap();
    let mut state_a = PeerSyncState::new();
    doc_a.create_file("/src/main.rs", None).unwrap();
    doc_a.set_file_content("/src/main.rs", "fn main() {}").unwrap();
    sync_client(&room, &mut a.subscription, "a", &mut doc_a, &mut state_a).await;

    match room.open_file("a", "/src/main.rs").await.unwrap() {
        ServerMessage::FileContent {
            content,
            language,
            version,
            ..
        } => {
            assert_eq!(content, "fn main() {}");
            assert_eq!(language, "rust");
            assert!(version >= 2);
        }
        other => panic!("expected FileContent, got {other:?}"),
    }

    match room.open_file("a", "/missing.rs").await.unwrap() {
        ServerMessage::FileNotFound { file_path, .. } => {
            assert_eq!(file_path, "/missing.rs");
        }
        other => panic!("expected FileNotFound, got {other:?}"),
    }
}
