//! End-to-end tests over real WebSockets: handshake, join, convergence,
//! session resume, cursor fan-out, protocol rejection.

use std::sync::Arc;
use std::time::Duration;

use codecollab_server::document::{Document, PeerSyncState};
use codecollab_server::protocol::{
    decode_server, encode_client, ChatEntry, ClientMessage, ErrorCode, PeerInfo, ServerMessage,
    PROTOCOL_VERSION,
};
use codecollab_server::storage::{CollabStore, StoreConfig};
use codecollab_server::voice::LiveKitIssuer;
use codecollab_server::{CollabServer, ServerConfig};
use futures_util::{SinkExt, StreamExt};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Boot a server on a free port; returns the port and the temp-store guard.
async fn start_server(
    tweak: impl FnOnce(&mut ServerConfig),
) -> (u16, Arc<CollabServer>, TempDir) {
    let dir = TempDir::new().unwrap();
    let mut config = ServerConfig::default();
    tweak(&mut config);

    let store =
        Arc::new(CollabStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
    let server = CollabServer::new(config, store, Arc::new(LiveKitIssuer::unconfigured()));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let app = codecollab_server::http::router(server.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (port, server, dir)
}

struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

struct Welcome {
    peer_id: String,
    color: String,
    session_token: String,
}

impl TestClient {
    async fn connect(port: u16, project_id: &str) -> Self {
        let url = format!("ws://127.0.0.1:{port}/ws/{project_id}");
        let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        Self { ws }
    }

    async fn send(&mut self, msg: &ClientMessage) {
        let frame = encode_client(msg).unwrap();
        self.ws.send(Message::Binary(frame.to_vec())).await.unwrap();
    }

    async fn send_raw(&mut self, bytes: Vec<u8>) {
        self.ws.send(Message::Binary(bytes)).await.unwrap();
    }

    /// Next decoded server message, or `None` when the socket closes.
    async fn recv(&mut self) -> Option<ServerMessage> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Binary(data)) => return Some(decode_server(&data).unwrap()),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }

    async fn recv_within(&mut self, timeout: Duration) -> Option<ServerMessage> {
        tokio::time::timeout(timeout, self.recv()).await.ok().flatten()
    }

    async fn expect(&mut self) -> ServerMessage {
        self.recv_within(Duration::from_secs(2))
            .await
            .expect("expected a server message")
    }

    async fn hello(&mut self, name: &str, session_token: Option<String>) -> Welcome {
        self.send(&ClientMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            client_id: None,
            client_name: name.to_string(),
            session_token,
        })
        .await;
        match self.expect().await {
            ServerMessage::Welcome {
                peer_id,
                color,
                session_token,
                protocol_version,
                ..
            } => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                Welcome {
                    peer_id,
                    color,
                    session_token,
                }
            }
            other => panic!("expected Welcome, got {other:?}"),
        }
    }

    /// Join and return (peers, document_state, chat_history).
    async fn join(
        &mut self,
        project_id: &str,
        request_state: bool,
    ) -> (Vec<PeerInfo>, Option<Vec<u8>>, Vec<ChatEntry>) {
        self.send(&ClientMessage::JoinProject {
            project_id: project_id.to_string(),
            request_state,
        })
        .await;

        let (peers, document_state) = match self.expect().await {
            ServerMessage::ProjectJoined {
                peers,
                document_state,
                ..
            } => (peers, document_state),
            other => panic!("expected ProjectJoined, got {other:?}"),
        };
        let history = match self.expect().await {
            ServerMessage::ChatHistory { messages, .. } => messages,
            other => panic!("expected ChatHistory, got {other:?}"),
        };
        (peers, document_state, history)
    }

    /// Anti-entropy until this replica and the server are in sync.
    async fn sync_to_convergence(
        &mut self,
        project_id: &str,
        doc: &mut Document,
        state: &mut PeerSyncState,
    ) {
        for _ in 0..30 {
            if let Some(payload) = doc.generate_for(state) {
                self.send(&ClientMessage::SyncMessage {
                    project_id: project_id.to_string(),
                    sync_data: payload,
                })
                .await;
            }
            while let Some(msg) = self.recv_within(Duration::from_millis(250)).await {
                if let ServerMessage::SyncMessage { sync_data, .. } = msg {
                    doc.apply_remote(state, &sync_data).unwrap();
                }
            }

            if doc.generate_for(state).is_none() {
                self.send(&ClientMessage::SyncRequest {
                    project_id: project_id.to_string(),
                })
                .await;
                loop {
                    match self.expect().await {
                        ServerMessage::SyncComplete { .. } => return,
                        ServerMessage::SyncMessage { sync_data, .. } => {
                            doc.apply_remote(state, &sync_data).unwrap();
                            break;
                        }
                        _ => continue,
                    }
                }
            }
        }
        panic!("replica did not converge");
    }
}

#[tokio::test]
async fn test_two_client_convergence() {
    let (port, _server, _dir) = start_server(|_| {}).await;

    // Client A joins a cold project and publishes main.rs.
    let mut a = TestClient::connect(port, "demo").await;
    a.hello("Ada", None).await;
    let (peers, state_bytes, _) = a.join("demo", true).await;
    assert!(peers.is_empty());

    let mut doc_a = Document::load("demo", &state_bytes.unwrap()).unwrap();
    let mut sync_a = PeerSyncState::new();
    doc_a.create_file("/main.rs", None).unwrap();
    doc_a.set_file_content("/main.rs", "fn main() {}").unwrap();
    a.sync_to_convergence("demo", &mut doc_a, &mut sync_a).await;

    // Client B joins requesting state and sees A plus the document.
    let mut b = TestClient::connect(port, "demo").await;
    let b_welcome = b.hello("Bob", None).await;
    assert_ne!(b_welcome.peer_id, "");
    let (peers, state_bytes, _) = b.join("demo", true).await;
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].name, "Ada");
    let state_bytes = state_bytes.expect("requested state must be present");

    let mut doc_b = Document::load("demo", &state_bytes).unwrap();
    let mut sync_b = PeerSyncState::new();
    b.sync_to_convergence("demo", &mut doc_b, &mut sync_b).await;

    let file = doc_b.file("/main.rs").unwrap().unwrap();
    assert_eq!(file.content, "fn main() {}");
    assert_eq!(file.language, "rust");

    // OpenFile through the server agrees with both replicas.
    b.send(&ClientMessage::OpenFile {
        project_id: "demo".into(),
        file_path: "/main.rs".into(),
    })
    .await;
    match b.expect().await {
        ServerMessage::FileContent {
            content, language, ..
        } => {
            assert_eq!(content, "fn main() {}");
            assert_eq!(language, "rust");
        }
        other => panic!("expected FileContent, got {other:?}"),
    }
}

#[tokio::test]
async fn test_session_resume_restores_identity() {
    let (port, _server, _dir) = start_server(|_| {}).await;

    let mut first = TestClient::connect(port, "demo").await;
    let welcome = first.hello("Ada", None).await;
    drop(first); // connection drops before any join

    let mut second = TestClient::connect(port, "demo").await;
    let resumed = second
        .hello("Ada", Some(welcome.session_token.clone()))
        .await;

    assert_eq!(resumed.peer_id, welcome.peer_id);
    assert_eq!(resumed.color, welcome.color);
    assert_eq!(resumed.session_token, welcome.session_token);
}

#[tokio::test]
async fn test_cursor_fan_out_three_peers() {
    let (port, _server, _dir) = start_server(|_| {}).await;

    let mut p1 = TestClient::connect(port, "demo").await;
    p1.hello("One", None).await;
    p1.join("demo", false).await;

    let mut p2 = TestClient::connect(port, "demo").await;
    let w2 = p2.hello("Two", None).await;
    p2.join("demo", false).await;

    let mut p3 = TestClient::connect(port, "demo").await;
    p3.hello("Three", None).await;
    p3.join("demo", false).await;

    // Drain join notifications.
    while let Some(msg) = p1.recv_within(Duration::from_millis(300)).await {
        assert!(matches!(msg, ServerMessage::PeerJoined { .. }));
    }
    while let Some(msg) = p2.recv_within(Duration::from_millis(300)).await {
        assert!(matches!(msg, ServerMessage::PeerJoined { .. }));
    }

    p2.send(&ClientMessage::CursorUpdate {
        project_id: "demo".into(),
        file_path: "/main.rs".into(),
        line: 10,
        column: 4,
        selection_end: None,
    })
    .await;

    for observer in [&mut p1, &mut p3] {
        match observer.expect().await {
            ServerMessage::CursorBroadcast {
                peer_id,
                peer_name,
                line,
                column,
                file_path,
                ..
            } => {
                assert_eq!(peer_id, w2.peer_id);
                assert_eq!(peer_name, "Two");
                assert_eq!((line, column), (10, 4));
                assert_eq!(file_path, "/main.rs");
            }
            other => panic!("expected CursorBroadcast, got {other:?}"),
        }
        // Exactly one.
        assert!(observer.recv_within(Duration::from_millis(200)).await.is_none());
    }

    // The sender hears nothing back.
    assert!(p2.recv_within(Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn test_version_mismatch_frame_closes_connection() {
    let (port, _server, _dir) = start_server(|_| {}).await;

    let mut client = TestClient::connect(port, "demo").await;
    client.hello("Ada", None).await;
    client.join("demo", false).await;

    // Corrupt the version byte of an otherwise valid frame.
    let mut frame = encode_client(&ClientMessage::Ping { timestamp: 1 })
        .unwrap()
        .to_vec();
    frame[0] = 0x02;
    client.send_raw(frame).await;

    match client.expect().await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::VersionMismatch),
        other => panic!("expected Error, got {other:?}"),
    }
    // The server closes the stream.
    assert!(client.recv_within(Duration::from_secs(2)).await.is_none());
}

#[tokio::test]
async fn test_hello_version_mismatch_rejected() {
    let (port, _server, _dir) = start_server(|_| {}).await;

    let mut client = TestClient::connect(port, "demo").await;
    client
        .send(&ClientMessage::Hello {
            protocol_version: 9,
            client_id: None,
            client_name: "Ada".into(),
            session_token: None,
        })
        .await;

    match client.expect().await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::VersionMismatch),
        other => panic!("expected Error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_not_joined_rejection() {
    let (port, _server, _dir) = start_server(|_| {}).await;

    let mut client = TestClient::connect(port, "demo").await;
    client.hello("Ada", None).await;

    // Room-scoped traffic before JoinProject is refused but non-fatal.
    client
        .send(&ClientMessage::ChatMessage {
            project_id: "demo".into(),
            content: "too early".into(),
        })
        .await;
    match client.expect().await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::NotJoined),
        other => panic!("expected Error, got {other:?}"),
    }

    // The connection still joins fine afterwards.
    client.join("demo", false).await;
}

#[tokio::test]
async fn test_project_id_mismatch_rejected() {
    let (port, _server, _dir) = start_server(|_| {}).await;

    let mut client = TestClient::connect(port, "demo").await;
    client.hello("Ada", None).await;
    client.join("demo", false).await;

    client
        .send(&ClientMessage::ChatMessage {
            project_id: "other".into(),
            content: "hi".into(),
        })
        .await;
    match client.expect().await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidMessage),
        other => panic!("expected Error, got {other:?}"),
    }

    // Kept open: a well-addressed message still works.
    client
        .send(&ClientMessage::Ping { timestamp: 42 })
        .await;
    match client.expect().await {
        ServerMessage::Pong { timestamp, .. } => assert_eq!(timestamp, 42),
        other => panic!("expected Pong, got {other:?}"),
    }
}

#[tokio::test]
async fn test_chat_broadcast_and_history() {
    let (port, _server, _dir) = start_server(|_| {}).await;

    let mut a = TestClient::connect(port, "demo").await;
    a.hello("Ada", None).await;
    a.join("demo", false).await;

    a.send(&ClientMessage::ChatMessage {
        project_id: "demo".into(),
        content: "hello room".into(),
    })
    .await;
    // Chat fan-out includes the sender.
    match a.expect().await {
        ServerMessage::ChatBroadcast {
            peer_name, content, ..
        } => {
            assert_eq!(peer_name, "Ada");
            assert_eq!(content, "hello room");
        }
        other => panic!("expected ChatBroadcast, got {other:?}"),
    }

    // A later joiner receives the ring.
    let mut b = TestClient::connect(port, "demo").await;
    b.hello("Bob", None).await;
    let (_, _, history) = b.join("demo", false).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].content, "hello room");
}

#[tokio::test]
async fn test_oversized_chat_rejected() {
    let (port, _server, _dir) = start_server(|_| {}).await;

    let mut client = TestClient::connect(port, "demo").await;
    client.hello("Ada", None).await;
    client.join("demo", false).await;

    client
        .send(&ClientMessage::ChatMessage {
            project_id: "demo".into(),
            content: "x".repeat(4097),
        })
        .await;
    match client.expect().await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidMessage),
        other => panic!("expected Error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_leave_and_rejoin_same_stream() {
    let (port, _server, _dir) = start_server(|_| {}).await;

    let mut client = TestClient::connect(port, "demo").await;
    client.hello("Ada", None).await;
    client.join("demo", false).await;

    client
        .send(&ClientMessage::LeaveProject {
            project_id: "demo".into(),
        })
        .await;
    match client.expect().await {
        ServerMessage::ProjectLeft { project_id } => assert_eq!(project_id, "demo"),
        other => panic!("expected ProjectLeft, got {other:?}"),
    }

    // Back in WAITING_JOIN; a second join succeeds.
    client.join("demo", false).await;
}

#[tokio::test]
async fn test_voice_unconfigured_yields_server_error() {
    let (port, _server, _dir) = start_server(|_| {}).await;

    let mut client = TestClient::connect(port, "demo").await;
    client.hello("Ada", None).await;
    client.join("demo", false).await;

    client
        .send(&ClientMessage::VoiceJoin {
            project_id: "demo".into(),
        })
        .await;
    match client.expect().await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::ServerError),
        other => panic!("expected Error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_invalid_project_id_rejected_at_upgrade() {
    let (port, _server, _dir) = start_server(|_| {}).await;
    let url = format!("ws://127.0.0.1:{port}/ws/not%20valid");
    assert!(tokio_tungstenite::connect_async(&url).await.is_err());
}
