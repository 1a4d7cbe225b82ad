//! Per-socket connection: handshake, read/write loops, teardown.
//!
//! State machine:
//! ```text
//! NEW ──Hello──▶ WAITING_JOIN ──JoinProject──▶ JOINED ──Goodbye/close──▶ CLOSED
//!  │                 │                           │
//!  │                 └──(timeout / invalid)─────▶│
//!  └──(timeout / version mismatch)──────────────▶ CLOSED
//! ```
//!
//! The read loop (this task) decodes one frame at a time and dispatches it
//! as a single logical operation against the bound room. The write loop is
//! a separate task fed by a bounded direct-reply queue and the room's
//! broadcast bus; a connection that cannot keep up with either is cut with
//! `RateLimited`, isolating slow consumers from the rest of the room.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::clock::unix_secs;
use crate::presence::CursorPosition;
use crate::protocol::{
    decode_client, encode_server, ClientMessage, ErrorCode, ProtocolError, ServerMessage,
    PROTOCOL_VERSION,
};
use crate::room::{Envelope, RoomError, RoomHandle};
use crate::server::CollabServer;

/// Items on the write loop's direct queue.
enum Outbound {
    Message(ServerMessage),
    WsPong(Bytes),
}

/// What the read loop decided after a joined session ended.
enum AfterJoin {
    /// Back to WAITING_JOIN (LeaveProject).
    Rejoinable,
    Closed,
}

/// Serve one upgraded socket until it closes.
pub async fn serve_socket(socket: WebSocket, project_id: String, server: Arc<CollabServer>) {
    let (mut sink, mut stream) = socket.split();
    let config = server.config().clone();

    // NEW: the Hello must arrive within the handshake window.
    let hello = match tokio::time::timeout(
        config.handshake_timeout,
        read_frame(&mut stream, &mut sink),
    )
    .await
    {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return,
        Err(_) => {
            log::debug!("handshake timeout for project {project_id}");
            return;
        }
    };

    let (client_name, session_token) = match decode_client(&hello) {
        Ok(ClientMessage::Hello {
            protocol_version,
            client_name,
            session_token,
            ..
        }) => {
            if protocol_version != PROTOCOL_VERSION {
                send_now(
                    &mut sink,
                    &ServerMessage::error(
                        ErrorCode::VersionMismatch,
                        format!("unsupported protocol version {protocol_version}"),
                        None,
                    ),
                )
                .await;
                return;
            }
            (client_name, session_token)
        }
        Ok(_) => {
            send_now(
                &mut sink,
                &ServerMessage::error(ErrorCode::InvalidMessage, "expected Hello", None),
            )
            .await;
            return;
        }
        Err(e) => {
            send_decode_error(&mut sink, &e).await;
            return;
        }
    };

    let identity = server.handshake(&client_name, session_token.as_deref()).await;
    let welcome = ServerMessage::Welcome {
        protocol_version: PROTOCOL_VERSION,
        peer_id: identity.peer_id.clone(),
        color: identity.color.clone(),
        session_token: identity.session_token.clone(),
        server_time: unix_secs(),
    };
    if send_now(&mut sink, &welcome).await.is_err() {
        return;
    }
    server.connection_opened();
    log::info!(
        "peer {} connected for project {project_id} (resumed: {})",
        identity.peer_id,
        identity.resumed
    );

    // Hand the sink to the write loop.
    let (direct_tx, direct_rx) = mpsc::channel(config.outbound_queue_limit);
    let (sub_tx, sub_rx) = mpsc::channel(4);
    let writer = tokio::spawn(write_loop(
        sink,
        direct_rx,
        sub_rx,
        identity.peer_id.clone(),
        config.ping_interval,
        config.write_stall_timeout,
    ));

    let mut conn = Connection {
        server: server.clone(),
        project_id,
        peer_id: identity.peer_id,
        name: identity.name,
        color: identity.color,
        direct_tx,
        sub_tx,
        room: None,
        last_frame: Instant::now(),
        idle_timeout: config.idle_timeout,
        join_deadline: config.handshake_timeout,
    };

    conn.run(&mut stream, writer).await;

    if let Some(room) = conn.room.take() {
        room.leave(&conn.peer_id, Some("disconnected".into())).await;
    }
    drop(conn);
    server.connection_closed();
}

struct Connection {
    server: Arc<CollabServer>,
    /// The project this socket was opened for; the only one it may join.
    project_id: String,
    peer_id: String,
    name: String,
    color: String,
    direct_tx: mpsc::Sender<Outbound>,
    sub_tx: mpsc::Sender<Option<broadcast::Receiver<Envelope>>>,
    room: Option<RoomHandle>,
    last_frame: Instant,
    idle_timeout: Duration,
    join_deadline: Duration,
}

impl Connection {
    async fn run(
        &mut self,
        stream: &mut SplitStream<WebSocket>,
        mut writer: tokio::task::JoinHandle<()>,
    ) {
        loop {
            // WAITING_JOIN
            if !self.wait_for_join(stream).await {
                break;
            }
            // JOINED
            match self.joined(stream, &mut writer).await {
                AfterJoin::Rejoinable => continue,
                AfterJoin::Closed => break,
            }
        }
    }

    /// WAITING_JOIN: accept only JoinProject or Goodbye until the deadline.
    /// Returns true once joined, false when the connection should close.
    async fn wait_for_join(&mut self, stream: &mut SplitStream<WebSocket>) -> bool {
        let deadline = Instant::now() + self.join_deadline;
        loop {
            let msg = match tokio::time::timeout_at(deadline, stream.next()).await {
                Ok(msg) => msg,
                Err(_) => {
                    log::debug!("peer {} never joined, closing", self.peer_id);
                    return false;
                }
            };
            let bytes = match self.raw_frame(msg).await {
                RawFrame::Data(bytes) => bytes,
                RawFrame::Skip => continue,
                RawFrame::Closed => return false,
            };

            match decode_client(&bytes) {
                Ok(ClientMessage::JoinProject {
                    project_id,
                    request_state,
                }) => {
                    if project_id != self.project_id {
                        self.send_error(
                            ErrorCode::InvalidMessage,
                            "project id does not match this stream",
                            Some(project_id),
                        )
                        .await;
                        continue;
                    }
                    if self.try_join(request_state).await {
                        return true;
                    }
                }
                Ok(ClientMessage::Goodbye { .. }) => {
                    self.send(ServerMessage::Goodbye { reason: None }).await;
                    return false;
                }
                Ok(other) => {
                    self.send_error(
                        ErrorCode::NotJoined,
                        format!("join a project before sending tag {}", other.tag()),
                        other.project_id().map(str::to_string),
                    )
                    .await;
                }
                Err(e) => {
                    self.protocol_error(&e).await;
                    return false;
                }
            }
        }
    }

    async fn try_join(&mut self, request_state: bool) -> bool {
        let room = match self.server.get_or_open_room(&self.project_id).await {
            Ok(room) => room,
            Err(e) => {
                log::error!("room open failed for {}: {e}", self.project_id);
                self.send_error(e.code(), e.to_string(), Some(self.project_id.clone()))
                    .await;
                return false;
            }
        };

        match room
            .join(&self.peer_id, &self.name, &self.color, request_state)
            .await
        {
            Ok(reply) => {
                let _ = self.sub_tx.send(Some(reply.subscription)).await;
                self.send(ServerMessage::ProjectJoined {
                    project_id: self.project_id.clone(),
                    peers: reply.peers,
                    document_state: reply.document_state,
                })
                .await;
                self.send(ServerMessage::ChatHistory {
                    project_id: self.project_id.clone(),
                    messages: reply.chat_history,
                })
                .await;
                self.room = Some(room);
                true
            }
            Err(e) => {
                self.send_error(e.code(), e.to_string(), Some(self.project_id.clone()))
                    .await;
                false
            }
        }
    }

    /// JOINED: shuttle frames until close, leave, or writer failure.
    async fn joined(
        &mut self,
        stream: &mut SplitStream<WebSocket>,
        writer: &mut tokio::task::JoinHandle<()>,
    ) -> AfterJoin {
        self.last_frame = Instant::now();
        loop {
            let stale_at = self.last_frame + self.idle_timeout;
            tokio::select! {
                // Write loop died: rate-limit cut or socket failure.
                _ = &mut *writer => return AfterJoin::Closed,

                _ = tokio::time::sleep_until(stale_at) => {
                    log::info!("peer {} stale ({}s without a frame)",
                        self.peer_id, self.idle_timeout.as_secs());
                    self.send_error(ErrorCode::InvalidMessage, "stale connection", None).await;
                    return AfterJoin::Closed;
                }

                msg = stream.next() => {
                    let bytes = match self.raw_frame(msg).await {
                        RawFrame::Data(bytes) => bytes,
                        RawFrame::Skip => continue,
                        RawFrame::Closed => return AfterJoin::Closed,
                    };
                    self.last_frame = Instant::now();
                    match decode_client(&bytes) {
                        Ok(msg) => match self.dispatch(msg).await {
                            Some(after) => return after,
                            None => {}
                        },
                        Err(e) => {
                            self.protocol_error(&e).await;
                            return AfterJoin::Closed;
                        }
                    }
                }
            }
        }
    }

    /// Handle one decoded frame in the JOINED state. `Some` ends the state.
    async fn dispatch(&mut self, msg: ClientMessage) -> Option<AfterJoin> {
        // Room-scoped frames must name the bound project.
        if let Some(project_id) = msg.project_id() {
            if project_id != self.project_id {
                self.send_error(
                    ErrorCode::InvalidMessage,
                    "project id does not match the joined project",
                    Some(project_id.to_string()),
                )
                .await;
                return None;
            }
        }
        let Some(room) = self.room.clone() else {
            return Some(AfterJoin::Closed);
        };

        match msg {
            ClientMessage::Hello { .. } => {
                self.send_error(ErrorCode::InvalidMessage, "already connected", None)
                    .await;
            }
            ClientMessage::JoinProject { .. } => {
                self.send_error(
                    ErrorCode::AlreadyJoined,
                    "already joined",
                    Some(self.project_id.clone()),
                )
                .await;
            }
            ClientMessage::LeaveProject { .. } => {
                room.leave(&self.peer_id, None).await;
                self.room = None;
                let _ = self.sub_tx.send(None).await;
                self.send(ServerMessage::ProjectLeft {
                    project_id: self.project_id.clone(),
                })
                .await;
                return Some(AfterJoin::Rejoinable);
            }
            ClientMessage::Goodbye { reason } => {
                room.leave(&self.peer_id, reason).await;
                self.room = None;
                self.send(ServerMessage::Goodbye { reason: None }).await;
                return Some(AfterJoin::Closed);
            }
            ClientMessage::SyncMessage { sync_data, .. } => {
                if let Err(e) = room.sync(&self.peer_id, sync_data).await {
                    self.room_error(e).await;
                }
            }
            ClientMessage::SyncRequest { .. } => {
                match room.sync_request(&self.peer_id).await {
                    Ok(reply) => self.send(reply).await,
                    Err(e) => self.room_error(e).await,
                }
            }
            ClientMessage::OpenFile { file_path, .. } => {
                match room.open_file(&self.peer_id, &file_path).await {
                    Ok(reply) => self.send(reply).await,
                    Err(e) => self.room_error(e).await,
                }
            }
            ClientMessage::CloseFile { file_path, .. } => {
                room.close_file(&self.peer_id, &file_path).await;
            }
            ClientMessage::CursorUpdate {
                file_path,
                line,
                column,
                selection_end,
                ..
            } => {
                let position = CursorPosition {
                    file_path,
                    line,
                    column,
                    selection_end,
                };
                if let Err(e) = room.cursor(&self.peer_id, position).await {
                    self.room_error(e).await;
                }
            }
            ClientMessage::PresenceUpdate {
                status,
                active_file,
                ..
            } => {
                room.presence(&self.peer_id, status, active_file).await;
            }
            ClientMessage::ChatMessage { content, .. } => {
                if let Err(e) = room.chat(&self.peer_id, content).await {
                    self.room_error(e).await;
                }
            }
            ClientMessage::VoiceJoin { .. } => match room.voice(&self.peer_id, true).await {
                Ok(Some(reply)) => self.send(reply).await,
                Ok(None) => {}
                Err(e) => self.room_error(e).await,
            },
            ClientMessage::VoiceLeave { .. } => {
                if let Err(e) = room.voice(&self.peer_id, false).await {
                    self.room_error(e).await;
                }
            }
            ClientMessage::Ping { timestamp } => {
                room.touch(&self.peer_id).await;
                self.send(ServerMessage::Pong {
                    timestamp,
                    server_time: unix_secs(),
                })
                .await;
            }
        }
        None
    }

    /// Pull the next binary frame out of the socket, answering transport
    /// pings along the way.
    async fn raw_frame(&mut self, msg: Option<Result<Message, axum::Error>>) -> RawFrame {
        match msg {
            Some(Ok(Message::Binary(data))) => RawFrame::Data(data),
            Some(Ok(Message::Ping(data))) => {
                let _ = self.direct_tx.send(Outbound::WsPong(data)).await;
                self.last_frame = Instant::now();
                RawFrame::Skip
            }
            Some(Ok(Message::Pong(_))) => {
                self.last_frame = Instant::now();
                RawFrame::Skip
            }
            Some(Ok(Message::Text(_))) => {
                self.send_error(ErrorCode::InvalidMessage, "binary frames only", None)
                    .await;
                RawFrame::Closed
            }
            Some(Ok(Message::Close(_))) | None => RawFrame::Closed,
            Some(Err(e)) => {
                log::debug!("socket error for peer {}: {e}", self.peer_id);
                RawFrame::Closed
            }
        }
    }

    async fn protocol_error(&self, e: &ProtocolError) {
        let code = if e.is_version_mismatch() {
            ErrorCode::VersionMismatch
        } else {
            ErrorCode::InvalidMessage
        };
        self.send_error(code, e.to_string(), None).await;
    }

    async fn room_error(&self, e: RoomError) {
        self.send_error(e.code(), e.to_string(), Some(self.project_id.clone()))
            .await;
    }

    async fn send_error(
        &self,
        code: ErrorCode,
        message: impl Into<String>,
        project_id: Option<String>,
    ) {
        self.send(ServerMessage::error(code, message, project_id)).await;
    }

    async fn send(&self, msg: ServerMessage) {
        let _ = self.direct_tx.send(Outbound::Message(msg)).await;
    }
}

enum RawFrame {
    Data(Bytes),
    Skip,
    Closed,
}

/// The write loop: direct replies, broadcast envelopes, transport pings.
///
/// A write that stalls past `stall_timeout`, or a broadcast receiver that
/// lags its buffer, disconnects this subscriber with `RateLimited`.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut direct_rx: mpsc::Receiver<Outbound>,
    mut sub_rx: mpsc::Receiver<Option<broadcast::Receiver<Envelope>>>,
    peer_id: String,
    ping_interval: Duration,
    stall_timeout: Duration,
) {
    let mut subscription: Option<broadcast::Receiver<Envelope>> = None;
    let mut sub_open = true;
    let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            item = direct_rx.recv() => match item {
                Some(Outbound::Message(msg)) => match encode_server(&msg) {
                    Ok(frame) => {
                        if send_stalled(&mut sink, Message::Binary(frame), stall_timeout).await {
                            break;
                        }
                    }
                    Err(e) => log::error!("encode failed for peer {peer_id}: {e}"),
                },
                Some(Outbound::WsPong(data)) => {
                    if send_stalled(&mut sink, Message::Pong(data), stall_timeout).await {
                        break;
                    }
                }
                // Read loop gone; close out.
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },

            new_sub = sub_rx.recv(), if sub_open => match new_sub {
                Some(new_sub) => subscription = new_sub,
                None => sub_open = false,
            },

            event = next_envelope(&mut subscription, &peer_id) => match event {
                EnvelopeEvent::Deliver(frame) => {
                    if send_stalled(&mut sink, Message::Binary(frame), stall_timeout).await {
                        // Treat a stalled socket like an overflowing queue.
                        rate_limit_cut(&mut sink, &peer_id).await;
                        break;
                    }
                }
                EnvelopeEvent::Lagged(n) => {
                    log::warn!("peer {peer_id} lagged {n} broadcast messages, disconnecting");
                    rate_limit_cut(&mut sink, &peer_id).await;
                    break;
                }
                EnvelopeEvent::RoomClosed => subscription = None,
            },

            _ = ping.tick() => {
                if send_stalled(&mut sink, Message::Ping(Bytes::new()), stall_timeout).await {
                    break;
                }
            }
        }
    }
}

enum EnvelopeEvent {
    Deliver(Bytes),
    Lagged(u64),
    RoomClosed,
}

/// Await the next envelope addressed to this peer; pends forever while the
/// connection has no subscription.
async fn next_envelope(
    subscription: &mut Option<broadcast::Receiver<Envelope>>,
    peer_id: &str,
) -> EnvelopeEvent {
    let Some(rx) = subscription else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(env) if env.is_for(peer_id) => return EnvelopeEvent::Deliver(env.frame),
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(n)) => return EnvelopeEvent::Lagged(n),
            Err(broadcast::error::RecvError::Closed) => return EnvelopeEvent::RoomClosed,
        }
    }
}

/// Send with a stall cutoff. Returns true when the write loop should stop.
async fn send_stalled(
    sink: &mut SplitSink<WebSocket, Message>,
    msg: Message,
    stall_timeout: Duration,
) -> bool {
    match tokio::time::timeout(stall_timeout, sink.send(msg)).await {
        Ok(Ok(())) => false,
        Ok(Err(_)) => true,
        Err(_) => true,
    }
}

/// Best-effort RateLimited notice before cutting a stalled subscriber.
async fn rate_limit_cut(sink: &mut SplitSink<WebSocket, Message>, peer_id: &str) {
    if let Ok(frame) = encode_server(&ServerMessage::error(
        ErrorCode::RateLimited,
        "outbound queue overflow",
        None,
    )) {
        let _ = tokio::time::timeout(
            Duration::from_millis(250),
            sink.send(Message::Binary(frame)),
        )
        .await;
    }
    let _ = sink.send(Message::Close(None)).await;
    log::info!("peer {peer_id} disconnected: rate limited");
}

/// Read one binary frame during the handshake, answering transport pings
/// inline (the write loop does not exist yet).
async fn read_frame(
    stream: &mut SplitStream<WebSocket>,
    sink: &mut SplitSink<WebSocket, Message>,
) -> Option<Bytes> {
    loop {
        match stream.next().await? {
            Ok(Message::Binary(data)) => return Some(data),
            Ok(Message::Ping(data)) => {
                let _ = sink.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

async fn send_now(
    sink: &mut SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> Result<(), axum::Error> {
    match encode_server(msg) {
        Ok(frame) => sink.send(Message::Binary(frame)).await,
        Err(e) => {
            log::error!("encode failed: {e}");
            Ok(())
        }
    }
}

async fn send_decode_error(sink: &mut SplitSink<WebSocket, Message>, e: &ProtocolError) {
    let code = if e.is_version_mismatch() {
        ErrorCode::VersionMismatch
    } else {
        ErrorCode::InvalidMessage
    };
    let _ = send_now(sink, &ServerMessage::error(code, e.to_string(), None)).await;
    let _ = sink.send(Message::Close(None)).await;
}
