//! WebSocket server with per-room buffer routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐  /ws/{room_id}
//!             ├── connection task ── RoomHandle ── room actor (buffer, hub_seq)
//! Client B ──┘                                         │
//!                                                      ├── RoomStore (load / save on GC)
//!                                                      │
//!                                       ┌──────────────┼──────────────┐
//!                                       ▼              ▼              ▼
//!                                    Client A       Client B       Client C
//! ```
//!
//! Two wire modes share the same room:
//! - text: every WebSocket text frame is the full buffer, relayed verbatim
//! - binary (`?wire=binary`): bincode [`SyncMessage`]s carrying origin, seq
//!   and hub_seq, plus presence and heartbeat messages
//!
//! A connection never receives broadcasts it originated.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::hub::{HubStats, RoomBroadcast, RoomHandle, RoomHub};
use crate::protocol::{MessageType, PeerInfo, Presence, SyncMessage};

type ConnResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Frame encoding negotiated from the upgrade URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireMode {
    /// Raw buffer text in WebSocket text frames
    Text,
    /// Bincode `SyncMessage` in binary frames
    Binary,
}

/// Extract the room id and wire mode from `/ws/{room_id}[?wire=binary]`.
pub fn parse_route(path: &str, query: Option<&str>) -> Option<(String, WireMode)> {
    let room_id = path.strip_prefix("/ws/")?.trim_end_matches('/');
    if room_id.is_empty() || room_id.contains('/') {
        return None;
    }
    let binary = query
        .map(|q| q.split('&').any(|pair| pair == "wire=binary"))
        .unwrap_or(false);
    let mode = if binary { WireMode::Binary } else { WireMode::Text };
    Some((room_id.to_string(), mode))
}

/// An open connection's membership in a room.
struct Membership {
    room: RoomHandle,
    peer: PeerInfo,
    rx: broadcast::Receiver<RoomBroadcast>,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    hub: Arc<RoomHub>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, hub: Arc<RoomHub>) -> Self {
        Self { config, hub }
    }

    /// Default bind address over an in-memory hub.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default(), Arc::new(RoomHub::in_memory()))
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(stream: TcpStream, addr: SocketAddr, hub: Arc<RoomHub>) -> ConnResult<()> {
        let mut route = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            route = parse_route(req.uri().path(), req.uri().query());
            Ok(resp)
        })
        .await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let Some((room_id, mode)) = route else {
            log::warn!("Rejecting {addr}: expected /ws/{{room_id}}");
            ws_sender.send(Message::Close(None)).await?;
            return Ok(());
        };
        log::info!("WebSocket connection from {addr} for room {room_id} ({mode:?})");

        let mut membership: Option<Membership> = None;
        let result = Self::session(&hub, &room_id, mode, addr, &mut membership, &mut ws_sender, &mut ws_receiver).await;

        // Cleanup: remove connection from its room, also after a socket error
        if let Some(m) = membership {
            m.room.leave(m.peer.peer_id).await;
        }

        result
    }

    /// Pump frames between the socket and the room until either side closes.
    async fn session(
        hub: &RoomHub,
        room_id: &str,
        mode: WireMode,
        addr: SocketAddr,
        membership: &mut Option<Membership>,
        ws_sender: &mut WsSink,
        ws_receiver: &mut WsSource,
    ) -> ConnResult<()> {
        let mut text_seq = 0u64;

        // Text connections have no Join message; they join as soon as they open
        if mode == WireMode::Text {
            let peer = PeerInfo::new(format!("text@{addr}"));
            Self::join(hub, room_id, peer, mode, ws_sender, membership).await?;
        }

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => match (membership.as_ref(), mode) {
                            (Some(m), WireMode::Text) => {
                                text_seq += 1;
                                if let Err(e) = m.room.submit_edit(m.peer.peer_id, text_seq, text.as_str()).await {
                                    log::warn!("Edit from {addr} rejected: {e}");
                                }
                            }
                            _ => log::debug!("Ignoring text frame from binary connection {addr}"),
                        },

                        Some(Ok(Message::Binary(data))) if mode == WireMode::Binary => {
                            let sync_msg = match SyncMessage::decode(&data) {
                                Ok(m) => m,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };

                            match sync_msg.msg_type {
                                MessageType::Join if membership.is_none() => {
                                    let peer = sync_msg
                                        .peer_info()
                                        .unwrap_or_else(|_| PeerInfo::with_id(sync_msg.origin, "Anonymous"));
                                    if !sync_msg.room_id.is_empty() && sync_msg.room_id != room_id {
                                        log::debug!("Join names room {} but path is {room_id}", sync_msg.room_id);
                                    }
                                    Self::join(hub, room_id, peer, mode, ws_sender, membership).await?;
                                }

                                MessageType::Edit => {
                                    let Some(m) = membership.as_ref() else {
                                        log::warn!("Edit before join from {addr}");
                                        continue;
                                    };
                                    match sync_msg.text() {
                                        Ok(text) => {
                                            if let Err(e) = m.room.submit_edit(m.peer.peer_id, sync_msg.seq, text).await {
                                                log::warn!("Edit from {addr} rejected: {e}");
                                            }
                                        }
                                        Err(e) => log::warn!("Bad edit payload from {addr}: {e}"),
                                    }
                                }

                                MessageType::Ping => {
                                    let pid = membership.as_ref().map_or(Uuid::nil(), |m| m.peer.peer_id);
                                    let encoded = SyncMessage::pong(pid).encode()?;
                                    ws_sender.send(Message::Binary(encoded.into())).await?;
                                }

                                _ => {
                                    log::debug!("Unhandled message type: {:?}", sync_msg.msg_type);
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing room broadcast
                item = async {
                    match membership.as_mut() {
                        Some(m) => m.rx.recv().await,
                        // Not joined yet: wait forever
                        None => std::future::pending().await,
                    }
                } => {
                    let Some(m) = membership.as_ref() else { continue };
                    match item {
                        Ok(item) => {
                            // Don't echo back to sender
                            if item.origin() == m.peer.peer_id {
                                continue;
                            }
                            if let Some(frame) = Self::frame(room_id, mode, &item)? {
                                ws_sender.send(frame).await?;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("Peer {} lagged by {n} messages, resyncing", m.peer.peer_id);
                            let snap = m.room.snapshot().await?;
                            let frame = match mode {
                                WireMode::Text => Message::Text(snap.buffer.to_string().into()),
                                WireMode::Binary => {
                                    let msg = SyncMessage::snapshot(room_id, snap.hub_seq, &snap.buffer);
                                    Message::Binary(msg.encode()?.into())
                                }
                            };
                            ws_sender.send(frame).await?;
                        }
                        Err(RecvError::Closed) => {
                            log::info!("Room {room_id} closed under connection {addr}");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Join the room and send the joiner its initial state.
    ///
    /// The membership is recorded before anything is written, so a failed
    /// send still leaves it for the caller to clean up.
    async fn join(
        hub: &RoomHub,
        room_id: &str,
        peer: PeerInfo,
        mode: WireMode,
        ws_sender: &mut WsSink,
        membership: &mut Option<Membership>,
    ) -> ConnResult<()> {
        let (room, grant) = hub.join(room_id, peer.clone()).await?;

        let initial = match mode {
            WireMode::Text if grant.buffer.is_empty() => None,
            WireMode::Text => Some(Message::Text(grant.buffer.to_string().into())),
            WireMode::Binary => {
                let state = SyncMessage::snapshot(room_id, grant.hub_seq, &grant.buffer);
                Some(Message::Binary(state.encode()?.into()))
            }
        };
        *membership = Some(Membership {
            room,
            peer,
            rx: grant.receiver,
        });

        if let Some(frame) = initial {
            ws_sender.send(frame).await?;
        }
        Ok(())
    }

    /// Encode a broadcast item for the connection's wire mode.
    fn frame(room_id: &str, mode: WireMode, item: &RoomBroadcast) -> ConnResult<Option<Message>> {
        let frame = match (mode, item) {
            (WireMode::Text, RoomBroadcast::Edit(edit)) => Some(Message::Text(edit.text.to_string().into())),
            // Text clients only understand buffer contents
            (WireMode::Text, _) => None,
            (WireMode::Binary, RoomBroadcast::Edit(edit)) => {
                let msg = SyncMessage::edit(edit.origin, room_id, edit.seq, edit.hub_seq, &edit.text);
                Some(Message::Binary(msg.encode()?.into()))
            }
            (WireMode::Binary, RoomBroadcast::PeerJoined { peer, peer_count }) => {
                let presence = Presence {
                    peer: peer.clone(),
                    peer_count: *peer_count,
                };
                Some(Message::Binary(SyncMessage::peer_joined(room_id, &presence).encode()?.into()))
            }
            (WireMode::Binary, RoomBroadcast::PeerLeft { peer, peer_count }) => {
                let presence = Presence {
                    peer: peer.clone(),
                    peer_count: *peer_count,
                };
                Some(Message::Binary(SyncMessage::peer_left(room_id, &presence).encode()?.into()))
            }
        };
        Ok(frame)
    }

    /// Get hub statistics.
    pub async fn stats(&self) -> HubStats {
        self.hub.stats().await
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn hub(&self) -> &Arc<RoomHub> {
        &self.hub
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
    }

    #[test]
    fn test_server_creation() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[test]
    fn test_parse_route_text() {
        assert_eq!(
            parse_route("/ws/a1b2c3d4", None),
            Some(("a1b2c3d4".to_string(), WireMode::Text))
        );
        assert_eq!(
            parse_route("/ws/a1b2c3d4/", Some("foo=bar")),
            Some(("a1b2c3d4".to_string(), WireMode::Text))
        );
    }

    #[test]
    fn test_parse_route_binary() {
        assert_eq!(
            parse_route("/ws/room", Some("x=1&wire=binary")),
            Some(("room".to_string(), WireMode::Binary))
        );
    }

    #[test]
    fn test_parse_route_rejects() {
        assert!(parse_route("/", None).is_none());
        assert!(parse_route("/ws/", None).is_none());
        assert!(parse_route("/rooms/abc", None).is_none());
        assert!(parse_route("/ws/a/b", None).is_none());
    }

    #[test]
    fn test_text_frames_skip_presence() {
        let item = RoomBroadcast::PeerJoined {
            peer: PeerInfo::new("A"),
            peer_count: 1,
        };
        assert!(SyncServer::frame("r", WireMode::Text, &item).unwrap().is_none());
        assert!(SyncServer::frame("r", WireMode::Binary, &item).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_edits, 0);
        assert_eq!(stats.active_rooms, 0);
    }
}
