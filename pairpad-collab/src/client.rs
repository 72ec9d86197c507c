//! WebSocket session client for one room.
//!
//! Provides:
//! - Connection lifecycle (`Connecting → Open → Closed`, one-shot)
//! - A connectivity indicator (`watch<bool>`) for the UI
//! - Local edits tagged with origin and seq, broadcast only while open
//! - Remote edits applied to the local buffer view without rebroadcast
//! - Optional debounced suggestions fed by local edits only
//!
//! A closed client is never reopened; [`SessionClient::fresh`] builds the next
//! `Connecting` instance for a reconnect.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::assist::AssistHandle;
use crate::echo::{OutgoingEdit, SharedBuffer};
use crate::hub::ConnectionState;
use crate::protocol::{MessageType, PeerInfo, Presence, ProtocolError, SyncMessage};

/// Events emitted by the session client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Connection established
    Opened,
    /// Connection closed (normal close or error)
    Closed,
    /// The buffer was replaced by an edit or snapshot from the room
    RemoteEdit { origin: Uuid, hub_seq: u64, text: String },
    PeerJoined(Presence),
    PeerLeft(Presence),
}

/// The session client.
pub struct SessionClient {
    peer_info: PeerInfo,
    room_id: String,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    connected: Arc<watch::Sender<bool>>,
    buffer: Arc<Mutex<SharedBuffer>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
    event_tx: mpsc::Sender<SessionEvent>,
    assist: Option<AssistHandle>,
    broadcasts: Arc<AtomicU64>,
}

impl SessionClient {
    /// `server_url` is the WebSocket root, e.g. `ws://127.0.0.1:9090`.
    pub fn new(peer_info: PeerInfo, room_id: impl Into<String>, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (connected, _) = watch::channel(false);
        let buffer = SharedBuffer::new(peer_info.peer_id);
        Self {
            peer_info,
            room_id: room_id.into(),
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Connecting)),
            connected: Arc::new(connected),
            buffer: Arc::new(Mutex::new(buffer)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            assist: None,
            broadcasts: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Feed local edits to a suggestion requester.
    pub fn with_assist(mut self, assist: AssistHandle) -> Self {
        self.assist = Some(assist);
        self
    }

    /// A new `Connecting` client for the same user and room, with a new origin.
    pub fn fresh(&self) -> Self {
        let client = Self::new(
            PeerInfo::new(self.peer_info.name.clone()),
            self.room_id.clone(),
            self.server_url.clone(),
        );
        match &self.assist {
            Some(assist) => client.with_assist(assist.clone()),
            None => client,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    fn url(&self) -> String {
        format!(
            "{}/ws/{}?wire=binary",
            self.server_url.trim_end_matches('/'),
            self.room_id
        )
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages. Only
    /// valid once per client.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        if self.outgoing_tx.is_some() || *self.state.read().await != ConnectionState::Connecting {
            return Err(ProtocolError::InvalidState("client already used; reconnect with fresh()"));
        }

        let ws_stream = match tokio_tungstenite::connect_async(self.url()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to room {}: {e}", self.room_id);
                *self.state.write().await = ConnectionState::Closed;
                self.connected.send_replace(false);
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        let join = SyncMessage::join(self.room_id.as_str(), &self.peer_info).encode()?;
        out_tx
            .send(Message::Binary(join.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        self.outgoing_tx = Some(out_tx.clone());

        *self.state.write().await = ConnectionState::Open;
        self.connected.send_replace(true);
        let _ = self.event_tx.send(SessionEvent::Opened).await;
        log::info!("Connected to room {} as {}", self.room_id, self.peer_info.peer_id);

        // Reader task: process incoming WebSocket messages
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let connected = self.connected.clone();
        let buffer = self.buffer.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let sync_msg = match SyncMessage::decode(&data) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Dropping undecodable frame: {e}");
                                continue;
                            }
                        };
                        let event = match sync_msg.msg_type {
                            MessageType::Edit | MessageType::Snapshot => {
                                let applied = buffer.lock().await.apply_remote(&sync_msg);
                                match sync_msg.text() {
                                    Ok(text) if applied => Some(SessionEvent::RemoteEdit {
                                        origin: sync_msg.origin,
                                        hub_seq: sync_msg.hub_seq,
                                        text: text.to_string(),
                                    }),
                                    _ => None,
                                }
                            }
                            MessageType::PeerJoined => sync_msg.presence_info().ok().map(SessionEvent::PeerJoined),
                            MessageType::PeerLeft => sync_msg.presence_info().ok().map(SessionEvent::PeerLeft),
                            MessageType::Pong => {
                                log::trace!("Pong from server");
                                None
                            }
                            _ => None,
                        };

                        if let Some(evt) = event {
                            let _ = event_tx.send(evt).await;
                        }
                    }
                    Ok(Message::Ping(data)) => {
                        let _ = out_tx.send(Message::Pong(data)).await;
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Closed;
            connected.send_replace(false);
            let _ = event_tx.send(SessionEvent::Closed).await;
        });

        Ok(())
    }

    /// Apply a locally typed change.
    ///
    /// The buffer view always updates and the suggestion requester is always
    /// notified. Returns whether the edit was broadcast, which only happens
    /// while the connection is open.
    pub async fn local_edit(&self, text: &str) -> Result<bool, ProtocolError> {
        let edit = self.buffer.lock().await.apply_local(text);
        if let Some(assist) = &self.assist {
            assist.notify_edit(text);
        }
        self.send_edit(edit).await
    }

    /// Append the displayed suggestion after a newline and broadcast the
    /// result as a local edit. Returns the new buffer, or `None` if nothing
    /// was displayed.
    pub async fn accept_suggestion(&self) -> Result<Option<String>, ProtocolError> {
        let Some(assist) = &self.assist else {
            return Ok(None);
        };
        let Some(suggestion) = assist.take_suggestion().await else {
            return Ok(None);
        };

        let (text, edit) = {
            let mut buffer = self.buffer.lock().await;
            let text = format!("{}\n{}", buffer.text(), suggestion);
            let edit = buffer.apply_local(&text);
            (text, edit)
        };
        self.send_edit(edit).await?;
        Ok(Some(text))
    }

    async fn send_edit(&self, edit: OutgoingEdit) -> Result<bool, ProtocolError> {
        if *self.state.read().await != ConnectionState::Open {
            log::debug!("Not open, edit seq {} kept local", edit.seq);
            return Ok(false);
        }
        let Some(tx) = &self.outgoing_tx else {
            return Ok(false);
        };

        let msg = SyncMessage::edit(edit.origin, self.room_id.as_str(), edit.seq, 0, &edit.text);
        tx.send(Message::Binary(msg.encode()?.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Send a ping to the server.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        let encoded = SyncMessage::ping(self.peer_info.peer_id).encode()?;
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(Message::Binary(encoded.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Close the connection. Terminal.
    pub async fn close(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
        *self.state.write().await = ConnectionState::Closed;
        self.connected.send_replace(false);
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Connectivity indicator.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Current local buffer text.
    pub async fn text(&self) -> String {
        self.buffer.lock().await.text().to_string()
    }

    /// Number of edits this client has broadcast.
    pub fn broadcasts_sent(&self) -> u64 {
        self.broadcasts.load(Ordering::Relaxed)
    }

    pub async fn local_changes(&self) -> u64 {
        self.buffer.lock().await.local_changes()
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = SessionClient::new(PeerInfo::new("TestUser"), "a1b2c3d4", "ws://localhost:9090/");
        assert_eq!(client.peer_info().name, "TestUser");
        assert_eq!(client.room_id(), "a1b2c3d4");
        assert_eq!(client.url(), "ws://localhost:9090/ws/a1b2c3d4?wire=binary");
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_initial_state_is_connecting() {
        let client = SessionClient::new(PeerInfo::new("u"), "r", "ws://localhost:9090");
        assert_eq!(client.connection_state().await, ConnectionState::Connecting);
        assert_eq!(client.broadcasts_sent(), 0);
    }

    #[tokio::test]
    async fn test_local_edit_offline_not_broadcast() {
        let client = SessionClient::new(PeerInfo::new("u"), "r", "ws://localhost:9090");
        assert!(!client.local_edit("print(1)").await.unwrap());
        assert_eq!(client.text().await, "print(1)");
        assert_eq!(client.local_changes().await, 1);
        assert_eq!(client.broadcasts_sent(), 0);
    }

    #[tokio::test]
    async fn test_failed_connect_is_terminal() {
        // Grab a free port, then release it so nothing is listening
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let mut client = SessionClient::new(PeerInfo::new("u"), "r", format!("ws://{addr}"));

        assert_eq!(client.connect().await, Err(ProtocolError::ConnectionClosed));
        assert_eq!(client.connection_state().await, ConnectionState::Closed);
        assert!(matches!(client.connect().await, Err(ProtocolError::InvalidState(_))));

        let next = client.fresh();
        assert_eq!(next.connection_state().await, ConnectionState::Connecting);
        assert_ne!(next.peer_info().peer_id, client.peer_info().peer_id);
        assert_eq!(next.peer_info().name, "u");
    }

    #[tokio::test]
    async fn test_accept_without_assist_is_noop() {
        let client = SessionClient::new(PeerInfo::new("u"), "r", "ws://localhost:9090");
        assert_eq!(client.accept_suggestion().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SessionClient::new(PeerInfo::new("u"), "r", "ws://localhost:9090");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }
}
