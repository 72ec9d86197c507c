//! Room hub: per-room fan-out of full-buffer edits.
//!
//! Each room is an actor task that exclusively owns the canonical buffer and
//! the connection table. Connections talk to it through a [`RoomHandle`]
//! (command channel) and receive fan-out through a tokio broadcast channel.
//!
//! ```text
//! conn A ──edit──┐                         ┌──► conn B
//!                ├──► room actor ── send ──┤
//! conn C ──edit──┘   (hub_seq++)           └──► conn C (skips own origin)
//! ```
//!
//! The actor handles one command at a time, so the order in which it stamps
//! `hub_seq` is the order every receiver observes. Two edits arriving "at the
//! same time" are resolved by arrival order at the actor's queue; the later
//! one wins the buffer.
//!
//! A room whose connection set stays empty for the configured grace period
//! persists its buffer (if it changed) and shuts down. [`RoomHub::shutdown`]
//! does the same for every room at once, connected or not.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use crate::protocol::PeerInfo;
use crate::storage::{generate_room_id, MemoryRoomStore, RoomStore, StoreError};

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Command queue depth per room
    pub command_capacity: usize,
    /// How long an empty room lingers before it is collected
    pub grace_period: Duration,
    /// Maximum open connections per room
    pub max_connections_per_room: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            command_capacity: 1024,
            grace_period: Duration::from_secs(30),
            max_connections_per_room: 100,
        }
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// An edit as serialized by the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomEdit {
    pub origin: Uuid,
    /// Origin-local sequence number
    pub seq: u64,
    /// Hub serialization order within the room
    pub hub_seq: u64,
    pub text: Arc<str>,
}

/// Items fanned out to every connection of a room.
#[derive(Debug, Clone)]
pub enum RoomBroadcast {
    Edit(RoomEdit),
    PeerJoined { peer: PeerInfo, peer_count: usize },
    PeerLeft { peer: PeerInfo, peer_count: usize },
}

impl RoomBroadcast {
    /// Connection that caused this broadcast.
    pub fn origin(&self) -> Uuid {
        match self {
            Self::Edit(edit) => edit.origin,
            Self::PeerJoined { peer, .. } | Self::PeerLeft { peer, .. } => peer.peer_id,
        }
    }
}

/// What a connection gets back when it joins.
#[derive(Debug)]
pub struct JoinGrant {
    /// Canonical buffer at join time
    pub buffer: Arc<str>,
    pub hub_seq: u64,
    pub peer_count: usize,
    pub receiver: broadcast::Receiver<RoomBroadcast>,
}

/// Point-in-time view of a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub buffer: Arc<str>,
    pub hub_seq: u64,
    pub connections: usize,
}

/// Per-connection bookkeeping inside a room.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub peer: PeerInfo,
    pub state: ConnectionState,
    /// Last buffer value this connection sent
    pub last_sent: Option<Arc<str>>,
}

/// Hub errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("Room {0} is closed")]
    RoomClosed(String),
    #[error("Room {0} is full")]
    RoomFull(String),
    #[error("Connection {0} is not open in this room")]
    NotJoined(Uuid),
    #[error("Connection {0} already joined")]
    AlreadyJoined(Uuid),
    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<StoreError> for HubError {
    fn from(e: StoreError) -> Self {
        HubError::Storage(e.to_string())
    }
}

/// Hub-wide counters, lock-free on the hot path.
#[derive(Debug, Default)]
struct AtomicHubStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_edits: AtomicU64,
    total_bytes: AtomicU64,
    rooms_collected: AtomicU64,
}

/// Statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_edits: u64,
    pub total_bytes: u64,
    pub rooms_collected: u64,
    pub active_rooms: usize,
}

enum RoomCommand {
    Join {
        peer: PeerInfo,
        respond_to: oneshot::Sender<Result<JoinGrant, HubError>>,
    },
    Edit {
        origin: Uuid,
        seq: u64,
        text: String,
        respond_to: oneshot::Sender<Result<u64, HubError>>,
    },
    /// Edit with no connection behind it (HTTP save)
    HubEdit {
        text: String,
        respond_to: oneshot::Sender<Result<u64, HubError>>,
    },
    Leave {
        peer_id: Uuid,
        respond_to: oneshot::Sender<bool>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
    Snapshot {
        respond_to: oneshot::Sender<RoomSnapshot>,
    },
    Connection {
        peer_id: Uuid,
        respond_to: oneshot::Sender<Option<ConnectionInfo>>,
    },
}

/// Cloneable handle to a room actor.
#[derive(Clone)]
pub struct RoomHandle {
    room_id: Arc<str>,
    sender: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Whether the room actor has shut down.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    fn closed(&self) -> HubError {
        HubError::RoomClosed(self.room_id.to_string())
    }

    /// Add a connection to the room's active set.
    pub async fn join(&self, peer: PeerInfo) -> Result<JoinGrant, HubError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomCommand::Join { peer, respond_to: tx })
            .await
            .map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())?
    }

    /// Submit a full-buffer edit. Returns the hub_seq it was stamped with.
    pub async fn submit_edit(&self, origin: Uuid, seq: u64, text: impl Into<String>) -> Result<u64, HubError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomCommand::Edit {
                origin,
                seq,
                text: text.into(),
                respond_to: tx,
            })
            .await
            .map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())?
    }

    /// Replace the buffer on behalf of the hub itself.
    ///
    /// The edit carries the nil origin, so every connection receives it and
    /// no presence change is announced.
    pub async fn push_edit(&self, text: impl Into<String>) -> Result<u64, HubError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomCommand::HubEdit {
                text: text.into(),
                respond_to: tx,
            })
            .await
            .map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())?
    }

    /// Remove a connection. Returns whether it was present.
    pub async fn leave(&self, peer_id: Uuid) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(RoomCommand::Leave { peer_id, respond_to: tx })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn snapshot(&self) -> Result<RoomSnapshot, HubError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomCommand::Snapshot { respond_to: tx })
            .await
            .map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())
    }

    pub async fn connection(&self, peer_id: Uuid) -> Option<ConnectionInfo> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomCommand::Connection { peer_id, respond_to: tx })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn connection_count(&self) -> usize {
        self.snapshot().await.map(|s| s.connections).unwrap_or(0)
    }

    /// Persist the buffer and stop the actor, whatever its connections.
    /// Returns once the snapshot is written.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(RoomCommand::Shutdown { respond_to: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// State owned by one room actor.
struct RoomActor {
    room_id: Arc<str>,
    buffer: Arc<str>,
    hub_seq: u64,
    dirty: bool,
    connections: HashMap<Uuid, ConnectionInfo>,
    sender: broadcast::Sender<RoomBroadcast>,
    config: HubConfig,
    store: Arc<dyn RoomStore>,
    stats: Arc<AtomicHubStats>,
}

impl RoomActor {
    async fn run(mut self, mut commands: mpsc::Receiver<RoomCommand>) {
        let mut empty_since = Some(Instant::now());
        let mut stopped_by = None;

        loop {
            let deadline = empty_since.map(|since| since + self.config.grace_period);
            tokio::select! {
                cmd = commands.recv() => {
                    let cmd = match cmd {
                        Some(RoomCommand::Shutdown { respond_to }) => {
                            stopped_by = Some(respond_to);
                            break;
                        }
                        Some(cmd) => cmd,
                        None => break,
                    };
                    self.handle(cmd);
                    empty_since = match (self.connections.is_empty(), empty_since) {
                        (true, None) => Some(Instant::now()),
                        (true, since) => since,
                        (false, _) => None,
                    };
                }
                _ = async {
                    match deadline {
                        Some(d) => tokio::time::sleep_until(d).await,
                        None => std::future::pending().await,
                    }
                } => {
                    log::info!("Room {} idle for {:?}, collecting", self.room_id, self.config.grace_period);
                    break;
                }
            }
        }

        // Persist first so a successor actor loads the final buffer
        self.persist();

        // Stop accepting work, then answer anything already queued
        commands.close();
        while let Ok(cmd) = commands.try_recv() {
            self.reject(cmd);
        }

        match stopped_by {
            Some(ack) => {
                log::info!("Room {} shut down with {} open", self.room_id, self.connections.len());
                let _ = ack.send(());
            }
            None => {
                self.stats.rooms_collected.fetch_add(1, Ordering::Relaxed);
                log::info!("Room {} removed (empty)", self.room_id);
            }
        }
    }

    fn handle(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::Join { peer, respond_to } => {
                let _ = respond_to.send(self.join(peer));
            }
            RoomCommand::Edit {
                origin,
                seq,
                text,
                respond_to,
            } => {
                let _ = respond_to.send(self.edit(origin, seq, text));
            }
            RoomCommand::HubEdit { text, respond_to } => {
                let seq = self.hub_seq + 1;
                let _ = respond_to.send(Ok(self.stamp(Uuid::nil(), seq, Arc::from(text))));
            }
            RoomCommand::Leave { peer_id, respond_to } => {
                let _ = respond_to.send(self.leave(peer_id));
            }
            // Intercepted by the run loop
            RoomCommand::Shutdown { respond_to } => {
                let _ = respond_to.send(());
            }
            RoomCommand::Snapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
            RoomCommand::Connection { peer_id, respond_to } => {
                let _ = respond_to.send(self.connections.get(&peer_id).cloned());
            }
        }
    }

    fn reject(&self, cmd: RoomCommand) {
        let closed = HubError::RoomClosed(self.room_id.to_string());
        match cmd {
            RoomCommand::Join { respond_to, .. } => {
                let _ = respond_to.send(Err(closed));
            }
            RoomCommand::Edit { respond_to, .. } | RoomCommand::HubEdit { respond_to, .. } => {
                let _ = respond_to.send(Err(closed));
            }
            RoomCommand::Leave { respond_to, .. } => {
                let _ = respond_to.send(false);
            }
            // Already persisted
            RoomCommand::Shutdown { respond_to } => {
                let _ = respond_to.send(());
            }
            RoomCommand::Snapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
            RoomCommand::Connection { respond_to, .. } => {
                let _ = respond_to.send(None);
            }
        }
    }

    fn join(&mut self, peer: PeerInfo) -> Result<JoinGrant, HubError> {
        if self.connections.contains_key(&peer.peer_id) {
            return Err(HubError::AlreadyJoined(peer.peer_id));
        }
        if self.connections.len() >= self.config.max_connections_per_room {
            return Err(HubError::RoomFull(self.room_id.to_string()));
        }

        // Subscribe before announcing so the joiner sees everything after hub_seq
        let receiver = self.sender.subscribe();
        self.connections.insert(
            peer.peer_id,
            ConnectionInfo {
                peer: peer.clone(),
                state: ConnectionState::Open,
                last_sent: None,
            },
        );
        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let peer_count = self.connections.len();
        log::info!(
            "Peer {} ({}) joined room {} ({} open)",
            peer.name,
            peer.peer_id,
            self.room_id,
            peer_count
        );
        let _ = self.sender.send(RoomBroadcast::PeerJoined { peer, peer_count });

        Ok(JoinGrant {
            buffer: self.buffer.clone(),
            hub_seq: self.hub_seq,
            peer_count,
            receiver,
        })
    }

    fn edit(&mut self, origin: Uuid, seq: u64, text: String) -> Result<u64, HubError> {
        let conn = self
            .connections
            .get_mut(&origin)
            .filter(|c| c.state == ConnectionState::Open)
            .ok_or(HubError::NotJoined(origin))?;

        let text: Arc<str> = Arc::from(text);
        conn.last_sent = Some(text.clone());

        Ok(self.stamp(origin, seq, text))
    }

    /// Take `text` as the new buffer and fan it out under the next hub_seq.
    fn stamp(&mut self, origin: Uuid, seq: u64, text: Arc<str>) -> u64 {
        self.hub_seq += 1;
        self.buffer = text.clone();
        self.dirty = true;

        self.stats.total_edits.fetch_add(1, Ordering::Relaxed);
        self.stats.total_bytes.fetch_add(text.len() as u64, Ordering::Relaxed);

        let edit = RoomEdit {
            origin,
            seq,
            hub_seq: self.hub_seq,
            text,
        };
        // Fire-and-forget: zero receivers is not an error
        let receivers = self.sender.send(RoomBroadcast::Edit(edit)).unwrap_or(0);
        log::trace!(
            "Room {} edit hub_seq={} from {origin} fanned out to {} receivers",
            self.room_id,
            self.hub_seq,
            receivers.saturating_sub(1)
        );
        self.hub_seq
    }

    fn leave(&mut self, peer_id: Uuid) -> bool {
        let Some(conn) = self.connections.remove(&peer_id) else {
            return false;
        };
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);

        let peer_count = self.connections.len();
        log::info!("Peer {} left room {} ({} open)", peer_id, self.room_id, peer_count);
        let _ = self.sender.send(RoomBroadcast::PeerLeft {
            peer: conn.peer,
            peer_count,
        });
        true
    }

    fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            room_id: self.room_id.to_string(),
            buffer: self.buffer.clone(),
            hub_seq: self.hub_seq,
            connections: self.connections.len(),
        }
    }

    fn persist(&mut self) {
        if !self.dirty {
            return;
        }
        match self.store.save_snapshot(&self.room_id, &self.buffer) {
            Ok(_) => {
                self.dirty = false;
                log::info!("Persisted snapshot for room {} (room closing)", self.room_id);
            }
            Err(e) => log::error!("Failed to persist snapshot for room {}: {e}", self.room_id),
        }
    }
}

/// Room manager: maps room ids to live room actors.
pub struct RoomHub {
    rooms: Arc<RwLock<HashMap<String, RoomHandle>>>,
    config: HubConfig,
    store: Arc<dyn RoomStore>,
    stats: Arc<AtomicHubStats>,
}

impl RoomHub {
    pub fn new(config: HubConfig, store: Arc<dyn RoomStore>) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            config,
            store,
            stats: Arc::new(AtomicHubStats::default()),
        }
    }

    /// In-memory hub with default settings.
    pub fn in_memory() -> Self {
        Self::new(HubConfig::default(), Arc::new(MemoryRoomStore::new()))
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RoomStore> {
        &self.store
    }

    /// Create a room with a fresh id, persist it, and start its actor.
    pub async fn create_room(&self) -> Result<String, HubError> {
        let mut room_id = generate_room_id();
        while self.store.room_exists(&room_id)? {
            room_id = generate_room_id();
        }
        self.store.create_room(&room_id)?;
        self.get_or_create(&room_id).await?;
        log::info!("Created room {room_id}");
        Ok(room_id)
    }

    /// Get the live room, starting it (from its persisted snapshot) if needed.
    pub async fn get_or_create(&self, room_id: &str) -> Result<RoomHandle, HubError> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                if !room.is_closed() {
                    return Ok(room.clone());
                }
            }
        }

        // Slow path: write lock to create
        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(room_id) {
            if !room.is_closed() {
                return Ok(room.clone());
            }
        }

        let buffer = self.store.load_snapshot(room_id)?.unwrap_or_default();
        let handle = self.spawn_room(room_id, buffer);
        rooms.insert(room_id.to_string(), handle.clone());
        Ok(handle)
    }

    fn spawn_room(&self, room_id: &str, buffer: String) -> RoomHandle {
        let room_id: Arc<str> = Arc::from(room_id);
        let (tx, rx) = mpsc::channel(self.config.command_capacity);
        let (sender, _) = broadcast::channel(self.config.broadcast_capacity);

        let actor = RoomActor {
            room_id: room_id.clone(),
            buffer: Arc::from(buffer),
            hub_seq: 0,
            dirty: false,
            connections: HashMap::new(),
            sender,
            config: self.config.clone(),
            store: self.store.clone(),
            stats: self.stats.clone(),
        };
        tokio::spawn(actor.run(rx));
        log::debug!("Started room {room_id}");

        RoomHandle { room_id, sender: tx }
    }

    /// Join a room, restarting it once if it was collected in between.
    pub async fn join(&self, room_id: &str, peer: PeerInfo) -> Result<(RoomHandle, JoinGrant), HubError> {
        let room = self.get_or_create(room_id).await?;
        match room.join(peer.clone()).await {
            Err(HubError::RoomClosed(_)) => {
                let room = self.get_or_create(room_id).await?;
                let grant = room.join(peer).await?;
                Ok((room, grant))
            }
            other => other.map(|grant| (room, grant)),
        }
    }

    /// Live room, if any.
    pub async fn room(&self, room_id: &str) -> Option<RoomHandle> {
        let rooms = self.rooms.read().await;
        rooms.get(room_id).filter(|r| !r.is_closed()).cloned()
    }

    /// Persist and stop every live room. Used on process shutdown.
    /// Returns how many rooms were stopped.
    pub async fn shutdown(&self) -> usize {
        let rooms: Vec<RoomHandle> = {
            let mut rooms = self.rooms.write().await;
            rooms.drain().map(|(_, room)| room).collect()
        };
        let mut stopped = 0;
        for room in rooms.into_iter().filter(|r| !r.is_closed()) {
            room.shutdown().await;
            stopped += 1;
        }
        stopped
    }

    /// Drop handles of collected rooms.
    pub async fn prune(&self) -> usize {
        let mut rooms = self.rooms.write().await;
        let before = rooms.len();
        rooms.retain(|_, room| !room.is_closed());
        before - rooms.len()
    }

    pub async fn room_count(&self) -> usize {
        let rooms = self.rooms.read().await;
        rooms.values().filter(|r| !r.is_closed()).count()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        let rooms = self.rooms.read().await;
        let mut ids: Vec<String> = rooms
            .iter()
            .filter(|(_, r)| !r.is_closed())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_edits: self.stats.total_edits.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
            rooms_collected: self.stats.rooms_collected.load(Ordering::Relaxed),
            active_rooms: self.room_count().await,
        }
    }
}
