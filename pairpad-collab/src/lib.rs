//! # pairpad-collab: Shared-buffer collaboration for pairpad
//!
//! Keeps every connection's view of a room's single text buffer convergent.
//! The protocol is last-write-wins: each edit carries the full buffer, the
//! room serializes edits, and every other connection receives them in that
//! order. Nothing is merged.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   WebSocket /ws/{room}  ┌─────────────┐
//! │ SessionClient │ ◄─────────────────────► │ SyncServer  │
//! │ (per user)    │   text or bincode       │ (central)   │
//! └──────┬────────┘                         └──────┬──────┘
//!        │                                         │
//!        ▼                                         ▼
//! ┌───────────────┐                         ┌─────────────┐
//! │ SharedBuffer  │                         │ Room actor  │──► RoomStore
//! │ + EchoGuard   │                         │ (hub_seq)   │
//! └──────┬────────┘                         └─────────────┘
//!        │ local edits only
//!        ▼
//! ┌─────────────────┐
//! │ AssistRequester │──► SuggestionService
//! └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`echo`]: Origin tagging so remote edits never loop back
//! - [`hub`]: Room actors, fan-out and grace-period collection
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket session client
//! - [`assist`]: Debounced suggestion requests
//! - [`rest`]: Room lifecycle HTTP client
//! - [`storage`]: Room snapshot persistence (memory or RocksDB)

pub mod assist;
pub mod client;
pub mod echo;
pub mod hub;
pub mod protocol;
pub mod rest;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use assist::{
    AssistConfig, AssistError, AssistHandle, AssistRequester, HeuristicSuggester,
    HttpSuggestionService, SuggestionQuery, SuggestionResponse, SuggestionService,
};
pub use client::{SessionClient, SessionEvent};
pub use echo::{ChangeSource, EchoGuard, Incoming, OutgoingEdit, SharedBuffer};
pub use hub::{
    ConnectionState, HubConfig, HubError, HubStats, JoinGrant, RoomBroadcast, RoomEdit,
    RoomHandle, RoomHub, RoomSnapshot,
};
pub use protocol::{MessageType, PeerInfo, Presence, ProtocolError, SyncMessage};
pub use rest::{RoomApiClient, RoomApiError};
pub use server::{ServerConfig, SyncServer, WireMode};
pub use storage::{
    generate_room_id, MemoryRoomStore, RocksRoomStore, RoomMetadata, RoomStore, StoreConfig,
    StoreError,
};
