//! HTTP API: room lifecycle and suggestions.
//!
//! | Method | Path                   | Response                        |
//! |--------|------------------------|---------------------------------|
//! | GET    | `/`                    | `{ "message": … }`              |
//! | POST   | `/rooms`               | `{ "room_id": … }`              |
//! | GET    | `/rooms/{room_id}`     | [`RoomInfo`]                    |
//! | PUT    | `/rooms/{room_id}/code`| `204`                           |
//! | POST   | `/autocomplete`        | `{ "suggestion": … }`           |

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use pairpad_collab::rest::{CreateRoomResponse, SaveCodeRequest};
use pairpad_collab::{
    AssistError, HeuristicSuggester, HubError, RoomHub, RoomStore, StoreError, SuggestionQuery,
    SuggestionResponse, SuggestionService,
};
use serde::Serialize;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<RoomHub>,
    pub suggester: Arc<dyn SuggestionService>,
}

impl AppState {
    /// State with the built-in suggestion heuristic.
    pub fn new(hub: Arc<RoomHub>) -> Self {
        Self {
            hub,
            suggester: Arc::new(HeuristicSuggester),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Room not found: {0}")]
    RoomNotFound(String),
    #[error(transparent)]
    Hub(#[from] HubError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Assist(#[from] AssistError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::RoomNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Hub(HubError::RoomFull(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Assist(_) => StatusCode::BAD_GATEWAY,
            ApiError::Hub(_) | ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            log::error!("{self}");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Body of `GET /rooms/{room_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomInfo {
    pub room_id: String,
    pub code: String,
    /// Whether the room currently has a running actor
    pub live: bool,
    pub connections: usize,
    pub hub_seq: u64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/rooms", post(create_room))
        .route("/rooms/{room_id}", get(get_room))
        .route("/rooms/{room_id}/code", put(save_room_code))
        .route("/autocomplete", post(autocomplete))
        .with_state(state)
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": "pairpad API is running" }))
}

async fn create_room(State(state): State<AppState>) -> Result<Json<CreateRoomResponse>, ApiError> {
    let room_id = state.hub.create_room().await?;
    Ok(Json(CreateRoomResponse { room_id }))
}

async fn get_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomInfo>, ApiError> {
    if let Some(room) = state.hub.room(&room_id).await {
        // Collected between lookup and snapshot: fall through to the store
        if let Ok(snap) = room.snapshot().await {
            return Ok(Json(RoomInfo {
                room_id: snap.room_id,
                code: snap.buffer.to_string(),
                live: true,
                connections: snap.connections,
                hub_seq: snap.hub_seq,
            }));
        }
    }

    let code = state
        .hub
        .store()
        .load_snapshot(&room_id)?
        .ok_or_else(|| ApiError::RoomNotFound(room_id.clone()))?;
    Ok(Json(RoomInfo {
        room_id,
        code,
        live: false,
        connections: 0,
        hub_seq: 0,
    }))
}

/// Persist the code. A live room also receives it as an ordinary edit, so
/// connected peers converge on the saved text.
async fn save_room_code(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Json(req): Json<SaveCodeRequest>,
) -> Result<StatusCode, ApiError> {
    let live = state.hub.room(&room_id).await;
    if live.is_none() && !state.hub.store().room_exists(&room_id)? {
        return Err(ApiError::RoomNotFound(room_id));
    }

    state.hub.store().save_snapshot(&room_id, &req.code)?;

    if let Some(room) = live {
        match room.push_edit(req.code).await {
            Ok(hub_seq) => log::debug!("Pushed saved code into room {room_id} at hub_seq {hub_seq}"),
            // Collected meanwhile; the store already holds the code
            Err(HubError::RoomClosed(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }

    log::debug!("Saved code for room {room_id}");
    Ok(StatusCode::NO_CONTENT)
}

async fn autocomplete(
    State(state): State<AppState>,
    Json(query): Json<SuggestionQuery>,
) -> Result<Json<SuggestionResponse>, ApiError> {
    let suggestion = state.suggester.suggest(query).await?;
    Ok(Json(SuggestionResponse { suggestion }))
}
