//! HTTP client for the room lifecycle endpoints.

use serde::{Deserialize, Serialize};

/// Response of `POST /rooms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRoomResponse {
    pub room_id: String,
}

/// Body of `PUT /rooms/{room_id}/code`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveCodeRequest {
    pub code: String,
}

/// Room API errors. Any non-2xx response surfaces as `Status`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomApiError {
    #[error("Request failed: {0}")]
    Request(String),
    #[error("Room API returned status {0}")]
    Status(u16),
    #[error("Malformed response: {0}")]
    Decode(String),
}

/// Thin client over the room HTTP API.
#[derive(Debug, Clone)]
pub struct RoomApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl RoomApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Create a room and return its id.
    pub async fn create_room(&self) -> Result<String, RoomApiError> {
        let resp = self
            .client
            .post(format!("{}/rooms", self.base_url))
            .send()
            .await
            .map_err(|e| RoomApiError::Request(e.to_string()))?;
        let resp = check(resp)?;
        let body: CreateRoomResponse = resp
            .json()
            .await
            .map_err(|e| RoomApiError::Decode(e.to_string()))?;
        Ok(body.room_id)
    }

    /// Overwrite the persisted snapshot of a room.
    pub async fn save_room_code(&self, room_id: &str, code: &str) -> Result<(), RoomApiError> {
        let resp = self
            .client
            .put(format!("{}/rooms/{room_id}/code", self.base_url))
            .json(&SaveCodeRequest { code: code.to_string() })
            .send()
            .await
            .map_err(|e| RoomApiError::Request(e.to_string()))?;
        check(resp)?;
        Ok(())
    }
}

fn check(resp: reqwest::Response) -> Result<reqwest::Response, RoomApiError> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        log::warn!("Room API {} -> {status}", resp.url());
        Err(RoomApiError::Status(status.as_u16()))
    }
}
