//! REST endpoints for presence lookups, explicit status changes and
//! presence subscriptions.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use super::{PresenceState, PresenceStatus};
use crate::error::CoreError;
use crate::messages::Recipient;
use crate::state::AppState;
use crate::UserId;

#[derive(Debug, Deserialize)]
pub struct SetPresenceRequest {
    pub user_id: UserId,
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionRequest {
    /// The user whose presence is observed
    pub user_id: UserId,
    pub observer_id: UserId,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub changed: bool,
}

#[derive(Debug, Deserialize)]
pub struct SendTypingRequest {
    pub user_id: UserId,
    pub target: Recipient,
}

/// GET /api/presence/{user_id}
pub async fn get_presence(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<PresenceState> {
    Json(state.hub.presence.status(&user_id))
}

/// POST /api/presence
/// Body: { "user_id": "...", "status": "online"|"away"|"offline" }
/// 409 for transitions the state machine does not allow.
pub async fn set_presence(
    State(state): State<AppState>,
    Json(body): Json<SetPresenceRequest>,
) -> Result<Json<PresenceState>, CoreError> {
    let status = PresenceStatus::from_str(&body.status)
        .ok_or_else(|| CoreError::InvalidRequest(format!("unknown status {:?}", body.status)))?;

    state.hub.set_status(&body.user_id, status)?;
    Ok(Json(state.hub.presence.status(&body.user_id)))
}

/// POST /api/presence/subscriptions
pub async fn subscribe(
    State(state): State<AppState>,
    Json(body): Json<SubscriptionRequest>,
) -> Result<(StatusCode, Json<SubscriptionResponse>), CoreError> {
    if body.user_id.is_empty() || body.observer_id.is_empty() {
        return Err(CoreError::InvalidRequest("user_id and observer_id are required".into()));
    }
    let changed = state.hub.presence.subscribe(&body.user_id, &body.observer_id);
    let status = if changed { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(SubscriptionResponse { changed })))
}

/// DELETE /api/presence/subscriptions
pub async fn unsubscribe(
    State(state): State<AppState>,
    Json(body): Json<SubscriptionRequest>,
) -> Json<SubscriptionResponse> {
    let changed = state.hub.presence.unsubscribe(&body.user_id, &body.observer_id);
    Json(SubscriptionResponse { changed })
}

/// POST /api/typing
/// Body: { "user_id": "...", "target": { "user": "..." } | { "thread": "..." } }
pub async fn send_typing(
    State(state): State<AppState>,
    Json(body): Json<SendTypingRequest>,
) -> StatusCode {
    state.hub.typing(&body.user_id, body.target);
    StatusCode::ACCEPTED
}
