//! REST endpoints for the notification queue: enqueue from other services,
//! pull-based drain for clients that are not connected, and acknowledgement.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use futures_util::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};

use super::{NotificationEntry, NotificationPayload};
use crate::error::CoreError;
use crate::state::AppState;
use crate::UserId;

/// Default page size for a drain.
const DEFAULT_LIMIT: usize = 100;
/// Maximum page size for a drain.
const MAX_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct DrainQuery {
    pub user_id: UserId,
    pub since: Option<u64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct DrainResponse {
    pub notifications: Vec<NotificationEntry>,
    /// Pass as `since` to continue.
    pub next_since: u64,
    pub has_more: bool,
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub user_id: UserId,
    pub payload: NotificationPayload,
}

#[derive(Debug, Deserialize)]
pub struct AckRequest {
    pub user_id: UserId,
    pub up_to_sequence: u64,
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub consumed: usize,
    pub acked_through: u64,
}

/// GET /api/notifications?user_id=...&since=...&limit=...
pub async fn drain_notifications(
    State(state): State<AppState>,
    Query(params): Query<DrainQuery>,
) -> Result<Json<DrainResponse>, CoreError> {
    let since = params.since.unwrap_or(0);
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    // One extra entry tells us whether there is more
    let mut notifications: Vec<NotificationEntry> = state
        .hub
        .queue
        .drain(&params.user_id, since)
        .into_stream()
        .take(limit + 1)
        .try_collect()
        .await?;

    state.hub.release_if_idle(&params.user_id);

    let has_more = notifications.len() > limit;
    notifications.truncate(limit);
    let next_since = notifications.last().map(|e| e.sequence).unwrap_or(since);

    Ok(Json(DrainResponse {
        notifications,
        next_since,
        has_more,
    }))
}

/// POST /api/notifications
/// Body: { "user_id": "...", "payload": { "type": "rsvp", ... } }
/// Returns 507 when the user's queue is full.
pub async fn enqueue_notification(
    State(state): State<AppState>,
    Json(body): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<NotificationEntry>), CoreError> {
    let entry = state.hub.notify(&body.user_id, body.payload).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

/// POST /api/notifications/ack
/// Body: { "user_id": "...", "up_to_sequence": 42 }
pub async fn acknowledge(
    State(state): State<AppState>,
    Json(body): Json<AckRequest>,
) -> Result<Json<AckResponse>, CoreError> {
    let consumed = state.hub.acknowledge(&body.user_id, body.up_to_sequence).await?;
    let acked_through = state.hub.queue.acked_through(&body.user_id).await?;
    Ok(Json(AckResponse {
        consumed,
        acked_through,
    }))
}
