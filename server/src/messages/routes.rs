//! REST endpoints for posting messages, receipts and thread membership.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use super::{Message, NewMessage, Receipt};
use crate::dispatch::OutcomeSummary;
use crate::error::CoreError;
use crate::state::AppState;
use crate::UserId;

// --- Request / Response types ---

#[derive(Debug, Serialize)]
pub struct PostMessageResponse {
    pub message: Message,
    pub recipients: Vec<OutcomeSummary>,
}

#[derive(Debug, Serialize)]
pub struct MessageWithReceipts {
    pub message: Message,
    pub receipts: Vec<Receipt>,
}

#[derive(Debug, Deserialize)]
pub struct MarkReadRequest {
    pub reader_id: UserId,
}

#[derive(Debug, Serialize)]
pub struct UpdatedResponse {
    pub updated: bool,
}

#[derive(Debug, Deserialize)]
pub struct JoinThreadRequest {
    pub user_id: UserId,
}

#[derive(Debug, Serialize)]
pub struct ParticipantsResponse {
    pub thread_id: String,
    pub participants: Vec<UserId>,
}

// --- Handlers ---

/// POST /api/messages
/// Persist a message and fan it out. Per-recipient outcomes are reported in
/// the body; a recipient whose queue is full does not fail the request.
pub async fn post_message(
    State(state): State<AppState>,
    Json(body): Json<NewMessage>,
) -> Result<(StatusCode, Json<PostMessageResponse>), CoreError> {
    let (message, report) = state.hub.post_message(body).await?;
    Ok((
        StatusCode::CREATED,
        Json(PostMessageResponse {
            message,
            recipients: report.summary(),
        }),
    ))
}

/// GET /api/messages/{message_id}
pub async fn get_message(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
) -> Result<Json<MessageWithReceipts>, CoreError> {
    let (message, receipts) = state.hub.messages.get(&message_id).await?;
    Ok(Json(MessageWithReceipts { message, receipts }))
}

/// POST /api/messages/{message_id}/read
/// Body: { "reader_id": "..." }
pub async fn mark_read(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    Json(body): Json<MarkReadRequest>,
) -> Result<Json<UpdatedResponse>, CoreError> {
    // 404 for unknown messages rather than a silent no-op
    state.hub.messages.get(&message_id).await?;
    let updated = state.hub.messages.mark_read(&message_id, &body.reader_id).await?;
    Ok(Json(UpdatedResponse { updated }))
}

/// POST /api/threads/{thread_id}/participants
/// Body: { "user_id": "..." }
pub async fn join_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(body): Json<JoinThreadRequest>,
) -> Result<(StatusCode, Json<UpdatedResponse>), CoreError> {
    if body.user_id.trim().is_empty() {
        return Err(CoreError::InvalidRequest("user_id is required".into()));
    }
    let joined = state.hub.messages.join_thread(&thread_id, &body.user_id).await?;
    let status = if joined { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(UpdatedResponse { updated: joined })))
}

/// DELETE /api/threads/{thread_id}/participants/{user_id}
pub async fn leave_thread(
    State(state): State<AppState>,
    Path((thread_id, user_id)): Path<(String, String)>,
) -> Result<StatusCode, CoreError> {
    if state.hub.messages.leave_thread(&thread_id, &user_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(CoreError::NotFound(format!("{user_id} in thread {thread_id}")))
    }
}

/// GET /api/threads/{thread_id}/participants
pub async fn list_participants(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<Json<ParticipantsResponse>, CoreError> {
    let participants = state.hub.messages.participants(&thread_id).await?;
    Ok(Json(ParticipantsResponse {
        thread_id,
        participants,
    }))
}
