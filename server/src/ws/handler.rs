use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::error::CoreError;
use crate::state::AppState;
use crate::ws::{actor, CLOSE_INTERNAL_ERROR};

/// Query parameters for a WebSocket connection.
/// The caller's identity is established by the upstream auth layer and
/// passed through as `user_id`.
#[derive(Debug, Deserialize)]
pub struct WsConnectQuery {
    pub user_id: String,
    /// Last notification sequence the client has processed. Everything up
    /// to it is acknowledged before the backlog is replayed.
    pub resume_from: Option<u64>,
}

/// GET /ws?user_id=...&resume_from=...
/// WebSocket upgrade endpoint. On success, runs an actor for the connection.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let user_id = params.user_id.trim().to_string();
    if user_id.is_empty() {
        return CoreError::InvalidRequest("user_id is required".into()).into_response();
    }

    ws.on_upgrade(move |socket| async move {
        let hub = state.hub.clone();
        hub.spawn_connection(handle_connection(socket, state, user_id, params.resume_from));
    })
}

async fn handle_connection(
    mut socket: WebSocket,
    state: AppState,
    user_id: String,
    resume_from: Option<u64>,
) {
    match state.hub.connect(&user_id, resume_from).await {
        Ok(handle) => actor::run_connection(socket, state, handle).await,
        Err(e) => {
            tracing::warn!(user_id = %user_id, error = %e, "Could not open connection");
            let close_frame = CloseFrame {
                code: CLOSE_INTERNAL_ERROR,
                reason: e.kind().into(),
            };
            let _ = socket.send(Message::Close(Some(close_frame))).await;
        }
    }
}
