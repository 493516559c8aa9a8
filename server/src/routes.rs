use axum::{routing, Router};

use crate::messages::routes as messages;
use crate::notifications::routes as notifications;
use crate::presence::routes as presence;
use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Build the full axum Router with all routes.
///
/// Callers are authenticated upstream; user ids in requests are trusted.
pub fn build_router(state: AppState) -> Router {
    let message_routes = Router::new()
        .route("/api/messages", routing::post(messages::post_message))
        .route("/api/messages/{message_id}", routing::get(messages::get_message))
        .route("/api/messages/{message_id}/read", routing::post(messages::mark_read))
        .route(
            "/api/threads/{thread_id}/participants",
            routing::get(messages::list_participants).post(messages::join_thread),
        )
        .route(
            "/api/threads/{thread_id}/participants/{user_id}",
            routing::delete(messages::leave_thread),
        );

    let notification_routes = Router::new()
        .route(
            "/api/notifications",
            routing::get(notifications::drain_notifications).post(notifications::enqueue_notification),
        )
        .route("/api/notifications/ack", routing::post(notifications::acknowledge));

    let presence_routes = Router::new()
        .route("/api/presence", routing::post(presence::set_presence))
        .route("/api/presence/{user_id}", routing::get(presence::get_presence))
        .route(
            "/api/presence/subscriptions",
            routing::post(presence::subscribe).delete(presence::unsubscribe),
        )
        .route("/api/typing", routing::post(presence::send_typing));

    Router::new()
        .route("/health", routing::get(health_check))
        .route("/ws", routing::get(ws_handler::ws_upgrade))
        .merge(message_routes)
        .merge(notification_routes)
        .merge(presence_routes)
        .with_state(state)
}

/// GET /health: simple health check
async fn health_check() -> &'static str {
    "ok"
}
