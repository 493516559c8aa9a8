use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::hub::Hub;
use crate::registry::ConnectionHandle;
use crate::state::AppState;
use crate::ws::{protocol, CLOSE_IDLE_TIMEOUT, CLOSE_NORMAL, CLOSE_SLOW_CONSUMER};

/// Run the actor-per-connection pattern for a registered connection.
///
/// - Writer task: owns the sink, drains the outbox and sends pings
/// - Reader loop: decodes client envelopes, enforces the idle timeout
///
/// Either half stopping cancels the connection; the outbox leftovers are
/// handed back to the core on the way out.
pub async fn run_connection(socket: WebSocket, state: AppState, handle: ConnectionHandle) {
    let hub = state.hub.clone();
    let user_id = handle.user_id().to_string();
    let connection_id = handle.id();
    let (ws_sender, mut ws_receiver) = socket.split();

    tracing::info!(user_id = %user_id, connection_id, "WebSocket actor started");

    let writer_handle = tokio::spawn(writer_task(ws_sender, handle.clone(), hub.clone()));

    let idle_timeout = hub.config.idle_timeout();
    let cancel = handle.cancel_token().clone();

    let mut idle = false;

    // Reader loop: any inbound frame counts as activity
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = timeout(idle_timeout, ws_receiver.next()) => next,
        };

        match next {
            Err(_) => {
                tracing::info!(user_id = %user_id, connection_id, "Idle timeout, closing connection");
                idle = true;
                break;
            }
            Ok(None) => {
                tracing::info!(user_id = %user_id, connection_id, "WebSocket stream ended");
                break;
            }
            Ok(Some(Err(e))) => {
                tracing::warn!(
                    user_id = %user_id,
                    connection_id,
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
            Ok(Some(Ok(msg))) => {
                hub.heartbeat(&user_id);
                match msg {
                    Message::Binary(data) => {
                        protocol::handle_binary_message(&data, &handle, &hub).await;
                    }
                    Message::Text(text) => {
                        tracing::debug!(
                            user_id = %user_id,
                            "Received text message (expected binary protobuf): {}",
                            text.as_str().chars().take(100).collect::<String>()
                        );
                    }
                    // Pongs to client pings are sent by the socket itself
                    Message::Ping(_) | Message::Pong(_) => {}
                    Message::Close(frame) => {
                        tracing::info!(
                            user_id = %user_id,
                            connection_id,
                            reason = ?frame,
                            "Client initiated close"
                        );
                        break;
                    }
                }
            }
        }
    }

    cancel.cancel();
    if let Ok(mut ws_sender) = writer_handle.await {
        let (code, reason) = if handle.outbox().is_closed() {
            (CLOSE_SLOW_CONSUMER, "send queue overflow")
        } else if idle {
            (CLOSE_IDLE_TIMEOUT, "idle timeout")
        } else {
            (CLOSE_NORMAL, "closing")
        };
        let _ = ws_sender
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })))
            .await;
    }

    hub.disconnect(&handle).await;

    tracing::info!(user_id = %user_id, connection_id, "WebSocket actor stopped");
}

/// Writer task: forwards outbox frames to the WebSocket sink and pings on
/// the heartbeat interval. Returns the sink so the actor can send a close
/// frame.
async fn writer_task(
    mut ws_sender: SplitSink<WebSocket, Message>,
    handle: ConnectionHandle,
    hub: Hub,
) -> SplitSink<WebSocket, Message> {
    let cancel = handle.cancel_token().clone();
    let mut ping_timer = interval(hub.config.heartbeat_interval());
    ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the first immediate tick
    ping_timer.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = handle.outbox().next() => {
                let Some(frame) = frame else { break };
                // Cancelling mid-send leaves the frame at the front of the
                // outbox, where detach salvages it
                let sent = tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = ws_sender.send(Message::Binary(frame.bytes.clone())) => sent,
                };
                if sent.is_err() {
                    cancel.cancel();
                    break;
                }
                handle.outbox().complete();
                hub.frame_written(&frame).await;
            }
            _ = ping_timer.tick() => {
                if ws_sender.send(Message::Ping(vec![1, 2, 3, 4].into())).await.is_err() {
                    cancel.cancel();
                    break;
                }
            }
        }
    }
    ws_sender
}
