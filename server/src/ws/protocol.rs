use prost::Message as ProstMessage;

use crate::error::CoreError;
use crate::hub::Hub;
use crate::proto::{self, Envelope, Payload};
use crate::registry::{ConnectionHandle, OutboundFrame, PushError};

/// Handle an incoming binary (protobuf) message.
/// Decodes the Envelope, dispatches based on payload type, replies on the
/// same connection.
pub async fn handle_binary_message(data: &[u8], handle: &ConnectionHandle, hub: &Hub) {
    let envelope = match Envelope::decode(data) {
        Ok(env) => env,
        Err(e) => {
            tracing::warn!(
                user_id = %handle.user_id(),
                error = %e,
                "Failed to decode protobuf Envelope"
            );
            send_error(handle, "", 400, "Invalid protobuf message");
            return;
        }
    };

    let request_id = envelope.request_id.clone();

    match envelope.payload {
        Some(payload) => dispatch_payload(payload, &request_id, handle, hub).await,
        None => send_error(handle, &request_id, 400, "Empty payload"),
    }
}

/// Dispatch a decoded payload to the appropriate handler.
async fn dispatch_payload(payload: Payload, request_id: &str, handle: &ConnectionHandle, hub: &Hub) {
    let user_id = handle.user_id();
    match payload {
        // Activity was already recorded by the reader loop
        Payload::Heartbeat(_) => {}
        Payload::Typing(typing) => match typing.target.and_then(|t| t.to_recipient()) {
            Some(target) => hub.typing(user_id, target),
            None => send_error(handle, request_id, 400, "Typing needs exactly one target"),
        },
        Payload::Ack(ack) => match hub.acknowledge(user_id, ack.up_to_sequence).await {
            Ok(consumed) => send_envelope(
                handle,
                &proto::ack_response(request_id, ack.up_to_sequence, consumed),
            ),
            Err(e) => send_core_error(handle, request_id, &e),
        },
        Payload::SetStatus(set) => {
            let status = proto::PresenceStatus::try_from(set.status)
                .ok()
                .and_then(proto::PresenceStatus::to_domain);
            match status {
                Some(status) => {
                    if let Err(e) = hub.set_status(user_id, status) {
                        send_core_error(handle, request_id, &e);
                    }
                }
                None => send_error(handle, request_id, 400, "Unknown presence status"),
            }
        }
        _ => {
            tracing::debug!(
                user_id = %user_id,
                request_id = %request_id,
                "Unexpected server-side payload from client"
            );
            send_error(handle, request_id, 400, "Payload not accepted from clients");
        }
    }
}

/// Queue an Envelope on this connection only.
fn send_envelope(handle: &ConnectionHandle, envelope: &Envelope) {
    if let Err(PushError::Full(_)) = handle.push(OutboundFrame::control(envelope)) {
        tracing::debug!(
            user_id = %handle.user_id(),
            connection_id = handle.id(),
            "Send queue full, dropping reply"
        );
    }
}

/// Send an error response envelope.
fn send_error(handle: &ConnectionHandle, request_id: &str, code: u32, message: &str) {
    send_envelope(handle, &proto::error_response(request_id, code, message));
}

fn send_core_error(handle: &ConnectionHandle, request_id: &str, err: &CoreError) {
    send_error(handle, request_id, u32::from(err.status_code().as_u16()), &err.to_string());
}
