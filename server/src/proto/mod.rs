//! WebSocket wire protocol.
//!
//! Every frame is one protobuf `Envelope` carrying a request id and a single
//! payload. The messages are defined in `shared/proto/agora.proto`.
//! Client -> server payloads: Heartbeat, Typing, Ack, SetStatus.
//! Server -> client payloads: MessageEvent, NotificationEvent,
//! PresenceEvent, TypingEvent, AckResponse, ErrorResponse.
//!
//! Timestamps are unix milliseconds.

use axum::body::Bytes;
use prost::Message as ProstMessage;

use crate::messages::{Message, Recipient};
use crate::notifications::NotificationEntry;
use crate::presence::PresenceState;

// Generated from shared/proto/agora.proto by prost-build.
// Package agora.ws -> proto::agora::ws
pub mod agora {
    pub mod ws {
        include!(concat!(env!("OUT_DIR"), "/agora.ws.rs"));
    }
}

pub use agora::ws::envelope::Payload;
pub use agora::ws::*;

// --- Conversions ---

impl From<&Recipient> for Target {
    fn from(recipient: &Recipient) -> Self {
        match recipient {
            Recipient::User(id) => Target {
                user_id: id.clone(),
                thread_id: String::new(),
            },
            Recipient::Thread(id) => Target {
                user_id: String::new(),
                thread_id: id.clone(),
            },
        }
    }
}

impl Target {
    pub fn to_recipient(&self) -> Option<Recipient> {
        match (self.user_id.is_empty(), self.thread_id.is_empty()) {
            (false, true) => Some(Recipient::User(self.user_id.clone())),
            (true, false) => Some(Recipient::Thread(self.thread_id.clone())),
            _ => None,
        }
    }
}

impl From<&Message> for ChatMessage {
    fn from(message: &Message) -> Self {
        ChatMessage {
            message_id: message.message_id.clone(),
            sender_id: message.sender_id.clone(),
            target: Some(Target::from(&message.target)),
            body: message.body.clone(),
            created_at: message.created_at.timestamp_millis(),
        }
    }
}

impl From<crate::presence::PresenceStatus> for PresenceStatus {
    fn from(status: crate::presence::PresenceStatus) -> Self {
        match status {
            crate::presence::PresenceStatus::Online => PresenceStatus::Online,
            crate::presence::PresenceStatus::Away => PresenceStatus::Away,
            crate::presence::PresenceStatus::Offline => PresenceStatus::Offline,
        }
    }
}

impl PresenceStatus {
    pub fn to_domain(self) -> Option<crate::presence::PresenceStatus> {
        match self {
            PresenceStatus::Unspecified => None,
            PresenceStatus::Online => Some(crate::presence::PresenceStatus::Online),
            PresenceStatus::Away => Some(crate::presence::PresenceStatus::Away),
            PresenceStatus::Offline => Some(crate::presence::PresenceStatus::Offline),
        }
    }
}

// --- Envelope builders ---

fn event(payload: Payload) -> Envelope {
    Envelope {
        request_id: String::new(),
        payload: Some(payload),
    }
}

pub fn message_event(message: &Message) -> Envelope {
    event(Payload::MessageEvent(MessageEvent {
        message: Some(ChatMessage::from(message)),
    }))
}

pub fn notification_event(entry: &NotificationEntry) -> Envelope {
    let message = entry.payload.message().map(ChatMessage::from);
    let data_json = if message.is_some() {
        String::new()
    } else {
        serde_json::to_string(&entry.payload).unwrap_or_default()
    };
    event(Payload::NotificationEvent(NotificationEvent {
        sequence: entry.sequence,
        notification_id: entry.notification_id.clone(),
        created_at: entry.created_at.timestamp_millis(),
        kind: entry.payload.kind().to_string(),
        message,
        data_json,
    }))
}

pub fn presence_event(state: &PresenceState) -> Envelope {
    event(Payload::PresenceEvent(PresenceEvent {
        user_id: state.user_id.clone(),
        status: PresenceStatus::from(state.status) as i32,
        last_seen: state.last_seen.timestamp_millis(),
    }))
}

pub fn typing_event(user_id: &str, target: &Recipient) -> Envelope {
    event(Payload::TypingEvent(TypingEvent {
        user_id: user_id.to_string(),
        target: Some(Target::from(target)),
    }))
}

pub fn ack_response(request_id: &str, up_to_sequence: u64, consumed: usize) -> Envelope {
    Envelope {
        request_id: request_id.to_string(),
        payload: Some(Payload::AckResponse(AckResponse {
            up_to_sequence,
            consumed: consumed as u32,
        })),
    }
}

pub fn error_response(request_id: &str, code: u32, message: &str) -> Envelope {
    Envelope {
        request_id: request_id.to_string(),
        payload: Some(Payload::Error(ErrorResponse {
            code,
            message: message.to_string(),
            request_id: request_id.to_string(),
        })),
    }
}

/// Encode an Envelope for a binary WebSocket frame.
pub fn encode(envelope: &Envelope) -> Bytes {
    Bytes::from(envelope.encode_to_vec())
}
