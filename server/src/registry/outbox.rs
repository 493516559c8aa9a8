//! Bounded per-connection send queue.
//!
//! The writer task peeks the front frame with [`Outbox::next`], writes it to
//! the socket and only then pops it with [`Outbox::complete`]. A frame that
//! is in flight when the connection dies therefore still shows up in the
//! leftovers returned by [`Outbox::close`].

use axum::body::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

use crate::messages::Message;
use crate::notifications::NotificationEntry;
use crate::proto;
use crate::UserId;

/// An encoded frame waiting to be written, tagged with what it carries so
/// leftovers can be salvaged and delivery receipts advanced.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub bytes: Bytes,
    pub kind: FrameKind,
}

#[derive(Debug, Clone)]
pub enum FrameKind {
    /// Presence, typing, acks and errors. Dropped if never written.
    Control,
    /// A chat message pushed directly to one recipient.
    Live {
        message: Arc<Message>,
        recipient: UserId,
    },
    /// An entry from the recipient's notification queue.
    Queued {
        sequence: u64,
        recipient: UserId,
        message_id: Option<String>,
    },
}

impl OutboundFrame {
    pub fn control(envelope: &proto::Envelope) -> Self {
        Self {
            bytes: proto::encode(envelope),
            kind: FrameKind::Control,
        }
    }

    pub fn live(message: &Arc<Message>, recipient: &str) -> Self {
        Self {
            bytes: proto::encode(&proto::message_event(message)),
            kind: FrameKind::Live {
                message: Arc::clone(message),
                recipient: recipient.to_string(),
            },
        }
    }

    pub fn queued(entry: &NotificationEntry) -> Self {
        Self {
            bytes: proto::encode(&proto::notification_event(entry)),
            kind: FrameKind::Queued {
                sequence: entry.sequence,
                recipient: entry.user_id.clone(),
                message_id: entry.payload.message().map(|m| m.message_id.clone()),
            },
        }
    }

    /// The chat message this frame delivers, with its recipient.
    pub fn delivers(&self) -> Option<(&str, &str)> {
        match &self.kind {
            FrameKind::Control => None,
            FrameKind::Live { message, recipient } => Some((&message.message_id, recipient)),
            FrameKind::Queued {
                recipient,
                message_id: Some(message_id),
                ..
            } => Some((message_id, recipient)),
            FrameKind::Queued { .. } => None,
        }
    }
}

#[derive(Debug)]
pub enum PushError {
    /// The outbox already holds `depth` frames.
    Full(OutboundFrame),
    /// The outbox was closed.
    Closed(OutboundFrame),
}

#[derive(Debug, Default)]
struct OutboxState {
    frames: VecDeque<OutboundFrame>,
    closed: bool,
}

#[derive(Debug)]
pub struct Outbox {
    state: Mutex<OutboxState>,
    ready: Notify,
    depth: usize,
}

impl Outbox {
    pub fn new(depth: usize) -> Self {
        Self {
            state: Mutex::new(OutboxState::default()),
            ready: Notify::new(),
            depth: depth.max(1),
        }
    }

    fn state(&self) -> MutexGuard<'_, OutboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn push(&self, frame: OutboundFrame) -> Result<(), PushError> {
        let mut state = self.state();
        if state.closed {
            return Err(PushError::Closed(frame));
        }
        if state.frames.len() >= self.depth {
            return Err(PushError::Full(frame));
        }
        state.frames.push_back(frame);
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    /// Free slots. Zero once closed.
    pub fn available(&self) -> usize {
        let state = self.state();
        if state.closed {
            0
        } else {
            self.depth.saturating_sub(state.frames.len())
        }
    }

    pub fn len(&self) -> usize {
        self.state().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Wait for the front frame and return a copy of it. The frame stays
    /// queued until [`Outbox::complete`]. Returns `None` once closed.
    pub async fn next(&self) -> Option<OutboundFrame> {
        loop {
            let notified = self.ready.notified();
            {
                let state = self.state();
                if state.closed {
                    return None;
                }
                if let Some(frame) = state.frames.front() {
                    return Some(frame.clone());
                }
            }
            notified.await;
        }
    }

    /// Drop the front frame after it was written.
    pub fn complete(&self) {
        let mut state = self.state();
        if !state.closed {
            state.frames.pop_front();
        }
    }

    /// Close the outbox and take every frame that was not completed,
    /// in order. Idempotent.
    pub fn close(&self) -> Vec<OutboundFrame> {
        let mut state = self.state();
        state.closed = true;
        let leftovers = state.frames.drain(..).collect();
        drop(state);
        self.ready.notify_waiters();
        leftovers
    }
}
