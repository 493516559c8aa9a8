//! Presence fanout task.
//!
//! Consumes [`PresenceEvent`]s from the tracker and pushes them to the
//! connections that should see them. Status changes go to the user's
//! observers, typing indicators to the other side of the conversation.

use std::sync::Arc;
use tokio::sync::mpsc;

use super::{PresenceEvent, PresenceTracker};
use crate::dispatch::Dispatcher;
use crate::messages::MessageStore;
use crate::proto;
use crate::registry::OutboundFrame;

pub async fn run_presence_fanout(
    mut events: mpsc::UnboundedReceiver<PresenceEvent>,
    presence: Arc<PresenceTracker>,
    dispatcher: Arc<Dispatcher>,
    messages: MessageStore,
) {
    while let Some(event) = events.recv().await {
        match event {
            PresenceEvent::Changed(state) => {
                let frame = OutboundFrame::control(&proto::presence_event(&state));
                for observer in presence.observers_of(&state.user_id) {
                    dispatcher.push_control(&observer, frame.clone()).await;
                }
            }
            PresenceEvent::Snapshot { observer, state } => {
                let frame = OutboundFrame::control(&proto::presence_event(&state));
                dispatcher.push_control(&observer, frame).await;
            }
            PresenceEvent::Typing { user_id, target } => {
                let recipients = match messages.recipients_for(&user_id, &target).await {
                    Ok(recipients) => recipients,
                    Err(e) => {
                        tracing::debug!(user_id = %user_id, error = %e, "Dropping typing indicator");
                        continue;
                    }
                };
                let frame = OutboundFrame::control(&proto::typing_event(&user_id, &target));
                for recipient in recipients {
                    dispatcher.push_control(&recipient, frame.clone()).await;
                }
            }
        }
    }
    tracing::debug!("Presence fanout stopped");
}
