//! Fan-out Dispatcher.
//!
//! Routes a persisted message to each recipient: straight into the outboxes
//! of their live connections when they are caught up, otherwise into their
//! notification queue. Recipients are handled concurrently; a slow or
//! failing recipient never holds up the others.
//!
//! Every mutation of one recipient's outboxes happens under that recipient's
//! lane (a FIFO async mutex). This gives per-recipient arrival ordering and
//! lets an evicted connection's leftovers be moved to the queue before
//! anything newer is routed.

pub mod worker;

use dashmap::DashMap;
use futures_util::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{CoreError, Result};
use crate::messages::{Message, MessageStore};
use crate::notifications::{NotificationEntry, NotificationPayload, NotificationQueue};
use crate::registry::{ConnectionHandle, ConnectionRegistry, FrameKind, OutboundFrame, PushError};
use crate::UserId;

/// What happened to a message for one recipient.
#[derive(Debug)]
pub enum DeliveryOutcome {
    /// Written to this many live connection outboxes.
    Live { connections: usize },
    /// Stored in the recipient's notification queue.
    Queued { sequence: u64 },
    /// Neither delivered nor queued. The receipt stays pending.
    Failed(CoreError),
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Live { .. } => "live",
            DeliveryOutcome::Queued { .. } => "queued",
            DeliveryOutcome::Failed(_) => "failed",
        }
    }
}

#[derive(Debug)]
pub struct RecipientOutcome {
    pub user_id: UserId,
    pub outcome: DeliveryOutcome,
}

#[derive(Debug)]
pub struct DispatchReport {
    pub message_id: String,
    pub outcomes: Vec<RecipientOutcome>,
}

impl DispatchReport {
    pub fn outcome_for(&self, user_id: &str) -> Option<&DeliveryOutcome> {
        self.outcomes
            .iter()
            .find(|o| o.user_id == user_id)
            .map(|o| &o.outcome)
    }

    pub fn failures(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.outcome, DeliveryOutcome::Failed(_)))
            .count()
    }

    pub fn summary(&self) -> Vec<OutcomeSummary> {
        self.outcomes
            .iter()
            .map(|o| {
                let (connections, sequence, error) = match &o.outcome {
                    DeliveryOutcome::Live { connections } => (Some(*connections), None, None),
                    DeliveryOutcome::Queued { sequence } => (None, Some(*sequence), None),
                    DeliveryOutcome::Failed(e) => (None, None, Some(e.kind())),
                };
                OutcomeSummary {
                    user_id: o.user_id.clone(),
                    outcome: o.outcome.as_str(),
                    connections,
                    sequence,
                    error,
                }
            })
            .collect()
    }
}

/// JSON view of one recipient's outcome.
#[derive(Debug, Serialize)]
pub struct OutcomeSummary {
    pub user_id: UserId,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connections: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
}

pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    queue: Arc<NotificationQueue>,
    messages: MessageStore,
    lanes: DashMap<UserId, Arc<Mutex<()>>>,
}

/// Held while delivering to one user. On drop the lane is released and
/// forgotten once nobody else holds or waits on it.
struct LaneGuard<'a> {
    lanes: &'a DashMap<UserId, Arc<Mutex<()>>>,
    user_id: UserId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for LaneGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.lanes
            .remove_if(&self.user_id, |_, lane| Arc::strong_count(lane) == 1);
    }
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        queue: Arc<NotificationQueue>,
        messages: MessageStore,
    ) -> Self {
        Self {
            registry,
            queue,
            messages,
            lanes: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Wait for `user_id`'s lane.
    async fn lock_lane(&self, user_id: &str) -> LaneGuard<'_> {
        let lane = self
            .lanes
            .entry(user_id.to_string())
            .or_default()
            .value()
            .clone();
        let guard = lane.lock_owned().await;
        LaneGuard {
            lanes: &self.lanes,
            user_id: user_id.to_string(),
            guard: Some(guard),
        }
    }

    /// Lanes currently allocated. Idle lanes are dropped.
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Fan a persisted message out to its recipients concurrently.
    pub async fn dispatch(&self, message: &Message, recipients: &[UserId]) -> DispatchReport {
        let message = Arc::new(message.clone());

        let deliveries = recipients.iter().map(|recipient| {
            let message = Arc::clone(&message);
            async move {
                let outcome = self.deliver_to(recipient, &message).await;
                RecipientOutcome {
                    user_id: recipient.clone(),
                    outcome,
                }
            }
        });
        let outcomes = join_all(deliveries).await;

        let report = DispatchReport {
            message_id: message.message_id.clone(),
            outcomes,
        };
        tracing::debug!(
            message_id = %report.message_id,
            recipients = report.outcomes.len(),
            failures = report.failures(),
            "Message dispatched"
        );
        report
    }

    async fn deliver_to(&self, recipient: &str, message: &Arc<Message>) -> DeliveryOutcome {
        let _lane = self.lock_lane(recipient).await;

        let connections = self.writable_connections(recipient).await;

        let backlog = match self.queue.last_pending_sequence(recipient).await {
            Ok(sequence) => sequence,
            Err(e) => return DeliveryOutcome::Failed(e),
        };
        // A live frame must not overtake queued entries still on their way
        let caught_up = connections.iter().all(|c| c.pushed_through() >= backlog);

        if !connections.is_empty() && caught_up {
            let frame = OutboundFrame::live(message, recipient);
            let mut accepted = 0;
            for conn in &connections {
                match conn.push(frame.clone()) {
                    Ok(()) => accepted += 1,
                    Err(PushError::Full(_)) => {
                        self.evict_locked(conn, "send queue overflow").await;
                    }
                    Err(PushError::Closed(_)) => {
                        let err = CoreError::TransportUnavailable {
                            connection_id: conn.id(),
                        };
                        tracing::debug!(user_id = %recipient, error = %err, "Skipping closed connection");
                        self.registry.unregister(conn.id());
                    }
                }
            }
            if accepted > 0 {
                return DeliveryOutcome::Live {
                    connections: accepted,
                };
            }
        }

        let payload = NotificationPayload::Message {
            message: Message::clone(message),
        };
        match self.queue.enqueue(recipient, payload).await {
            Ok(entry) => {
                self.pump_locked(recipient).await;
                DeliveryOutcome::Queued {
                    sequence: entry.sequence,
                }
            }
            Err(e) => {
                tracing::warn!(
                    user_id = %recipient,
                    message_id = %message.message_id,
                    error = %e,
                    "Message could not be queued"
                );
                DeliveryOutcome::Failed(e)
            }
        }
    }

    /// Connections of `user_id` that can take another frame. Connections
    /// whose outbox is already at depth are evicted. Caller holds the lane.
    async fn writable_connections(&self, user_id: &str) -> Vec<ConnectionHandle> {
        let mut writable = Vec::new();
        for conn in self.registry.connections_for(user_id) {
            if conn.outbox().available() == 0 {
                self.evict_locked(&conn, "send queue overflow").await;
            } else {
                writable.push(conn);
            }
        }
        writable
    }

    /// Close a connection and move its undelivered chat messages to the
    /// queue, preserving their order. Caller holds the lane.
    async fn evict_locked(&self, conn: &ConnectionHandle, reason: &str) {
        let leftovers = self.registry.force_close(conn, reason);
        self.salvage_locked(conn.user_id(), leftovers).await;
    }

    /// Re-queue live message frames that never reached the client. Queued
    /// frames are still in the queue and control frames are dropped.
    async fn salvage_locked(&self, user_id: &str, frames: Vec<OutboundFrame>) -> usize {
        let mut salvaged = 0;
        for frame in frames {
            let FrameKind::Live { message, .. } = frame.kind else {
                continue;
            };
            let payload = NotificationPayload::Message {
                message: Message::clone(&message),
            };
            match self.queue.enqueue(user_id, payload).await {
                Ok(_) => salvaged += 1,
                Err(e) => tracing::error!(
                    user_id = %user_id,
                    message_id = %message.message_id,
                    error = %e,
                    "Lost live frame could not be queued; receipt stays pending"
                ),
            }
        }
        if salvaged > 0 {
            tracing::info!(user_id = %user_id, salvaged, "Undelivered frames moved to queue");
        }
        salvaged
    }

    /// Push queued entries each connection has not seen yet, as far as its
    /// outbox has room. Caller holds the lane.
    async fn pump_locked(&self, user_id: &str) -> usize {
        let mut pushed = 0;
        for conn in self.registry.connections_for(user_id) {
            'conn: loop {
                let room = conn.outbox().available();
                if room == 0 {
                    break;
                }
                let entries = match self.queue.pending_after(user_id, conn.pushed_through(), room).await {
                    Ok(entries) => entries,
                    Err(e) => {
                        tracing::warn!(user_id = %user_id, error = %e, "Queue read failed during pump");
                        return pushed;
                    }
                };
                if entries.is_empty() {
                    break;
                }
                for entry in &entries {
                    if conn.push(OutboundFrame::queued(entry)).is_err() {
                        break 'conn;
                    }
                    conn.advance_pushed(entry.sequence);
                    pushed += 1;
                }
            }
        }
        pushed
    }

    /// Push pending queue entries to every connection of `user_id`.
    pub async fn pump(&self, user_id: &str) -> usize {
        let _lane = self.lock_lane(user_id).await;
        self.pump_locked(user_id).await
    }

    /// Register a new connection and send it the user's backlog.
    pub async fn attach(&self, handle: &ConnectionHandle) -> Result<()> {
        let _lane = self.lock_lane(handle.user_id()).await;

        if !self.registry.register(handle.clone()) {
            return Err(CoreError::TransportUnavailable {
                connection_id: handle.id(),
            });
        }
        self.pump_locked(handle.user_id()).await;
        Ok(())
    }

    /// Tear a connection down: close it, unregister it, and move any live
    /// frames it never wrote to the queue. Safe to call more than once.
    pub async fn detach(&self, handle: &ConnectionHandle) {
        let _lane = self.lock_lane(handle.user_id()).await;

        let leftovers = handle.close();
        self.registry.unregister(handle.id());
        if self.salvage_locked(handle.user_id(), leftovers).await > 0 {
            self.pump_locked(handle.user_id()).await;
        }
    }

    /// Enqueue a notification for `user_id` and push it to any live
    /// connection.
    pub async fn notify(&self, user_id: &str, payload: NotificationPayload) -> Result<NotificationEntry> {
        let _lane = self.lock_lane(user_id).await;

        let entry = self.queue.enqueue(user_id, payload).await?;
        self.pump_locked(user_id).await;
        Ok(entry)
    }

    /// Push an ephemeral frame (presence, typing) to every connection of
    /// `user_id`. Returns how many connections took it.
    pub async fn push_control(&self, user_id: &str, frame: OutboundFrame) -> usize {
        let _lane = self.lock_lane(user_id).await;

        let mut accepted = 0;
        for conn in self.writable_connections(user_id).await {
            match conn.push(frame.clone()) {
                Ok(()) => accepted += 1,
                Err(PushError::Full(_)) => self.evict_locked(&conn, "send queue overflow").await,
                Err(PushError::Closed(_)) => {}
            }
        }
        accepted
    }

    /// Record that a frame reached the client's socket.
    pub async fn frame_written(&self, frame: &OutboundFrame) {
        let Some((message_id, recipient)) = frame.delivers() else {
            return;
        };
        if let Err(e) = self.messages.mark_delivered(message_id, recipient).await {
            tracing::warn!(
                message_id = %message_id,
                user_id = %recipient,
                error = %e,
                "Failed to record delivery"
            );
        }
    }
}
