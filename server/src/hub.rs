//! The messaging core, wired together.
//!
//! `Hub` owns one instance of each component and is what the HTTP and
//! WebSocket layers talk to. Cloning is cheap.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;

use crate::config::MessagingConfig;
use crate::dispatch::{worker, DispatchReport, Dispatcher};
use crate::error::{CoreError, Result};
use crate::messages::{Message, MessageStore, NewMessage, Recipient};
use crate::notifications::{retention, NotificationEntry, NotificationPayload, NotificationQueue};
use crate::presence::{self, PresenceConfig, PresenceStatus, PresenceTracker};
use crate::registry::{ConnectionHandle, ConnectionRegistry, OutboundFrame};
use crate::store::Store;

#[derive(Clone)]
pub struct Hub {
    pub registry: Arc<ConnectionRegistry>,
    pub presence: Arc<PresenceTracker>,
    pub queue: Arc<NotificationQueue>,
    pub messages: MessageStore,
    pub dispatcher: Arc<Dispatcher>,
    pub config: Arc<MessagingConfig>,
    store: Arc<dyn Store>,
    connections: TaskTracker,
}

impl Hub {
    /// Build the core on top of `store` and start the presence fanout.
    /// Must be called inside a Tokio runtime.
    pub fn new(store: Arc<dyn Store>, config: MessagingConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let presence = Arc::new(PresenceTracker::new(
            PresenceConfig {
                away_after: config.away_timeout(),
                offline_grace: config.offline_grace(),
            },
            events_tx,
        ));
        let registry = Arc::new(ConnectionRegistry::new(Arc::clone(&presence)));
        let queue = Arc::new(NotificationQueue::new(Arc::clone(&store), config.queue_capacity));
        let messages = MessageStore::new(Arc::clone(&store), config.max_body_length);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&queue),
            messages.clone(),
        ));

        tokio::spawn(presence::broadcast::run_presence_fanout(
            events_rx,
            Arc::clone(&presence),
            Arc::clone(&dispatcher),
            messages.clone(),
        ));

        Self {
            registry,
            presence,
            queue,
            messages,
            dispatcher,
            config: Arc::new(config),
            store,
            connections: TaskTracker::new(),
        }
    }

    /// Start the periodic tasks: idle sweep, delivery worker and retention.
    pub fn spawn_background_tasks(&self) {
        presence::monitor::spawn_heartbeat_monitor(
            Arc::clone(&self.presence),
            self.config.heartbeat_interval(),
        );
        worker::spawn_delivery_worker(
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.queue),
            self.config.delivery_interval(),
        );
        retention::spawn_retention_cleanup(
            Arc::clone(&self.store),
            self.config.retention_days,
            self.config.cleanup_interval(),
        );
    }

    /// Persist a message, then fan it out. A persistence failure aborts
    /// before any recipient sees the message.
    pub async fn post_message(&self, new: NewMessage) -> Result<(Message, DispatchReport)> {
        let (message, recipients) = self.messages.persist(new).await?;
        let report = self.dispatcher.dispatch(&message, &recipients).await;
        Ok((message, report))
    }

    /// Queue a notification for a user and push it if they are connected.
    pub async fn notify(&self, user_id: &str, payload: NotificationPayload) -> Result<NotificationEntry> {
        if user_id.is_empty() {
            return Err(CoreError::InvalidRequest("user_id must be non-empty".into()));
        }
        self.dispatcher.notify(user_id, payload).await
    }

    /// Open a connection for `user_id`. `resume_from` acknowledges
    /// everything up to that sequence first; the backlog after the
    /// acknowledged point is pushed right away.
    pub async fn connect(&self, user_id: &str, resume_from: Option<u64>) -> Result<ConnectionHandle> {
        if let Some(sequence) = resume_from {
            let consumed = self.queue.acknowledge_entries(user_id, sequence).await?;
            self.record_delivered(user_id, &consumed).await;
        }

        let handle = ConnectionHandle::new(
            self.registry.next_connection_id(),
            user_id,
            self.config.send_queue_depth,
        );
        handle.advance_pushed(self.queue.acked_through(user_id).await?);

        self.dispatcher.attach(&handle).await?;
        self.presence.announce_to(user_id);
        Ok(handle)
    }

    pub async fn disconnect(&self, handle: &ConnectionHandle) {
        self.dispatcher.detach(handle).await;
        self.release_if_idle(handle.user_id());
    }

    /// Acknowledge queue entries. Acknowledged messages count as delivered.
    pub async fn acknowledge(&self, user_id: &str, up_to_sequence: u64) -> Result<usize> {
        let consumed = self.queue.acknowledge_entries(user_id, up_to_sequence).await?;
        self.record_delivered(user_id, &consumed).await;
        self.release_if_idle(user_id);
        Ok(consumed.len())
    }

    async fn record_delivered(&self, user_id: &str, entries: &[NotificationEntry]) {
        for message in entries.iter().filter_map(|e| e.payload.message()) {
            if let Err(e) = self.messages.mark_delivered(&message.message_id, user_id).await {
                tracing::warn!(
                    message_id = %message.message_id,
                    user_id = %user_id,
                    error = %e,
                    "Failed to record delivery on acknowledge"
                );
            }
        }
    }

    /// Forget per-user queue state of a user with no connection and nothing
    /// pending.
    pub fn release_if_idle(&self, user_id: &str) {
        if !self.registry.is_connected(user_id) {
            self.queue.release(user_id);
        }
    }

    pub fn heartbeat(&self, user_id: &str) {
        self.presence.heartbeat(user_id);
    }

    pub fn set_status(&self, user_id: &str, status: PresenceStatus) -> Result<bool> {
        Ok(self.presence.set_status(user_id, status)?.is_some())
    }

    pub fn typing(&self, user_id: &str, target: Recipient) {
        self.presence.typing(user_id, target);
    }

    /// The WebSocket writer finished sending `frame`.
    pub async fn frame_written(&self, frame: &OutboundFrame) {
        self.dispatcher.frame_written(frame).await;
    }

    /// Run a connection actor on a tracked task so shutdown can wait for it.
    pub fn spawn_connection<F>(&self, actor: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.connections.spawn(actor);
    }

    /// Cancel every connection. Their actors detach on their own.
    pub fn shutdown(&self) {
        self.connections.close();
        self.registry.close_all();
    }

    /// Wait for connection actors to finish detaching after [`Hub::shutdown`].
    /// Returns false if some were still running at the deadline.
    pub async fn wait_for_connections(&self, deadline: Duration) -> bool {
        match tokio::time::timeout(deadline, self.connections.wait()).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    remaining = self.connections.len(),
                    "Connections still open at shutdown deadline"
                );
                false
            }
        }
    }
}
