//! Connection Registry.
//!
//! Maps each online user to their live connections. A user may hold several
//! connections at once (multiple devices or tabs). The first connection of a
//! user marks them online in the presence tracker; losing the last one starts
//! the offline grace period.

pub mod outbox;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use outbox::{FrameKind, OutboundFrame, Outbox, PushError};

use crate::error::CoreError;
use crate::presence::PresenceTracker;
use crate::UserId;

pub type ConnectionId = u64;

struct ConnectionInner {
    connection_id: ConnectionId,
    user_id: UserId,
    connected_at: DateTime<Utc>,
    outbox: Outbox,
    cancel: CancellationToken,
    /// Highest queue sequence pushed into this connection's outbox.
    pushed_through: AtomicU64,
}

/// Cheap-to-clone handle to one live connection. The WebSocket writer task
/// drains `outbox()`; everything else pushes into it.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("connection_id", &self.inner.connection_id)
            .field("user_id", &self.inner.user_id)
            .field("queued", &self.inner.outbox.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConnectionHandle {
    pub fn new(connection_id: ConnectionId, user_id: &str, send_queue_depth: usize) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                connection_id,
                user_id: user_id.to_string(),
                connected_at: Utc::now(),
                outbox: Outbox::new(send_queue_depth),
                cancel: CancellationToken::new(),
                pushed_through: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.connection_id
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.inner.connected_at
    }

    pub fn outbox(&self) -> &Outbox {
        &self.inner.outbox
    }

    /// Cancelled when the connection must stop: writer failure, idle
    /// timeout, eviction or shutdown.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled() || self.inner.outbox.is_closed()
    }

    pub fn push(&self, frame: OutboundFrame) -> Result<(), PushError> {
        self.inner.outbox.push(frame)
    }

    pub fn pushed_through(&self) -> u64 {
        self.inner.pushed_through.load(Ordering::Acquire)
    }

    pub fn advance_pushed(&self, sequence: u64) {
        self.inner.pushed_through.fetch_max(sequence, Ordering::AcqRel);
    }

    /// Close the outbox and cancel the connection. Returns the frames that
    /// were never completed, in order.
    pub fn close(&self) -> Vec<OutboundFrame> {
        let leftovers = self.inner.outbox.close();
        self.inner.cancel.cancel();
        leftovers
    }
}

pub struct ConnectionRegistry {
    users: DashMap<UserId, HashMap<ConnectionId, ConnectionHandle>>,
    owners: DashMap<ConnectionId, UserId>,
    next_id: AtomicU64,
    presence: Arc<PresenceTracker>,
}

impl ConnectionRegistry {
    pub fn new(presence: Arc<PresenceTracker>) -> Self {
        Self {
            users: DashMap::new(),
            owners: DashMap::new(),
            next_id: AtomicU64::new(1),
            presence,
        }
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Add a connection. A closed handle is refused. Registering an id that
    /// is already present replaces the old handle.
    pub fn register(&self, handle: ConnectionHandle) -> bool {
        let user_id = handle.user_id().to_string();
        let connection_id = handle.id();

        if handle.is_closed() {
            tracing::debug!(user_id = %user_id, connection_id, "Refusing closed connection");
            return false;
        }

        {
            // Presence is notified under the user's entry lock so open/close
            // transitions for one user are observed in registry order.
            let mut conns = self.users.entry(user_id.clone()).or_default();
            let first = conns.is_empty();
            conns.insert(connection_id, handle);
            self.owners.insert(connection_id, user_id.clone());
            if first {
                self.presence.connection_opened(&user_id);
            }
        }

        tracing::info!(user_id = %user_id, connection_id, "Connection registered");
        true
    }

    /// Remove a connection and cancel it. Unknown ids are a logged no-op.
    /// The outbox is left as is; whoever owns the leftovers closes it.
    pub fn unregister(&self, connection_id: ConnectionId) -> Option<ConnectionHandle> {
        let Some((_, user_id)) = self.owners.remove(&connection_id) else {
            let err = CoreError::RegistryInconsistency(format!(
                "connection {connection_id} is not registered"
            ));
            tracing::debug!(connection_id, error = %err, "Ignoring unregister");
            return None;
        };

        let removed = match self.users.get_mut(&user_id) {
            Some(mut conns) => {
                let removed = conns.remove(&connection_id);
                if conns.is_empty() {
                    self.presence.connection_closed(&user_id);
                }
                removed
            }
            None => None,
        };
        self.users.remove_if(&user_id, |_, conns| conns.is_empty());

        match &removed {
            Some(handle) => {
                handle.cancel_token().cancel();
                tracing::info!(user_id = %user_id, connection_id, "Connection unregistered");
            }
            None => {
                let err = CoreError::RegistryInconsistency(format!(
                    "connection {connection_id} indexed for {user_id} but not in their set"
                ));
                tracing::warn!(connection_id, error = %err, "Registry out of sync");
            }
        }
        removed
    }

    /// Close a connection's outbox, cancel it and drop it from the registry.
    /// Returns the frames it never wrote, in order.
    pub fn force_close(&self, handle: &ConnectionHandle, reason: &str) -> Vec<OutboundFrame> {
        tracing::warn!(
            user_id = %handle.user_id(),
            connection_id = handle.id(),
            queued = handle.outbox().len(),
            reason,
            "Force-closing connection"
        );
        let leftovers = handle.close();
        self.unregister(handle.id());
        leftovers
    }

    /// Live connections of a user, in no particular order.
    pub fn connections_for(&self, user_id: &str) -> Vec<ConnectionHandle> {
        self.users
            .get(user_id)
            .map(|conns| {
                conns
                    .values()
                    .filter(|h| !h.outbox().is_closed())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get(&self, connection_id: ConnectionId) -> Option<ConnectionHandle> {
        let user_id = self.owners.get(&connection_id)?.value().clone();
        self.users.get(&user_id)?.get(&connection_id).cloned()
    }

    pub fn connection_count(&self, user_id: &str) -> usize {
        self.users.get(user_id).map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_connected(&self, user_id: &str) -> bool {
        self.connection_count(user_id) > 0
    }

    pub fn online_users(&self) -> Vec<UserId> {
        self.users.iter().map(|e| e.key().clone()).collect()
    }

    pub fn total_connections(&self) -> usize {
        self.owners.len()
    }

    /// Cancel every connection. Used on shutdown.
    pub fn close_all(&self) {
        for entry in self.users.iter() {
            for handle in entry.value().values() {
                handle.cancel_token().cancel();
            }
        }
    }
}
