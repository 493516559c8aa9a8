//! Persistence collaborator boundary.
//!
//! The core only ever appends messages and notifications and moves flags
//! forward; it never rewrites history. Implementations are synchronous and
//! are driven from async code through [`run_blocking`].

pub mod sqlite;

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::Result;
use crate::messages::{DeliveryState, Message, Receipt};
use crate::notifications::NotificationEntry;
use crate::UserId;

/// Durable state of one user's notification queue, as loaded on hydration.
#[derive(Debug, Clone, Default)]
pub struct StoredQueue {
    /// Highest sequence ever issued to this user (0 if none).
    pub last_sequence: u64,
    /// Unconsumed entries, ascending by sequence.
    pub entries: Vec<NotificationEntry>,
}

pub trait Store: Send + Sync + 'static {
    /// Append a message and a pending receipt for every recipient, atomically.
    fn append_message(&self, message: &Message, recipients: &[UserId]) -> Result<()>;

    fn load_message(&self, message_id: &str) -> Result<Option<Message>>;

    fn receipts(&self, message_id: &str) -> Result<Vec<Receipt>>;

    /// Advance a receipt to `state` if it is currently behind it.
    /// Returns whether anything changed.
    fn advance_receipt(&self, message_id: &str, recipient_id: &str, state: DeliveryState) -> Result<bool>;

    fn add_participant(&self, thread_id: &str, user_id: &str) -> Result<bool>;

    fn remove_participant(&self, thread_id: &str, user_id: &str) -> Result<bool>;

    fn participants(&self, thread_id: &str) -> Result<Vec<UserId>>;

    /// Append a notification. The entry's sequence must be the next one for
    /// its user.
    fn append_notification(&self, entry: &NotificationEntry) -> Result<()>;

    fn load_queue(&self, user_id: &str) -> Result<StoredQueue>;

    /// Mark every entry of `user_id` with sequence <= `up_to_sequence`
    /// consumed. Returns the number of entries that changed.
    fn mark_consumed(&self, user_id: &str, up_to_sequence: u64) -> Result<usize>;

    /// Delete consumed entries acknowledged before `before`.
    fn purge_consumed(&self, before: DateTime<Utc>) -> Result<usize>;
}

/// Run a store operation on the blocking pool.
pub async fn run_blocking<T, F>(store: &Arc<dyn Store>, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn Store) -> Result<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || op(store.as_ref())).await?
}
