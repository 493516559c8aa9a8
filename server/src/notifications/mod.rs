//! Durable, ordered, per-user notification queue.
//!
//! Entries get a per-user sequence starting at 1. Clients resume from the
//! last sequence they acknowledged, which gives at-least-once delivery
//! across reconnects; deduplication by `notification_id` is left to the
//! client. Unacknowledged entries are never dropped: once a user holds
//! `capacity` of them, new writes are rejected with `QueueOverflow`.
//!
//! State is sharded per user (DashMap of per-user async mutexes) and
//! hydrated lazily from the store on first touch.

pub mod retention;
pub mod routes;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{CoreError, Result};
use crate::messages::Message;
use crate::store::{run_blocking, Store};
use crate::UserId;

/// Entries fetched per lock acquisition while draining.
const DRAIN_PAGE_SIZE: usize = 64;

/// What a notification carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationPayload {
    /// A chat message that could not be delivered live.
    Message { message: Message },
    /// An event RSVP confirmation.
    Rsvp {
        event_id: String,
        attendee_id: UserId,
        response: String,
    },
    /// The user was mentioned in a message.
    Mention {
        message_id: String,
        thread_id: Option<String>,
        mentioned_by: UserId,
    },
    /// Anything else a collaborator wants queued.
    Custom {
        kind: String,
        data: serde_json::Value,
    },
}

impl NotificationPayload {
    pub fn kind(&self) -> &str {
        match self {
            NotificationPayload::Message { .. } => "message",
            NotificationPayload::Rsvp { .. } => "rsvp",
            NotificationPayload::Mention { .. } => "mention",
            NotificationPayload::Custom { kind, .. } => kind,
        }
    }

    pub fn message(&self) -> Option<&Message> {
        match self {
            NotificationPayload::Message { message } => Some(message),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEntry {
    pub notification_id: String,
    pub user_id: UserId,
    pub sequence: u64,
    pub payload: NotificationPayload,
    pub created_at: DateTime<Utc>,
    pub consumed: bool,
}

/// In-memory view of one user's queue. Holds only unacknowledged entries.
#[derive(Debug, Default)]
struct UserQueue {
    hydrated: bool,
    last_sequence: u64,
    acked_through: u64,
    entries: VecDeque<NotificationEntry>,
}

impl UserQueue {
    fn after(&self, after: u64, upper: u64, limit: usize) -> Vec<NotificationEntry> {
        self.entries
            .iter()
            .filter(|e| e.sequence > after && e.sequence <= upper)
            .take(limit)
            .cloned()
            .collect()
    }
}

pub struct NotificationQueue {
    store: Arc<dyn Store>,
    queues: DashMap<UserId, Arc<Mutex<UserQueue>>>,
    capacity: usize,
}

impl NotificationQueue {
    pub fn new(store: Arc<dyn Store>, capacity: usize) -> Self {
        Self {
            store,
            queues: DashMap::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lock one user's queue, loading it from the store on first use.
    async fn lock(&self, user_id: &str) -> Result<OwnedMutexGuard<UserQueue>> {
        let slot = self
            .queues
            .entry(user_id.to_string())
            .or_default()
            .value()
            .clone();
        let mut queue = slot.lock_owned().await;

        if !queue.hydrated {
            let uid = user_id.to_string();
            let stored = run_blocking(&self.store, move |store| store.load_queue(&uid)).await?;
            queue.last_sequence = stored.last_sequence;
            queue.acked_through = stored
                .entries
                .first()
                .map(|e| e.sequence - 1)
                .unwrap_or(stored.last_sequence);
            queue.entries = stored.entries.into();
            queue.hydrated = true;
            tracing::debug!(
                user_id = %user_id,
                last_sequence = queue.last_sequence,
                pending = queue.entries.len(),
                "Notification queue hydrated"
            );
        }

        Ok(queue)
    }

    /// Durably append a notification and return it with its sequence.
    pub async fn enqueue(&self, user_id: &str, payload: NotificationPayload) -> Result<NotificationEntry> {
        let mut queue = self.lock(user_id).await?;

        if queue.entries.len() >= self.capacity {
            tracing::warn!(
                user_id = %user_id,
                capacity = self.capacity,
                "Notification queue full, rejecting write"
            );
            return Err(CoreError::QueueOverflow {
                user_id: user_id.to_string(),
                capacity: self.capacity,
            });
        }

        let entry = NotificationEntry {
            notification_id: uuid::Uuid::now_v7().to_string(),
            user_id: user_id.to_string(),
            sequence: queue.last_sequence + 1,
            payload,
            created_at: Utc::now(),
            consumed: false,
        };

        // Sequence only advances once the write is durable
        let durable = entry.clone();
        run_blocking(&self.store, move |store| store.append_notification(&durable)).await?;

        queue.last_sequence = entry.sequence;
        queue.entries.push_back(entry.clone());

        tracing::debug!(
            user_id = %user_id,
            sequence = entry.sequence,
            kind = entry.payload.kind(),
            "Notification enqueued"
        );

        Ok(entry)
    }

    /// Lazy cursor over entries with sequence > `since`, ascending. The
    /// upper bound is fixed on the first page so the cursor is finite.
    pub fn drain(self: &Arc<Self>, user_id: &str, since: u64) -> Drain {
        Drain {
            queue: Arc::clone(self),
            user_id: user_id.to_string(),
            cursor: since,
            upper: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Mark every entry up to `up_to_sequence` consumed. Acks at or below
    /// the current watermark are no-ops; acks beyond the last issued
    /// sequence are clamped. Returns how many entries were consumed.
    pub async fn acknowledge(&self, user_id: &str, up_to_sequence: u64) -> Result<usize> {
        Ok(self.acknowledge_entries(user_id, up_to_sequence).await?.len())
    }

    /// Like [`acknowledge`](Self::acknowledge), returning the consumed
    /// entries in sequence order.
    pub async fn acknowledge_entries(
        &self,
        user_id: &str,
        up_to_sequence: u64,
    ) -> Result<Vec<NotificationEntry>> {
        let mut queue = self.lock(user_id).await?;

        let up_to = up_to_sequence.min(queue.last_sequence);
        if up_to <= queue.acked_through {
            return Ok(Vec::new());
        }

        let uid = user_id.to_string();
        run_blocking(&self.store, move |store| store.mark_consumed(&uid, up_to)).await?;

        let mut consumed = Vec::new();
        while queue
            .entries
            .front()
            .is_some_and(|e| e.sequence <= up_to)
        {
            if let Some(mut entry) = queue.entries.pop_front() {
                entry.consumed = true;
                consumed.push(entry);
            }
        }
        queue.acked_through = up_to;

        tracing::debug!(
            user_id = %user_id,
            up_to_sequence = up_to,
            consumed = consumed.len(),
            "Notifications acknowledged"
        );

        Ok(consumed)
    }

    /// Up to `limit` unacknowledged entries with sequence > `after`.
    pub async fn pending_after(&self, user_id: &str, after: u64, limit: usize) -> Result<Vec<NotificationEntry>> {
        let queue = self.lock(user_id).await?;
        Ok(queue.after(after, u64::MAX, limit))
    }

    /// Highest unacknowledged sequence, or 0 when nothing is pending.
    pub async fn last_pending_sequence(&self, user_id: &str) -> Result<u64> {
        let queue = self.lock(user_id).await?;
        Ok(queue.entries.back().map(|e| e.sequence).unwrap_or(0))
    }

    /// Highest acknowledged sequence.
    pub async fn acked_through(&self, user_id: &str) -> Result<u64> {
        let queue = self.lock(user_id).await?;
        Ok(queue.acked_through)
    }

    /// Number of unacknowledged entries.
    pub async fn depth(&self, user_id: &str) -> Result<usize> {
        let queue = self.lock(user_id).await?;
        Ok(queue.entries.len())
    }

    /// Drop the in-memory copy of an empty queue. It is reloaded from the
    /// store on next use. Queues in use or holding entries are kept.
    pub fn release(&self, user_id: &str) -> bool {
        self.queues
            .remove_if(user_id, |_, slot| {
                Arc::strong_count(slot) == 1
                    && slot
                        .try_lock()
                        .map(|q| q.hydrated && q.entries.is_empty())
                        .unwrap_or(false)
            })
            .is_some()
    }

    /// Queues currently held in memory.
    pub fn loaded_queues(&self) -> usize {
        self.queues.len()
    }

    /// Users whose loaded queue holds unacknowledged entries. Queues that are
    /// busy right now are skipped; the next sweep sees them.
    pub fn users_with_pending(&self) -> Vec<UserId> {
        self.queues
            .iter()
            .filter(|slot| {
                slot.value()
                    .try_lock()
                    .map(|q| !q.entries.is_empty())
                    .unwrap_or(false)
            })
            .map(|slot| slot.key().clone())
            .collect()
    }
}

/// Restartable cursor returned by [`NotificationQueue::drain`].
pub struct Drain {
    queue: Arc<NotificationQueue>,
    user_id: UserId,
    cursor: u64,
    upper: Option<u64>,
    buffer: VecDeque<NotificationEntry>,
    exhausted: bool,
}

impl Drain {
    /// Sequence of the last entry handed out; pass it back to `drain` to
    /// resume after a restart.
    pub fn position(&self) -> u64 {
        self.cursor
    }

    pub async fn next(&mut self) -> Result<Option<NotificationEntry>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fill().await?;
        }
        match self.buffer.pop_front() {
            Some(entry) => {
                self.cursor = entry.sequence;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    async fn fill(&mut self) -> Result<()> {
        let queue = self.queue.lock(&self.user_id).await?;
        let upper = *self.upper.get_or_insert(queue.last_sequence);
        let page = queue.after(self.cursor, upper, DRAIN_PAGE_SIZE);
        drop(queue);

        if page.len() < DRAIN_PAGE_SIZE {
            self.exhausted = true;
        }
        self.buffer.extend(page);
        Ok(())
    }

    /// Collect everything that remains.
    pub async fn collect_all(mut self) -> Result<Vec<NotificationEntry>> {
        let mut out = Vec::new();
        while let Some(entry) = self.next().await? {
            out.push(entry);
        }
        Ok(out)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<NotificationEntry>> + Send {
        stream::try_unfold(self, |mut drain| async move {
            Ok(drain.next().await?.map(|entry| (entry, drain)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::SqliteStore;
    use futures_util::TryStreamExt;

    fn rsvp(event: &str) -> NotificationPayload {
        NotificationPayload::Rsvp {
            event_id: event.to_string(),
            attendee_id: "carol".into(),
            response: "yes".into(),
        }
    }

    fn queue_with(capacity: usize) -> (Arc<NotificationQueue>, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        (
            Arc::new(NotificationQueue::new(Arc::clone(&store), capacity)),
            store,
        )
    }

    #[tokio::test]
    async fn test_sequences_increase_per_user() {
        let (queue, _) = queue_with(100);
        let a1 = queue.enqueue("alice", rsvp("e1")).await.unwrap();
        let b1 = queue.enqueue("bob", rsvp("e1")).await.unwrap();
        let a2 = queue.enqueue("alice", rsvp("e2")).await.unwrap();

        assert_eq!(a1.sequence, 1);
        assert_eq!(a2.sequence, 2);
        assert_eq!(b1.sequence, 1);
    }

    #[tokio::test]
    async fn test_released_queue_reloads_with_same_numbering() {
        let (queue, _) = queue_with(100);
        queue.enqueue("bob", rsvp("e1")).await.unwrap();
        queue.enqueue("bob", rsvp("e2")).await.unwrap();
        assert!(!queue.release("bob"));

        let consumed = queue.acknowledge_entries("bob", 2).await.unwrap();
        assert_eq!(consumed.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2]);
        assert!(consumed.iter().all(|e| e.consumed));

        assert!(queue.release("bob"));
        assert_eq!(queue.loaded_queues(), 0);

        assert_eq!(queue.acked_through("bob").await.unwrap(), 2);
        assert_eq!(queue.enqueue("bob", rsvp("e3")).await.unwrap().sequence, 3);
    }

    #[tokio::test]
    async fn test_drain_ack_drain() {
        let (queue, _) = queue_with(100);
        for i in 0..5 {
            queue.enqueue("bob", rsvp(&format!("e{i}"))).await.unwrap();
        }

        let all = queue.drain("bob", 0).collect_all().await.unwrap();
        assert_eq!(all.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);

        queue.acknowledge("bob", 3).await.unwrap();
        let rest = queue.drain("bob", 3).collect_all().await.unwrap();
        assert_eq!(rest.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![4, 5]);

        // Acknowledged entries are gone even when draining from scratch
        let from_zero = queue.drain("bob", 0).collect_all().await.unwrap();
        assert_eq!(from_zero.len(), 2);
    }

    #[tokio::test]
    async fn test_acknowledge_is_idempotent() {
        let (queue, _) = queue_with(100);
        for i in 0..3 {
            queue.enqueue("bob", rsvp(&format!("e{i}"))).await.unwrap();
        }
        assert_eq!(queue.acknowledge("bob", 2).await.unwrap(), 2);
        assert_eq!(queue.acknowledge("bob", 2).await.unwrap(), 0);
        assert_eq!(queue.acknowledge("bob", 1).await.unwrap(), 0);
        assert_eq!(queue.depth("bob").await.unwrap(), 1);

        // Acks past the last issued sequence are clamped
        assert_eq!(queue.acknowledge("bob", 99).await.unwrap(), 1);
        let next = queue.enqueue("bob", rsvp("e9")).await.unwrap();
        assert_eq!(next.sequence, 4);
        assert_eq!(queue.depth("bob").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_overflow_rejects_new_writes() {
        let (queue, _) = queue_with(2);
        queue.enqueue("bob", rsvp("e1")).await.unwrap();
        queue.enqueue("bob", rsvp("e2")).await.unwrap();

        let overflow = queue.enqueue("bob", rsvp("e3")).await;
        assert!(matches!(overflow, Err(CoreError::QueueOverflow { capacity: 2, .. })));
        assert_eq!(queue.depth("bob").await.unwrap(), 2);

        queue.acknowledge("bob", 1).await.unwrap();
        let accepted = queue.enqueue("bob", rsvp("e3")).await.unwrap();
        assert_eq!(accepted.sequence, 3);
    }

    #[tokio::test]
    async fn test_drain_is_finite_and_restartable() {
        let (queue, _) = queue_with(1000);
        for i in 0..150 {
            queue.enqueue("bob", rsvp(&format!("e{i}"))).await.unwrap();
        }

        let mut drain = queue.drain("bob", 0);
        for _ in 0..70 {
            drain.next().await.unwrap().unwrap();
        }
        assert_eq!(drain.position(), 70);

        // Entries enqueued after the drain started are not included
        queue.enqueue("bob", rsvp("late")).await.unwrap();

        let resumed = queue.drain("bob", drain.position());
        let rest: Vec<_> = resumed.into_stream().try_collect().await.unwrap();
        assert_eq!(rest.first().map(|e| e.sequence), Some(71));
        assert_eq!(rest.last().map(|e| e.sequence), Some(151));

        let mut tail = Vec::new();
        while let Some(entry) = drain.next().await.unwrap() {
            tail.push(entry.sequence);
        }
        assert_eq!(tail.first(), Some(&71));
        assert_eq!(tail.last(), Some(&150));
    }

    #[tokio::test]
    async fn test_queue_survives_restart() {
        let (queue, store) = queue_with(100);
        for i in 0..4 {
            queue.enqueue("bob", rsvp(&format!("e{i}"))).await.unwrap();
        }
        queue.acknowledge("bob", 2).await.unwrap();
        drop(queue);

        let reopened = Arc::new(NotificationQueue::new(store, 100));
        let pending = reopened.drain("bob", 0).collect_all().await.unwrap();
        assert_eq!(pending.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(reopened.acked_through("bob").await.unwrap(), 2);

        let next = reopened.enqueue("bob", rsvp("e5")).await.unwrap();
        assert_eq!(next.sequence, 5);
    }

    #[tokio::test]
    async fn test_users_with_pending() {
        let (queue, _) = queue_with(100);
        queue.enqueue("bob", rsvp("e1")).await.unwrap();
        queue.enqueue("carol", rsvp("e1")).await.unwrap();
        queue.acknowledge("carol", 1).await.unwrap();

        assert_eq!(queue.users_with_pending(), vec!["bob".to_string()]);
    }
}
