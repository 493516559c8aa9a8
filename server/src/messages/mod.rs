//! Message Store Adapter.
//!
//! Chat messages are immutable once persisted; only their per-recipient
//! delivery receipts move, and only forward (pending -> delivered -> read).
//! Storage itself is delegated to the [`Store`] collaborator.

pub mod routes;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::{CoreError, Result};
use crate::store::{run_blocking, Store};
use crate::UserId;

/// Delivery state of a message for one recipient. Ordered so that a
/// transition is valid only when the new state compares greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending = 0,
    Delivered = 1,
    Read = 2,
}

impl DeliveryState {
    pub fn as_i64(&self) -> i64 {
        *self as i64
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Pending),
            1 => Some(Self::Delivered),
            2 => Some(Self::Read),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who a message is addressed to: a single user or every participant of a
/// thread/forum.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    User(UserId),
    Thread(String),
}

impl Recipient {
    pub fn kind(&self) -> &'static str {
        match self {
            Recipient::User(_) => "user",
            Recipient::Thread(_) => "thread",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Recipient::User(id) | Recipient::Thread(id) => id,
        }
    }

    pub fn from_parts(kind: &str, id: String) -> Option<Self> {
        match kind {
            "user" => Some(Recipient::User(id)),
            "thread" => Some(Recipient::Thread(id)),
            _ => None,
        }
    }
}

/// A persisted chat message.
///
/// `delivery_state` is the lowest receipt state across all recipients, so a
/// direct message reports exactly its recipient's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub sender_id: UserId,
    pub target: Recipient,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub delivery_state: DeliveryState,
}

/// A message as submitted by the API layer, before persistence.
#[derive(Debug, Clone, Deserialize)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub target: Recipient,
    pub body: String,
}

/// Per-recipient delivery receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub message_id: String,
    pub recipient_id: UserId,
    pub state: DeliveryState,
    pub updated_at: DateTime<Utc>,
}

/// Thin async adapter over the persistence collaborator for messages,
/// receipts and thread membership.
#[derive(Clone)]
pub struct MessageStore {
    store: Arc<dyn Store>,
    max_body_length: usize,
}

impl MessageStore {
    pub fn new(store: Arc<dyn Store>, max_body_length: usize) -> Self {
        Self {
            store,
            max_body_length,
        }
    }

    /// Validate, resolve recipients and durably append a new message with a
    /// pending receipt per recipient. Nothing is fanned out if this fails.
    pub async fn persist(&self, new: NewMessage) -> Result<(Message, Vec<UserId>)> {
        let body = new.body.trim().to_string();
        if body.is_empty() {
            return Err(CoreError::InvalidRequest("message body is empty".into()));
        }
        if body.chars().count() > self.max_body_length {
            return Err(CoreError::PayloadTooLarge(format!(
                "message body exceeds {} characters",
                self.max_body_length
            )));
        }
        if new.sender_id.is_empty() || new.target.id().is_empty() {
            return Err(CoreError::InvalidRequest(
                "sender and target must be non-empty".into(),
            ));
        }

        let recipients = self.recipients_for(&new.sender_id, &new.target).await?;

        let message = Message {
            message_id: uuid::Uuid::now_v7().to_string(),
            sender_id: new.sender_id,
            target: new.target,
            body,
            created_at: Utc::now(),
            delivery_state: DeliveryState::Pending,
        };

        let to_store = message.clone();
        let to_notify = recipients.clone();
        run_blocking(&self.store, move |store| {
            store.append_message(&to_store, &to_notify)
        })
        .await?;

        tracing::debug!(
            message_id = %message.message_id,
            sender_id = %message.sender_id,
            recipients = recipients.len(),
            "Message persisted"
        );

        Ok((message, recipients))
    }

    /// Resolve the recipient set of a message: the addressed user, or every
    /// thread participant except the sender. The sender must participate in
    /// the thread.
    pub async fn recipients_for(&self, sender_id: &str, target: &Recipient) -> Result<Vec<UserId>> {
        match target {
            Recipient::User(user_id) => Ok(vec![user_id.clone()]),
            Recipient::Thread(thread_id) => {
                let participants = self.participants(thread_id).await?;
                if !participants.iter().any(|p| p == sender_id) {
                    return Err(CoreError::NotParticipant {
                        user_id: sender_id.to_string(),
                        thread_id: thread_id.clone(),
                    });
                }
                Ok(participants
                    .into_iter()
                    .filter(|p| p != sender_id)
                    .collect())
            }
        }
    }

    pub async fn mark_delivered(&self, message_id: &str, recipient_id: &str) -> Result<bool> {
        self.advance(message_id, recipient_id, DeliveryState::Delivered)
            .await
    }

    pub async fn mark_read(&self, message_id: &str, reader_id: &str) -> Result<bool> {
        self.advance(message_id, reader_id, DeliveryState::Read).await
    }

    /// Move a receipt forward. Returns `false` when the receipt was already at
    /// or past `state` (never regresses).
    async fn advance(&self, message_id: &str, recipient_id: &str, state: DeliveryState) -> Result<bool> {
        let message_id = message_id.to_string();
        let recipient_id = recipient_id.to_string();
        run_blocking(&self.store, move |store| {
            store.advance_receipt(&message_id, &recipient_id, state)
        })
        .await
    }

    pub async fn get(&self, message_id: &str) -> Result<(Message, Vec<Receipt>)> {
        let id = message_id.to_string();
        run_blocking(&self.store, move |store| {
            let message = store
                .load_message(&id)?
                .ok_or_else(|| CoreError::NotFound(format!("message {id}")))?;
            let receipts = store.receipts(&id)?;
            Ok((message, receipts))
        })
        .await
    }

    pub async fn join_thread(&self, thread_id: &str, user_id: &str) -> Result<bool> {
        let thread_id = thread_id.to_string();
        let user_id = user_id.to_string();
        run_blocking(&self.store, move |store| {
            store.add_participant(&thread_id, &user_id)
        })
        .await
    }

    pub async fn leave_thread(&self, thread_id: &str, user_id: &str) -> Result<bool> {
        let thread_id = thread_id.to_string();
        let user_id = user_id.to_string();
        run_blocking(&self.store, move |store| {
            store.remove_participant(&thread_id, &user_id)
        })
        .await
    }

    pub async fn participants(&self, thread_id: &str) -> Result<Vec<UserId>> {
        let thread_id = thread_id.to_string();
        run_blocking(&self.store, move |store| store.participants(&thread_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::SqliteStore;

    fn message_store() -> MessageStore {
        let store = SqliteStore::in_memory().unwrap();
        MessageStore::new(Arc::new(store), 16)
    }

    #[tokio::test]
    async fn test_persist_direct_message() {
        let messages = message_store();
        let (message, recipients) = messages
            .persist(NewMessage {
                sender_id: "alice".into(),
                target: Recipient::User("bob".into()),
                body: "  hi  ".into(),
            })
            .await
            .unwrap();

        assert_eq!(message.body, "hi");
        assert_eq!(recipients, vec!["bob".to_string()]);

        let (loaded, receipts) = messages.get(&message.message_id).await.unwrap();
        assert_eq!(loaded.delivery_state, DeliveryState::Pending);
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].recipient_id, "bob");
    }

    #[tokio::test]
    async fn test_rejects_empty_and_oversized_bodies() {
        let messages = message_store();
        let empty = messages
            .persist(NewMessage {
                sender_id: "alice".into(),
                target: Recipient::User("bob".into()),
                body: "   ".into(),
            })
            .await;
        assert!(matches!(empty, Err(CoreError::InvalidRequest(_))));

        let long = messages
            .persist(NewMessage {
                sender_id: "alice".into(),
                target: Recipient::User("bob".into()),
                body: "x".repeat(17),
            })
            .await;
        assert!(matches!(long, Err(CoreError::PayloadTooLarge(_))));
    }

    #[tokio::test]
    async fn test_receipts_never_regress() {
        let messages = message_store();
        let (message, _) = messages
            .persist(NewMessage {
                sender_id: "alice".into(),
                target: Recipient::User("bob".into()),
                body: "hello".into(),
            })
            .await
            .unwrap();
        let id = message.message_id.as_str();

        assert!(messages.mark_read(id, "bob").await.unwrap());
        assert!(!messages.mark_delivered(id, "bob").await.unwrap());
        assert!(!messages.mark_read(id, "bob").await.unwrap());

        let (loaded, _) = messages.get(id).await.unwrap();
        assert_eq!(loaded.delivery_state, DeliveryState::Read);
    }

    #[tokio::test]
    async fn test_thread_recipients_exclude_sender() {
        let messages = message_store();
        for user in ["alice", "bob", "carol"] {
            messages.join_thread("t1", user).await.unwrap();
        }

        let mut recipients = messages
            .recipients_for("alice", &Recipient::Thread("t1".into()))
            .await
            .unwrap();
        recipients.sort();
        assert_eq!(recipients, vec!["bob".to_string(), "carol".to_string()]);

        let outsider = messages
            .recipients_for("mallory", &Recipient::Thread("t1".into()))
            .await;
        assert!(matches!(outsider, Err(CoreError::NotParticipant { .. })));
    }

    #[tokio::test]
    async fn test_thread_state_is_lowest_receipt() {
        let messages = message_store();
        for user in ["alice", "bob", "carol"] {
            messages.join_thread("t1", user).await.unwrap();
        }
        let (message, _) = messages
            .persist(NewMessage {
                sender_id: "alice".into(),
                target: Recipient::Thread("t1".into()),
                body: "hey all".into(),
            })
            .await
            .unwrap();

        messages
            .mark_delivered(&message.message_id, "bob")
            .await
            .unwrap();
        let (loaded, _) = messages.get(&message.message_id).await.unwrap();
        assert_eq!(loaded.delivery_state, DeliveryState::Pending);

        messages
            .mark_delivered(&message.message_id, "carol")
            .await
            .unwrap();
        let (loaded, _) = messages.get(&message.message_id).await.unwrap();
        assert_eq!(loaded.delivery_state, DeliveryState::Delivered);
    }
}
