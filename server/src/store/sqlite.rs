//! SQLite implementation of the persistence collaborator.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::MutexGuard;

use super::{Store, StoredQueue};
use crate::db::models::{format_timestamp, MessageRow, NotificationRow, ReceiptRow};
use crate::db::{self, DbPool};
use crate::error::{CoreError, Result};
use crate::messages::{DeliveryState, Message, Receipt};
use crate::notifications::NotificationEntry;
use crate::UserId;

pub struct SqliteStore {
    db: DbPool,
}

impl SqliteStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    /// Fresh in-memory store with the schema applied.
    pub fn in_memory() -> Result<Self> {
        let db = db::init_memory_db().map_err(|e| CoreError::PersistenceFailure(e.to_string()))?;
        Ok(Self::new(db))
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| CoreError::PersistenceFailure("database lock poisoned".into()))
    }
}

impl Store for SqliteStore {
    fn append_message(&self, message: &Message, recipients: &[UserId]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let created_at = format_timestamp(&message.created_at);

        tx.execute(
            "INSERT INTO messages (id, sender_id, target_kind, target_id, body, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.message_id,
                message.sender_id,
                message.target.kind(),
                message.target.id(),
                message.body,
                created_at,
            ],
        )?;

        for recipient in recipients {
            tx.execute(
                "INSERT OR IGNORE INTO message_receipts (message_id, recipient_id, state, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    message.message_id,
                    recipient,
                    DeliveryState::Pending.as_i64(),
                    created_at,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn load_message(&self, message_id: &str) -> Result<Option<Message>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT m.id, m.sender_id, m.target_kind, m.target_id, m.body, m.created_at,
                        COALESCE(MIN(r.state), 0)
                 FROM messages m
                 LEFT JOIN message_receipts r ON r.message_id = m.id
                 WHERE m.id = ?1
                 GROUP BY m.id",
                params![message_id],
                |row| {
                    Ok(MessageRow {
                        id: row.get(0)?,
                        sender_id: row.get(1)?,
                        target_kind: row.get(2)?,
                        target_id: row.get(3)?,
                        body: row.get(4)?,
                        created_at: row.get(5)?,
                        min_state: row.get(6)?,
                    })
                },
            )
            .optional()?;

        row.map(Message::try_from).transpose()
    }

    fn receipts(&self, message_id: &str) -> Result<Vec<Receipt>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT message_id, recipient_id, state, updated_at
             FROM message_receipts
             WHERE message_id = ?1
             ORDER BY recipient_id ASC",
        )?;
        let rows = stmt
            .query_map(params![message_id], |row| {
                Ok(ReceiptRow {
                    message_id: row.get(0)?,
                    recipient_id: row.get(1)?,
                    state: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter().map(Receipt::try_from).collect()
    }

    fn advance_receipt(&self, message_id: &str, recipient_id: &str, state: DeliveryState) -> Result<bool> {
        let conn = self.conn()?;
        // The state guard in WHERE keeps receipts monotonic under races
        let changed = conn.execute(
            "UPDATE message_receipts SET state = ?3, updated_at = ?4
             WHERE message_id = ?1 AND recipient_id = ?2 AND state < ?3",
            params![
                message_id,
                recipient_id,
                state.as_i64(),
                format_timestamp(&Utc::now()),
            ],
        )?;
        Ok(changed > 0)
    }

    fn add_participant(&self, thread_id: &str, user_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO thread_participants (thread_id, user_id, joined_at)
             VALUES (?1, ?2, ?3)",
            params![thread_id, user_id, format_timestamp(&Utc::now())],
        )?;
        Ok(changed > 0)
    }

    fn remove_participant(&self, thread_id: &str, user_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "DELETE FROM thread_participants WHERE thread_id = ?1 AND user_id = ?2",
            params![thread_id, user_id],
        )?;
        Ok(changed > 0)
    }

    fn participants(&self, thread_id: &str) -> Result<Vec<UserId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT user_id FROM thread_participants WHERE thread_id = ?1 ORDER BY joined_at ASC, user_id ASC",
        )?;
        let users = stmt
            .query_map(params![thread_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(users)
    }

    fn append_notification(&self, entry: &NotificationEntry) -> Result<()> {
        let payload = serde_json::to_string(&entry.payload)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO notifications (id, user_id, sequence, payload, created_at, consumed)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
            params![
                entry.notification_id,
                entry.user_id,
                entry.sequence as i64,
                payload,
                format_timestamp(&entry.created_at),
            ],
        )?;
        tx.execute(
            "INSERT INTO notification_cursors (user_id, last_sequence) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET last_sequence = excluded.last_sequence
             WHERE excluded.last_sequence > notification_cursors.last_sequence",
            params![entry.user_id, entry.sequence as i64],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn load_queue(&self, user_id: &str) -> Result<StoredQueue> {
        let conn = self.conn()?;

        let last_sequence: i64 = conn
            .query_row(
                "SELECT last_sequence FROM notification_cursors WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);

        let mut stmt = conn.prepare(
            "SELECT id, user_id, sequence, payload, created_at, consumed
             FROM notifications
             WHERE user_id = ?1 AND consumed = 0
             ORDER BY sequence ASC",
        )?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok(NotificationRow {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    sequence: row.get(2)?,
                    payload: row.get(3)?,
                    created_at: row.get(4)?,
                    consumed: row.get::<_, i64>(5)? != 0,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let entries = rows
            .into_iter()
            .map(NotificationEntry::try_from)
            .collect::<Result<Vec<_>>>()?;

        Ok(StoredQueue {
            last_sequence: last_sequence as u64,
            entries,
        })
    }

    fn mark_consumed(&self, user_id: &str, up_to_sequence: u64) -> Result<usize> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE notifications SET consumed = 1, consumed_at = ?3
             WHERE user_id = ?1 AND sequence <= ?2 AND consumed = 0",
            params![user_id, up_to_sequence as i64, format_timestamp(&Utc::now())],
        )?;
        Ok(changed)
    }

    fn purge_consumed(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM notifications WHERE consumed = 1 AND consumed_at < ?1",
            params![format_timestamp(&before)],
        )?;
        Ok(deleted)
    }
}
