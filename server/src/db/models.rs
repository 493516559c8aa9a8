/// Database row types.
/// These correspond 1:1 to the SQLite schema defined in migrations.rs.
/// Timestamps are RFC 3339 strings in UTC with millisecond precision.
use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{CoreError, Result};
use crate::messages::{DeliveryState, Message, Receipt, Recipient};
use crate::notifications::{NotificationEntry, NotificationPayload};

/// Message record joined with its lowest receipt state
#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: String,
    pub sender_id: String,
    pub target_kind: String,
    pub target_id: String,
    pub body: String,
    pub created_at: String,
    pub min_state: i64,
}

/// Delivery receipt record
#[derive(Debug, Clone)]
pub struct ReceiptRow {
    pub message_id: String,
    pub recipient_id: String,
    pub state: i64,
    pub updated_at: String,
}

/// Notification queue record
#[derive(Debug, Clone)]
pub struct NotificationRow {
    pub id: String,
    pub user_id: String,
    pub sequence: i64,
    pub payload: String,
    pub created_at: String,
    pub consumed: bool,
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| CoreError::PersistenceFailure(format!("bad timestamp {raw:?}: {e}")))
}

fn parse_state(raw: i64) -> Result<DeliveryState> {
    DeliveryState::from_i64(raw)
        .ok_or_else(|| CoreError::PersistenceFailure(format!("bad delivery state {raw}")))
}

impl TryFrom<MessageRow> for Message {
    type Error = CoreError;

    fn try_from(row: MessageRow) -> Result<Self> {
        let target = Recipient::from_parts(&row.target_kind, row.target_id).ok_or_else(|| {
            CoreError::PersistenceFailure(format!("bad target kind {:?}", row.target_kind))
        })?;
        Ok(Message {
            message_id: row.id,
            sender_id: row.sender_id,
            target,
            body: row.body,
            created_at: parse_timestamp(&row.created_at)?,
            delivery_state: parse_state(row.min_state)?,
        })
    }
}

impl TryFrom<ReceiptRow> for Receipt {
    type Error = CoreError;

    fn try_from(row: ReceiptRow) -> Result<Self> {
        Ok(Receipt {
            message_id: row.message_id,
            recipient_id: row.recipient_id,
            state: parse_state(row.state)?,
            updated_at: parse_timestamp(&row.updated_at)?,
        })
    }
}

impl TryFrom<NotificationRow> for NotificationEntry {
    type Error = CoreError;

    fn try_from(row: NotificationRow) -> Result<Self> {
        let payload: NotificationPayload = serde_json::from_str(&row.payload)?;
        Ok(NotificationEntry {
            notification_id: row.id,
            user_id: row.user_id,
            sequence: row.sequence as u64,
            payload,
            created_at: parse_timestamp(&row.created_at)?,
            consumed: row.consumed,
        })
    }
}
