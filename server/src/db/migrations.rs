use rusqlite_migration::{Migrations, M};

/// Define all schema migrations.
/// Uses SQLite user_version pragma for tracking, no migration table needed.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            "-- Migration 1: Messages, receipts, thread membership

CREATE TABLE messages (
    id TEXT PRIMARY KEY,
    sender_id TEXT NOT NULL,
    target_kind TEXT NOT NULL,
    target_id TEXT NOT NULL,
    body TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX idx_messages_target ON messages(target_kind, target_id, created_at);

CREATE TABLE message_receipts (
    message_id TEXT NOT NULL,
    recipient_id TEXT NOT NULL,
    state INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (message_id, recipient_id),
    FOREIGN KEY (message_id) REFERENCES messages(id)
);

CREATE INDEX idx_receipts_recipient ON message_receipts(recipient_id, state);

CREATE TABLE thread_participants (
    thread_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    joined_at TEXT NOT NULL,
    PRIMARY KEY (thread_id, user_id)
);
",
        ),
        M::up(
            "-- Migration 2: Per-user notification queues

CREATE TABLE notifications (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    consumed INTEGER NOT NULL DEFAULT 0,
    consumed_at TEXT,
    UNIQUE (user_id, sequence)
);

CREATE INDEX idx_notifications_pending ON notifications(user_id, consumed, sequence);

-- Survives retention purges so sequences are never reissued
CREATE TABLE notification_cursors (
    user_id TEXT PRIMARY KEY,
    last_sequence INTEGER NOT NULL
);
",
        ),
    ])
}
