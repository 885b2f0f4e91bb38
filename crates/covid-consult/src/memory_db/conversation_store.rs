use chrono::{DateTime, TimeZone, Utc};
use rusqlite::params;
use std::sync::Arc;
use tracing::debug;

use crate::error::StoreError;
use crate::memory_db::schema::{Role, StoredMessage};
use crate::memory_db::{require_user, write_tx, DbPool};

/// Message nodes and their SENT edges.
pub struct ConversationStore {
    pool: Arc<DbPool>,
}

impl ConversationStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    /// Append a message for `user_id`. Always creates a new node, even when
    /// text and role repeat the previous message.
    ///
    /// The timestamp is the wall clock, raised to the user's latest message
    /// timestamp if the clock went backwards.
    pub fn append_message(&self, user_id: &str, text: &str, role: Role) -> Result<StoredMessage, StoreError> {
        let stored = write_tx(&self.pool, |tx| {
            require_user(tx, user_id)?;

            let latest: Option<i64> = tx.query_row(
                "SELECT MAX(m.timestamp_us)
                 FROM messages m JOIN sent_edges s ON s.message_id = m.id
                 WHERE s.user_id = ?1",
                [user_id],
                |row| row.get(0),
            )?;
            let now = Utc::now().timestamp_micros();
            let timestamp_us = latest.map_or(now, |last| now.max(last));

            tx.execute(
                "INSERT INTO messages (text, timestamp_us) VALUES (?1, ?2)",
                params![text, timestamp_us],
            )?;
            let message_id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO sent_edges (message_id, user_id, direction) VALUES (?1, ?2, ?3)",
                params![message_id, user_id, role.direction()],
            )?;

            Ok(StoredMessage {
                text: text.to_string(),
                role,
                timestamp: micros_to_datetime(timestamp_us)?,
            })
        })?;

        debug!("Message stored for user ID {} ({})", user_id, role);
        Ok(stored)
    }

    /// Full history, oldest first; equal timestamps keep insertion order.
    /// Empty for a user without messages.
    pub fn get_history(&self, user_id: &str) -> Result<Vec<StoredMessage>, StoreError> {
        let conn = self.pool.get()?;
        require_user(&conn, user_id)?;

        let mut stmt = conn.prepare(
            "SELECT m.text, s.direction, m.timestamp_us
             FROM sent_edges s JOIN messages m ON m.id = s.message_id
             WHERE s.user_id = ?1
             ORDER BY m.timestamp_us ASC, m.id ASC",
        )?;
        let mut rows = stmt.query([user_id])?;

        let mut messages = Vec::new();
        while let Some(row) = rows.next()? {
            let direction: String = row.get(1)?;
            messages.push(StoredMessage {
                text: row.get(0)?,
                role: Role::from_direction(&direction)?,
                timestamp: micros_to_datetime(row.get(2)?)?,
            });
        }
        Ok(messages)
    }

    pub fn count_messages(&self, user_id: &str) -> Result<i64, StoreError> {
        let conn = self.pool.get()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM sent_edges WHERE user_id = ?1", [user_id], |row| row.get(0))?)
    }
}

fn micros_to_datetime(micros: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_micros(micros)
        .single()
        .ok_or_else(|| StoreError::Malformed(format!("timestamp {} out of range", micros)))
}
