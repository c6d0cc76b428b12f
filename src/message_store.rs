//! Inter-service message queue
//!
//! A small SQLite-backed mailbox for asynchronous bot/ingestor relay.
//! Messages are created by the sender, fetched in enqueue order by the
//! receiver, and deleted on acknowledgement. Old rows are reaped by age.

use crate::types::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// One queued relay message.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct QueuedMessage {
    pub id: String,
    #[serde(rename = "from")]
    pub from_service: String,
    #[serde(rename = "to")]
    pub to_service: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
    pub created_at: String,
}

/// Queue statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStats {
    pub total_pending: usize,
    pub oldest_age_seconds: Option<i64>,
}

/// Thread-safe SQLite message queue.
pub struct MessageStore {
    conn: Mutex<Connection>,
}

impl MessageStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                from_service TEXT NOT NULL,
                to_service TEXT NOT NULL,
                type TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_to_service
                ON messages(to_service, created_at);
            CREATE INDEX IF NOT EXISTS idx_messages_created_at
                ON messages(created_at);",
        )?;
        info!(?path, "message store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, used by tests and single-process setups.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE messages (
                id TEXT PRIMARY KEY,
                from_service TEXT NOT NULL,
                to_service TEXT NOT NULL,
                type TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at REAL NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Enqueue a message for delivery. Returns the stored record.
    pub fn enqueue(
        &self,
        from_service: &str,
        to_service: &str,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<QueuedMessage> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let created_at = now.timestamp_millis() as f64 / 1000.0;

        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO messages (id, from_service, to_service, type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                from_service,
                to_service,
                kind,
                payload.to_string(),
                created_at
            ],
        )?;

        info!(%id, from_service, to_service, kind, "message enqueued");
        Ok(QueuedMessage {
            id,
            from_service: from_service.to_string(),
            to_service: to_service.to_string(),
            kind: kind.to_string(),
            payload,
            created_at: now.to_rfc3339(),
        })
    }

    /// Fetch up to `limit` messages for a service in enqueue order,
    /// optionally only those created after `after_id`. Returns the items and
    /// the id to use as the next cursor.
    pub fn dequeue(
        &self,
        to_service: &str,
        after_id: Option<&str>,
        limit: usize,
    ) -> Result<(Vec<QueuedMessage>, Option<String>)> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());

        let after_timestamp: f64 = match after_id {
            Some(id) => conn
                .query_row(
                    "SELECT created_at FROM messages WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .unwrap_or(0.0),
            None => 0.0,
        };

        let mut stmt = conn.prepare(
            "SELECT id, from_service, to_service, type, payload, created_at
             FROM messages
             WHERE to_service = ?1 AND created_at > ?2
             ORDER BY created_at ASC LIMIT ?3",
        )?;
        let mapped = stmt.query_map(params![to_service, after_timestamp, limit as i64], |row| {
            let payload_raw: String = row.get(4)?;
            let created_at: f64 = row.get(5)?;
            Ok(QueuedMessage {
                id: row.get(0)?,
                from_service: row.get(1)?,
                to_service: row.get(2)?,
                kind: row.get(3)?,
                payload: serde_json::from_str(&payload_raw).unwrap_or(serde_json::Value::Null),
                created_at: DateTime::<Utc>::from_timestamp_millis((created_at * 1000.0) as i64)
                    .unwrap_or_else(Utc::now)
                    .to_rfc3339(),
            })
        })?;

        let mut items = Vec::new();
        for item in mapped {
            items.push(item?);
        }
        let next_after_id = items.last().map(|m| m.id.clone());
        debug!(
            to_service,
            count = items.len(),
            ?after_id,
            "messages dequeued"
        );
        Ok((items, next_after_id))
    }

    /// Acknowledge (delete) a processed message. Returns false when the id
    /// is unknown.
    pub fn acknowledge(&self, message_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let deleted = conn.execute("DELETE FROM messages WHERE id = ?1", params![message_id])?;
        if deleted > 0 {
            debug!(%message_id, "message acknowledged");
        } else {
            warn!(%message_id, "acknowledgement for unknown message");
        }
        Ok(deleted > 0)
    }

    /// Delete messages older than `max_age_hours`. Returns the deleted count.
    pub fn cleanup_old_messages(&self, max_age_hours: i64) -> Result<usize> {
        let cutoff = Utc::now().timestamp_millis() as f64 / 1000.0 - (max_age_hours * 3600) as f64;
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let deleted = conn.execute(
            "DELETE FROM messages WHERE created_at < ?1",
            params![cutoff],
        )?;
        if deleted > 0 {
            info!(deleted, max_age_hours, "reaped old relay messages");
        }
        Ok(deleted)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let total_pending: usize =
            conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        let oldest: Option<f64> =
            conn.query_row("SELECT MIN(created_at) FROM messages", [], |row| row.get(0))?;
        let oldest_age_seconds = oldest
            .map(|ts| Utc::now().timestamp() - ts as i64)
            .map(|age| age.max(0));
        Ok(QueueStats {
            total_pending,
            oldest_age_seconds,
        })
    }
}
