//! Inter-agent Message Store
//!
//! Direct messages between agents plus broadcast channels. Channel reads
//! are tracked with a per-subscriber cursor so every subscriber sees each
//! broadcast exactly once.

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use super::{now, open_connection};

/// A direct or channel message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender: String,
    /// Set for direct messages
    pub recipient: Option<String>,
    /// Set for channel broadcasts
    pub channel: Option<String>,
    pub content: String,
    pub created_at: i64,
}

/// Unread message counts for one agent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub direct: usize,
    pub channel: usize,
}

impl PendingCounts {
    pub fn total(&self) -> usize {
        self.direct + self.channel
    }
}

/// SQLite-backed message store
pub struct SqliteMessageStore {
    conn: Mutex<Connection>,
}

impl SqliteMessageStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = open_connection(path.as_ref())?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| anyhow!("Lock error: {}", e))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                sender TEXT NOT NULL,
                recipient TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                read_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS channel_messages (
                id TEXT PRIMARY KEY,
                channel TEXT NOT NULL,
                sender TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS channel_subscriptions (
                channel TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                last_read_rowid INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (channel, agent_id)
            );

            CREATE INDEX IF NOT EXISTS idx_messages_recipient ON messages(recipient, read_at);
            CREATE INDEX IF NOT EXISTS idx_channel_messages_channel ON channel_messages(channel);
            "#,
        )?;
        Ok(())
    }

    /// Send a direct message; returns its id
    pub fn send_direct(&self, sender: &str, recipient: &str, content: &str) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO messages (id, sender, recipient, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, sender, recipient, content, now()],
        )?;
        debug!("Message {} from {} to {}", id, sender, recipient);
        Ok(id)
    }

    /// Subscribe an agent to a channel; only later broadcasts are delivered
    pub fn subscribe(&self, agent_id: &str, channel: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT OR IGNORE INTO channel_subscriptions (channel, agent_id, last_read_rowid)
            VALUES (?1, ?2, (SELECT COALESCE(MAX(rowid), 0) FROM channel_messages))
            "#,
            params![channel, agent_id],
        )?;
        Ok(())
    }

    /// Broadcast to a channel; returns the message id
    pub fn broadcast(&self, channel: &str, sender: &str, content: &str) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO channel_messages (id, channel, sender, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, channel, sender, content, now()],
        )?;
        Ok(id)
    }

    pub fn pending_counts(&self, agent_id: &str) -> Result<PendingCounts> {
        let conn = self.lock()?;
        let direct: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE recipient = ?1 AND read_at IS NULL",
            params![agent_id],
            |row| row.get(0),
        )?;
        let channel: i64 = conn.query_row(
            r#"
            SELECT COUNT(*) FROM channel_messages m
            JOIN channel_subscriptions s ON s.channel = m.channel
            WHERE s.agent_id = ?1 AND m.rowid > s.last_read_rowid AND m.sender != ?1
            "#,
            params![agent_id],
            |row| row.get(0),
        )?;
        Ok(PendingCounts {
            direct: direct as usize,
            channel: channel as usize,
        })
    }

    /// Fetch and mark read up to `limit` pending messages of each kind.
    ///
    /// Returns `(direct, channel)` in arrival order. Anything past the limit
    /// stays pending for the next fetch.
    pub fn fetch_pending(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<(Vec<Message>, Vec<Message>)> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let limit = limit as i64;

        let direct = {
            let mut stmt = tx.prepare(
                r#"
                SELECT id, sender, recipient, content, created_at FROM messages
                WHERE recipient = ?1 AND read_at IS NULL
                ORDER BY created_at, rowid
                LIMIT ?2
                "#,
            )?;
            let rows = stmt.query_map(params![agent_id, limit], |row| {
                Ok(Message {
                    id: row.get(0)?,
                    sender: row.get(1)?,
                    recipient: Some(row.get(2)?),
                    channel: None,
                    content: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?;
            rows.filter_map(|r| r.ok()).collect::<Vec<_>>()
        };

        let channel_rows = {
            let mut stmt = tx.prepare(
                r#"
                SELECT m.id, m.sender, m.channel, m.content, m.created_at, m.rowid
                FROM channel_messages m
                JOIN channel_subscriptions s ON s.channel = m.channel
                WHERE s.agent_id = ?1 AND m.rowid > s.last_read_rowid AND m.sender != ?1
                ORDER BY m.rowid
                LIMIT ?2
                "#,
            )?;
            let rows = stmt.query_map(params![agent_id, limit], |row| {
                let message = Message {
                    id: row.get(0)?,
                    sender: row.get(1)?,
                    recipient: None,
                    channel: Some(row.get(2)?),
                    content: row.get(3)?,
                    created_at: row.get(4)?,
                };
                let rowid: i64 = row.get(5)?;
                Ok((message, rowid))
            })?;
            rows.filter_map(|r| r.ok()).collect::<Vec<_>>()
        };

        let read_at = now();
        for message in &direct {
            tx.execute(
                "UPDATE messages SET read_at = ?1 WHERE id = ?2",
                params![read_at, message.id],
            )?;
        }
        for (message, rowid) in &channel_rows {
            tx.execute(
                r#"
                UPDATE channel_subscriptions SET last_read_rowid = ?1
                WHERE agent_id = ?2 AND channel = ?3 AND last_read_rowid < ?1
                "#,
                params![rowid, agent_id, message.channel],
            )?;
        }
        tx.commit()?;

        let channel = channel_rows.into_iter().map(|(m, _)| m).collect();
        Ok((direct, channel))
    }

    /// Drop everything addressed to an agent that no longer exists
    pub fn cleanup_agent(&self, agent_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM messages WHERE recipient = ?1", params![agent_id])?;
        conn.execute(
            "DELETE FROM channel_subscriptions WHERE agent_id = ?1",
            params![agent_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_messages() {
        let store = SqliteMessageStore::in_memory().unwrap();
        store.send_direct("sub-1", "parent", "done").unwrap();
        store.send_direct("sub-2", "parent", "also done").unwrap();

        assert_eq!(store.pending_counts("parent").unwrap().direct, 2);
        assert_eq!(store.pending_counts("other").unwrap().total(), 0);

        let (direct, channel) = store.fetch_pending("parent", 20).unwrap();
        assert_eq!(direct.len(), 2);
        assert!(channel.is_empty());
        assert_eq!(direct[0].content, "done");

        // Marked read
        assert_eq!(store.pending_counts("parent").unwrap().total(), 0);
    }

    #[test]
    fn test_channel_broadcast() {
        let store = SqliteMessageStore::in_memory().unwrap();
        store.broadcast("ops", "a", "before subscribing").unwrap();
        store.subscribe("b", "ops").unwrap();
        store.broadcast("ops", "a", "hello").unwrap();
        store.broadcast("ops", "b", "own message").unwrap();

        let counts = store.pending_counts("b").unwrap();
        assert_eq!(counts, PendingCounts { direct: 0, channel: 1 });

        let (_, channel) = store.fetch_pending("b", 20).unwrap();
        assert_eq!(channel.len(), 1);
        assert_eq!(channel[0].channel.as_deref(), Some("ops"));
        assert_eq!(store.pending_counts("b").unwrap().channel, 0);
    }

    #[test]
    fn test_fetch_limit_leaves_rest_pending() {
        let store = SqliteMessageStore::in_memory().unwrap();
        for i in 0..3 {
            store.send_direct("a", "b", &format!("m{}", i)).unwrap();
        }

        let (direct, _) = store.fetch_pending("b", 2).unwrap();
        assert_eq!(direct.len(), 2);
        assert_eq!(store.pending_counts("b").unwrap().direct, 1);

        let (direct, _) = store.fetch_pending("b", 2).unwrap();
        assert_eq!(direct[0].content, "m2");
    }

    #[test]
    fn test_cleanup_agent() {
        let store = SqliteMessageStore::in_memory().unwrap();
        store.send_direct("a", "gone", "hi").unwrap();
        store.cleanup_agent("gone").unwrap();
        assert_eq!(store.pending_counts("gone").unwrap().total(), 0);
    }
}
