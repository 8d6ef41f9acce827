//! Durable Work Queue
//!
//! Named FIFO queues of work items persisted in a shared SQLite file:
//! - Exactly-one-claimant claims (single atomic `UPDATE ... RETURNING`)
//! - Strict FIFO by `created_at` within a queue
//! - Retry on failure until `max_attempts` is exhausted
//! - Terminal items (Completed/Failed) never move again
//!
//! One table serves every queue; several `WorkQueue` handles may share a
//! connection, and separate processes may open the same file.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default retry budget when the caller passes `max_attempts <= 0`
pub const DEFAULT_MAX_ATTEMPTS: i64 = 3;

const MAX_QUEUE_NAME_LEN: usize = 64;

const ITEM_COLUMNS: &str = "id, queue_name, task_description, context, assigned_to, status, \
     attempt_count, max_attempts, created_at, assigned_at, completed_at, result, error";

/// Work queue errors
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Invalid queue name: {0:?}")]
    InvalidName(String),

    #[error("Work item not found: {0}")]
    NotFound(String),

    #[error("Work item {0} is already {1}")]
    Terminal(String, WorkItemStatus),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Lock poisoned")]
    Lock,
}

/// Work item lifecycle state (stored as an integer)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkItemStatus {
    Pending = 0,
    Assigned = 1,
    Completed = 2,
    Failed = 3,
}

impl WorkItemStatus {
    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => Self::Assigned,
            2 => Self::Completed,
            3 => Self::Failed,
            _ => Self::Pending,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single unit of queued work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub queue_name: String,
    pub task_description: String,
    pub context: Option<String>,
    pub assigned_to: Option<String>,
    pub status: WorkItemStatus,
    pub attempt_count: i64,
    pub max_attempts: i64,
    pub created_at: i64,
    pub assigned_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl WorkItem {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let status: i64 = row.get(5)?;
        Ok(Self {
            id: row.get(0)?,
            queue_name: row.get(1)?,
            task_description: row.get(2)?,
            context: row.get(3)?,
            assigned_to: row.get(4)?,
            status: WorkItemStatus::from_i64(status),
            attempt_count: row.get(6)?,
            max_attempts: row.get(7)?,
            created_at: row.get(8)?,
            assigned_at: row.get(9)?,
            completed_at: row.get(10)?,
            result: row.get(11)?,
            error: row.get(12)?,
        })
    }
}

/// Shared handle to the queue database
pub type SharedConnection = Arc<Mutex<Connection>>;

/// Open (or create) the queue database and its schema
pub fn open_database(path: &Path) -> Result<SharedConnection, QueueError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    // Readers never block the single writer; claims stay serialized by SQLite
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    debug!("Work queue database {} (journal_mode={})", path.display(), mode);

    init_schema(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// In-memory database, mostly for tests
pub fn open_in_memory() -> Result<SharedConnection, QueueError> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

fn init_schema(conn: &Connection) -> Result<(), QueueError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS work_items (
            id TEXT PRIMARY KEY,
            queue_name TEXT NOT NULL,
            task_description TEXT NOT NULL,
            context TEXT,
            assigned_to TEXT,
            status INTEGER NOT NULL DEFAULT 0,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 3,
            created_at INTEGER NOT NULL,
            assigned_at INTEGER,
            completed_at INTEGER,
            result TEXT,
            error TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_work_items_queue_status
            ON work_items(queue_name, status);
        CREATE INDEX IF NOT EXISTS idx_work_items_assigned
            ON work_items(assigned_to, status);
        "#,
    )?;
    Ok(())
}

/// One named queue over the shared table
#[derive(Clone)]
pub struct WorkQueue {
    name: String,
    conn: SharedConnection,
}

impl WorkQueue {
    /// Open a queue backed by the database file at `path`
    pub fn open(path: &Path, name: &str) -> Result<Self, QueueError> {
        let conn = open_database(path)?;
        Self::with_connection(conn, name)
    }

    /// Attach a queue to an already opened database
    pub fn with_connection(conn: SharedConnection, name: &str) -> Result<Self, QueueError> {
        if name.is_empty() || name.len() >= MAX_QUEUE_NAME_LEN {
            return Err(QueueError::InvalidName(name.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            conn,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, QueueError> {
        self.conn.lock().map_err(|_| QueueError::Lock)
    }

    /// Add a task; returns the new item id
    pub fn enqueue(
        &self,
        task_description: &str,
        context: Option<&str>,
        max_attempts: i64,
    ) -> Result<String, QueueError> {
        let max_attempts = if max_attempts <= 0 {
            DEFAULT_MAX_ATTEMPTS
        } else {
            max_attempts
        };
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();

        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO work_items
                (id, queue_name, task_description, context, status, attempt_count, max_attempts, created_at)
            VALUES (?1, ?2, ?3, ?4, 0, 0, ?5, ?6)
            "#,
            params![id, self.name, task_description, context, max_attempts, now],
        )?;

        debug!("Enqueued {} on queue {} (max_attempts={})", id, self.name, max_attempts);
        Ok(id)
    }

    /// Claim the oldest pending item for `worker_id`.
    ///
    /// Returns `Ok(None)` when nothing is pending. Callers poll on an
    /// interval. The select and the update are one statement, so two
    /// claimants can never win the same row.
    pub fn claim(&self, worker_id: &str) -> Result<Option<WorkItem>, QueueError> {
        let now = Utc::now().timestamp();
        let sql = format!(
            r#"
            UPDATE work_items SET
                assigned_to = ?1,
                status = 1,
                attempt_count = attempt_count + 1,
                assigned_at = ?2
            WHERE id = (
                SELECT id FROM work_items
                WHERE queue_name = ?3 AND status = 0
                ORDER BY created_at ASC, rowid ASC
                LIMIT 1
            ) AND status = 0
            RETURNING {}
            "#,
            ITEM_COLUMNS
        );

        let conn = self.lock()?;
        let item = conn
            .query_row(&sql, params![worker_id, now, self.name], WorkItem::from_row)
            .optional()?;

        if let Some(ref item) = item {
            info!(
                "Worker {} claimed {} from {} (attempt {}/{})",
                worker_id, item.id, self.name, item.attempt_count, item.max_attempts
            );
        }
        Ok(item)
    }

    /// Mark an item completed with its result
    pub fn complete(&self, id: &str, result: &str) -> Result<(), QueueError> {
        let now = Utc::now().timestamp();
        let conn = self.lock()?;
        let changed = conn.execute(
            r#"
            UPDATE work_items SET status = 2, completed_at = ?1, result = ?2
            WHERE id = ?3 AND queue_name = ?4 AND status IN (0, 1)
            "#,
            params![now, result, id, self.name],
        )?;

        if changed == 0 {
            return Err(self.explain_miss(&conn, id));
        }
        info!("Completed {} on {}", id, self.name);
        Ok(())
    }

    /// Record a failure.
    ///
    /// The item goes back to Pending while `attempt_count < max_attempts`,
    /// otherwise it is Failed for good. Returns the resulting status.
    pub fn fail(&self, id: &str, error: &str) -> Result<WorkItemStatus, QueueError> {
        let now = Utc::now().timestamp();
        let conn = self.lock()?;
        let status: Option<i64> = conn
            .query_row(
                r#"
                UPDATE work_items SET
                    status = CASE WHEN attempt_count < max_attempts THEN 0 ELSE 3 END,
                    completed_at = CASE WHEN attempt_count < max_attempts THEN NULL ELSE ?1 END,
                    assigned_to = NULL,
                    error = ?2
                WHERE id = ?3 AND queue_name = ?4 AND status IN (0, 1)
                RETURNING status
                "#,
                params![now, error, id, self.name],
                |row| row.get(0),
            )
            .optional()?;

        match status.map(WorkItemStatus::from_i64) {
            Some(WorkItemStatus::Pending) => {
                warn!("Work item {} failed, requeued: {}", id, error);
                Ok(WorkItemStatus::Pending)
            }
            Some(status) => {
                warn!("Work item {} failed permanently: {}", id, error);
                Ok(status)
            }
            None => Err(self.explain_miss(&conn, id)),
        }
    }

    /// Number of pending items on this queue
    pub fn pending_count(&self) -> Result<usize, QueueError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM work_items WHERE queue_name = ?1 AND status = 0",
            params![self.name],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Delete an item regardless of status
    pub fn remove(&self, id: &str) -> Result<(), QueueError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "DELETE FROM work_items WHERE id = ?1 AND queue_name = ?2",
            params![id, self.name],
        )?;
        if changed == 0 {
            return Err(QueueError::NotFound(id.to_string()));
        }
        debug!("Removed {} from {}", id, self.name);
        Ok(())
    }

    /// Point lookup by id, any status
    pub fn get_item(&self, id: &str) -> Result<Option<WorkItem>, QueueError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM work_items WHERE id = ?1 AND queue_name = ?2",
            ITEM_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![id, self.name], WorkItem::from_row)
            .optional()?)
    }

    /// Why an update touched no row: unknown id or already terminal
    fn explain_miss(&self, conn: &Connection, id: &str) -> QueueError {
        let status: Option<i64> = conn
            .query_row(
                "SELECT status FROM work_items WHERE id = ?1 AND queue_name = ?2",
                params![id, self.name],
                |row| row.get(0),
            )
            .optional()
            .unwrap_or(None);

        match status {
            Some(s) => QueueError::Terminal(id.to_string(), WorkItemStatus::from_i64(s)),
            None => QueueError::NotFound(id.to_string()),
        }
    }
}
