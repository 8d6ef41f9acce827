//! Action Persistence
//!
//! Actions are the decomposed steps of a goal's plan. Primitive actions can
//! be dispatched to a work queue, at which point they carry the work item id
//! until orphan recovery or the executor settles them.

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use super::{now, open_connection, ActionStore};
use crate::goap::{parse_preconditions, preconditions_met, Assertions};

/// Action status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionStatus {
    Pending = 0,
    Running = 1,
    Completed = 2,
    Failed = 3,
    Skipped = 4,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => Self::Running,
            2 => Self::Completed,
            3 => Self::Failed,
            4 => Self::Skipped,
            _ => Self::Pending,
        }
    }
}

/// A step of a goal's plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub goal_id: String,
    pub parent_action_id: Option<String>,
    /// Set once dispatched to a work queue
    pub work_item_id: Option<String>,
    pub description: String,
    pub preconditions: Option<Vec<String>>,
    pub effects: Option<Vec<String>>,
    pub is_compound: bool,
    pub status: ActionStatus,
    pub role: String,
    pub result: Option<String>,
    pub attempt_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields for inserting an action
#[derive(Debug, Clone, Default)]
pub struct NewAction<'a> {
    pub goal_id: &'a str,
    pub parent_action_id: Option<&'a str>,
    pub description: &'a str,
    pub preconditions: &'a [String],
    pub effects: &'a [String],
    pub is_compound: bool,
    /// Defaults to "implementation"
    pub role: Option<&'a str>,
}

const ACTION_COLUMNS: &str = "id, goal_id, parent_action_id, work_item_id, description, preconditions, \
     effects, is_compound, status, role, result, attempt_count, created_at, updated_at";

/// SQLite-backed action store
pub struct SqliteActionStore {
    conn: Mutex<Connection>,
}

impl SqliteActionStore {
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
            CREATE TABLE IF NOT EXISTS actions (
                id TEXT PRIMARY KEY,
                goal_id TEXT NOT NULL,
                parent_action_id TEXT,
                work_item_id TEXT,
                description TEXT NOT NULL,
                preconditions TEXT DEFAULT '[]',
                effects TEXT DEFAULT '[]',
                is_compound INTEGER NOT NULL DEFAULT 0,
                status INTEGER NOT NULL DEFAULT 0,
                role TEXT NOT NULL DEFAULT 'implementation',
                result TEXT,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_actions_goal ON actions(goal_id);
            CREATE INDEX IF NOT EXISTS idx_actions_goal_status ON actions(goal_id, status);
            CREATE INDEX IF NOT EXISTS idx_actions_parent ON actions(parent_action_id);
            "#,
        )?;
        Ok(())
    }

    fn load_action(row: &rusqlite::Row) -> rusqlite::Result<Action> {
        let work_item_id: Option<String> = row.get(3)?;
        let preconditions: Option<String> = row.get(5)?;
        let effects: Option<String> = row.get(6)?;
        let is_compound: i64 = row.get(7)?;
        let status: i64 = row.get(8)?;

        Ok(Action {
            id: row.get(0)?,
            goal_id: row.get(1)?,
            parent_action_id: row.get(2)?,
            work_item_id: work_item_id.filter(|w| !w.is_empty()),
            description: row.get(4)?,
            preconditions: preconditions.as_deref().and_then(parse_preconditions),
            effects: effects.as_deref().and_then(parse_preconditions),
            is_compound: is_compound != 0,
            status: ActionStatus::from_i64(status),
            role: row.get(9)?,
            result: row.get(10)?,
            attempt_count: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn query(&self, filter: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Action>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM actions WHERE {} ORDER BY created_at, rowid",
            ACTION_COLUMNS, filter
        );
        let mut stmt = conn.prepare(&sql)?;
        let actions = stmt
            .query_map(params, Self::load_action)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(actions)
    }

    /// Insert an action; returns its id
    pub fn insert(&self, action: &NewAction<'_>) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let ts = now();
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO actions (id, goal_id, parent_action_id, description, preconditions,
                                 effects, is_compound, status, role, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9, ?9)
            "#,
            params![
                id,
                action.goal_id,
                action.parent_action_id,
                action.description,
                serde_json::to_string(action.preconditions)?,
                serde_json::to_string(action.effects)?,
                action.is_compound as i64,
                action.role.unwrap_or("implementation"),
                ts,
            ],
        )?;
        debug!("Inserted action {} for goal {}", id, action.goal_id);
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Result<Option<Action>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM actions WHERE id = ?1", ACTION_COLUMNS);
        Ok(conn
            .query_row(&sql, params![id], Self::load_action)
            .optional()?)
    }

    /// Pending primitive-or-compound actions whose preconditions hold
    pub fn list_ready(&self, goal_id: &str, world_state: Option<&Assertions>) -> Result<Vec<Action>> {
        let pending = self.query("goal_id = ?1 AND status = 0", params![goal_id])?;
        Ok(pending
            .into_iter()
            .filter(|a| preconditions_met(a.preconditions.as_deref(), world_state))
            .collect())
    }

    pub fn list_children(&self, parent_action_id: &str) -> Result<Vec<Action>> {
        self.query("parent_action_id = ?1", params![parent_action_id])
    }

    pub fn update_work_item(&self, id: &str, work_item_id: &str) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE actions SET work_item_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![work_item_id, now(), id],
        )?;
        if changed == 0 {
            return Err(anyhow!("action not found: {}", id));
        }
        Ok(())
    }

    pub fn count_by_status(&self, goal_id: &str, status: ActionStatus) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM actions WHERE goal_id = ?1 AND status = ?2",
            params![goal_id, status as i64],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Mark every pending action of a goal as skipped
    pub fn skip_pending(&self, goal_id: &str) -> Result<usize> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE actions SET status = 4, updated_at = ?1 WHERE goal_id = ?2 AND status = 0",
            params![now(), goal_id],
        )?;
        Ok(changed)
    }
}

impl ActionStore for SqliteActionStore {
    fn list_by_goal(&self, goal_id: &str) -> Result<Vec<Action>> {
        self.query("goal_id = ?1", params![goal_id])
    }

    fn list_running(&self, goal_id: &str) -> Result<Vec<Action>> {
        self.query("goal_id = ?1 AND status = 1", params![goal_id])
    }

    fn update_status(&self, id: &str, status: ActionStatus, result: Option<&str>) -> Result<()> {
        let conn = self.lock()?;
        // Each move into Running counts as an attempt
        let changed = conn.execute(
            r#"
            UPDATE actions SET
                status = ?1,
                result = COALESCE(?2, result),
                attempt_count = attempt_count + CASE WHEN ?1 = 1 AND status != 1 THEN 1 ELSE 0 END,
                updated_at = ?3
            WHERE id = ?4
            "#,
            params![status as i64, result, now(), id],
        )?;
        if changed == 0 {
            return Err(anyhow!("action not found: {}", id));
        }
        Ok(())
    }
}
