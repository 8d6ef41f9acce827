//! Goal Persistence
//!
//! Goals carry their acceptance criteria (`goal_state`), the current
//! `world_state`, the plan produced by the planning phase and the pid of the
//! supervisor process driving them.
//!
//! Status only ever moves forward: Pending -> Active -> Completed.

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

use super::{now, open_connection, GoalStore};
use crate::goap::{assertions_to_json, parse_assertions, Assertions};

/// Goal status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GoalStatus {
    /// Waiting for (or in) the planning phase
    Pending = 0,
    /// Plan saved, executing actions
    Active = 1,
    /// Goal state satisfied
    Completed = 2,
}

impl GoalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GoalStatus::Pending => "pending",
            GoalStatus::Active => "active",
            GoalStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(GoalStatus::Pending),
            "active" => Some(GoalStatus::Active),
            "completed" => Some(GoalStatus::Completed),
            _ => None,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => GoalStatus::Active,
            2 => GoalStatus::Completed,
            _ => GoalStatus::Pending,
        }
    }
}

/// A goal driven by a supervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    /// Acceptance criteria: every key must be true in `world_state`
    pub goal_state: Option<Assertions>,
    pub world_state: Option<Assertions>,
    pub plan_document: Option<String>,
    pub summary: Option<String>,
    pub status: GoalStatus,
    pub queue_name: String,
    /// 0 when no supervisor process is attached
    pub supervisor_pid: i64,
    pub supervisor_started_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Goal {
    pub fn has_plan(&self) -> bool {
        self.plan_document
            .as_deref()
            .map(|p| !p.trim().is_empty())
            .unwrap_or(false)
    }

    /// Raw JSON of the goal state for prompts
    pub fn goal_state_json(&self) -> String {
        self.goal_state
            .as_ref()
            .map(assertions_to_json)
            .unwrap_or_else(|| "{}".to_string())
    }

    /// Raw JSON of the world state for prompts
    pub fn world_state_json(&self) -> String {
        self.world_state
            .as_ref()
            .map(assertions_to_json)
            .unwrap_or_else(|| "{}".to_string())
    }
}

const GOAL_COLUMNS: &str = "id, name, description, goal_state, world_state, plan_document, summary, \
     status, queue_name, supervisor_pid, supervisor_started_at, created_at, updated_at";

/// SQLite-backed goal store
pub struct SqliteGoalStore {
    conn: Mutex<Connection>,
}

impl SqliteGoalStore {
    /// Open goal store with a specific database path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = open_connection(path.as_ref())?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory store for tests
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
            CREATE TABLE IF NOT EXISTS goals (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                goal_state TEXT DEFAULT '{}',
                world_state TEXT DEFAULT '{}',
                plan_document TEXT,
                summary TEXT,
                status INTEGER NOT NULL DEFAULT 0,
                queue_name TEXT NOT NULL,
                supervisor_pid INTEGER NOT NULL DEFAULT 0,
                supervisor_started_at INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_goals_status ON goals(status);
            "#,
        )?;
        Ok(())
    }

    fn load_goal(row: &rusqlite::Row) -> rusqlite::Result<Goal> {
        let goal_state: Option<String> = row.get(3)?;
        let world_state: Option<String> = row.get(4)?;
        let status: i64 = row.get(7)?;

        Ok(Goal {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            goal_state: goal_state.as_deref().and_then(parse_assertions),
            world_state: world_state.as_deref().and_then(parse_assertions),
            plan_document: row.get(5)?,
            summary: row.get(6)?,
            status: GoalStatus::from_i64(status),
            queue_name: row.get(8)?,
            supervisor_pid: row.get(9)?,
            supervisor_started_at: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    /// Create a goal; the queue name defaults to `goal-<id prefix>`
    pub fn create(
        &self,
        name: &str,
        description: Option<&str>,
        goal_state: &Assertions,
        queue_name: Option<&str>,
    ) -> Result<Goal> {
        let id = uuid::Uuid::new_v4().to_string();
        let queue_name = queue_name
            .map(String::from)
            .unwrap_or_else(|| format!("goal-{}", &id[..8]));
        let ts = now();

        {
            let conn = self.lock()?;
            conn.execute(
                r#"
                INSERT INTO goals (id, name, description, goal_state, world_state, status,
                                   queue_name, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, '{}', 0, ?5, ?6, ?6)
                "#,
                params![id, name, description, assertions_to_json(goal_state), queue_name, ts],
            )?;
        }

        info!("Created goal {} ({})", name, id);
        self.get(&id)?
            .ok_or_else(|| anyhow!("goal {} vanished after insert", id))
    }

    pub fn update_world_state(&self, id: &str, world_state: &Assertions) -> Result<()> {
        self.update_column(id, "world_state", &assertions_to_json(world_state))
    }

    pub fn update_plan_document(&self, id: &str, plan: &str) -> Result<()> {
        self.update_column(id, "plan_document", plan)
    }

    /// Record (or clear, with pid 0) the supervisor process for a goal
    pub fn update_supervisor(&self, id: &str, pid: i64, started_at: i64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE goals SET supervisor_pid = ?1, supervisor_started_at = ?2, updated_at = ?3 WHERE id = ?4",
            params![pid, started_at, now(), id],
        )?;
        Ok(())
    }

    pub fn list_by_status(&self, status: GoalStatus) -> Result<Vec<Goal>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM goals WHERE status = ?1 ORDER BY created_at",
            GOAL_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let goals = stmt
            .query_map(params![status as i64], Self::load_goal)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(goals)
    }

    pub fn list_all(&self) -> Result<Vec<Goal>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM goals ORDER BY created_at", GOAL_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let goals = stmt
            .query_map([], Self::load_goal)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(goals)
    }

    fn update_column(&self, id: &str, column: &str, value: &str) -> Result<()> {
        let conn = self.lock()?;
        let sql = format!("UPDATE goals SET {} = ?1, updated_at = ?2 WHERE id = ?3", column);
        let changed = conn.execute(&sql, params![value, now(), id])?;
        if changed == 0 {
            return Err(anyhow!("goal not found: {}", id));
        }
        Ok(())
    }
}

impl GoalStore for SqliteGoalStore {
    fn get(&self, id: &str) -> Result<Option<Goal>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM goals WHERE id = ?1", GOAL_COLUMNS);
        Ok(conn
            .query_row(&sql, params![id], Self::load_goal)
            .optional()?)
    }

    fn update_status(&self, id: &str, status: GoalStatus) -> Result<()> {
        let conn = self.lock()?;
        // One step forward at a time: Pending -> Active -> Completed
        let changed = conn.execute(
            "UPDATE goals SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status IN (?1, ?1 - 1)",
            params![status as i64, now(), id],
        )?;
        if changed == 0 {
            debug!("Goal {} status not moved to {}", id, status.as_str());
        }
        Ok(())
    }

    fn update_summary(&self, id: &str, summary: &str) -> Result<()> {
        self.update_column(id, "summary", summary)
    }
}
