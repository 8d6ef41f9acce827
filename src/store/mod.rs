//! Goal, Action and Message Stores
//!
//! The supervisor only depends on the narrow traits below; the SQLite
//! implementations are what the binary wires in. Records are always read
//! fresh from the database, never cached, since other supervisors and
//! workers mutate the same files.

pub mod actions;
pub mod goals;
pub mod messages;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

pub use actions::{Action, ActionStatus, NewAction, SqliteActionStore};
pub use goals::{Goal, GoalStatus, SqliteGoalStore};
pub use messages::{Message, PendingCounts, SqliteMessageStore};

/// Goal persistence used by the supervisor
pub trait GoalStore: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<Goal>>;
    fn update_status(&self, id: &str, status: GoalStatus) -> Result<()>;
    fn update_summary(&self, id: &str, summary: &str) -> Result<()>;
}

/// Action persistence used by the supervisor and orphan recovery
pub trait ActionStore: Send + Sync {
    fn list_by_goal(&self, goal_id: &str) -> Result<Vec<Action>>;
    fn list_running(&self, goal_id: &str) -> Result<Vec<Action>>;
    fn update_status(&self, id: &str, status: ActionStatus, result: Option<&str>) -> Result<()>;
}

/// Open a SQLite file, creating parent directories as needed
pub(crate) fn open_connection(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }

    let conn = Connection::open(path).with_context(|| format!("opening {}", path.display()))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
