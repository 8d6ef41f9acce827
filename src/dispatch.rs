//! Action Dispatch
//!
//! Turns a ready primitive action into queued work plus a worker process:
//! 1. validate the action and the goal's worker capacity
//! 2. enqueue the action on the goal's queue with a JSON context
//! 3. spawn a worker subagent bound to that queue
//! 4. mark the action Running and link it to its work item
//!
//! A failed spawn removes the work item again so nothing is left orphaned.

use serde::Serialize;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::roles;
use crate::store::{Action, ActionStatus, ActionStore, Goal, GoalStore, SqliteActionStore, SqliteGoalStore};
use crate::subagent::{SubagentError, SubagentManager};
use crate::work_queue::{QueueError, SharedConnection, WorkQueue, DEFAULT_MAX_ATTEMPTS};

pub const DEFAULT_MAX_WORKERS_PER_GOAL: usize = 3;

/// Longest prerequisite result copied into a work context
const MAX_RESULT_PREVIEW: usize = 4000;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Action not found: {0}")]
    ActionNotFound(String),

    #[error("Cannot dispatch compound action - decompose it first")]
    Compound,

    #[error("Action is not pending (status {})", .0.as_str())]
    NotPending(ActionStatus),

    #[error("Worker capacity reached for this goal ({0} running)")]
    AtCapacity(usize),

    #[error("Goal not found for action: {0}")]
    GoalNotFound(String),

    #[error("Failed to spawn worker: {0}")]
    Spawn(#[from] SubagentError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a successful dispatch created
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dispatched {
    pub action_id: String,
    pub subagent_id: String,
    pub work_item_id: String,
}

pub struct Dispatcher {
    goals: Arc<SqliteGoalStore>,
    actions: Arc<SqliteActionStore>,
    queue_db: SharedConnection,
    prompts_dir: PathBuf,
    worker_program: PathBuf,
    max_workers_per_goal: usize,
}

impl Dispatcher {
    pub fn new(
        goals: Arc<SqliteGoalStore>,
        actions: Arc<SqliteActionStore>,
        queue_db: SharedConnection,
        prompts_dir: &Path,
        worker_program: &Path,
    ) -> Self {
        Self {
            goals,
            actions,
            queue_db,
            prompts_dir: prompts_dir.to_path_buf(),
            worker_program: worker_program.to_path_buf(),
            max_workers_per_goal: DEFAULT_MAX_WORKERS_PER_GOAL,
        }
    }

    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers_per_goal = max.max(1);
        self
    }

    /// Dispatch one pending primitive action to a new worker
    pub fn dispatch_action(
        &self,
        subagents: &mut SubagentManager,
        action_id: &str,
    ) -> Result<Dispatched, DispatchError> {
        let action = self
            .actions
            .get(action_id)?
            .ok_or_else(|| DispatchError::ActionNotFound(action_id.to_string()))?;

        if action.is_compound {
            return Err(DispatchError::Compound);
        }
        if action.status != ActionStatus::Pending {
            return Err(DispatchError::NotPending(action.status));
        }

        let running = self.actions.count_by_status(&action.goal_id, ActionStatus::Running)?;
        if running >= self.max_workers_per_goal {
            return Err(DispatchError::AtCapacity(running));
        }

        let goal = self
            .goals
            .get(&action.goal_id)?
            .ok_or_else(|| DispatchError::GoalNotFound(action.goal_id.clone()))?;

        let context = self.work_context(&goal, &action)?;
        let queue = WorkQueue::with_connection(Arc::clone(&self.queue_db), &goal.queue_name)?;
        let work_item_id = queue.enqueue(&action.description, Some(&context), DEFAULT_MAX_ATTEMPTS)?;

        let prompt_file = match self.write_prompt_file(&action, &work_item_id) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("Failed to write prompt for action {}: {}", action.id, e);
                None
            }
        };

        let mut args = vec![
            "--worker".to_string(),
            "--queue".to_string(),
            goal.queue_name.clone(),
        ];
        if let Some(path) = &prompt_file {
            args.push("--system-prompt-file".to_string());
            args.push(path.to_string_lossy().into_owned());
        }

        let subagent_id = match subagents.spawn_with_args(&self.worker_program, &args, &action.description) {
            Ok(id) => id,
            Err(e) => {
                if let Some(path) = &prompt_file {
                    let _ = std::fs::remove_file(path);
                }
                if let Err(remove_err) = queue.remove(&work_item_id) {
                    warn!("Failed to remove work item {}: {}", work_item_id, remove_err);
                }
                return Err(DispatchError::Spawn(e));
            }
        };

        self.actions.update_status(&action.id, ActionStatus::Running, None)?;
        self.actions.update_work_item(&action.id, &work_item_id)?;

        info!(
            "Dispatched action {} as work item {} (worker {})",
            action.id, work_item_id, subagent_id
        );

        Ok(Dispatched {
            action_id: action.id,
            subagent_id,
            work_item_id,
        })
    }

    /// JSON context handed to the worker alongside the task
    pub fn work_context(&self, goal: &Goal, action: &Action) -> anyhow::Result<String> {
        let mut ctx = Map::new();
        ctx.insert(
            "goal".into(),
            json!(goal.description.as_deref().unwrap_or(&goal.name)),
        );
        ctx.insert("action".into(), json!(action.description));
        ctx.insert("role".into(), json!(role_of(action)));
        if let Some(world) = &goal.world_state {
            ctx.insert("world_state".into(), serde_json::to_value(world)?);
        }

        let prereqs = self.prerequisite_results(action)?;
        if !prereqs.is_empty() {
            ctx.insert("prerequisite_results".into(), Value::Object(prereqs));
        }

        Ok(Value::Object(ctx).to_string())
    }

    /// Results of completed actions whose effects satisfy this action's preconditions
    fn prerequisite_results(&self, action: &Action) -> anyhow::Result<Map<String, Value>> {
        let mut results = Map::new();
        let Some(preconditions) = action.preconditions.as_ref().filter(|p| !p.is_empty()) else {
            return Ok(results);
        };

        for other in self.actions.list_by_goal(&action.goal_id)? {
            if other.status != ActionStatus::Completed {
                continue;
            }
            let (Some(result), Some(effects)) = (&other.result, &other.effects) else {
                continue;
            };
            if effects.iter().any(|e| preconditions.contains(e)) {
                results.insert(other.id.clone(), json!(preview(result)));
            }
        }
        Ok(results)
    }

    fn write_prompt_file(&self, action: &Action, work_item_id: &str) -> std::io::Result<PathBuf> {
        let prompt = roles::load(&self.prompts_dir, role_of(action));
        let path = std::env::temp_dir().join(format!("goal-supervisor-prompt-{}.md", work_item_id));
        std::fs::write(&path, prompt)?;
        Ok(path)
    }
}

fn role_of(action: &Action) -> &str {
    if action.role.is_empty() {
        roles::DEFAULT_ROLE
    } else {
        &action.role
    }
}

fn preview(result: &str) -> String {
    match result.char_indices().nth(MAX_RESULT_PREVIEW) {
        Some((idx, _)) => format!("{}...[truncated]", &result[..idx]),
        None => result.to_string(),
    }
}
