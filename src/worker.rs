//! Queue Workers
//!
//! A worker process drains one work queue: claim an item, run it, record
//! the outcome, repeat until the queue is empty. Failed items go back to
//! the queue until their attempt budget is spent.
//!
//! `WorkerHandle` is the parent-side view of a standalone worker process.

use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::session::{self, SessionError};
use crate::subagent::{process, ApprovalClient, SubagentError};
use crate::work_queue::{QueueError, WorkItem, WorkItemStatus, WorkQueue};

/// Result recorded when a task succeeds without output
const DEFAULT_RESULT: &str = "Task completed successfully";

/// Worker errors
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Worker timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task processing failed with code {code}: {detail}")]
    Failed { code: i32, detail: String },

    #[error("Task denied: {0}")]
    Denied(String),

    #[error("Approval failed: {0}")]
    Approval(#[from] SubagentError),

    #[error("Worker interrupted")]
    Interrupted,

    #[error("Queue name is empty")]
    EmptyQueueName,

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SessionError> for WorkerError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Timeout(d) => Self::Timeout(d),
            SessionError::Spawn(e) => Self::SpawnFailed(e.to_string()),
            SessionError::EmptyCommand => Self::SpawnFailed("worker command is empty".to_string()),
            SessionError::Io(e) => Self::Io(e),
        }
    }
}

/// How a claimed task gets done
#[async_trait]
pub trait TaskRunner: Send {
    /// Run one task message, returning the result text
    async fn run(&mut self, message: &str) -> Result<String, WorkerError>;
}

/// Worker command configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub program: String,
    pub args: Vec<String>,
    pub system_prompt: Option<String>,
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

impl WorkerConfig {
    /// `command` is split on whitespace: program first, then arguments
    pub fn from_command(command: &str, timeout: Duration) -> Result<Self, WorkerError> {
        let mut parts = command.split_whitespace().map(String::from);
        let program = parts
            .next()
            .ok_or_else(|| WorkerError::SpawnFailed("worker command is empty".to_string()))?;

        Ok(Self {
            program,
            args: parts.collect(),
            system_prompt: None,
            timeout,
            max_output_bytes: 10 * 1024 * 1024, // 10MB
        })
    }

    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt.filter(|p| !p.trim().is_empty());
        self
    }
}

/// Runs each task through an external command, optionally asking the
/// parent for approval first
pub struct CommandRunner {
    config: WorkerConfig,
    approval: Option<ApprovalClient>,
}

impl CommandRunner {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            approval: None,
        }
    }

    pub fn with_approval(mut self, client: Option<ApprovalClient>) -> Self {
        self.approval = client;
        self
    }

    fn input_for(&self, message: &str) -> String {
        match &self.config.system_prompt {
            Some(prompt) => format!("{}\n\n{}", prompt, message),
            None => message.to_string(),
        }
    }
}

#[async_trait]
impl TaskRunner for CommandRunner {
    async fn run(&mut self, message: &str) -> Result<String, WorkerError> {
        if let Some(client) = self.approval.as_mut() {
            let decision = client
                .request(
                    "run_task",
                    json!({ "command": self.config.program, "task": message }),
                )
                .await?;
            if !decision.approved {
                let reason = decision.reason.unwrap_or_else(|| "no reason given".to_string());
                return Err(WorkerError::Denied(reason));
            }
        }

        let input = self.input_for(message);
        let out = session::run_command(
            &self.config.program,
            &self.config.args,
            &input,
            self.config.timeout,
            self.config.max_output_bytes,
        )
        .await?;

        if out.code == 0 {
            Ok(out.stdout)
        } else {
            let detail = if out.stderr.trim().is_empty() {
                "no output".to_string()
            } else {
                out.stderr.trim().to_string()
            };
            Err(WorkerError::Failed {
                code: out.code,
                detail,
            })
        }
    }
}

/// Counts from one worker run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub processed: usize,
    pub failed: usize,
}

/// Claims and runs items from one queue until it is empty
pub struct WorkerLoop<R: TaskRunner> {
    queue: WorkQueue,
    runner: R,
    worker_id: String,
    cancel: CancellationToken,
}

impl<R: TaskRunner> WorkerLoop<R> {
    pub fn new(queue: WorkQueue, runner: R) -> Self {
        Self {
            queue,
            runner,
            worker_id: format!("worker-{}", Uuid::new_v4()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub async fn run(&mut self) -> Result<WorkerSummary, WorkerError> {
        let mut summary = WorkerSummary::default();
        info!("Worker {} started on queue {}", self.worker_id, self.queue.name());

        while !self.cancel.is_cancelled() {
            let Some(item) = self.queue.claim(&self.worker_id)? else {
                break;
            };
            debug!("Worker claimed item {}: {}", item.id, item.task_description);

            let message = task_message(&item);
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => Err(WorkerError::Interrupted),
                result = self.runner.run(&message) => result,
            };

            match outcome {
                Ok(output) => {
                    let output = output.trim();
                    let result = if output.is_empty() { DEFAULT_RESULT } else { output };
                    self.queue.complete(&item.id, result)?;
                    summary.processed += 1;
                    debug!("Worker completed item {}", item.id);
                }
                Err(e) => {
                    let status = self.queue.fail(&item.id, &e.to_string())?;
                    summary.failed += 1;
                    if status == WorkItemStatus::Failed {
                        warn!("Item {} failed permanently: {}", item.id, e);
                    } else {
                        warn!("Item {} failed, will retry: {}", item.id, e);
                    }
                }
            }
        }

        info!(
            "Worker {} shutting down: {} items processed, {} errors",
            self.worker_id, summary.processed, summary.failed
        );
        Ok(summary)
    }
}

/// Message a worker runs for an item: the context first, when there is one
pub fn task_message(item: &WorkItem) -> String {
    match item.context.as_deref().filter(|c| !c.is_empty()) {
        Some(context) => format!("Context: {}\n\nTask: {}", context, item.task_description),
        None => item.task_description.clone(),
    }
}

/// A worker process started outside the subagent pool
pub struct WorkerHandle {
    pub agent_id: String,
    pub queue_name: String,
    pub pid: u32,
    child: Child,
    prompt_file: Option<PathBuf>,
    running: bool,
}

impl WorkerHandle {
    /// Start `program --worker --queue Q [--system-prompt-file F]` in its own process group
    pub fn spawn(program: &Path, queue_name: &str, system_prompt: Option<&str>) -> Result<Self, WorkerError> {
        if queue_name.is_empty() {
            return Err(WorkerError::EmptyQueueName);
        }

        let agent_id = format!("worker-{}", Uuid::new_v4());
        let prompt_file = match system_prompt.filter(|p| !p.is_empty()) {
            Some(prompt) => {
                let path = std::env::temp_dir().join(format!("goal-supervisor-prompt-{}.md", agent_id));
                std::fs::write(&path, prompt)?;
                Some(path)
            }
            None => None,
        };

        let mut cmd = Command::new(program);
        cmd.arg("--worker").arg("--queue").arg(queue_name);
        if let Some(path) = &prompt_file {
            cmd.arg("--system-prompt-file").arg(path);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                if let Some(path) = &prompt_file {
                    let _ = std::fs::remove_file(path);
                }
                return Err(WorkerError::SpawnFailed(e.to_string()));
            }
        };
        let pid = child.id().unwrap_or(0);
        info!("Spawned worker {} (pid {}) on queue {}", agent_id, pid, queue_name);

        Ok(Self {
            agent_id,
            queue_name: queue_name.to_string(),
            pid,
            child,
            prompt_file,
            running: true,
        })
    }

    pub fn is_running(&mut self) -> bool {
        if !self.running {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) | Err(_) => {
                self.running = false;
                false
            }
        }
    }

    /// SIGTERM, a short grace period, then SIGKILL
    pub async fn stop(&mut self) -> Result<(), WorkerError> {
        if !self.is_running() {
            return Ok(());
        }
        let status = process::terminate_group(&mut self.child, self.pid).await?;
        self.running = false;
        debug!("Worker {} stopped: {:?}", self.agent_id, process::classify_exit(status));
        Ok(())
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Some(path) = self.prompt_file.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}
