//! Subagent Manager
//!
//! Owns a bounded pool of child processes running delegated tasks:
//! - each child runs in its own process group so timeouts leave no survivors
//! - stdout and stderr land in one capped buffer, filled by a reader task
//! - every child gets an approval socket; requests fan in to one channel
//! - terminal transitions are reported to the parent agent as messages
//!
//! The manager is polled. Nothing here blocks on a child except the bounded
//! waits of a final drain or an explicit `get_status(.., wait = true)`.

pub mod approval;
pub mod process;

pub use approval::{
    AllowAllGate, ApprovalClient, ApprovalDecision, ApprovalEvent, ApprovalRequest, DenyAllGate,
    PolicyGate, APPROVAL_FD_ENV, CHILD_APPROVAL_FD, PARENT_ID_ENV,
};
pub use process::{OutputBuffer, GRACE_PERIOD, MAX_OUTPUT_BYTES};

use parking_lot::Mutex;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::unix::OwnedWriteHalf;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::SqliteMessageStore;
use process::SharedOutput;

pub const DEFAULT_MAX_SUBAGENTS: usize = 5;
pub const MAX_SUBAGENTS_HARD_CAP: usize = 20;
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
pub const MAX_TIMEOUT_SECS: u64 = 3600;

/// Interval between checks while waiting on a single subagent
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

const TIMEOUT_ERROR: &str = "Subagent execution timed out";

#[derive(Debug, Error)]
pub enum SubagentError {
    #[error("Maximum number of concurrent subagents ({0}) reached")]
    PoolFull(usize),

    #[error("Subagents cannot spawn additional subagents")]
    NestedSpawn,

    #[error("Task description is required")]
    EmptyTask,

    #[error("Subagent not found: {0}")]
    NotFound(String),

    #[error("Approval channel closed")]
    ApprovalChannelClosed,

    #[error("Failed to spawn subagent: {0}")]
    Spawn(std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubagentStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl SubagentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }
}

impl std::fmt::Display for SubagentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pool limits
#[derive(Debug, Clone)]
pub struct SubagentConfig {
    pub max_subagents: usize,
    pub timeout: Duration,
    /// Executable launched by `spawn`
    pub program: PathBuf,
    /// Set when this process is itself a subagent
    pub is_subagent_process: bool,
}

impl SubagentConfig {
    /// Clamp limits into their safe ranges; zero means default
    pub fn new(max_subagents: usize, timeout_secs: u64) -> Self {
        let max_subagents = match max_subagents {
            0 => DEFAULT_MAX_SUBAGENTS,
            n => n.min(MAX_SUBAGENTS_HARD_CAP),
        };
        let timeout_secs = match timeout_secs {
            0 => DEFAULT_TIMEOUT_SECS,
            n => n.min(MAX_TIMEOUT_SECS),
        };

        Self {
            max_subagents,
            timeout: Duration::from_secs(timeout_secs),
            program: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("goal-supervisor")),
            is_subagent_process: std::env::var_os(PARENT_ID_ENV).is_some(),
        }
    }
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SUBAGENTS, DEFAULT_TIMEOUT_SECS)
    }
}

/// One child process and what it has produced so far
pub struct Subagent {
    pub id: String,
    pub status: SubagentStatus,
    pub pid: u32,
    pub task: String,
    pub context: Option<String>,
    pub started_at: Instant,
    pub result: Option<String>,
    pub error: Option<String>,
    child: Child,
    output: SharedOutput,
    reader: JoinHandle<()>,
    approval_writer: Option<OwnedWriteHalf>,
    approval_reader: JoinHandle<()>,
}

impl Subagent {
    /// Output captured so far
    pub fn output(&self) -> String {
        self.output.lock().text()
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn report(&self) -> StatusReport {
        StatusReport {
            id: self.id.clone(),
            status: self.status,
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }

    /// Check one running child. Returns true if it reached a terminal state.
    async fn check(&mut self, timeout: Duration) -> bool {
        if self.status != SubagentStatus::Running {
            return false;
        }

        // Inclusive: the first poll at or past the deadline times the child out
        if self.started_at.elapsed() >= timeout {
            if let Err(e) = process::kill_group(&mut self.child, self.pid).await {
                warn!("Failed to kill timed out subagent {}: {}", self.id, e);
            }
            process::drain_output(&mut self.reader).await;
            self.status = SubagentStatus::Timeout;
            self.error = Some(TIMEOUT_ERROR.to_string());
            self.close_approval();
            warn!("Subagent {} timed out after {:?}", self.id, timeout);
            return true;
        }

        match self.child.try_wait() {
            Ok(None) => false,
            Ok(Some(exit)) => {
                // Stragglers in the group would hold the pipe open
                let _ = process::signal_group(self.pid, libc::SIGKILL);
                process::drain_output(&mut self.reader).await;
                match process::classify_exit(exit) {
                    Ok(()) => {
                        self.status = SubagentStatus::Completed;
                        self.result = Some(self.output());
                        info!("Subagent {} completed", self.id);
                    }
                    Err(reason) => {
                        self.status = SubagentStatus::Failed;
                        info!("Subagent {} failed: {}", self.id, reason);
                        self.error = Some(reason);
                    }
                }
                self.close_approval();
                true
            }
            Err(e) => {
                self.status = SubagentStatus::Failed;
                self.error = Some(format!("Failed to check subagent status: {}", e));
                self.close_approval();
                true
            }
        }
    }

    fn close_approval(&mut self) {
        self.approval_writer = None;
        self.approval_reader.abort();
    }
}

/// Point-in-time view of a subagent
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub id: String,
    pub status: SubagentStatus,
    pub result: Option<String>,
    pub error: Option<String>,
}

/// Where terminal transitions are reported
struct ParentLink {
    store: Arc<SqliteMessageStore>,
    agent_id: String,
}

pub struct SubagentManager {
    config: SubagentConfig,
    subagents: Vec<Subagent>,
    gate: Arc<dyn PolicyGate>,
    parent: Option<ParentLink>,
    approval_tx: mpsc::UnboundedSender<ApprovalEvent>,
    approval_rx: mpsc::UnboundedReceiver<ApprovalEvent>,
}

impl SubagentManager {
    pub fn new(config: SubagentConfig, gate: Arc<dyn PolicyGate>) -> Self {
        let (approval_tx, approval_rx) = mpsc::unbounded_channel();
        Self {
            config,
            subagents: Vec::new(),
            gate,
            parent: None,
            approval_tx,
            approval_rx,
        }
    }

    /// Report completions to `agent_id` through the message store
    pub fn with_parent(mut self, store: Arc<SqliteMessageStore>, agent_id: &str) -> Self {
        self.parent = Some(ParentLink {
            store,
            agent_id: agent_id.to_string(),
        });
        self
    }

    pub fn config(&self) -> &SubagentConfig {
        &self.config
    }

    /// Spawn this executable in subagent mode for a task
    pub fn spawn(&mut self, task: &str, context: Option<&str>) -> Result<String, SubagentError> {
        let mut args = vec![
            "--subagent".to_string(),
            "--task".to_string(),
            task.to_string(),
        ];
        let context = context.filter(|c| !c.is_empty());
        if let Some(context) = context {
            args.push("--context".to_string());
            args.push(context.to_string());
        }

        let program = self.config.program.clone();
        self.launch(&program, &args, task, context)
    }

    /// Spawn an arbitrary program under the same supervision; `task` is
    /// recorded as its description.
    pub fn spawn_with_args(
        &mut self,
        program: &Path,
        args: &[String],
        task: &str,
    ) -> Result<String, SubagentError> {
        self.launch(program, args, task, None)
    }

    fn launch(
        &mut self,
        program: &Path,
        args: &[String],
        task: &str,
        context: Option<&str>,
    ) -> Result<String, SubagentError> {
        if self.config.is_subagent_process {
            return Err(SubagentError::NestedSpawn);
        }
        if task.trim().is_empty() {
            return Err(SubagentError::EmptyTask);
        }
        if self.subagents.len() >= self.config.max_subagents {
            return Err(SubagentError::PoolFull(self.config.max_subagents));
        }

        let id = generate_id();

        let (output_parent, output_child) =
            std::os::unix::net::UnixStream::pair().map_err(SubagentError::Spawn)?;
        let stderr_child = output_child.try_clone().map_err(SubagentError::Spawn)?;
        let (approval_parent, approval_child) =
            std::os::unix::net::UnixStream::pair().map_err(SubagentError::Spawn)?;
        let approval_child_fd = approval_child.as_raw_fd();

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(OwnedFd::from(output_child)))
            .stderr(Stdio::from(OwnedFd::from(stderr_child)))
            .env(APPROVAL_FD_ENV, CHILD_APPROVAL_FD.to_string())
            .process_group(0);
        if let Some(parent) = &self.parent {
            cmd.env(PARENT_ID_ENV, &parent.agent_id);
        }

        // SAFETY: only async-signal-safe calls (dup2, fcntl) run between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                if approval_child_fd == CHILD_APPROVAL_FD {
                    if libc::fcntl(CHILD_APPROVAL_FD, libc::F_SETFD, 0) == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                } else if libc::dup2(approval_child_fd, CHILD_APPROVAL_FD) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(SubagentError::Spawn)?;
        // The child holds its own copies now
        drop(cmd);
        drop(approval_child);

        let pid = child.id().unwrap_or(0);

        output_parent.set_nonblocking(true)?;
        let output_stream = tokio::net::UnixStream::from_std(output_parent)?;
        let output: SharedOutput = Arc::new(Mutex::new(OutputBuffer::with_cap(MAX_OUTPUT_BYTES)));
        let reader = process::spawn_output_reader(output_stream, Arc::clone(&output));

        approval_parent.set_nonblocking(true)?;
        let approval_stream = tokio::net::UnixStream::from_std(approval_parent)?;
        let (approval_read, approval_writer) = approval_stream.into_split();
        let approval_reader = tokio::spawn(approval::forward_requests(
            id.clone(),
            approval_read,
            self.approval_tx.clone(),
        ));

        info!("Spawned subagent {} (pid {}): {}", id, pid, truncate(task, 80));

        self.subagents.push(Subagent {
            id: id.clone(),
            status: SubagentStatus::Running,
            pid,
            task: task.to_string(),
            context: context.map(String::from),
            started_at: Instant::now(),
            result: None,
            error: None,
            child,
            output,
            reader,
            approval_writer: Some(approval_writer),
            approval_reader,
        });

        Ok(id)
    }

    /// Check every running subagent once. Returns how many changed state.
    pub async fn poll_all(&mut self) -> usize {
        let timeout = self.config.timeout;
        let mut changed = 0;
        for idx in 0..self.subagents.len() {
            if self.subagents[idx].check(timeout).await {
                self.notify_parent(&self.subagents[idx]);
                changed += 1;
            }
        }
        if changed > 0 {
            debug!("{} subagent state changes", changed);
        }
        changed
    }

    /// Current status of one subagent, optionally waiting for it to finish.
    ///
    /// While waiting, approval requests from any subagent keep being served.
    pub async fn get_status(&mut self, id: &str, wait: bool) -> Result<StatusReport, SubagentError> {
        let idx = self
            .position(id)
            .ok_or_else(|| SubagentError::NotFound(id.to_string()))?;
        let timeout = self.config.timeout;

        loop {
            if self.subagents[idx].check(timeout).await {
                self.notify_parent(&self.subagents[idx]);
            }
            if !wait || self.subagents[idx].status.is_terminal() {
                return Ok(self.subagents[idx].report());
            }

            tokio::select! {
                Some(event) = self.approval_rx.recv() => {
                    self.handle_approval(event).await;
                }
                _ = tokio::time::sleep(WAIT_POLL_INTERVAL) => {}
            }
        }
    }

    pub fn find(&self, id: &str) -> Option<&Subagent> {
        self.subagents.iter().find(|s| s.id == id)
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.subagents.iter().position(|s| s.id == id)
    }

    pub fn list(&self) -> impl Iterator<Item = &Subagent> {
        self.subagents.iter()
    }

    pub fn len(&self) -> usize {
        self.subagents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subagents.is_empty()
    }

    pub fn running_count(&self) -> usize {
        self.subagents
            .iter()
            .filter(|s| s.status == SubagentStatus::Running)
            .count()
    }

    /// Drop finished entries, freeing their pool slots. Returns how many.
    pub fn remove_finished(&mut self) -> usize {
        let before = self.subagents.len();
        self.subagents.retain(|s| !s.status.is_terminal());
        before - self.subagents.len()
    }

    /// Next approval request from any subagent
    pub async fn next_approval(&mut self) -> Option<ApprovalEvent> {
        self.approval_rx.recv().await
    }

    /// An already-queued approval request, without waiting
    pub fn try_next_approval(&mut self) -> Option<ApprovalEvent> {
        self.approval_rx.try_recv().ok()
    }

    /// Answer one approval request through the policy gate.
    ///
    /// Requests from subagents that are no longer running are dropped.
    pub async fn handle_approval(&mut self, event: ApprovalEvent) {
        let Some(idx) = self.position(&event.subagent_id) else {
            debug!("Approval request from unknown subagent {}", event.subagent_id);
            return;
        };
        if self.subagents[idx].status != SubagentStatus::Running {
            debug!(
                "Dropping approval request from {} subagent {}",
                self.subagents[idx].status, event.subagent_id
            );
            return;
        }

        let decision = self.gate.evaluate(&event.subagent_id, &event.request).await;
        info!(
            "Approval for {} tool {}: {}",
            event.subagent_id,
            event.request.tool,
            if decision.approved { "approved" } else { "denied" }
        );

        let sub = &mut self.subagents[idx];
        if let Some(writer) = sub.approval_writer.as_mut() {
            if let Err(e) = approval::send_decision(writer, &decision).await {
                warn!("Failed to answer approval request from {}: {}", sub.id, e);
            }
        }
    }

    /// Stop every running child (SIGTERM, grace, SIGKILL) and free the pool
    pub async fn shutdown(&mut self) {
        for sub in self.subagents.iter_mut() {
            if sub.status == SubagentStatus::Running {
                if let Err(e) = process::terminate_group(&mut sub.child, sub.pid).await {
                    warn!("Failed to stop subagent {}: {}", sub.id, e);
                }
                sub.status = SubagentStatus::Failed;
                sub.error = Some("Stopped by parent".to_string());
            }
            sub.reader.abort();
            sub.close_approval();
        }
        let count = self.subagents.len();
        self.subagents.clear();
        if count > 0 {
            info!("Subagent manager shut down ({} entries)", count);
        }
    }

    fn notify_parent(&self, sub: &Subagent) {
        let Some(parent) = &self.parent else {
            return;
        };

        let mut msg = serde_json::json!({
            "type": "subagent_completion",
            "subagent_id": sub.id,
            "status": sub.status.as_str(),
            "task": sub.task,
            "elapsed_seconds": sub.elapsed().as_secs(),
        });
        if let Some(result) = &sub.result {
            msg["result"] = serde_json::Value::String(result.clone());
        }
        if let Some(error) = &sub.error {
            msg["error"] = serde_json::Value::String(error.clone());
        }

        match parent
            .store
            .send_direct(&sub.id, &parent.agent_id, &msg.to_string())
        {
            Ok(msg_id) => debug!("Sent completion {} for {} to {}", msg_id, sub.id, parent.agent_id),
            Err(e) => warn!("Failed to notify {} about {}: {}", parent.agent_id, sub.id, e),
        }
    }
}

impl Drop for SubagentManager {
    fn drop(&mut self) {
        for sub in &self.subagents {
            if sub.status == SubagentStatus::Running {
                let _ = process::signal_group(sub.pid, libc::SIGKILL);
            }
            sub.reader.abort();
            sub.approval_reader.abort();
        }
    }
}

/// 16 hex characters
fn generate_id() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_clamps() {
        let config = SubagentConfig::new(0, 0);
        assert_eq!(config.max_subagents, DEFAULT_MAX_SUBAGENTS);
        assert_eq!(config.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));

        let config = SubagentConfig::new(100, 100_000);
        assert_eq!(config.max_subagents, MAX_SUBAGENTS_HARD_CAP);
        assert_eq!(config.timeout, Duration::from_secs(MAX_TIMEOUT_SECS));
    }

    #[test]
    fn test_generate_id() {
        let id = generate_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_id());
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(SubagentStatus::Timeout.to_string(), "timeout");
        assert!(SubagentStatus::Failed.is_terminal());
        assert!(!SubagentStatus::Running.is_terminal());
    }

    #[tokio::test]
    async fn test_nested_spawn_refused() {
        let config = SubagentConfig {
            is_subagent_process: true,
            ..SubagentConfig::default()
        };
        let mut manager = SubagentManager::new(config, Arc::new(DenyAllGate));
        let err = manager.spawn("anything", None).unwrap_err();
        assert!(matches!(err, SubagentError::NestedSpawn));
    }

    #[tokio::test]
    async fn test_empty_task_refused() {
        let config = SubagentConfig {
            is_subagent_process: false,
            ..SubagentConfig::default()
        };
        let mut manager = SubagentManager::new(config, Arc::new(DenyAllGate));
        let err = manager
            .spawn_with_args(Path::new("/bin/sh"), &[], "  ")
            .unwrap_err();
        assert!(matches!(err, SubagentError::EmptyTask));
    }
}
