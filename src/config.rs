//! Configuration management

use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

use crate::dispatch::DEFAULT_MAX_WORKERS_PER_GOAL;
use crate::messaging::DEFAULT_POLL_INTERVAL;
use crate::subagent::{DEFAULT_MAX_SUBAGENTS, DEFAULT_TIMEOUT_SECS, MAX_SUBAGENTS_HARD_CAP, MAX_TIMEOUT_SECS};

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the databases and prompt overrides
    pub home: PathBuf,

    /// Concurrent subagents per supervisor (1..=20)
    pub max_subagents: usize,

    /// Wall-clock limit per subagent in seconds (1..=3600)
    pub subagent_timeout_secs: u64,

    /// Inbound message poll interval
    pub poll_interval: Duration,

    /// Command the supervisor's model session runs for each turn
    pub model_command: String,

    /// Model context window in tokens
    pub context_tokens: usize,

    /// Command a worker runs for each claimed item
    pub worker_command: String,

    /// Running actions allowed per goal
    pub max_workers_per_goal: usize,

    /// Answer subagent approval requests with yes (otherwise no)
    pub approve_subagents: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let home = std::env::var("SUPERVISOR_HOME")
            .map(|v| PathBuf::from(shellexpand::tilde(&v).into_owned()))
            .unwrap_or_else(|_| {
                dirs::data_local_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("goal-supervisor")
            });

        let max_subagents = env_parse("SUPERVISOR_MAX_SUBAGENTS", DEFAULT_MAX_SUBAGENTS)
            .clamp(1, MAX_SUBAGENTS_HARD_CAP);

        let subagent_timeout_secs = env_parse("SUPERVISOR_SUBAGENT_TIMEOUT", DEFAULT_TIMEOUT_SECS)
            .clamp(1, MAX_TIMEOUT_SECS);

        let poll_interval = Duration::from_millis(env_parse(
            "SUPERVISOR_POLL_INTERVAL_MS",
            DEFAULT_POLL_INTERVAL.as_millis() as u64,
        ));

        let model_command = std::env::var("SUPERVISOR_MODEL_COMMAND")
            .unwrap_or_else(|_| "claude -p --output-format text".to_string());

        let context_tokens = env_parse("SUPERVISOR_CONTEXT_TOKENS", 180_000);

        let worker_command =
            std::env::var("SUPERVISOR_WORKER_COMMAND").unwrap_or_else(|_| "claude -p".to_string());

        let max_workers_per_goal =
            env_parse("SUPERVISOR_MAX_WORKERS_PER_GOAL", DEFAULT_MAX_WORKERS_PER_GOAL).max(1);

        let approve_subagents = std::env::var("SUPERVISOR_APPROVE_SUBAGENTS")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);

        Ok(Self {
            home,
            max_subagents,
            subagent_timeout_secs,
            poll_interval,
            model_command,
            context_tokens,
            worker_command,
            max_workers_per_goal,
            approve_subagents,
        })
    }

    pub fn queue_db_path(&self) -> PathBuf {
        self.home.join("work_queues.db")
    }

    /// Goals, actions and messages
    pub fn goals_db_path(&self) -> PathBuf {
        self.home.join("goals.db")
    }

    pub fn prompts_dir(&self) -> PathBuf {
        self.home.join("prompts")
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
