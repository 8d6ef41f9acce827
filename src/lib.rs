//! Goal Supervisor
//!
//! Multi-agent orchestration core: one supervisor process per goal drives a
//! model session, delegates work to child processes and decides when the
//! goal is done.
//!
//! # Features
//!
//! - **Goal evaluation**: boolean world-state assertions against a goal state
//! - **Work queues**: SQLite-backed, shared across processes, bounded retries
//! - **Subagents**: process-group isolation, timeouts, approval channel
//! - **Supervisor loop**: plan and execute phases, context-full respawn
//! - **Orchestration**: per-goal supervisor processes, crash recovery
//!
//! # Architecture
//!
//! ```text
//! Orchestrator ──► Supervisor (one per goal) ──► ModelSession
//!                     │
//!                     ├── Messaging (poller + SQLite messages)
//!                     ├── SubagentManager ──► worker / subagent processes
//!                     │                           │
//!                     ├── Dispatcher ─────► WorkQueue (SQLite)
//!                     └── Goal / Action stores (SQLite)
//! ```

pub mod config;
pub mod dispatch;
pub mod goap;
pub mod messaging;
pub mod orchestrator;
pub mod roles;
pub mod session;
pub mod store;
pub mod subagent;
pub mod supervisor;
pub mod tokenizer;
pub mod work_queue;
pub mod worker;

pub use config::Config;
pub use dispatch::{DispatchError, Dispatched, Dispatcher};
pub use goap::{check_progress, preconditions_met, Assertions, Progress};
pub use messaging::{MessageHub, Messaging, NotificationBundle};
pub use orchestrator::Orchestrator;
pub use session::{CommandSession, ModelSession, SessionError, TurnOutcome};
pub use store::{
    Action, ActionStatus, ActionStore, Goal, GoalStatus, GoalStore, SqliteActionStore,
    SqliteGoalStore, SqliteMessageStore,
};
pub use subagent::{
    AllowAllGate, ApprovalClient, DenyAllGate, PolicyGate, SubagentConfig, SubagentError,
    SubagentManager, SubagentStatus,
};
pub use supervisor::{Phase, Supervisor, SupervisorExit};
pub use tokenizer::{BudgetCheck, TokenCounter};
pub use work_queue::{QueueError, WorkItem, WorkItemStatus, WorkQueue};
pub use worker::{CommandRunner, TaskRunner, WorkerConfig, WorkerError, WorkerHandle, WorkerLoop};
