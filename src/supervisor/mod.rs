//! Goal Supervisor
//!
//! Drives one goal through one phase (plan or execute) to a terminal exit:
//! - seeds the model session from current goal and action state
//! - waits on inbound messages, subagent approvals and a fixed timeout
//! - polls subagents, answers approvals, forwards messages as system turns
//! - re-checks phase completion after every wake
//!
//! Cancellation is cooperative. Stores and queues are durable, so stopping
//! between turns loses nothing; an Execute run always starts by reconciling
//! orphaned actions against the work queue.

pub mod prompts;
pub mod recovery;

pub use prompts::ActionTally;
pub use recovery::recover_orphaned_actions;

use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::goap::check_progress;
use crate::messaging::Messaging;
use crate::session::{ModelSession, TurnOutcome};
use crate::store::{ActionStore, Goal, GoalStatus, GoalStore};
use crate::subagent::{ApprovalEvent, SubagentManager};
use crate::work_queue::{SharedConnection, WorkQueue};

/// Longest the loop sleeps without any event
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Turn failures in a row before giving up
pub const MAX_CONSECUTIVE_ERRORS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Plan,
    Execute,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Execute => "execute",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "plan" => Some(Self::Plan),
            "execute" => Some(Self::Execute),
            _ => None,
        }
    }

    fn activity(&self) -> &'static str {
        match self {
            Self::Plan => "planning",
            Self::Execute => "execution",
        }
    }
}

/// How a supervisor run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    Complete,
    /// Failure or cooperative shutdown: stopped, not finished
    Error,
    /// Model context exhausted; respawn with a fresh context
    ContextFull,
}

impl SupervisorExit {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Complete => 0,
            Self::Error => 1,
            Self::ContextFull => 2,
        }
    }

    pub fn from_exit_code(code: i32) -> Self {
        match code {
            0 => Self::Complete,
            2 => Self::ContextFull,
            _ => Self::Error,
        }
    }
}

pub struct Supervisor {
    goals: Arc<dyn GoalStore>,
    actions: Arc<dyn ActionStore>,
    queue_db: SharedConnection,
    messaging: Arc<dyn Messaging>,
    subagents: SubagentManager,
    agent_id: String,
    wait_timeout: Duration,
}

impl Supervisor {
    pub fn new(
        goals: Arc<dyn GoalStore>,
        actions: Arc<dyn ActionStore>,
        queue_db: SharedConnection,
        messaging: Arc<dyn Messaging>,
        subagents: SubagentManager,
        agent_id: &str,
    ) -> Self {
        Self {
            goals,
            actions,
            queue_db,
            messaging,
            subagents,
            agent_id: agent_id.to_string(),
            wait_timeout: WAIT_TIMEOUT,
        }
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn subagents(&mut self) -> &mut SubagentManager {
        &mut self.subagents
    }

    /// Run one phase of a goal to a terminal exit
    pub async fn run(
        &mut self,
        goal_id: &str,
        phase: Phase,
        session: &mut dyn ModelSession,
        cancel: &CancellationToken,
    ) -> SupervisorExit {
        info!("Supervisor started for goal {} ({} phase)", goal_id, phase.as_str());

        if phase == Phase::Execute {
            if let Err(e) = self.recover(goal_id) {
                error!("Orphan recovery failed for goal {}: {:#}", goal_id, e);
                return SupervisorExit::Error;
            }
        }

        let seed = match self.seed_message(goal_id, phase) {
            Ok(seed) => seed,
            Err(e) => {
                error!("Failed to build initial message for goal {}: {:#}", goal_id, e);
                return SupervisorExit::Error;
            }
        };

        match session.process_message(&seed).await {
            TurnOutcome::Ok => {}
            TurnOutcome::ContextFull => return self.context_full(goal_id, phase),
            TurnOutcome::Error(code) => {
                error!("Initial turn for goal {} failed ({})", goal_id, code);
                return SupervisorExit::Error;
            }
        }

        match self.phase_complete(goal_id, phase) {
            Ok(true) => {
                info!("Goal {} {} complete after initial turn", goal_id, phase.as_str());
                return SupervisorExit::Complete;
            }
            Ok(false) => {}
            Err(e) => {
                error!("Completion check failed for goal {}: {:#}", goal_id, e);
                return SupervisorExit::Error;
            }
        }

        let mut consecutive_errors = 0;
        while !cancel.is_cancelled() {
            let mut notified = false;
            let mut woke_on: Option<ApprovalEvent> = None;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.messaging.notified() => notified = true,
                Some(event) = self.subagents.next_approval() => woke_on = Some(event),
                _ = tokio::time::sleep(self.wait_timeout) => {}
            }

            let changes = self.subagents.poll_all().await;

            if let Some(event) = woke_on {
                self.subagents.handle_approval(event).await;
            }
            while let Some(event) = self.subagents.try_next_approval() {
                self.subagents.handle_approval(event).await;
            }

            // State changes without a wakeup cover messages that landed
            // between the poller's check and this wait
            if notified || changes > 0 {
                if notified {
                    self.messaging.clear_notification();
                }

                match self.process_notifications(session).await {
                    Ok(None) => {}
                    Ok(Some(TurnOutcome::Ok)) => consecutive_errors = 0,
                    Ok(Some(TurnOutcome::ContextFull)) => return self.context_full(goal_id, phase),
                    Ok(Some(TurnOutcome::Error(code))) => {
                        consecutive_errors += 1;
                        warn!(
                            "Turn for goal {} failed ({}), {} in a row",
                            goal_id, code, consecutive_errors
                        );
                        if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                            error!("Too many consecutive errors for goal {}, exiting", goal_id);
                            return SupervisorExit::Error;
                        }
                    }
                    Err(e) => {
                        error!("Failed to fetch messages for {}: {:#}", self.agent_id, e);
                        return SupervisorExit::Error;
                    }
                }
            }

            match self.phase_complete(goal_id, phase) {
                Ok(true) => {
                    info!("Goal {} {} complete", goal_id, phase.as_str());
                    return SupervisorExit::Complete;
                }
                Ok(false) => {}
                Err(e) => {
                    error!("Completion check failed for goal {}: {:#}", goal_id, e);
                    return SupervisorExit::Error;
                }
            }
        }

        info!("Supervisor for goal {} shutting down", goal_id);
        SupervisorExit::Error
    }

    /// Stop every subagent this supervisor started
    pub async fn shutdown(&mut self) {
        self.subagents.shutdown().await;
    }

    fn load_goal(&self, goal_id: &str) -> Result<Goal> {
        self.goals
            .get(goal_id)?
            .ok_or_else(|| anyhow!("goal not found: {}", goal_id))
    }

    fn recover(&self, goal_id: &str) -> Result<usize> {
        let goal = self.load_goal(goal_id)?;
        let queue = WorkQueue::with_connection(Arc::clone(&self.queue_db), &goal.queue_name)?;
        recover_orphaned_actions(self.actions.as_ref(), &queue, goal_id)
    }

    fn seed_message(&self, goal_id: &str, phase: Phase) -> Result<String> {
        let goal = self.load_goal(goal_id)?;
        Ok(match phase {
            Phase::Plan => prompts::plan_message(&goal),
            Phase::Execute => {
                let actions = self.actions.list_by_goal(goal_id)?;
                prompts::execute_message(&goal, &ActionTally::from_actions(&actions))
            }
        })
    }

    /// Check the phase's completion condition, recording the transition if met
    fn phase_complete(&self, goal_id: &str, phase: Phase) -> Result<bool> {
        let goal = self.load_goal(goal_id)?;

        match phase {
            Phase::Plan => {
                if !goal.has_plan() || self.actions.list_by_goal(goal_id)?.is_empty() {
                    return Ok(false);
                }
                self.goals.update_status(goal_id, GoalStatus::Active)?;
            }
            Phase::Execute => {
                let progress = check_progress(goal.goal_state.as_ref(), goal.world_state.as_ref());
                debug!("Goal {} progress {}", goal_id, progress);
                if !progress.complete && goal.status != GoalStatus::Completed {
                    return Ok(false);
                }
                if goal.status == GoalStatus::Pending {
                    self.goals.update_status(goal_id, GoalStatus::Active)?;
                }
                self.goals.update_status(goal_id, GoalStatus::Completed)?;
            }
        }
        Ok(true)
    }

    fn context_full(&self, goal_id: &str, phase: Phase) -> SupervisorExit {
        let summary = format!("Context full during {}, respawn needed", phase.activity());
        if let Err(e) = self.goals.update_summary(goal_id, &summary) {
            warn!("Failed to record summary for goal {}: {:#}", goal_id, e);
        }
        info!("Goal {}: {}", goal_id, summary);
        SupervisorExit::ContextFull
    }

    /// Forward pending inbound messages as a system turn.
    ///
    /// `None` when there was nothing to forward.
    async fn process_notifications(
        &self,
        session: &mut dyn ModelSession,
    ) -> Result<Option<TurnOutcome>> {
        let bundle = self.messaging.fetch_pending_bundle(&self.agent_id)?;
        let Some(text) = bundle.format_for_llm() else {
            return Ok(None);
        };

        debug!("Processing {} incoming messages", bundle.total_count());
        session.append_system_message(&text);
        Ok(Some(session.continue_session().await))
    }
}

/// Cancel `token` on SIGINT or SIGTERM
pub fn install_shutdown_handler(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        shutdown_signal().await;
        token.cancel();
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping supervisor");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping supervisor");
        }
    }
}
