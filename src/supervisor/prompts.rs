//! Seed messages for supervisor runs

use crate::goap::check_progress;
use crate::store::{Action, ActionStatus, Goal};

/// System prompt for the supervisor's model session
pub const SUPERVISOR_SYSTEM_PROMPT: &str = "You are a goal supervisor. You drive one goal to \
completion by planning actions, dispatching them to workers and verifying their results \
against the goal state. You do not write code yourself. Incoming agent messages, including \
worker completion reports, arrive as system messages; act on them before anything else.";

/// Action counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionTally {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl ActionTally {
    pub fn from_actions(actions: &[Action]) -> Self {
        let mut tally = Self::default();
        for action in actions {
            match action.status {
                ActionStatus::Pending => tally.pending += 1,
                ActionStatus::Running => tally.running += 1,
                ActionStatus::Completed => tally.completed += 1,
                ActionStatus::Failed => tally.failed += 1,
                ActionStatus::Skipped => tally.skipped += 1,
            }
        }
        tally
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed + self.skipped
    }
}

pub fn plan_message(goal: &Goal) -> String {
    format!(
        "You are planning goal \"{name}\" (ID: {id}).\n\n\
         Description: {description}\n\n\
         Goal state (acceptance criteria):\n{goal_state}\n\n\
         Current world state:\n{world_state}\n\n\
         Plan this goal before any work is dispatched:\n\
         1. Research the codebase and constraints relevant to the goal\n\
         2. Decompose the goal into actions with preconditions and effects \
         expressed as world-state assertions\n\
         3. Create the actions with goap_create_actions\n\
         4. Save the plan document with goap_save_plan\n\n\
         Planning is finished once a plan document is saved and at least one action exists.",
        name = goal.name,
        id = goal.id,
        description = goal.description.as_deref().unwrap_or("(none)"),
        goal_state = goal.goal_state_json(),
        world_state = goal.world_state_json(),
    )
}

pub fn execute_message(goal: &Goal, tally: &ActionTally) -> String {
    let progress = check_progress(goal.goal_state.as_ref(), goal.world_state.as_ref());

    let mut msg = format!(
        "You are supervising goal \"{}\" (ID: {}).\n\nDescription: {}\n\n",
        goal.name,
        goal.id,
        goal.description.as_deref().unwrap_or("(none)")
    );

    if let Some(plan) = goal.plan_document.as_deref().filter(|p| !p.trim().is_empty()) {
        msg.push_str(&format!("Plan:\n{}\n\n", plan.trim()));
    }
    if let Some(summary) = goal.summary.as_deref().filter(|s| !s.trim().is_empty()) {
        msg.push_str(&format!("Summary from the previous supervisor:\n{}\n\n", summary.trim()));
    }

    msg.push_str(&format!(
        "Goal state (acceptance criteria):\n{}\n\n\
         Current world state:\n{}\n\n\
         Progress: {} assertions satisfied.\n\
         Actions: {} pending, {} running, {} completed, {} failed (total: {}).\n\n\
         Use GOAP tools to progress this goal to completion:\n\
         1. Check for ready actions with goap_list_actions (status=\"pending\")\n\
         2. Decompose ready compound actions into children with goap_create_actions\n\
         3. Dispatch ready primitive actions to workers with goap_dispatch_action\n\
         4. When workers complete, verify their effects with goap_get_action_results\n\
         5. Update world state with goap_update_world_state for verified effects\n\
         6. Check goal completion with goap_check_complete\n\n\
         Begin by examining the current state and taking the next appropriate action.",
        goal.goal_state_json(),
        goal.world_state_json(),
        progress,
        tally.pending,
        tally.running,
        tally.completed,
        tally.failed,
        tally.total()
    ));
    msg
}
