//! Supervisor Loop Integration Tests
//!
//! A scripted model session stands in for the real model. Its side effects
//! write to the same stores the supervisor reads, the way model tool calls
//! would.

use anyhow::Result;
use async_trait::async_trait;
use goal_supervisor::goap::Assertions;
use goal_supervisor::messaging::{MessageHub, Messaging, NotificationBundle};
use goal_supervisor::session::{ModelSession, TurnOutcome};
use goal_supervisor::store::{
    ActionStatus, ActionStore, GoalStatus, GoalStore, Message, NewAction, SqliteActionStore,
    SqliteGoalStore, SqliteMessageStore,
};
use goal_supervisor::subagent::{DenyAllGate, SubagentConfig, SubagentManager};
use goal_supervisor::supervisor::{Phase, Supervisor, SupervisorExit};
use goal_supervisor::work_queue::open_in_memory;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

type Effect = Box<dyn FnMut(usize) + Send>;

/// Replays canned outcomes; runs `effect` with the turn number on every turn
struct ScriptedSession {
    outcomes: VecDeque<TurnOutcome>,
    effect: Option<Effect>,
    turns: usize,
    system_messages: Vec<String>,
}

impl ScriptedSession {
    fn new(outcomes: &[TurnOutcome]) -> Self {
        Self {
            outcomes: outcomes.iter().copied().collect(),
            effect: None,
            turns: 0,
            system_messages: Vec::new(),
        }
    }

    fn with_effect(mut self, effect: impl FnMut(usize) + Send + 'static) -> Self {
        self.effect = Some(Box::new(effect));
        self
    }

    fn turn(&mut self) -> TurnOutcome {
        let turn = self.turns;
        self.turns += 1;
        if let Some(effect) = self.effect.as_mut() {
            effect(turn);
        }
        self.outcomes.pop_front().unwrap_or(TurnOutcome::Ok)
    }
}

#[async_trait]
impl ModelSession for ScriptedSession {
    async fn process_message(&mut self, _text: &str) -> TurnOutcome {
        self.turn()
    }

    fn append_system_message(&mut self, text: &str) {
        self.system_messages.push(text.to_string());
    }

    async fn continue_session(&mut self) -> TurnOutcome {
        self.turn()
    }
}

/// Always has exactly one message waiting
struct ChattyMessaging;

#[async_trait]
impl Messaging for ChattyMessaging {
    async fn notified(&self) {}

    fn clear_notification(&self) {}

    fn fetch_pending_bundle(&self, agent_id: &str) -> Result<NotificationBundle> {
        Ok(one_message(agent_id, "peer", "status?"))
    }
}

fn one_message(agent_id: &str, sender: &str, content: &str) -> NotificationBundle {
    NotificationBundle {
        direct: vec![Message {
            id: "m1".to_string(),
            sender: sender.to_string(),
            recipient: Some(agent_id.to_string()),
            channel: None,
            content: content.to_string(),
            created_at: 0,
        }],
        channel: Vec::new(),
    }
}

/// Holds a message but never signals it, as when a wakeup is lost
struct UnsignalledMessaging;

#[async_trait]
impl Messaging for UnsignalledMessaging {
    async fn notified(&self) {
        std::future::pending::<()>().await
    }

    fn clear_notification(&self) {}

    fn fetch_pending_bundle(&self, agent_id: &str) -> Result<NotificationBundle> {
        Ok(one_message(agent_id, "sub-1", "finished"))
    }
}

/// Never wakes the supervisor
struct SilentMessaging;

#[async_trait]
impl Messaging for SilentMessaging {
    async fn notified(&self) {
        std::future::pending::<()>().await
    }

    fn clear_notification(&self) {}

    fn fetch_pending_bundle(&self, _agent_id: &str) -> Result<NotificationBundle> {
        Ok(NotificationBundle::default())
    }
}

struct Fixture {
    goals: Arc<SqliteGoalStore>,
    actions: Arc<SqliteActionStore>,
    goal_id: String,
    _temp: TempDir,
}

fn fixture() -> Fixture {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let db = temp.path().join("goals.db");
    let goals = Arc::new(SqliteGoalStore::open(&db).unwrap());
    let actions = Arc::new(SqliteActionStore::open(&db).unwrap());

    let state: Assertions = [("tests_pass".to_string(), true)].into_iter().collect();
    let goal = goals
        .create("fix the build", Some("make CI green"), &state, None)
        .unwrap();

    Fixture {
        goals,
        actions,
        goal_id: goal.id,
        _temp: temp,
    }
}

impl Fixture {
    fn supervisor(&self, messaging: Arc<dyn Messaging>) -> Supervisor {
        let mut config = SubagentConfig::new(2, 10);
        config.is_subagent_process = false;
        let subagents = SubagentManager::new(config, Arc::new(DenyAllGate));
        Supervisor::new(
            self.goals.clone(),
            self.actions.clone(),
            open_in_memory().unwrap(),
            messaging,
            subagents,
            &format!("supervisor-{}", self.goal_id),
        )
        .with_wait_timeout(Duration::from_millis(20))
    }

    /// Effect that marks the goal state reached on `turn`
    fn finish_on(&self, turn: usize) -> impl FnMut(usize) + Send + 'static {
        let goals = Arc::clone(&self.goals);
        let goal_id = self.goal_id.clone();
        move |n| {
            if n == turn {
                let world: Assertions = [("tests_pass".to_string(), true)].into_iter().collect();
                goals.update_world_state(&goal_id, &world).unwrap();
            }
        }
    }

    fn goal_status(&self) -> GoalStatus {
        self.goals.get(&self.goal_id).unwrap().unwrap().status
    }
}

#[tokio::test]
async fn test_execute_completes_when_goal_state_reached() {
    let f = fixture();
    let mut supervisor = f.supervisor(Arc::new(SilentMessaging));
    let mut session = ScriptedSession::new(&[]).with_effect(f.finish_on(0));

    let exit = supervisor
        .run(&f.goal_id, Phase::Execute, &mut session, &CancellationToken::new())
        .await;

    assert_eq!(exit, SupervisorExit::Complete);
    assert_eq!(session.turns, 1);
    assert_eq!(f.goal_status(), GoalStatus::Completed);
}

#[tokio::test]
async fn test_plan_completes_with_plan_and_actions() {
    let f = fixture();
    let mut supervisor = f.supervisor(Arc::new(SilentMessaging));

    let goals = Arc::clone(&f.goals);
    let actions = Arc::clone(&f.actions);
    let goal_id = f.goal_id.clone();
    let mut session = ScriptedSession::new(&[]).with_effect(move |_| {
        goals
            .update_plan_document(&goal_id, "1. reproduce\n2. fix")
            .unwrap();
        actions
            .insert(&NewAction {
                goal_id: &goal_id,
                description: "reproduce the failure",
                ..Default::default()
            })
            .unwrap();
    });

    let exit = supervisor
        .run(&f.goal_id, Phase::Plan, &mut session, &CancellationToken::new())
        .await;

    assert_eq!(exit, SupervisorExit::Complete);
    assert_eq!(f.goal_status(), GoalStatus::Active);
}

#[tokio::test]
async fn test_context_full_records_summary() {
    let f = fixture();
    let mut supervisor = f.supervisor(Arc::new(SilentMessaging));
    let mut session = ScriptedSession::new(&[TurnOutcome::ContextFull]);

    let exit = supervisor
        .run(&f.goal_id, Phase::Execute, &mut session, &CancellationToken::new())
        .await;

    assert_eq!(exit, SupervisorExit::ContextFull);
    assert_eq!(exit.exit_code(), 2);
    let goal = f.goals.get(&f.goal_id).unwrap().unwrap();
    assert_eq!(
        goal.summary.as_deref(),
        Some("Context full during execution, respawn needed")
    );
    assert_eq!(goal.status, GoalStatus::Pending);
}

#[tokio::test]
async fn test_first_turn_error_exits() {
    let f = fixture();
    let mut supervisor = f.supervisor(Arc::new(SilentMessaging));
    let mut session = ScriptedSession::new(&[TurnOutcome::Error(1)]);

    let exit = supervisor
        .run(&f.goal_id, Phase::Plan, &mut session, &CancellationToken::new())
        .await;
    assert_eq!(exit, SupervisorExit::Error);
}

#[tokio::test]
async fn test_consecutive_errors_exit() {
    let f = fixture();
    let mut supervisor = f.supervisor(Arc::new(ChattyMessaging));
    let mut session = ScriptedSession::new(&[
        TurnOutcome::Ok,
        TurnOutcome::Error(1),
        TurnOutcome::Error(1),
        TurnOutcome::Error(1),
    ]);

    let exit = supervisor
        .run(&f.goal_id, Phase::Execute, &mut session, &CancellationToken::new())
        .await;

    assert_eq!(exit, SupervisorExit::Error);
    assert_eq!(session.turns, 4);
    assert_eq!(session.system_messages.len(), 3);
}

#[tokio::test]
async fn test_success_resets_error_count() {
    let f = fixture();
    let mut supervisor = f.supervisor(Arc::new(ChattyMessaging));
    let mut session = ScriptedSession::new(&[
        TurnOutcome::Ok,
        TurnOutcome::Error(1),
        TurnOutcome::Error(1),
        TurnOutcome::Ok,
        TurnOutcome::Error(1),
    ])
    .with_effect(f.finish_on(5));

    let exit = supervisor
        .run(&f.goal_id, Phase::Execute, &mut session, &CancellationToken::new())
        .await;

    assert_eq!(exit, SupervisorExit::Complete);
    assert_eq!(session.turns, 6);
}

#[tokio::test]
async fn test_messages_forwarded_as_system_turns() {
    let f = fixture();
    let store = Arc::new(SqliteMessageStore::in_memory().unwrap());
    let agent_id = format!("supervisor-{}", f.goal_id);
    let hub = Arc::new(MessageHub::start(
        &agent_id,
        Arc::clone(&store),
        Duration::from_millis(10),
    ));
    let mut supervisor = f.supervisor(hub.clone());
    let mut session = ScriptedSession::new(&[]).with_effect(f.finish_on(1));

    store.send_direct("worker-7", &agent_id, "tests pass now").unwrap();

    let exit = tokio::time::timeout(
        Duration::from_secs(5),
        supervisor.run(&f.goal_id, Phase::Execute, &mut session, &CancellationToken::new()),
    )
    .await
    .expect("supervisor never woke for the message");

    assert_eq!(exit, SupervisorExit::Complete);
    assert_eq!(session.system_messages.len(), 1);
    assert!(session.system_messages[0].contains("Direct from worker-7: \"tests pass now\""));
    hub.stop().await;
}

#[tokio::test]
async fn test_cancellation_stops_loop() {
    let f = fixture();
    let mut supervisor = f.supervisor(Arc::new(SilentMessaging));
    let mut session = ScriptedSession::new(&[]);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let exit = tokio::time::timeout(
        Duration::from_secs(5),
        supervisor.run(&f.goal_id, Phase::Execute, &mut session, &cancel),
    )
    .await
    .expect("cancellation was ignored");

    assert_eq!(exit, SupervisorExit::Error);
    assert_eq!(session.turns, 1);
    assert_eq!(f.goal_status(), GoalStatus::Pending);
}

#[tokio::test]
async fn test_context_full_mid_loop_records_summary() {
    let f = fixture();
    let mut supervisor = f.supervisor(Arc::new(ChattyMessaging));
    let mut session = ScriptedSession::new(&[TurnOutcome::Ok, TurnOutcome::ContextFull]);

    let exit = supervisor
        .run(&f.goal_id, Phase::Execute, &mut session, &CancellationToken::new())
        .await;

    assert_eq!(exit, SupervisorExit::ContextFull);
    assert_eq!(session.turns, 2);
    assert_eq!(session.system_messages.len(), 1);
    let goal = f.goals.get(&f.goal_id).unwrap().unwrap();
    assert_eq!(
        goal.summary.as_deref(),
        Some("Context full during execution, respawn needed")
    );
}

#[tokio::test]
async fn test_execute_recovers_orphaned_actions_first() {
    let f = fixture();
    let orphan = f
        .actions
        .insert(&NewAction {
            goal_id: &f.goal_id,
            description: "dispatched by a dead supervisor",
            ..Default::default()
        })
        .unwrap();
    f.actions.update_status(&orphan, ActionStatus::Running, None).unwrap();

    // Recovery runs before the seed turn
    let actions = Arc::clone(&f.actions);
    let orphan_id = orphan.clone();
    let mut finish = f.finish_on(0);
    let mut session = ScriptedSession::new(&[]).with_effect(move |n| {
        if n == 0 {
            let status = actions.get(&orphan_id).unwrap().unwrap().status;
            assert_eq!(status, ActionStatus::Pending);
        }
        finish(n);
    });
    let mut supervisor = f.supervisor(Arc::new(SilentMessaging));

    let exit = supervisor
        .run(&f.goal_id, Phase::Execute, &mut session, &CancellationToken::new())
        .await;

    assert_eq!(exit, SupervisorExit::Complete);
    assert_eq!(
        f.actions.get(&orphan).unwrap().unwrap().status,
        ActionStatus::Pending
    );
}

#[tokio::test]
async fn test_subagent_exit_triggers_message_fetch() {
    let f = fixture();
    let mut supervisor = f.supervisor(Arc::new(UnsignalledMessaging));
    supervisor
        .subagents()
        .spawn_with_args(
            Path::new("/bin/sh"),
            &["-c".to_string(), "exit 0".to_string()],
            "short task",
        )
        .unwrap();
    let mut session = ScriptedSession::new(&[]).with_effect(f.finish_on(1));

    let exit = tokio::time::timeout(
        Duration::from_secs(5),
        supervisor.run(&f.goal_id, Phase::Execute, &mut session, &CancellationToken::new()),
    )
    .await
    .expect("subagent exit never led to a message fetch");

    assert_eq!(exit, SupervisorExit::Complete);
    assert_eq!(session.system_messages.len(), 1);
    assert!(session.system_messages[0].contains("Direct from sub-1: \"finished\""));
    supervisor.shutdown().await;
}
