//! Goal Supervisor - Entry Point
//!
//! Modes:
//! - --supervisor --goal ID --phase plan|execute: drive one goal phase
//! - --worker --queue Q: drain a work queue
//! - --subagent --task T: run one delegated task
//! - --queue-status Q: print queue depth
//! - --respawn: restart supervisors for unfinished goals

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use goal_supervisor::messaging::MessageHub;
use goal_supervisor::supervisor::{install_shutdown_handler, prompts::SUPERVISOR_SYSTEM_PROMPT};
use goal_supervisor::work_queue::open_database;
use goal_supervisor::{
    AllowAllGate, ApprovalClient, CommandRunner, CommandSession, Config, DenyAllGate, ModelSession,
    Orchestrator, Phase, PolicyGate, SqliteActionStore, SqliteGoalStore, SqliteMessageStore,
    SubagentConfig, SubagentManager, Supervisor, TurnOutcome, WorkQueue, WorkerConfig, WorkerLoop,
};

/// Longest a single model command may run
const MODEL_TURN_TIMEOUT: Duration = Duration::from_secs(600);

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn print_help() {
    println!("Goal Supervisor v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: goal-supervisor <MODE> [OPTIONS]");
    println!();
    println!("Modes:");
    println!("  --supervisor --goal ID --phase plan|execute   Drive one goal phase");
    println!("  --worker --queue Q [--system-prompt-file F]   Drain a work queue");
    println!("  --subagent --task T [--context C]             Run one delegated task");
    println!("  --queue-status Q                              Show pending items in a queue");
    println!("  --respawn                                     Restart missing supervisors");
    println!("  --help, -h                                    Show this help");
    println!();
    println!("Supervisor exit codes: 0 complete, 1 error, 2 context full");
    println!();
    println!("Environment variables:");
    println!("  SUPERVISOR_HOME                  Data directory");
    println!("  SUPERVISOR_MAX_SUBAGENTS         Concurrent subagents (default: 5)");
    println!("  SUPERVISOR_SUBAGENT_TIMEOUT      Subagent timeout in seconds (default: 300)");
    println!("  SUPERVISOR_POLL_INTERVAL_MS      Message poll interval (default: 2000)");
    println!("  SUPERVISOR_MODEL_COMMAND         Model command for supervisor turns");
    println!("  SUPERVISOR_CONTEXT_TOKENS        Model context window (default: 180000)");
    println!("  SUPERVISOR_WORKER_COMMAND        Command workers run per task");
    println!("  SUPERVISOR_MAX_WORKERS_PER_GOAL  Running actions per goal (default: 3)");
    println!("  SUPERVISOR_APPROVE_SUBAGENTS     Approve subagent requests (default: true)");
}

#[tokio::main]
async fn main() -> Result<()> {
    let code = run().await?;
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    // Load environment
    dotenvy::dotenv().ok();

    // Parse args
    let args: Vec<String> = std::env::args().collect();
    let supervisor_mode = args.iter().any(|a| a == "--supervisor");
    let worker_mode = args.iter().any(|a| a == "--worker");
    let subagent_mode = args.iter().any(|a| a == "--subagent");
    let queue_status = arg_value(&args, "--queue-status");
    let respawn_mode = args.iter().any(|a| a == "--respawn");
    let help_mode = args.iter().any(|a| a == "--help" || a == "-h");

    if help_mode
        || !(supervisor_mode || worker_mode || subagent_mode || respawn_mode || queue_status.is_some())
    {
        print_help();
        return Ok(0);
    }

    // Subagent output is captured as the task result, keep it quiet by default
    let default_level = if subagent_mode { Level::WARN } else { Level::INFO };
    let background = supervisor_mode || worker_mode || subagent_mode;
    init_logging(background, default_level)?;

    let config = Config::from_env()?;

    if supervisor_mode {
        let goal_id = arg_value(&args, "--goal").ok_or_else(|| anyhow!("--supervisor requires --goal"))?;
        let phase = arg_value(&args, "--phase")
            .as_deref()
            .and_then(Phase::parse)
            .ok_or_else(|| anyhow!("--supervisor requires --phase plan|execute"))?;
        run_supervisor(&config, &goal_id, phase).await
    } else if worker_mode {
        let queue = arg_value(&args, "--queue").ok_or_else(|| anyhow!("--worker requires --queue"))?;
        let prompt_file = arg_value(&args, "--system-prompt-file").map(PathBuf::from);
        run_worker(&config, &queue, prompt_file).await
    } else if subagent_mode {
        let task = arg_value(&args, "--task").ok_or_else(|| anyhow!("--subagent requires --task"))?;
        let context = arg_value(&args, "--context");
        run_subagent(&config, &task, context.as_deref()).await
    } else if let Some(queue) = queue_status {
        let queue = WorkQueue::open(&config.queue_db_path(), &queue)?;
        println!("Queue {}: {} pending", queue.name(), queue.pending_count()?);
        Ok(0)
    } else {
        let goals = Arc::new(SqliteGoalStore::open(config.goals_db_path())?);
        let orchestrator = Orchestrator::new(goals, &std::env::current_exe()?);
        let reaped = orchestrator.reap_supervisors()?;
        let stale = orchestrator.check_stale()?;
        let respawned = orchestrator.respawn_dead()?;
        println!(
            "Cleared {} finished and {} stale supervisors, started {}",
            reaped, stale, respawned
        );
        Ok(0)
    }
}

fn init_logging(background: bool, default_level: Level) -> Result<()> {
    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(default_level);

    if background {
        // Process modes - stdout may be captured by a parent, log to stderr as JSON
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

async fn run_supervisor(config: &Config, goal_id: &str, phase: Phase) -> Result<i32> {
    info!("Goal Supervisor v{} for goal {}", env!("CARGO_PKG_VERSION"), goal_id);

    let goals_db = config.goals_db_path();
    let goals = Arc::new(SqliteGoalStore::open(&goals_db)?);
    let actions = Arc::new(SqliteActionStore::open(&goals_db)?);
    let messages = Arc::new(SqliteMessageStore::open(&goals_db)?);
    let queue_db = open_database(&config.queue_db_path())?;

    let agent_id = format!("supervisor-{}", goal_id);
    let hub = Arc::new(MessageHub::start(&agent_id, Arc::clone(&messages), config.poll_interval));

    let gate: Arc<dyn PolicyGate> = if config.approve_subagents {
        Arc::new(AllowAllGate)
    } else {
        Arc::new(DenyAllGate)
    };
    let subagents = SubagentManager::new(
        SubagentConfig::new(config.max_subagents, config.subagent_timeout_secs),
        gate,
    )
    .with_parent(Arc::clone(&messages), &agent_id);

    let mut supervisor = Supervisor::new(goals, actions, queue_db, hub.clone(), subagents, &agent_id);
    let mut session = CommandSession::new(&config.model_command, config.context_tokens, MODEL_TURN_TIMEOUT)?
        .with_system_prompt(SUPERVISOR_SYSTEM_PROMPT);

    let cancel = CancellationToken::new();
    let signals = install_shutdown_handler(cancel.clone());

    let exit = supervisor.run(goal_id, phase, &mut session, &cancel).await;

    supervisor.shutdown().await;
    hub.stop().await;
    signals.abort();
    if let Err(e) = messages.cleanup_agent(&agent_id) {
        error!("Failed to clean up messages for {}: {:#}", agent_id, e);
    }

    info!("Supervisor for goal {} exiting: {:?}", goal_id, exit);
    Ok(exit.exit_code())
}

async fn run_worker(config: &Config, queue_name: &str, prompt_file: Option<PathBuf>) -> Result<i32> {
    let system_prompt = match prompt_file {
        Some(path) => Some(
            std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?,
        ),
        None => None,
    };

    let worker_config = WorkerConfig::from_command(
        &config.worker_command,
        Duration::from_secs(config.subagent_timeout_secs),
    )?
    .with_system_prompt(system_prompt);
    let runner = CommandRunner::new(worker_config).with_approval(ApprovalClient::from_env());

    let queue = WorkQueue::open(&config.queue_db_path(), queue_name)?;
    let cancel = CancellationToken::new();
    let signals = install_shutdown_handler(cancel.clone());

    let mut worker = WorkerLoop::new(queue, runner).with_cancel(cancel);
    let summary = worker.run().await?;
    signals.abort();

    Ok(if summary.failed > 0 { 1 } else { 0 })
}

async fn run_subagent(config: &Config, task: &str, context: Option<&str>) -> Result<i32> {
    let message = match context.filter(|c| !c.is_empty()) {
        Some(context) => format!("Context: {}\n\nTask: {}", context, task),
        None => task.to_string(),
    };

    let mut session = CommandSession::new(&config.model_command, config.context_tokens, MODEL_TURN_TIMEOUT)?;
    match session.process_message(&message).await {
        TurnOutcome::Ok => {
            if let Some(reply) = session.transcript().last() {
                println!("{}", reply.content);
            }
            Ok(0)
        }
        TurnOutcome::ContextFull => {
            eprintln!("Task exceeds the model context window");
            Ok(2)
        }
        TurnOutcome::Error(code) => {
            eprintln!("Model command failed ({})", code);
            Ok(1)
        }
    }
}
