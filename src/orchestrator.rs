//! Supervisor Process Management
//!
//! One supervisor process per goal, tracked through the goal record's
//! `supervisor_pid`. The orchestrator starts them, notices when they die
//! and starts replacements for goals that still have work left.

use anyhow::{anyhow, Result};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::store::{GoalStatus, GoalStore, SqliteGoalStore};
use crate::subagent::{process, GRACE_PERIOD};
use crate::supervisor::Phase;

/// How long `kill_supervisor` waits for a SIGKILLed child to be reaped
const REAP_TIMEOUT: Duration = Duration::from_secs(1);

/// Clock-tick rounding allowed when matching a pid to its recorded start
const START_TIME_SLACK_SECS: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    Alive,
    Gone,
    /// Exists but we may not signal it
    Unknown,
}

fn probe(pid: i64) -> Probe {
    // SAFETY: signal 0 only probes for existence.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return Probe::Alive;
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::ESRCH) => Probe::Gone,
        _ => Probe::Unknown,
    }
}

/// Start time of a live process in unix seconds, from `/proc`
#[cfg(target_os = "linux")]
fn process_started_at(pid: i64) -> Option<i64> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // Fields after the parenthesised command name; starttime is field 22
    let rest = &stat[stat.rfind(')')? + 1..];
    let start_ticks: i64 = rest.split_whitespace().nth(19)?.parse().ok()?;

    let boot = std::fs::read_to_string("/proc/stat").ok()?;
    let btime: i64 = boot
        .lines()
        .find_map(|line| line.strip_prefix("btime "))?
        .trim()
        .parse()
        .ok()?;

    // SAFETY: sysconf has no side effects.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks <= 0 {
        return None;
    }
    Some(btime + start_ticks / ticks as i64)
}

#[cfg(not(target_os = "linux"))]
fn process_started_at(_pid: i64) -> Option<i64> {
    None
}

/// Probe a goal's recorded supervisor. A live process that started after
/// the record was written holds a reused pid and counts as gone.
fn probe_recorded(pid: i64, recorded_at: i64) -> Probe {
    match probe(pid) {
        Probe::Alive if recorded_at > 0 => match process_started_at(pid) {
            Some(started) if started > recorded_at + START_TIME_SLACK_SECS => {
                debug!("Pid {} started at {}, after its record at {}", pid, started, recorded_at);
                Probe::Gone
            }
            _ => Probe::Alive,
        },
        other => other,
    }
}

/// Non-blocking reap. `Some(code)` once our child has exited.
fn try_reap(pid: i64) -> Option<i32> {
    let mut status: libc::c_int = 0;
    // SAFETY: waitpid writes only to the provided status integer.
    let rc = unsafe { libc::waitpid(pid as libc::pid_t, &mut status, libc::WNOHANG) };
    if rc == pid as libc::pid_t {
        Some(if libc::WIFEXITED(status) {
            libc::WEXITSTATUS(status)
        } else {
            -1
        })
    } else {
        None
    }
}

pub struct Orchestrator {
    goals: Arc<SqliteGoalStore>,
    program: PathBuf,
}

impl Orchestrator {
    /// `program` is the executable started in supervisor mode
    pub fn new(goals: Arc<SqliteGoalStore>, program: &Path) -> Self {
        Self {
            goals,
            program: program.to_path_buf(),
        }
    }

    /// Start a detached supervisor for a goal and record its pid.
    ///
    /// Pending goals get a planning supervisor, everything else executes.
    pub fn spawn_supervisor(&self, goal_id: &str) -> Result<u32> {
        let goal = self
            .goals
            .get(goal_id)?
            .ok_or_else(|| anyhow!("goal not found: {}", goal_id))?;
        let phase = if goal.status == GoalStatus::Pending {
            Phase::Plan
        } else {
            Phase::Execute
        };

        let child = Command::new(&self.program)
            .args(["--supervisor", "--goal", goal_id, "--phase", phase.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()?;
        let pid = child.id();

        let started_at = chrono::Utc::now().timestamp();
        if let Err(e) = self.goals.update_supervisor(goal_id, pid as i64, started_at) {
            let _ = process::signal_process(pid, libc::SIGKILL);
            let _ = try_reap(pid as i64);
            return Err(e);
        }

        info!(
            "Spawned supervisor pid {} for goal {} ({} phase)",
            pid,
            goal_id,
            phase.as_str()
        );
        Ok(pid)
    }

    /// Whether the goal's recorded supervisor still exists. A vanished
    /// process has its record cleared.
    pub fn supervisor_alive(&self, goal_id: &str) -> Result<bool> {
        let Some(goal) = self.goals.get(goal_id)? else {
            return Ok(false);
        };
        if goal.supervisor_pid <= 0 {
            return Ok(false);
        }

        match probe_recorded(goal.supervisor_pid, goal.supervisor_started_at) {
            Probe::Alive => Ok(true),
            Probe::Gone => {
                self.goals.update_supervisor(goal_id, 0, 0)?;
                Ok(false)
            }
            Probe::Unknown => Ok(false),
        }
    }

    /// Collect exited supervisor children and clear their records.
    ///
    /// Returns how many records were cleared.
    pub fn reap_supervisors(&self) -> Result<usize> {
        let mut cleared = 0;
        for goal in self.goals.list_all()? {
            let pid = goal.supervisor_pid;
            if pid <= 0 {
                continue;
            }

            if let Some(code) = try_reap(pid) {
                debug!("Reaped supervisor pid {} for goal {} (exit {})", pid, goal.id, code);
            } else if probe_recorded(pid, goal.supervisor_started_at) != Probe::Gone {
                continue;
            } else {
                debug!("Supervisor pid {} for goal {} no longer exists", pid, goal.id);
            }
            self.goals.update_supervisor(&goal.id, 0, 0)?;
            cleared += 1;
        }
        Ok(cleared)
    }

    /// SIGTERM the goal's supervisor, SIGKILL it after a grace period, and
    /// clear the record
    pub async fn kill_supervisor(&self, goal_id: &str) -> Result<()> {
        let goal = self
            .goals
            .get(goal_id)?
            .ok_or_else(|| anyhow!("goal not found: {}", goal_id))?;
        let pid = goal.supervisor_pid;
        if pid <= 0 {
            return Err(anyhow!("goal {} has no supervisor", goal_id));
        }

        // Never signal a process that merely reuses the recorded pid
        if probe_recorded(pid, goal.supervisor_started_at) == Probe::Gone {
            self.goals.update_supervisor(goal_id, 0, 0)?;
            return Ok(());
        }

        process::signal_process(pid as u32, libc::SIGTERM)?;
        tokio::time::sleep(GRACE_PERIOD).await;

        if try_reap(pid).is_none() && probe(pid) != Probe::Gone {
            process::signal_process(pid as u32, libc::SIGKILL)?;
            let deadline = tokio::time::Instant::now() + REAP_TIMEOUT;
            while try_reap(pid).is_none() && probe(pid) != Probe::Gone {
                if tokio::time::Instant::now() >= deadline {
                    warn!("Supervisor pid {} did not exit after SIGKILL", pid);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        self.goals.update_supervisor(goal_id, 0, 0)?;
        info!("Killed supervisor pid {} for goal {}", pid, goal_id);
        Ok(())
    }

    /// Clear records whose process no longer exists, without reaping
    pub fn check_stale(&self) -> Result<usize> {
        let mut cleared = 0;
        for goal in self.goals.list_all()? {
            if goal.supervisor_pid <= 0 {
                continue;
            }
            if probe_recorded(goal.supervisor_pid, goal.supervisor_started_at) == Probe::Gone {
                debug!(
                    "Clearing dead supervisor pid {} for goal {}",
                    goal.supervisor_pid, goal.id
                );
                self.goals.update_supervisor(&goal.id, 0, 0)?;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    /// Start supervisors for unfinished goals that have none.
    ///
    /// Returns how many were started.
    pub fn respawn_dead(&self) -> Result<usize> {
        let mut respawned = 0;
        for status in [GoalStatus::Pending, GoalStatus::Active] {
            for goal in self.goals.list_by_status(status)? {
                if goal.supervisor_pid != 0 {
                    continue;
                }
                info!("Respawning supervisor for goal {} ({})", goal.id, goal.name);
                match self.spawn_supervisor(&goal.id) {
                    Ok(_) => respawned += 1,
                    Err(e) => warn!("Failed to respawn supervisor for goal {}: {:#}", goal.id, e),
                }
            }
        }
        Ok(respawned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goap::Assertions;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("supervisor.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn goal(store: &SqliteGoalStore) -> String {
        let state: Assertions = [("done".to_string(), true)].into_iter().collect();
        store.create("g", None, &state, None).unwrap().id
    }

    #[tokio::test]
    async fn test_spawn_and_kill() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteGoalStore::in_memory().unwrap());
        let id = goal(&store);
        let orchestrator = Orchestrator::new(Arc::clone(&store), &script(&dir, "exec sleep 30"));

        let pid = orchestrator.spawn_supervisor(&id).unwrap();
        assert_eq!(store.get(&id).unwrap().unwrap().supervisor_pid, pid as i64);
        assert!(orchestrator.supervisor_alive(&id).unwrap());

        orchestrator.kill_supervisor(&id).await.unwrap();
        let goal = store.get(&id).unwrap().unwrap();
        assert_eq!(goal.supervisor_pid, 0);
        assert_eq!(goal.status, GoalStatus::Pending);
        assert!(!orchestrator.supervisor_alive(&id).unwrap());
    }

    #[tokio::test]
    async fn test_reap_clears_exited_supervisor() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteGoalStore::in_memory().unwrap());
        let id = goal(&store);
        let orchestrator = Orchestrator::new(Arc::clone(&store), &script(&dir, "exit 0"));

        orchestrator.spawn_supervisor(&id).unwrap();
        let mut cleared = 0;
        for _ in 0..100 {
            cleared += orchestrator.reap_supervisors().unwrap();
            if cleared > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(cleared, 1);
        assert_eq!(store.get(&id).unwrap().unwrap().supervisor_pid, 0);
    }

    #[test]
    fn test_check_stale_clears_missing_process() {
        let store = Arc::new(SqliteGoalStore::in_memory().unwrap());
        let id = goal(&store);
        // Far above any default pid_max
        store.update_supervisor(&id, 99_999_999, 1).unwrap();

        let orchestrator = Orchestrator::new(Arc::clone(&store), Path::new("/bin/true"));
        assert_eq!(orchestrator.check_stale().unwrap(), 1);
        assert_eq!(store.get(&id).unwrap().unwrap().supervisor_pid, 0);
        assert_eq!(orchestrator.check_stale().unwrap(), 0);
    }

    #[test]
    fn test_start_time_recorded_in_seconds() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteGoalStore::in_memory().unwrap());
        let id = goal(&store);
        let orchestrator = Orchestrator::new(Arc::clone(&store), &script(&dir, "exit 0"));

        let before = chrono::Utc::now().timestamp();
        let pid = orchestrator.spawn_supervisor(&id).unwrap();
        let after = chrono::Utc::now().timestamp();

        let started_at = store.get(&id).unwrap().unwrap().supervisor_started_at;
        assert!(started_at >= before && started_at <= after);
        for _ in 0..100 {
            if try_reap(pid as i64).is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_reused_pid_counts_as_stale() {
        let store = Arc::new(SqliteGoalStore::in_memory().unwrap());
        let reused = goal(&store);
        let current = goal(&store);
        let pid = std::process::id() as i64;
        // This process is alive but started long after a record from 1970
        store.update_supervisor(&reused, pid, 1).unwrap();
        store
            .update_supervisor(&current, pid, chrono::Utc::now().timestamp())
            .unwrap();

        let orchestrator = Orchestrator::new(Arc::clone(&store), Path::new("/bin/true"));
        assert!(!orchestrator.supervisor_alive(&reused).unwrap());
        assert_eq!(store.get(&reused).unwrap().unwrap().supervisor_pid, 0);
        assert!(orchestrator.supervisor_alive(&current).unwrap());
        assert_eq!(orchestrator.check_stale().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_respawn_skips_finished_and_supervised_goals() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteGoalStore::in_memory().unwrap());
        let orphan = goal(&store);
        let finished = goal(&store);
        store.update_status(&finished, GoalStatus::Active).unwrap();
        store.update_status(&finished, GoalStatus::Completed).unwrap();
        let supervised = goal(&store);
        store
            .update_supervisor(&supervised, std::process::id() as i64, chrono::Utc::now().timestamp())
            .unwrap();

        let orchestrator = Orchestrator::new(Arc::clone(&store), &script(&dir, "exec sleep 30"));
        assert_eq!(orchestrator.respawn_dead().unwrap(), 1);
        assert!(orchestrator.supervisor_alive(&orphan).unwrap());
        assert_eq!(store.get(&finished).unwrap().unwrap().supervisor_pid, 0);

        orchestrator.kill_supervisor(&orphan).await.unwrap();
    }
}
