//! Child process plumbing: capped output capture, process-group signals,
//! exit classification.

use parking_lot::Mutex;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::debug;

/// Output kept per subagent; the rest is read and discarded
pub const MAX_OUTPUT_BYTES: usize = 128 * 1024;

/// Wait between SIGTERM and SIGKILL
pub const GRACE_PERIOD: Duration = Duration::from_millis(100);

/// How long a final drain may wait for the pipe to reach EOF
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
pub struct OutputBuffer {
    data: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl OutputBuffer {
    pub fn with_cap(cap: usize) -> Self {
        Self {
            data: Vec::new(),
            cap,
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.cap.saturating_sub(self.data.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.data.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

pub type SharedOutput = Arc<Mutex<OutputBuffer>>;

/// Read a child's output until EOF into a capped buffer.
///
/// Keeps reading past the cap so the child never blocks on a full pipe.
pub fn spawn_output_reader(mut stream: UnixStream, output: SharedOutput) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => output.lock().push(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Output pipe read failed: {}", e);
                    break;
                }
            }
        }
    })
}

/// Wait for the reader to hit EOF, giving up after a short bound
pub async fn drain_output(reader: &mut JoinHandle<()>) {
    if tokio::time::timeout(DRAIN_TIMEOUT, &mut *reader).await.is_err() {
        reader.abort();
    }
}

/// Send a signal to every process in a group. A vanished group is not an error.
pub fn signal_group(pgid: u32, signal: i32) -> io::Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(-(pgid as libc::pid_t), signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

/// Send a signal to a single process. A vanished process is not an error.
pub fn signal_process(pid: u32, signal: i32) -> io::Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

/// Whether any process in the group can still be signalled
pub fn group_alive(pgid: u32) -> bool {
    // SAFETY: signal 0 only probes for existence.
    unsafe { libc::kill(-(pgid as libc::pid_t), 0) == 0 }
}

/// Whether a process exists
pub fn process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only probes for existence.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Map an exit status to `Ok(())` for a clean exit or a description of the failure
pub fn classify_exit(status: ExitStatus) -> Result<(), String> {
    if let Some(code) = status.code() {
        if code == 0 {
            Ok(())
        } else {
            Err(format!("exited with code {}", code))
        }
    } else if let Some(signal) = status.signal() {
        Err(format!("killed by signal {}", signal))
    } else {
        Err("exited abnormally".to_string())
    }
}

/// SIGTERM the group, wait out the grace period, then SIGKILL and reap
pub async fn terminate_group(child: &mut Child, pgid: u32) -> io::Result<ExitStatus> {
    signal_group(pgid, libc::SIGTERM)?;
    if let Some(status) = child.try_wait()? {
        signal_group(pgid, libc::SIGKILL)?;
        return Ok(status);
    }

    tokio::time::sleep(GRACE_PERIOD).await;
    signal_group(pgid, libc::SIGKILL)?;
    child.wait().await
}

/// SIGKILL the group and reap the leader
pub async fn kill_group(child: &mut Child, pgid: u32) -> io::Result<ExitStatus> {
    signal_group(pgid, libc::SIGKILL)?;
    child.wait().await
}
