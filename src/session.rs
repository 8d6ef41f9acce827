//! Model Session
//!
//! The supervisor talks to the model through `ModelSession`: one turn at a
//! time, each classified as OK, context exhausted, or a generic failure.
//! `CommandSession` backs it with an external CLI that reads the rendered
//! transcript on stdin and answers on stdout.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::tokenizer::{BudgetCheck, TokenCounter};

/// Reply tokens reserved when checking the context window
const RESERVED_OUTPUT_TOKENS: usize = 4096;

/// Largest reply kept from the model command
const MAX_REPLY_BYTES: usize = 1024 * 1024;

const MAX_STDERR_BYTES: usize = 64 * 1024;

/// Phrases model CLIs use when the prompt overflows the window
const CONTEXT_FULL_MARKERS: &[&str] = &[
    "context length",
    "context window",
    "prompt is too long",
    "maximum context",
];

/// Classified result of one model turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Ok,
    ContextFull,
    Error(i32),
}

impl TurnOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, TurnOutcome::Ok)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Model command is empty")]
    EmptyCommand,

    #[error("Failed to start model command: {0}")]
    Spawn(std::io::Error),

    #[error("Model command timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Model-interaction collaborator
#[async_trait]
pub trait ModelSession: Send {
    /// Add a user turn and run the model on it
    async fn process_message(&mut self, text: &str) -> TurnOutcome;

    /// Add a system turn without running the model
    fn append_system_message(&mut self, text: &str);

    /// Run the model on the transcript as it stands
    async fn continue_session(&mut self) -> TurnOutcome;
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEntry {
    pub role: String,
    pub content: String,
}

/// Session backed by an external model command
pub struct CommandSession {
    program: String,
    args: Vec<String>,
    system_prompt: Option<String>,
    transcript: Vec<TranscriptEntry>,
    counter: TokenCounter,
    context_limit: usize,
    timeout: Duration,
}

impl CommandSession {
    /// `command` is split on whitespace: program first, then arguments
    pub fn new(command: &str, context_limit: usize, timeout: Duration) -> Result<Self, SessionError> {
        let mut parts = command.split_whitespace().map(String::from);
        let program = parts.next().ok_or(SessionError::EmptyCommand)?;

        Ok(Self {
            program,
            args: parts.collect(),
            system_prompt: None,
            transcript: Vec::new(),
            counter: TokenCounter::new(),
            context_limit,
            timeout,
        })
    }

    pub fn with_system_prompt(mut self, prompt: &str) -> Self {
        self.system_prompt = Some(prompt.to_string());
        self
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    fn push(&mut self, role: &str, content: &str) {
        self.transcript.push(TranscriptEntry {
            role: role.to_string(),
            content: content.to_string(),
        });
    }

    /// Transcript as the text fed to the model command
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(prompt) = &self.system_prompt {
            out.push_str("[system]\n");
            out.push_str(prompt);
            out.push_str("\n\n");
        }
        for entry in &self.transcript {
            out.push_str(&format!("[{}]\n{}\n\n", entry.role, entry.content));
        }
        out
    }

    fn context_check(&self) -> BudgetCheck {
        let system = self.system_prompt.as_deref().map(|p| ("system", p));
        let entries = self
            .transcript
            .iter()
            .map(|e| (e.role.as_str(), e.content.as_str()));
        self.counter
            .check_context(system.into_iter().chain(entries), RESERVED_OUTPUT_TOKENS, self.context_limit)
    }

    async fn run_turn(&mut self) -> TurnOutcome {
        let check = self.context_check();
        if check.should_block() {
            info!(
                "Transcript at ~{} tokens exceeds the context window",
                TokenCounter::format_tokens(check.estimated_tokens())
            );
            return TurnOutcome::ContextFull;
        }
        if check.should_warn() {
            warn!(
                "Transcript at ~{} tokens is close to the context window",
                TokenCounter::format_tokens(check.estimated_tokens())
            );
        }

        let input = self.render();
        let result = run_command(&self.program, &self.args, &input, self.timeout, MAX_REPLY_BYTES).await;
        match result.map(|out| (out.code, out.stdout, out.stderr)) {
            Ok((0, reply, _)) => {
                debug!("Model replied with {} bytes", reply.len());
                self.push("assistant", reply.trim());
                TurnOutcome::Ok
            }
            Ok((code, reply, stderr)) => {
                let lowered = format!("{}\n{}", reply, stderr).to_lowercase();
                if CONTEXT_FULL_MARKERS.iter().any(|m| lowered.contains(m)) {
                    info!("Model command reported context exhaustion");
                    TurnOutcome::ContextFull
                } else {
                    warn!("Model command exited with code {}: {}", code, stderr.trim());
                    TurnOutcome::Error(if code == 0 { 1 } else { code })
                }
            }
            Err(e) => {
                warn!("Model turn failed: {}", e);
                TurnOutcome::Error(-1)
            }
        }
    }
}

#[async_trait]
impl ModelSession for CommandSession {
    async fn process_message(&mut self, text: &str) -> TurnOutcome {
        self.push("user", text);
        self.run_turn().await
    }

    fn append_system_message(&mut self, text: &str) {
        self.push("system", text);
    }

    async fn continue_session(&mut self) -> TurnOutcome {
        self.run_turn().await
    }
}

/// Captured result of a piped command run
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Run `program` with `input` on stdin, collecting at most `max_stdout` bytes of stdout.
///
/// The child is killed if the timeout expires.
pub(crate) async fn run_command(
    program: &str,
    args: &[String],
    input: &str,
    timeout: Duration,
    max_stdout: usize,
) -> Result<CommandOutput, SessionError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(SessionError::Spawn)?;

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let input = input.as_bytes().to_vec();

    let result = tokio::time::timeout(timeout, async move {
        let write_in = async {
            if let Some(mut stdin) = stdin {
                // A command that ignores its input is not an error
                match stdin.write_all(&input).await {
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                    other => other?,
                }
                let _ = stdin.shutdown().await;
            }
            Ok::<_, std::io::Error>(())
        };
        let read_out = async {
            let mut out = Vec::new();
            if let Some(stdout) = stdout {
                stdout.take(max_stdout as u64).read_to_end(&mut out).await?;
            }
            Ok::<_, std::io::Error>(out)
        };
        let read_err = async {
            let mut err = Vec::new();
            if let Some(stderr) = stderr {
                stderr.take(MAX_STDERR_BYTES as u64).read_to_end(&mut err).await?;
            }
            Ok::<_, std::io::Error>(err)
        };
        let ((), out, err) = tokio::try_join!(write_in, read_out, read_err)?;

        let status = child.wait().await?;
        Ok::<_, std::io::Error>((status.code().unwrap_or(-1), out, err))
    })
    .await;

    match result {
        Ok(Ok((code, out, err))) => Ok(CommandOutput {
            code,
            stdout: String::from_utf8_lossy(&out).into_owned(),
            stderr: String::from_utf8_lossy(&err).into_owned(),
        }),
        Ok(Err(e)) => Err(SessionError::Io(e)),
        Err(_) => Err(SessionError::Timeout(timeout)),
    }
}
