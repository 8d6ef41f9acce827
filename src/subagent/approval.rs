//! Subagent Approval Protocol
//!
//! A subagent asks its parent before running a sensitive tool. Requests and
//! decisions are newline-delimited JSON over a socket the parent hands the
//! child at spawn time:
//!
//! - child → parent: `{"request_id": "...", "tool": "...", "arguments": {...}}`
//! - parent → child: `{"request_id": "...", "approved": true, "reason": null}`

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::os::fd::FromRawFd;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tracing::warn;

use super::SubagentError;

/// Environment variable holding the approval socket fd in the child
pub const APPROVAL_FD_ENV: &str = "SUBAGENT_APPROVAL_FD";

/// Environment variable holding the parent agent id in the child
pub const PARENT_ID_ENV: &str = "SUBAGENT_PARENT_ID";

/// Fixed descriptor the approval socket is installed at in the child
pub const CHILD_APPROVAL_FD: i32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub tool: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub request_id: String,
    pub approved: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ApprovalDecision {
    pub fn approve(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            approved: true,
            reason: None,
        }
    }

    pub fn deny(request_id: &str, reason: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            approved: false,
            reason: Some(reason.to_string()),
        }
    }
}

/// A request tagged with the subagent it came from
#[derive(Debug, Clone)]
pub struct ApprovalEvent {
    pub subagent_id: String,
    pub request: ApprovalRequest,
}

/// Decides whether a subagent may run a tool
#[async_trait]
pub trait PolicyGate: Send + Sync {
    async fn evaluate(&self, subagent_id: &str, request: &ApprovalRequest) -> ApprovalDecision;
}

/// Refuses everything
pub struct DenyAllGate;

#[async_trait]
impl PolicyGate for DenyAllGate {
    async fn evaluate(&self, _subagent_id: &str, request: &ApprovalRequest) -> ApprovalDecision {
        ApprovalDecision::deny(&request.request_id, "denied by policy")
    }
}

/// Approves everything
pub struct AllowAllGate;

#[async_trait]
impl PolicyGate for AllowAllGate {
    async fn evaluate(&self, _subagent_id: &str, request: &ApprovalRequest) -> ApprovalDecision {
        ApprovalDecision::approve(&request.request_id)
    }
}

/// Forward every request line from one subagent onto the shared channel.
///
/// Ends when the child closes its end or the manager drops the receiver.
pub(crate) async fn forward_requests(
    subagent_id: String,
    read_half: OwnedReadHalf,
    tx: tokio::sync::mpsc::UnboundedSender<ApprovalEvent>,
) {
    let mut lines = BufReader::new(read_half).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<ApprovalRequest>(line) {
            Ok(request) => {
                let event = ApprovalEvent {
                    subagent_id: subagent_id.clone(),
                    request,
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Malformed approval request from {}: {}", subagent_id, e);
            }
        }
    }
}

/// Write one decision line back to a subagent
pub(crate) async fn send_decision(
    write_half: &mut OwnedWriteHalf,
    decision: &ApprovalDecision,
) -> Result<(), SubagentError> {
    let mut line = serde_json::to_string(decision)?;
    line.push('\n');
    write_half.write_all(line.as_bytes()).await?;
    write_half.flush().await?;
    Ok(())
}

/// Child side of the approval channel
pub struct ApprovalClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ApprovalClient {
    /// Attach to the socket inherited from the parent, if any.
    ///
    /// Must only be called once per process: the descriptor is adopted.
    pub fn from_env() -> Option<Self> {
        let fd: i32 = std::env::var(APPROVAL_FD_ENV).ok()?.parse().ok()?;
        if fd <= 2 {
            return None;
        }
        // SAFETY: the parent installed a socket at this descriptor for us and
        // nothing else in the process owns it.
        let std_stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
        std_stream.set_nonblocking(true).ok()?;
        let stream = UnixStream::from_std(std_stream).ok()?;
        Some(Self::from_stream(stream))
    }

    pub fn from_stream(stream: UnixStream) -> Self {
        let (read_half, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    /// Ask the parent and wait for its decision
    pub async fn request(
        &mut self,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<ApprovalDecision, SubagentError> {
        let request = ApprovalRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            tool: tool.to_string(),
            arguments,
        };
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;

        loop {
            let mut reply = String::new();
            if self.reader.read_line(&mut reply).await? == 0 {
                return Err(SubagentError::ApprovalChannelClosed);
            }
            let decision: ApprovalDecision = serde_json::from_str(reply.trim())?;
            if decision.request_id == request.request_id {
                return Ok(decision);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gates() {
        let request = ApprovalRequest {
            request_id: "r1".to_string(),
            tool: "shell".to_string(),
            arguments: serde_json::json!({"command": "ls"}),
        };

        let denied = DenyAllGate.evaluate("sub", &request).await;
        assert!(!denied.approved);
        assert_eq!(denied.request_id, "r1");
        assert!(denied.reason.is_some());

        let approved = AllowAllGate.evaluate("sub", &request).await;
        assert!(approved.approved);
    }

    #[tokio::test]
    async fn test_request_round_trip_over_socket() {
        let (parent, child) = UnixStream::pair().unwrap();
        let (read_half, mut write_half) = parent.into_split();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(forward_requests("sub-1".to_string(), read_half, tx));

        let mut client = ApprovalClient::from_stream(child);
        let ask = tokio::spawn(async move {
            client
                .request("write_file", serde_json::json!({"path": "/tmp/x"}))
                .await
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.subagent_id, "sub-1");
        assert_eq!(event.request.tool, "write_file");

        let decision = ApprovalDecision::deny(&event.request.request_id, "no writes");
        send_decision(&mut write_half, &decision).await.unwrap();

        let answer = ask.await.unwrap().unwrap();
        assert!(!answer.approved);
        assert_eq!(answer.reason.as_deref(), Some("no writes"));
    }

    #[test]
    fn test_arguments_default_when_missing() {
        let request: ApprovalRequest =
            serde_json::from_str(r#"{"request_id":"a","tool":"t"}"#).unwrap();
        assert!(request.arguments.is_null());
    }
}
