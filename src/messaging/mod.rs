//! Inter-agent Messaging
//!
//! What the supervisor loop sees of the message system:
//! - a wakeup it can await alongside subagent events
//! - an idempotent way to clear that wakeup
//! - a bundle of pending messages rendered as a system turn

pub mod notifier;
pub mod poller;

pub use notifier::Notifier;
pub use poller::{MessagePoller, DEFAULT_POLL_INTERVAL};

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::store::{Message, SqliteMessageStore};

/// Most messages of each kind pulled into one bundle
pub const MAX_MESSAGES_PER_KIND: usize = 20;

/// Pending inbound messages fetched in one go
#[derive(Debug, Clone, Default)]
pub struct NotificationBundle {
    pub direct: Vec<Message>,
    pub channel: Vec<Message>,
}

impl NotificationBundle {
    pub fn total_count(&self) -> usize {
        self.direct.len() + self.channel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_count() == 0
    }

    /// Render the bundle as text for a system turn. `None` when empty.
    pub fn format_for_llm(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }

        let mut out = String::from("[INCOMING AGENT MESSAGES]\n\n");
        for msg in &self.direct {
            out.push_str(&format!("Direct from {}: \"{}\"\n", msg.sender, msg.content));
        }
        for msg in &self.channel {
            out.push_str(&format!(
                "Channel #{} from {}: \"{}\"\n",
                msg.channel.as_deref().unwrap_or("unknown"),
                msg.sender,
                msg.content
            ));
        }
        out.push_str("\nPlease review and respond to these messages.\n");
        Some(out)
    }
}

/// Messaging collaborator consumed by the supervisor
#[async_trait]
pub trait Messaging: Send + Sync {
    /// Resolves once a wakeup is pending
    async fn notified(&self);

    /// Drop pending wakeups and reset counts
    fn clear_notification(&self);

    /// Fetch (and mark read) pending messages for an agent
    fn fetch_pending_bundle(&self, agent_id: &str) -> Result<NotificationBundle>;
}

/// Message store plus its background poller
pub struct MessageHub {
    store: Arc<SqliteMessageStore>,
    poller: MessagePoller,
}

impl MessageHub {
    /// Create the hub and start polling for `agent_id`
    pub fn start(agent_id: &str, store: Arc<SqliteMessageStore>, interval: Duration) -> Self {
        let poller = MessagePoller::new(agent_id, Arc::clone(&store), interval);
        poller.start();
        Self { store, poller }
    }

    pub fn store(&self) -> &Arc<SqliteMessageStore> {
        &self.store
    }

    pub fn poller(&self) -> &MessagePoller {
        &self.poller
    }

    pub async fn stop(&self) {
        self.poller.stop().await;
    }
}

#[async_trait]
impl Messaging for MessageHub {
    async fn notified(&self) {
        self.poller.notifier().notified().await
    }

    fn clear_notification(&self) {
        self.poller.clear_notification();
    }

    fn fetch_pending_bundle(&self, agent_id: &str) -> Result<NotificationBundle> {
        let (direct, channel) = self.store.fetch_pending(agent_id, MAX_MESSAGES_PER_KIND)?;
        Ok(NotificationBundle { direct, channel })
    }
}
