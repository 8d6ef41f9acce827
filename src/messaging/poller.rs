//! Inbound Message Poller
//!
//! Background task that checks the message store for an agent on a fixed
//! interval and raises the notifier whenever anything is pending.
//!
//! - Counts are published under a mutex so readers never race the task
//! - The has-pending flag is only set after a wakeup was queued
//! - A wakeup is sent on every detection, even if one is already pending,
//!   so a `clear_notification` racing a poll can't strand the flag

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Notifier;
use crate::store::{PendingCounts, SqliteMessageStore};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);

struct PollerState {
    has_pending: AtomicBool,
    counts: Mutex<PendingCounts>,
    notifier: Notifier,
}

pub struct MessagePoller {
    agent_id: String,
    interval: Duration,
    store: Arc<SqliteMessageStore>,
    state: Arc<PollerState>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MessagePoller {
    pub fn new(agent_id: &str, store: Arc<SqliteMessageStore>, interval: Duration) -> Self {
        let interval = if interval.is_zero() {
            DEFAULT_POLL_INTERVAL
        } else {
            interval
        };

        Self {
            agent_id: agent_id.to_string(),
            interval,
            store,
            state: Arc::new(PollerState {
                has_pending: AtomicBool::new(false),
                counts: Mutex::new(PendingCounts::default()),
                notifier: Notifier::new(),
            }),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Start the background task. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }

        let agent_id = self.agent_id.clone();
        let store = Arc::clone(&self.store);
        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();
        let interval = self.interval;

        *handle = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let counts = match store.pending_counts(&agent_id) {
                    Ok(counts) => counts,
                    Err(e) => {
                        warn!("Message poll for {} failed: {}", agent_id, e);
                        continue;
                    }
                };

                if counts.total() > 0 {
                    *state.counts.lock() = counts;
                    if state.notifier.signal() {
                        state.has_pending.store(true, Ordering::SeqCst);
                    }
                    debug!(
                        "{} pending for {} ({} direct, {} channel)",
                        counts.total(),
                        agent_id,
                        counts.direct,
                        counts.channel
                    );
                }
            }
            debug!("Message poller for {} stopped", agent_id);
        }));
    }

    /// Stop the background task and wait for it to finish
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn has_pending(&self) -> bool {
        self.state.has_pending.load(Ordering::SeqCst)
    }

    /// Last counts seen by the poller
    pub fn pending(&self) -> PendingCounts {
        *self.state.counts.lock()
    }

    pub fn notifier(&self) -> &Notifier {
        &self.state.notifier
    }

    /// Drain queued wakeups and reset the flag and counts
    pub fn clear_notification(&self) {
        self.state.notifier.drain();
        self.state.has_pending.store(false, Ordering::SeqCst);
        *self.state.counts.lock() = PendingCounts::default();
    }
}

impl Drop for MessagePoller {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_poller_detects_pending_messages() {
        let store = Arc::new(SqliteMessageStore::in_memory().unwrap());
        let poller = MessagePoller::new("supervisor", Arc::clone(&store), Duration::from_millis(10));
        poller.start();

        store.send_direct("sub-1", "supervisor", "hello").unwrap();

        tokio::time::timeout(Duration::from_secs(2), poller.notifier().notified())
            .await
            .unwrap();
        assert!(poller.has_pending());
        assert_eq!(poller.pending().direct, 1);

        // Consume the message so the poller stops re-raising it
        store.fetch_pending("supervisor", 20).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        poller.clear_notification();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!poller.has_pending());
        assert_eq!(poller.pending(), PendingCounts::default());

        poller.stop().await;
    }

    #[tokio::test]
    async fn test_poller_quiet_without_messages() {
        let store = Arc::new(SqliteMessageStore::in_memory().unwrap());
        let poller = MessagePoller::new("idle", store, Duration::from_millis(10));
        poller.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!poller.has_pending());
        assert!(!poller.notifier().is_pending());
        poller.stop().await;
    }
}
