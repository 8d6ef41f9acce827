//! Wakeup channel between the message poller and the supervisor loop

use tokio::sync::{mpsc, Mutex};

const NOTIFIER_CAPACITY: usize = 64;

/// Bounded, lossy signal channel.
///
/// `signal` never blocks: when the buffer is full a wakeup is already
/// pending, so dropping the extra one loses nothing.
pub struct Notifier {
    tx: mpsc::Sender<()>,
    rx: Mutex<mpsc::Receiver<()>>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(NOTIFIER_CAPACITY);
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Queue a wakeup. Returns false only if the receiver is gone.
    pub fn signal(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => true,
            Err(mpsc::error::TrySendError::Closed(())) => false,
        }
    }

    /// Wait until at least one wakeup is buffered. Does not consume it.
    pub async fn notified(&self) {
        let mut rx = self.rx.lock().await;
        if let Some(()) = rx.recv().await {
            // Put it back so `drain` stays the only consumer
            let _ = self.tx.try_send(());
        }
    }

    /// Discard every buffered wakeup; returns how many were dropped
    pub fn drain(&self) -> usize {
        let Ok(mut rx) = self.rx.try_lock() else {
            return 0;
        };
        let mut drained = 0;
        while rx.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }

    /// Whether a wakeup is buffered right now
    pub fn is_pending(&self) -> bool {
        self.tx.capacity() < NOTIFIER_CAPACITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signal_then_drain() {
        let notifier = Notifier::new();
        assert!(!notifier.is_pending());

        notifier.signal();
        notifier.signal();
        assert!(notifier.is_pending());

        tokio::time::timeout(Duration::from_millis(100), notifier.notified())
            .await
            .unwrap();
        assert!(notifier.is_pending());

        assert_eq!(notifier.drain(), 2);
        assert!(!notifier.is_pending());
        assert_eq!(notifier.drain(), 0);
    }

    #[tokio::test]
    async fn test_signal_never_blocks_when_full() {
        let notifier = Notifier::new();
        for _ in 0..(NOTIFIER_CAPACITY * 2) {
            assert!(notifier.signal());
        }
        assert_eq!(notifier.drain(), NOTIFIER_CAPACITY);
    }

    #[tokio::test]
    async fn test_notified_waits_without_signal() {
        let notifier = Notifier::new();
        let waited = tokio::time::timeout(Duration::from_millis(50), notifier.notified()).await;
        assert!(waited.is_err());
    }
}
