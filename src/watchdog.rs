use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogStatus {
    /// No notification arrived within the timeout.
    Stalled,
    /// A notification arrived while stalled.
    Recovered,
}

#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    /// How long to wait between notifications before reporting a stall.
    pub timeout: Duration,
    /// How long to wait for the very first notification. Defaults to
    /// `timeout` when constructed via [`WatchdogConfig::with_timeout`].
    pub grace: Duration,
}

impl WatchdogConfig {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            grace: timeout,
        }
    }
}

enum Signal {
    Notify,
    Close,
}

/// Oneshot-timeout channel that is reset on every `notify`. Transitions
/// between the active and stalled states are reported on the status stream;
/// the stream closes when the watchdog is closed.
#[derive(Debug, Clone)]
pub struct Watchdog {
    tx: mpsc::UnboundedSender<Signal>,
    closed: Arc<AtomicBool>,
}

impl Watchdog {
    pub fn start(config: WatchdogConfig) -> (Self, mpsc::UnboundedReceiver<WatchdogStatus>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(async move {
            let mut stalled = false;
            let mut deadline = config.grace;
            loop {
                match tokio::time::timeout(deadline, rx.recv()).await {
                    Ok(Some(Signal::Notify)) => {
                        if stalled {
                            stalled = false;
                            let _ = status_tx.send(WatchdogStatus::Recovered);
                        }
                    }
                    Ok(Some(Signal::Close)) | Ok(None) => break,
                    Err(_) => {
                        if !stalled {
                            stalled = true;
                            let _ = status_tx.send(WatchdogStatus::Stalled);
                        }
                    }
                }
                deadline = config.timeout;
            }
        });

        (Self { tx, closed }, status_rx)
    }

    /// Resets the timer. Returns `false` if the watchdog is already closed.
    pub fn notify(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.tx.send(Signal::Notify).is_ok()
    }

    /// Shuts the watchdog down and closes its status stream. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(Signal::Close);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(ms: u64) -> WatchdogConfig {
        WatchdogConfig::with_timeout(Duration::from_millis(ms))
    }

    #[tokio::test(start_paused = true)]
    async fn stalls_without_notifications() {
        let (_watchdog, mut status) = Watchdog::start(config(100));
        assert_eq!(status.recv().await, Some(WatchdogStatus::Stalled));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_on_notify_while_stalled() {
        let (watchdog, mut status) = Watchdog::start(config(100));
        assert_eq!(status.recv().await, Some(WatchdogStatus::Stalled));

        assert!(watchdog.notify());
        assert_eq!(status.recv().await, Some(WatchdogStatus::Recovered));
    }

    #[tokio::test(start_paused = true)]
    async fn stays_active_while_notified() {
        let (watchdog, mut status) = Watchdog::start(config(100));
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(watchdog.notify());
        }
        assert!(status.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn close_ends_stream_and_rejects_notify() {
        let (watchdog, mut status) = Watchdog::start(config(100));
        watchdog.close();
        watchdog.close(); // idempotent

        assert!(!watchdog.notify());
        assert_eq!(status.recv().await, None);
    }
}
