//! Cooperative shutdown signal.
//!
//! The flag is a `watch` channel. Long waits are split into slices of at most
//! one second so a stop request is noticed promptly.

use std::time::Duration;
use tokio::sync::watch;

/// Longest uninterrupted sleep.
pub const SLEEP_SLICE: Duration = Duration::from_secs(1);

/// Sending half, owned by whoever handles process signals.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger(watch::Sender<bool>);

impl ShutdownTrigger {
    pub fn trigger(&self) {
        let _ = self.0.send(true);
    }
}

/// Receiving half, cloned into every component that waits.
#[derive(Debug, Clone)]
pub struct Shutdown(watch::Receiver<bool>);

/// Creates a connected trigger/listener pair.
pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger(tx), Shutdown(rx))
}

impl Shutdown {
    /// A listener that never fires.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Keep the value readable after the sender is gone.
        drop(tx);
        Shutdown(rx)
    }

    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Sleeps for `total` in slices of at most [`SLEEP_SLICE`].
    ///
    /// Returns `false` if shutdown was requested before the time elapsed.
    pub async fn sleep(&self, total: Duration) -> bool {
        let mut remaining = total;
        while !remaining.is_zero() {
            if self.is_triggered() {
                return false;
            }
            let slice = remaining.min(SLEEP_SLICE);
            tokio::time::sleep(slice).await;
            remaining = remaining.saturating_sub(slice);
        }
        !self.is_triggered()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_sleep_completes_without_signal() {
        let (_trigger, shutdown) = channel();
        assert!(shutdown.sleep(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_sleep_returns_early_after_trigger() {
        let (trigger, shutdown) = channel();
        let started = Instant::now();

        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.sleep(Duration::from_secs(600)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.trigger();

        let completed = waiter.await.unwrap();
        assert!(!completed);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_never_is_not_triggered() {
        assert!(!Shutdown::never().is_triggered());
    }
}
