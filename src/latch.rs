//! Manual-reset event latch for async coordination.

use std::time::Duration;
use tokio::sync::watch;

/// A manual-reset boolean synchronizer.
///
/// Once [`set`](Latch::set), every waiter wakes and subsequent waits return
/// immediately until [`clear`](Latch::clear) is called. Construction yields a
/// cleared latch.
///
/// Spurious wakeups are permitted: a waiter that observes the latch set may
/// find the guarded condition already consumed by another task, so callers
/// must re-check their predicate under their own lock after waking.
#[derive(Debug)]
pub(crate) struct Latch {
    state: watch::Sender<bool>,
}

impl Latch {
    /// Create a cleared latch.
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self { state }
    }

    /// Set the latch, waking all waiters. Idempotent.
    pub fn set(&self) {
        self.state.send_replace(true);
    }

    /// Clear the latch. Idempotent.
    pub fn clear(&self) {
        self.state.send_replace(false);
    }

    /// Non-blocking read of the latch state.
    pub fn is_set(&self) -> bool {
        *self.state.borrow()
    }

    /// Wait up to `timeout` for the latch to become set.
    ///
    /// Returns `true` iff the latch is set at the moment of return, whether it
    /// was set on entry or became set during the wait.
    pub async fn wait_for(&self, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        let result = tokio::time::timeout(timeout, rx.wait_for(|set| *set)).await;
        match result {
            Ok(Ok(_)) => true,
            // The sender lives in self, so the channel cannot close while
            // we are borrowed; treat it as "not set" regardless.
            Ok(Err(_)) => false,
            Err(_) => self.is_set(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[tokio::test]
    async fn starts_cleared() {
        let latch = Latch::new();
        assert!(!latch.is_set());
        assert!(!latch.wait_for(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn set_before_wait_returns_immediately() {
        let latch = Latch::new();
        latch.set();

        let start = Instant::now();
        assert!(latch.wait_for(Duration::from_secs(5)).await);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn set_and_clear_are_idempotent() {
        let latch = Latch::new();
        latch.set();
        latch.set();
        assert!(latch.is_set());
        latch.clear();
        latch.clear();
        assert!(!latch.is_set());
    }

    #[tokio::test]
    async fn set_during_wait_wakes_waiter() {
        let latch = Arc::new(Latch::new());

        let waiter = {
            let latch = Arc::clone(&latch);
            tokio::spawn(async move { latch.wait_for(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        latch.set();

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_times_out_when_never_set() {
        let latch = Latch::new();

        let start = Instant::now();
        assert!(!latch.wait_for(Duration::from_millis(100)).await);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(600));
    }

    #[tokio::test]
    async fn wakes_all_waiters() {
        let latch = Arc::new(Latch::new());

        let mut waiters = Vec::new();
        for _ in 0..4 {
            let latch = Arc::clone(&latch);
            waiters.push(tokio::spawn(async move {
                latch.wait_for(Duration::from_secs(5)).await
            }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        latch.set();

        for waiter in waiters {
            assert!(waiter.await.unwrap());
        }
    }
}
