//! Connection counting for drain coordination.
//!
//! Every accepted connection holds a [`ConnectionGuard`]. The guard bumps the
//! shared counter when created and decrements it exactly once when released or
//! dropped. Draining waits until the counter reaches zero.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Shared count of open connections.
#[derive(Debug, Default)]
pub struct ConnectionCounter {
    count: AtomicUsize,
    drained: Notify,
}

impl ConnectionCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new connection. The slot is released when the guard drops.
    pub fn register(self: &Arc<Self>) -> ConnectionGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            counter: Arc::clone(self),
        }
    }

    /// Current number of open connections.
    pub fn active(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait until no connections are open.
    pub async fn wait_for_zero(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            // Register interest before checking so a release in between is not lost.
            notified.as_mut().enable();

            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// One open connection's slot in a [`ConnectionCounter`].
#[derive(Debug)]
pub struct ConnectionGuard {
    counter: Arc<ConnectionCounter>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let prev = self.counter.count.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.counter.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_connection_guard_counting() {
        let counter = ConnectionCounter::new();
        assert_eq!(counter.active(), 0);

        let mut guards: Vec<_> = (0..10).map(|_| counter.register()).collect();
        assert_eq!(counter.active(), 10);

        guards.truncate(5);
        assert_eq!(counter.active(), 5);

        drop(guards);
        assert_eq!(counter.active(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_zero_returns_immediately_when_idle() {
        let counter = ConnectionCounter::new();
        tokio::time::timeout(Duration::from_secs(1), counter.wait_for_zero())
            .await
            .expect("idle counter drains immediately");
    }

    #[tokio::test]
    async fn test_wait_for_zero_blocks_until_last_release() {
        let counter = ConnectionCounter::new();
        let first = counter.register();
        let second = counter.register();

        let waiter = {
            let counter = Arc::clone(&counter);
            tokio::spawn(async move { counter.wait_for_zero().await })
        };

        drop(first);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "one connection is still open");

        drop(second);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("drain completes after last release")
            .unwrap();
    }

    #[tokio::test]
    async fn test_counter_survives_concurrent_churn() {
        let counter = ConnectionCounter::new();
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let counter = Arc::clone(&counter);
            tasks.push(tokio::spawn(async move {
                for _ in 0..100 {
                    let guard = counter.register();
                    tokio::task::yield_now().await;
                    drop(guard);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(counter.active(), 0);
    }
}
