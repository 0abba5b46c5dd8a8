//! Bounded concurrency for outbound LLM work.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Why a slot could not be obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SlotError {
    /// The manager was closed.
    #[error("concurrency manager is closed")]
    Closed,
    /// The cancellation token fired while waiting for a slot.
    #[error("cancelled while waiting for a concurrency slot")]
    Cancelled,
}

/// Caps how many tasks run at once.
///
/// Cloning shares the same slots. Slots are released when the task's future
/// completes, fails, or is dropped.
#[derive(Debug, Clone)]
pub struct ConcurrencyManager {
    slots: Arc<Semaphore>,
    limit: usize,
}

impl ConcurrencyManager {
    /// Creates a manager allowing `limit` concurrent tasks. Returns `None` for zero.
    pub fn new(limit: usize) -> Option<Self> {
        if limit == 0 {
            return None;
        }
        Some(Self {
            slots: Arc::new(Semaphore::new(limit)),
            limit,
        })
    }

    /// Configured limit.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Tasks currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.limit - self.slots.available_permits()
    }

    /// Runs `task` once a slot is free.
    pub async fn run_with_limit<F, T>(&self, task: F) -> Result<T, SlotError>
    where
        F: Future<Output = T>,
    {
        let _permit = self.slots.acquire().await.map_err(|_| SlotError::Closed)?;
        trace!(in_flight = self.in_flight(), limit = self.limit, "Concurrency slot acquired");
        Ok(task.await)
    }

    /// Runs `task` once a slot is free, unless `token` fires first.
    ///
    /// Cancellation only interrupts the wait; a task that started runs to
    /// completion and observes the token itself if it needs to.
    pub async fn run_with_limit_cancellable<F, T>(
        &self,
        token: &CancellationToken,
        task: F,
    ) -> Result<T, SlotError>
    where
        F: Future<Output = T>,
    {
        let _permit = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(SlotError::Cancelled),
            permit = self.slots.acquire() => permit.map_err(|_| SlotError::Closed)?,
        };
        Ok(task.await)
    }

    /// Rejects all waiting and future tasks. Running tasks are unaffected.
    pub fn close(&self) {
        self.slots.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    async fn instrumented(limit: usize, tasks: usize) -> usize {
        let manager = ConcurrencyManager::new(limit).unwrap();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let runs = (0..tasks).map(|_| {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            manager.run_with_limit(async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            })
        });
        for result in futures::future::join_all(runs).await {
            result.unwrap();
        }
        assert_eq!(manager.in_flight(), 0);
        peak.load(Ordering::SeqCst)
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_limit() {
        assert_eq!(instrumented(3, 12).await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn limit_one_is_sequential() {
        assert_eq!(instrumented(1, 5).await, 1);
    }

    #[test]
    fn zero_limit_is_rejected() {
        assert!(ConcurrencyManager::new(0).is_none());
    }

    #[tokio::test]
    async fn slot_released_when_task_fails() {
        let manager = ConcurrencyManager::new(1).unwrap();
        let failed: Result<Result<(), &str>, _> = manager.run_with_limit(async { Err("boom") }).await;
        assert_eq!(failed.unwrap(), Err("boom"));
        assert_eq!(manager.run_with_limit(async { 7 }).await.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_abandons_wait() {
        let manager = ConcurrencyManager::new(1).unwrap();
        let token = CancellationToken::new();
        let holder = manager.clone();
        let blocker = tokio::spawn(async move {
            holder
                .run_with_limit(tokio::time::sleep(Duration::from_secs(60)))
                .await
        });
        tokio::task::yield_now().await;
        token.cancel();
        let waited = manager.run_with_limit_cancellable(&token, async { 1 }).await;
        assert_eq!(waited, Err(SlotError::Cancelled));
        blocker.abort();
    }

    #[tokio::test]
    async fn closed_manager_rejects_work() {
        let manager = ConcurrencyManager::new(2).unwrap();
        manager.close();
        assert_eq!(manager.run_with_limit(async { 1 }).await, Err(SlotError::Closed));
    }
}
