//! Bounded-parallelism execution gate.
//!
//! A counting semaphore plus an active-task gauge. Slots and the gauge are released
//! by RAII guards, so an error or a panic inside the task still frees its slot.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use taskclaw_core::error::{Result, TaskClawError};
use tokio::sync::{watch, Semaphore};

pub struct ConcurrencyController {
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
    active: Arc<watch::Sender<usize>>,
}

/// Decrements the active gauge when dropped.
struct ActiveGuard {
    active: Arc<watch::Sender<usize>>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl ConcurrencyController {
    pub fn new(max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        let (active, _) = watch::channel(0usize);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            active: Arc::new(active),
        }
    }

    /// Run `task` once a slot is free. Waits for the slot; never rejects while open.
    pub async fn execute_with_limit<F, T>(&self, task_id: &str, task: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| TaskClawError::Execution(format!("concurrency gate closed: {e}")))?;

        self.active.send_modify(|n| *n += 1);
        let _guard = ActiveGuard {
            active: self.active.clone(),
        };
        tracing::debug!(
            "🚦 Slot acquired for {} ({}/{} active)",
            task_id,
            self.active_count(),
            self.max_concurrency
        );

        Ok(task.await)
    }

    /// Wait until no task is active, or `timeout` elapses. Returns true when drained.
    pub async fn wait_all(&self, timeout: Duration) -> bool {
        let mut rx = self.active.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0)).await {
            Ok(Ok(_)) => true,
            Ok(Err(_)) => self.active_count() == 0,
            Err(_) => {
                tracing::warn!(
                    "⏳ Drain timed out after {:?} with {} task(s) still running",
                    timeout,
                    self.active_count()
                );
                false
            }
        }
    }

    pub fn active_count(&self) -> usize {
        *self.active.borrow()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }
}
