//! Priority-ordered ready queue.
//!
//! When many firings become ready at once (burst or manual triggers), they are queued
//! here as deferred constructors and started highest-priority first. Equal priorities
//! keep submission order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::Mutex;

/// A deferred task constructor. Nothing runs until it is dequeued.
pub type TaskFactory<T> = Box<dyn FnOnce() -> BoxFuture<'static, T> + Send>;

struct QueuedTask<T> {
    id: String,
    priority: i32,
    seq: u64,
    factory: TaskFactory<T>,
}

impl<T> PartialEq for QueuedTask<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for QueuedTask<T> {}

impl<T> PartialOrd for QueuedTask<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for QueuedTask<T> {
    /// Max-heap: higher priority first, then lower sequence number (FIFO).
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState<T> {
    heap: BinaryHeap<QueuedTask<T>>,
    next_seq: u64,
    total_processed: u64,
}

pub struct PriorityScheduler<T> {
    state: Mutex<QueueState<T>>,
}

impl<T: Send + 'static> PriorityScheduler<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                total_processed: 0,
            }),
        }
    }

    /// Queue a task constructor at `priority` (higher runs first).
    pub async fn schedule(&self, task_id: &str, factory: TaskFactory<T>, priority: i32) {
        let mut state = self.state.lock().await;
        let seq = state.next_seq;
        state.next_seq += 1;
        tracing::debug!(
            "📥 Ready queue enqueue: {} (priority {}, queued {})",
            task_id,
            priority,
            state.heap.len()
        );
        state.heap.push(QueuedTask {
            id: task_id.to_string(),
            priority,
            seq,
            factory,
        });
    }

    /// Run the highest-priority task. Returns its output and whether more are queued,
    /// or `None` when the queue is empty.
    pub async fn execute_next(&self) -> Option<(T, bool)> {
        let task = {
            let mut state = self.state.lock().await;
            state.heap.pop()?
        };
        tracing::debug!("▶️ Ready queue run: {} (priority {})", task.id, task.priority);

        let result = (task.factory)().await;

        let mut state = self.state.lock().await;
        state.total_processed += 1;
        Some((result, !state.heap.is_empty()))
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.heap.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.heap.is_empty()
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            queued: state.heap.len(),
            total_processed: state.total_processed,
        }
    }
}

impl<T: Send + 'static> Default for PriorityScheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub total_processed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn task(label: &'static str) -> TaskFactory<&'static str> {
        Box::new(move || async move { label }.boxed())
    }

    #[tokio::test]
    async fn test_priority_ordering() {
        let sched = PriorityScheduler::new();
        sched.schedule("low", task("low"), 1).await;
        sched.schedule("high", task("high"), 10).await;
        sched.schedule("mid", task("mid"), 5).await;

        assert_eq!(sched.execute_next().await, Some(("high", true)));
        assert_eq!(sched.execute_next().await, Some(("mid", true)));
        assert_eq!(sched.execute_next().await, Some(("low", false)));
        assert_eq!(sched.execute_next().await, None);
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let sched = PriorityScheduler::new();
        for label in ["a", "b", "c"] {
            sched.schedule(label, task(label), 3).await;
        }
        sched.schedule("urgent", task("urgent"), 9).await;
        sched.schedule("d", task("d"), 3).await;

        let mut order = Vec::new();
        while let Some((label, _)) = sched.execute_next().await {
            order.push(label);
        }
        assert_eq!(order, vec!["urgent", "a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_factory_deferred() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let sched: PriorityScheduler<()> = PriorityScheduler::new();
        sched
            .schedule(
                "deferred",
                Box::new(move || {
                    flag.store(true, Ordering::SeqCst);
                    async {}.boxed()
                }),
                0,
            )
            .await;

        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(sched.len().await, 1);
        sched.execute_next().await;
        assert!(ran.load(Ordering::SeqCst));

        let stats = sched.stats().await;
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.total_processed, 1);
    }
}
