//! In-memory execution cache.
//!
//! Per trigger: a bounded ring of recent outcomes (newest first on read) and a
//! TTL-expiring stats entry. Also home of next-fire-time computation.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::cron;
use crate::tasks::{ExecutionStatus, ExecutionSummary};

/// Rolling success figures over the recent window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerStats {
    /// Executed (non-skipped) runs in the window.
    pub sample_size: usize,
    pub success_rate: f64,
    pub avg_duration_seconds: f64,
    pub failures: usize,
}

impl TriggerStats {
    /// Compute from recent outcomes. Skipped firings never ran and are ignored.
    pub fn from_summaries(summaries: &[ExecutionSummary]) -> Self {
        let executed: Vec<&ExecutionSummary> = summaries
            .iter()
            .filter(|s| s.status.is_terminal() && s.status != ExecutionStatus::Skipped)
            .collect();
        if executed.is_empty() {
            return Self::default();
        }
        let failures = executed.iter().filter(|s| s.is_failure()).count();
        let total_duration: f64 = executed.iter().map(|s| s.duration_seconds).sum();
        let n = executed.len();
        Self {
            sample_size: n,
            success_rate: (n - failures) as f64 / n as f64,
            avg_duration_seconds: total_duration / n as f64,
            failures,
        }
    }
}

#[derive(Default)]
struct KeyCache {
    history: VecDeque<ExecutionSummary>,
    stats: Option<(TriggerStats, Instant)>,
}

pub struct ExecutionCache {
    capacity: usize,
    stats_ttl: Duration,
    entries: RwLock<HashMap<String, Arc<Mutex<KeyCache>>>>,
}

impl ExecutionCache {
    pub fn new(capacity: usize, stats_ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            stats_ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Add a finished firing; the oldest entry falls off once at capacity.
    pub async fn push(&self, event_name: &str, summary: ExecutionSummary) {
        let slot = self.slot(event_name).await;
        let mut cache = slot.lock().await;
        cache.history.push_front(summary);
        cache.history.truncate(self.capacity);
    }

    /// Recent outcomes, newest first.
    pub async fn recent(&self, event_name: &str, limit: Option<usize>) -> Vec<ExecutionSummary> {
        let Some(slot) = self.entries.read().await.get(event_name).cloned() else {
            return Vec::new();
        };
        let cache = slot.lock().await;
        let limit = limit.unwrap_or(self.capacity);
        cache.history.iter().take(limit).cloned().collect()
    }

    pub async fn set_stats(&self, event_name: &str, stats: TriggerStats) {
        let slot = self.slot(event_name).await;
        slot.lock().await.stats = Some((stats, Instant::now() + self.stats_ttl));
    }

    /// Cached stats if not yet expired.
    pub async fn get_stats(&self, event_name: &str) -> Option<TriggerStats> {
        let slot = self.entries.read().await.get(event_name).cloned()?;
        let mut cache = slot.lock().await;
        let fresh = cache
            .stats
            .as_ref()
            .filter(|(_, expires)| Instant::now() < *expires)
            .map(|(stats, _)| stats.clone());
        if fresh.is_none() {
            cache.stats = None;
        }
        fresh
    }

    /// Clear both the history ring and the stats entry for a trigger.
    pub async fn invalidate(&self, event_name: &str) {
        self.entries.write().await.remove(event_name);
    }

    /// Next fire instant strictly after `base`; `None` for an invalid expression.
    pub fn next_trigger_time(cron_expression: &str, base: DateTime<Utc>) -> Option<DateTime<Utc>> {
        cron::next_run_from_cron(cron_expression, base)
    }

    async fn slot(&self, event_name: &str) -> Arc<Mutex<KeyCache>> {
        if let Some(slot) = self.entries.read().await.get(event_name) {
            return slot.clone();
        }
        self.entries
            .write()
            .await
            .entry(event_name.to_string())
            .or_default()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn summary(id: &str, status: ExecutionStatus, duration: f64) -> ExecutionSummary {
        ExecutionSummary {
            execution_id: id.to_string(),
            status,
            decision_mode: None,
            triggered_at: Utc::now(),
            duration_seconds: duration,
            cost_usd: 0.0,
        }
    }

    #[tokio::test]
    async fn test_ring_is_bounded_newest_first() {
        let cache = ExecutionCache::new(3, Duration::from_secs(60));
        for i in 0..5 {
            cache
                .push("job", summary(&format!("e{i}"), ExecutionStatus::Success, 1.0))
                .await;
        }
        let ids: Vec<String> = cache
            .recent("job", None)
            .await
            .into_iter()
            .map(|s| s.execution_id)
            .collect();
        assert_eq!(ids, vec!["e4", "e3", "e2"]);
        assert_eq!(cache.recent("job", Some(1)).await.len(), 1);
        assert!(cache.recent("other", None).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_expire() {
        let cache = ExecutionCache::new(10, Duration::from_secs(30));
        let stats = TriggerStats {
            sample_size: 2,
            success_rate: 0.5,
            avg_duration_seconds: 1.0,
            failures: 1,
        };
        cache.set_stats("job", stats.clone()).await;
        assert_eq!(cache.get_stats("job").await, Some(stats));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cache.get_stats("job").await, None);
    }

    #[tokio::test]
    async fn test_invalidate_clears_both() {
        let cache = ExecutionCache::new(10, Duration::from_secs(30));
        cache.push("job", summary("e1", ExecutionStatus::Failed, 2.0)).await;
        cache.set_stats("job", TriggerStats::default()).await;

        cache.invalidate("job").await;
        assert!(cache.recent("job", None).await.is_empty());
        assert!(cache.get_stats("job").await.is_none());
    }

    #[test]
    fn test_stats_ignore_skipped() {
        let stats = TriggerStats::from_summaries(&[
            summary("a", ExecutionStatus::Success, 2.0),
            summary("b", ExecutionStatus::Skipped, 0.0),
            summary("c", ExecutionStatus::Failed, 4.0),
            summary("d", ExecutionStatus::Fallback, 0.0),
        ]);
        assert_eq!(stats.sample_size, 3);
        assert_eq!(stats.failures, 1);
        assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((stats.avg_duration_seconds - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_next_trigger_time() {
        let base = Utc.with_ymd_and_hms(2026, 2, 22, 10, 2, 0).unwrap();
        assert_eq!(
            ExecutionCache::next_trigger_time("*/15 * * * *", base),
            Some(Utc.with_ymd_and_hms(2026, 2, 22, 10, 15, 0).unwrap())
        );
        assert_eq!(ExecutionCache::next_trigger_time("* * * *", base), None);
    }
}
