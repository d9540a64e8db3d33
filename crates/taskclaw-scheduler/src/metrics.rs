use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use serde::Serialize;

use crate::tasks::{DecisionMode, ExecutionStatus};

/// Samples retained per series.
const SERIES_CAPACITY: usize = 1_000;

#[derive(Debug, Default)]
struct Series {
    samples: VecDeque<f64>,
    total_count: u64,
    total_sum: f64,
}

impl Series {
    fn observe(&mut self, value: f64) {
        if self.samples.len() == SERIES_CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
        self.total_count += 1;
        self.total_sum += value;
    }

    fn summary(&self) -> SeriesSummary {
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let percentile = |p: f64| -> f64 {
            if sorted.is_empty() {
                return 0.0;
            }
            let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
            sorted[idx.min(sorted.len() - 1)]
        };
        SeriesSummary {
            count: self.total_count,
            sum: self.total_sum,
            mean: if self.total_count == 0 {
                0.0
            } else {
                self.total_sum / self.total_count as f64
            },
            p50: percentile(0.5),
            p95: percentile(0.95),
            max: sorted.last().copied().unwrap_or(0.0),
        }
    }
}

/// Aggregates over a sample series. Percentiles and max cover the retained window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SeriesSummary {
    pub count: u64,
    pub sum: f64,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub max: f64,
}

type CounterKey = (String, ExecutionStatus, Option<DecisionMode>);

#[derive(Debug, Default)]
struct MetricsState {
    executions: HashMap<CounterKey, u64>,
    durations: HashMap<String, Series>,
    costs: HashMap<String, Series>,
    delays: HashMap<String, Series>,
    active_tasks: usize,
    open_circuits: usize,
}

/// One `(event, status, mode)` counter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionCount {
    pub event_name: String,
    pub status: ExecutionStatus,
    pub decision_mode: Option<DecisionMode>,
    pub count: u64,
}

/// Everything an external collector needs, captured at one instant.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub executions: Vec<ExecutionCount>,
    /// Seconds, per trigger.
    pub durations: BTreeMap<String, SeriesSummary>,
    /// USD, per trigger.
    pub costs: BTreeMap<String, SeriesSummary>,
    /// Seconds between the scheduled fire time and the actual start, per trigger.
    pub delays: BTreeMap<String, SeriesSummary>,
    pub active_tasks: usize,
    pub open_circuits: usize,
}

impl MetricsSnapshot {
    /// Total firings that ended in `status`, across triggers and modes.
    pub fn total(&self, status: ExecutionStatus) -> u64 {
        self.executions
            .iter()
            .filter(|c| c.status == status)
            .map(|c| c.count)
            .sum()
    }
}

/// Engine counters, series and gauges.
#[derive(Debug, Default)]
pub struct Metrics {
    state: Mutex<MetricsState>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_execution(&self, event_name: &str, status: ExecutionStatus, mode: Option<DecisionMode>) {
        self.with_state(|s| {
            *s.executions
                .entry((event_name.to_string(), status, mode))
                .or_default() += 1;
        });
    }

    pub fn observe_duration(&self, event_name: &str, seconds: f64) {
        self.with_state(|s| s.durations.entry(event_name.to_string()).or_default().observe(seconds));
    }

    pub fn observe_cost(&self, event_name: &str, usd: f64) {
        self.with_state(|s| s.costs.entry(event_name.to_string()).or_default().observe(usd));
    }

    pub fn observe_delay(&self, event_name: &str, seconds: f64) {
        self.with_state(|s| s.delays.entry(event_name.to_string()).or_default().observe(seconds));
    }

    pub fn set_active_tasks(&self, n: usize) {
        self.with_state(|s| s.active_tasks = n);
    }

    pub fn set_open_circuits(&self, n: usize) {
        self.with_state(|s| s.open_circuits = n);
    }

    pub fn execution_count(&self, event_name: &str, status: ExecutionStatus) -> u64 {
        self.with_state(|s| {
            s.executions
                .iter()
                .filter(|((event, st, _), _)| event == event_name && *st == status)
                .map(|(_, n)| *n)
                .sum()
        })
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.with_state(|s| {
            let mut executions: Vec<ExecutionCount> = s
                .executions
                .iter()
                .map(|((event, status, mode), count)| ExecutionCount {
                    event_name: event.clone(),
                    status: *status,
                    decision_mode: *mode,
                    count: *count,
                })
                .collect();
            executions.sort_by(|a, b| {
                a.event_name
                    .cmp(&b.event_name)
                    .then_with(|| a.status.as_str().cmp(b.status.as_str()))
            });
            let summarize = |m: &HashMap<String, Series>| -> BTreeMap<String, SeriesSummary> {
                m.iter().map(|(k, v)| (k.clone(), v.summary())).collect()
            };
            MetricsSnapshot {
                executions,
                durations: summarize(&s.durations),
                costs: summarize(&s.costs),
                delays: summarize(&s.delays),
                active_tasks: s.active_tasks,
                open_circuits: s.open_circuits,
            }
        })
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MetricsState) -> R) -> R {
        match self.state.lock() {
            Ok(mut state) => f(&mut state),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_by_event_status_mode() {
        let m = Metrics::new();
        m.record_execution("job", ExecutionStatus::Success, Some(DecisionMode::Agent));
        m.record_execution("job", ExecutionStatus::Success, Some(DecisionMode::Agent));
        m.record_execution("job", ExecutionStatus::Fallback, Some(DecisionMode::Fallback));
        m.record_execution("other", ExecutionStatus::Skipped, None);

        assert_eq!(m.execution_count("job", ExecutionStatus::Success), 2);
        let snap = m.snapshot();
        assert_eq!(snap.executions.len(), 3);
        assert_eq!(snap.total(ExecutionStatus::Skipped), 1);
    }

    #[test]
    fn test_series_summary() {
        let m = Metrics::new();
        for v in [1.0, 2.0, 3.0, 4.0] {
            m.observe_duration("job", v);
        }
        m.observe_cost("job", 0.25);

        let snap = m.snapshot();
        let d = &snap.durations["job"];
        assert_eq!(d.count, 4);
        assert!((d.mean - 2.5).abs() < 1e-9);
        assert_eq!(d.max, 4.0);
        assert_eq!(snap.costs["job"].sum, 0.25);
        assert!(snap.delays.is_empty());
    }

    #[test]
    fn test_series_window_is_bounded() {
        let mut series = Series::default();
        for i in 0..(SERIES_CAPACITY + 10) {
            series.observe(i as f64);
        }
        assert_eq!(series.samples.len(), SERIES_CAPACITY);
        assert_eq!(series.summary().count, (SERIES_CAPACITY + 10) as u64);
    }

    #[test]
    fn test_gauges() {
        let m = Metrics::new();
        m.set_active_tasks(3);
        m.set_open_circuits(1);
        let snap = m.snapshot();
        assert_eq!(snap.active_tasks, 3);
        assert_eq!(snap.open_circuits, 1);
    }
}
