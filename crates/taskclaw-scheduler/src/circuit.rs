//! Circuit Breaker — per-trigger failure-ratio isolation.
//!
//! `Closed → Open` when the failure ratio over the recent window reaches the threshold,
//! `Open → HalfOpen` once the recovery timeout has elapsed (one trial allowed),
//! `HalfOpen → Closed` on the next success or back to `Open` on failure.
//!
//! State lives in a per-trigger map; when a [`CircuitStateStore`] is attached every
//! transition is mirrored to it so other instances (or a restarted process) see it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use taskclaw_core::config::CircuitConfig;
use taskclaw_core::{CircuitStateStore, Clock};
use tokio::sync::{Mutex, RwLock};

use crate::tasks::{ExecutionStatus, ExecutionSummary};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Result of asking whether a firing may proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitCheck {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl CircuitCheck {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: &str) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_string()),
        }
    }
}

/// Persisted per-trigger state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CircuitEntry {
    state: CircuitState,
    opened_at: Option<DateTime<Utc>>,
    /// Outcomes before this instant belong to a previous cycle and are not counted.
    window_start: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

pub struct CircuitBreaker {
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn CircuitStateStore>>,
    circuits: RwLock<HashMap<String, Arc<Mutex<CircuitEntry>>>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            store: None,
            circuits: RwLock::new(HashMap::new()),
        }
    }

    /// Mirror state transitions to an external store.
    pub fn with_store(mut self, store: Arc<dyn CircuitStateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Re-evaluate a trigger's circuit from its recent outcomes (newest first).
    pub async fn evaluate(&self, event_name: &str, recent: &[ExecutionSummary]) -> CircuitState {
        let slot = self.slot(event_name).await;
        let mut entry = slot.lock().await;
        self.sync_from_store(event_name, &mut entry).await;

        let window: Vec<&ExecutionSummary> = recent
            .iter()
            .filter(|s| matches!(
                s.status,
                ExecutionStatus::Success | ExecutionStatus::Failed | ExecutionStatus::Fallback
            ))
            .filter(|s| entry.window_start.is_none_or(|start| s.triggered_at >= start))
            .take(self.config.window_size)
            .collect();

        if entry.state == CircuitState::HalfOpen {
            if window.first().is_some_and(|s| s.is_failure()) {
                tracing::warn!("🔌 Circuit '{}' trial failed — reopening", event_name);
                self.open(event_name, &mut entry).await;
            }
            return entry.state;
        }

        if entry.state == CircuitState::Open || window.is_empty() || window.len() < self.config.min_samples {
            return entry.state;
        }

        let failures = window.iter().filter(|s| s.is_failure()).count();
        let ratio = failures as f64 / window.len() as f64;
        if ratio >= self.config.failure_threshold {
            tracing::warn!(
                "🔌 Circuit '{}' opened: {}/{} recent runs failed (threshold {:.0}%)",
                event_name,
                failures,
                window.len(),
                self.config.failure_threshold * 100.0
            );
            self.open(event_name, &mut entry).await;
        }
        entry.state
    }

    /// May a firing of this trigger proceed?
    pub async fn check(&self, event_name: &str) -> CircuitCheck {
        let slot = self.slot(event_name).await;
        let mut entry = slot.lock().await;
        self.sync_from_store(event_name, &mut entry).await;

        match entry.state {
            CircuitState::Closed => CircuitCheck::allow(),
            CircuitState::Open => {
                let now = self.clock.now();
                let recovered = entry
                    .opened_at
                    .is_none_or(|at| now - at >= self.recovery_timeout());
                if recovered {
                    tracing::info!("🔌 Circuit '{}' half-open, allowing one trial", event_name);
                    entry.state = CircuitState::HalfOpen;
                    entry.trial_in_flight = true;
                    self.persist(event_name, &entry).await;
                    CircuitCheck::allow()
                } else {
                    CircuitCheck::deny("circuit open")
                }
            }
            CircuitState::HalfOpen => {
                if entry.trial_in_flight {
                    CircuitCheck::deny("circuit open")
                } else {
                    entry.trial_in_flight = true;
                    self.persist(event_name, &entry).await;
                    CircuitCheck::allow()
                }
            }
        }
    }

    /// Open and still inside the recovery timeout. Does not transition.
    pub async fn is_open(&self, event_name: &str) -> bool {
        let entry = self.snapshot(event_name).await;
        entry.state == CircuitState::Open
            && entry
                .opened_at
                .is_some_and(|at| self.clock.now() - at < self.recovery_timeout())
    }

    /// Reset to `Closed` (after a successful run).
    pub async fn close(&self, event_name: &str) {
        let slot = self.slot(event_name).await;
        let mut entry = slot.lock().await;
        if entry.state != CircuitState::Closed {
            tracing::info!("🔌 Circuit '{}' closed", event_name);
        }
        *entry = CircuitEntry {
            window_start: Some(self.clock.now()),
            ..CircuitEntry::default()
        };
        if let Some(store) = &self.store {
            if let Err(e) = store.delete(&self.key(event_name)).await {
                tracing::warn!("⚠️ Failed to clear circuit state for '{}': {e}", event_name);
            }
        }
    }

    /// Give back a half-open trial slot that was granted but never executed.
    pub async fn release_trial(&self, event_name: &str) {
        let slot = self.slot(event_name).await;
        let mut entry = slot.lock().await;
        if entry.state == CircuitState::HalfOpen && entry.trial_in_flight {
            entry.trial_in_flight = false;
            self.persist(event_name, &entry).await;
        }
    }

    pub async fn state(&self, event_name: &str) -> CircuitState {
        self.snapshot(event_name).await.state
    }

    /// Triggers whose circuit is not closed.
    pub async fn open_count(&self) -> usize {
        let slots: Vec<Arc<Mutex<CircuitEntry>>> =
            self.circuits.read().await.values().cloned().collect();
        let mut count = 0;
        for slot in slots {
            if slot.lock().await.state != CircuitState::Closed {
                count += 1;
            }
        }
        count
    }

    /// Drop a trigger's circuit entirely.
    pub async fn remove(&self, event_name: &str) {
        self.circuits.write().await.remove(event_name);
        if let Some(store) = &self.store {
            if let Err(e) = store.delete(&self.key(event_name)).await {
                tracing::warn!("⚠️ Failed to clear circuit state for '{}': {e}", event_name);
            }
        }
    }

    async fn snapshot(&self, event_name: &str) -> CircuitEntry {
        let slot = self.slot(event_name).await;
        let mut entry = slot.lock().await;
        self.sync_from_store(event_name, &mut entry).await;
        entry.clone()
    }

    async fn open(&self, event_name: &str, entry: &mut CircuitEntry) {
        let now = self.clock.now();
        entry.state = CircuitState::Open;
        entry.opened_at = Some(now);
        entry.window_start = Some(now);
        entry.trial_in_flight = false;
        self.persist(event_name, entry).await;
    }

    async fn slot(&self, event_name: &str) -> Arc<Mutex<CircuitEntry>> {
        if let Some(slot) = self.circuits.read().await.get(event_name) {
            return slot.clone();
        }
        self.circuits
            .write()
            .await
            .entry(event_name.to_string())
            .or_default()
            .clone()
    }

    /// The store is authoritative when present: a missing key means closed.
    async fn sync_from_store(&self, event_name: &str, entry: &mut CircuitEntry) {
        let Some(store) = &self.store else {
            return;
        };
        match store.get(&self.key(event_name)).await {
            Ok(Some(raw)) => match serde_json::from_str::<CircuitEntry>(&raw) {
                Ok(stored) => *entry = stored,
                Err(e) => tracing::warn!("⚠️ Corrupt circuit state for '{}': {e}", event_name),
            },
            Ok(None) => {
                if entry.state != CircuitState::Closed {
                    entry.state = CircuitState::Closed;
                    entry.opened_at = None;
                    entry.trial_in_flight = false;
                }
            }
            Err(e) => tracing::warn!("⚠️ Circuit store read failed for '{}': {e}", event_name),
        }
    }

    async fn persist(&self, event_name: &str, entry: &CircuitEntry) {
        let Some(store) = &self.store else {
            return;
        };
        let raw = match serde_json::to_string(entry) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("⚠️ Failed to encode circuit state for '{}': {e}", event_name);
                return;
            }
        };
        if let Err(e) = store.set(&self.key(event_name), &raw).await {
            tracing::warn!("⚠️ Circuit store write failed for '{}': {e}", event_name);
        }
    }

    fn key(&self, event_name: &str) -> String {
        format!("{}:{}", self.config.key_prefix, event_name)
    }

    fn recovery_timeout(&self) -> Duration {
        Duration::seconds(self.config.recovery_timeout_secs as i64)
    }
}
