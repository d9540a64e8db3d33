//! Trigger registry — registration, lifecycle, and the per-firing pipeline.
//!
//! ```text
//! fire(event)
//!   ├── disabled?            → SKIPPED("disabled")
//!   ├── GovernanceGate       → SKIPPED(reason) on first veto
//!   ├── decision::choose     → agent | fallback (per-firing draw)
//!   ├── ConcurrencyController
//!   │     ├── agent: PrimaryExecutor (+ retries, + fallback per strategy)
//!   │     └── fallback: FallbackHandler
//!   ├── post-hoc cost/duration flags
//!   └── BatchWriter, ExecutionCache, CircuitBreaker, Metrics, ErrorNotifier
//! ```

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use serde_json::{Value, json};
use taskclaw_core::error::{Result, TaskClawError};
use taskclaw_core::{
    CircuitStateStore, Clock, Ledger, LedgerQuery, LedgerRecord, PrimaryExecutor, SchedulerConfig,
    SystemClock,
};
use tokio::sync::RwLock;

use crate::batch::{BatchStats, BatchWriter};
use crate::cache::{ExecutionCache, TriggerStats};
use crate::circuit::{CircuitBreaker, CircuitState};
use crate::concurrency::ConcurrencyController;
use crate::decision::{self, RandomSource, ThreadRandom};
use crate::governance::GovernanceGate;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::notify::{ErrorNotifier, NotifyChannel};
use crate::retry;
use crate::tasks::{
    DecisionMode, ExecutionRecord, ExecutionStatus, FallbackContext, FireResult, TriggerConfig,
};

/// `task_type` written to every ledger row.
pub const TASK_TYPE: &str = "scheduled_trigger";

struct TriggerEntry {
    config: Arc<TriggerConfig>,
    enabled: bool,
}

/// Live view of one trigger.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerStatus {
    pub event_name: String,
    pub description: String,
    pub cron_expression: String,
    pub enabled: bool,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub circuit_state: CircuitState,
    /// Over the in-memory sample window, not full history.
    pub stats: TriggerStats,
    pub consecutive_failures: u32,
    pub priority: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: HealthState,
    pub total_triggers: usize,
    pub enabled_triggers: usize,
    pub disabled_triggers: usize,
    /// A ledger is configured and answers its health probe.
    pub backend_connected: bool,
    pub open_circuits: usize,
    pub active_tasks: usize,
    pub batch: Option<BatchStats>,
}

/// Collects collaborators for a [`TriggerRegistry`].
pub struct RegistryBuilder {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    ledger: Option<Arc<dyn Ledger>>,
    executor: Option<Arc<dyn PrimaryExecutor>>,
    circuit_store: Option<Arc<dyn CircuitStateStore>>,
    rng: Arc<dyn RandomSource>,
    channels: Vec<Arc<dyn NotifyChannel>>,
}

impl RegistryBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn PrimaryExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn circuit_store(mut self, store: Arc<dyn CircuitStateStore>) -> Self {
        self.circuit_store = Some(store);
        self
    }

    pub fn random_source(mut self, rng: Arc<dyn RandomSource>) -> Self {
        self.rng = rng;
        self
    }

    pub fn channel(mut self, channel: Arc<dyn NotifyChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    /// Assemble the registry. Starts the batch writer when a ledger is configured,
    /// so this must run inside a tokio runtime.
    pub fn build(self) -> TriggerRegistry {
        let mut circuit = CircuitBreaker::new(self.config.circuit.clone(), self.clock.clone());
        if let Some(store) = self.circuit_store {
            circuit = circuit.with_store(store);
        }
        let circuit = Arc::new(circuit);
        let governance = GovernanceGate::new(
            circuit.clone(),
            self.ledger.clone(),
            &self.config.tenant_id,
            self.clock.clone(),
        );
        let writer = self
            .ledger
            .clone()
            .map(|ledger| BatchWriter::spawn(ledger, self.config.batch.clone()));

        tracing::info!(
            "📋 Trigger registry ready (tenant '{}', max concurrency {}, ledger: {}, executor: {})",
            self.config.tenant_id,
            self.config.max_concurrency,
            if self.ledger.is_some() { "yes" } else { "no" },
            if self.executor.is_some() { "yes" } else { "no" },
        );

        TriggerRegistry {
            triggers: RwLock::new(HashMap::new()),
            concurrency: ConcurrencyController::new(self.config.max_concurrency),
            cache: ExecutionCache::new(
                self.config.cache.history_capacity,
                Duration::from_secs(self.config.cache.stats_ttl_secs),
            ),
            notifier: ErrorNotifier::with_channels(self.channels),
            metrics: Metrics::new(),
            clock: self.clock,
            ledger: self.ledger,
            executor: self.executor,
            rng: self.rng,
            circuit,
            governance,
            writer,
            config: self.config,
        }
    }
}

pub struct TriggerRegistry {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    triggers: RwLock<HashMap<String, TriggerEntry>>,
    ledger: Option<Arc<dyn Ledger>>,
    executor: Option<Arc<dyn PrimaryExecutor>>,
    rng: Arc<dyn RandomSource>,
    circuit: Arc<CircuitBreaker>,
    governance: GovernanceGate,
    concurrency: ConcurrencyController,
    cache: ExecutionCache,
    writer: Option<BatchWriter>,
    metrics: Metrics,
    notifier: ErrorNotifier,
}

impl TriggerRegistry {
    pub fn builder(config: SchedulerConfig) -> RegistryBuilder {
        RegistryBuilder {
            config,
            clock: Arc::new(SystemClock),
            ledger: None,
            executor: None,
            circuit_store: None,
            rng: Arc::new(ThreadRandom),
            channels: Vec::new(),
        }
    }

    // ── Lifecycle ──────────────────────────────────────────

    /// Add a trigger. Fails on a duplicate name or invalid config; nothing is stored then.
    pub async fn register(&self, config: TriggerConfig) -> Result<()> {
        let config = config.validated()?;
        let mut triggers = self.triggers.write().await;
        if triggers.contains_key(&config.event_name) {
            return Err(TaskClawError::Validation(format!(
                "trigger '{}' is already registered",
                config.event_name
            )));
        }
        tracing::info!(
            "📅 Trigger registered: '{}' ({}, weight {:.2})",
            config.event_name,
            config.cron_expression,
            config.migration_weight
        );
        let enabled = config.enabled;
        triggers.insert(
            config.event_name.clone(),
            TriggerEntry {
                config: Arc::new(config),
                enabled,
            },
        );
        Ok(())
    }

    /// Remove a trigger and forget its cached history and circuit.
    pub async fn unregister(&self, event_name: &str) -> Result<TriggerConfig> {
        let entry = self
            .triggers
            .write()
            .await
            .remove(event_name)
            .ok_or_else(|| TaskClawError::NotFound(event_name.to_string()))?;
        self.cache.invalidate(event_name).await;
        self.circuit.remove(event_name).await;
        tracing::info!("🗑️ Trigger removed: '{}'", event_name);
        let mut config = (*entry.config).clone();
        config.enabled = entry.enabled;
        Ok(config)
    }

    pub async fn pause(&self, event_name: &str) -> Result<()> {
        self.set_enabled(event_name, false).await
    }

    pub async fn resume(&self, event_name: &str) -> Result<()> {
        self.set_enabled(event_name, true).await
    }

    async fn set_enabled(&self, event_name: &str, enabled: bool) -> Result<()> {
        let mut triggers = self.triggers.write().await;
        let entry = triggers
            .get_mut(event_name)
            .ok_or_else(|| TaskClawError::NotFound(event_name.to_string()))?;
        if entry.enabled != enabled {
            entry.enabled = enabled;
            tracing::info!(
                "{} Trigger '{}' {}",
                if enabled { "▶️" } else { "⏸️" },
                event_name,
                if enabled { "resumed" } else { "paused" }
            );
        }
        Ok(())
    }

    /// Registered triggers, `enabled` reflecting pause state.
    pub async fn list_triggers(&self) -> Vec<TriggerConfig> {
        let triggers = self.triggers.read().await;
        let mut list: Vec<TriggerConfig> = triggers
            .values()
            .map(|entry| {
                let mut config = (*entry.config).clone();
                config.enabled = entry.enabled;
                config
            })
            .collect();
        list.sort_by(|a, b| a.event_name.cmp(&b.event_name));
        list
    }

    // ── Firing ─────────────────────────────────────────────

    /// Main execution entry. Always returns a structured result.
    pub async fn fire(&self, event_name: &str) -> FireResult {
        self.fire_inner(event_name, json!({}), None).await
    }

    /// A cron-driven firing that was due at `scheduled_at`; the lag is recorded as delay.
    pub async fn fire_scheduled(&self, event_name: &str, scheduled_at: DateTime<Utc>) -> FireResult {
        self.fire_inner(event_name, json!({ "scheduled_at": scheduled_at }), Some(scheduled_at))
            .await
    }

    /// Manual firing outside the cron clock. Still governed.
    pub async fn trigger_now(&self, event_name: &str) -> FireResult {
        self.trigger_now_with_payload(event_name, json!({})).await
    }

    pub async fn trigger_now_with_payload(&self, event_name: &str, payload: Value) -> FireResult {
        tracing::info!("👆 Manual trigger: '{}'", event_name);
        self.fire_inner(event_name, json!({ "manual": true, "data": payload }), None)
            .await
    }

    async fn fire_inner(
        &self,
        event_name: &str,
        payload: Value,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> FireResult {
        let now = self.clock.now();
        let mut record = ExecutionRecord::new(event_name, now);

        let entry = {
            let triggers = self.triggers.read().await;
            triggers
                .get(event_name)
                .map(|e| (e.config.clone(), e.enabled))
        };
        let Some((config, enabled)) = entry else {
            tracing::info!("❓ Fire for unknown trigger '{}'", event_name);
            record.skip("not found");
            return FireResult::from(&record);
        };

        if !enabled {
            tracing::debug!("⏸️ '{}' is paused, skipping", event_name);
            record.skip("disabled");
            return self.complete(&config, record, &payload, scheduled_at).await;
        }

        let verdict = self.governance.check(&config, &mut record).await;
        if !verdict.allowed {
            record.skip(verdict.reason.as_deref().unwrap_or("governance"));
            return self.complete(&config, record, &payload, scheduled_at).await;
        }

        let mode = decision::choose(config.migration_weight, self.rng.as_ref());
        let run = async {
            self.metrics.set_active_tasks(self.concurrency.active_count());
            match mode {
                DecisionMode::Agent => self.run_agent(&config, &mut record, &payload).await,
                DecisionMode::Fallback => self.run_fallback(&config, &mut record, &payload).await,
            }
        };
        let gated = self.concurrency.execute_with_limit(event_name, run).await;
        if let Err(e) = gated {
            record.fail(&e.to_string());
        }

        record.finish(self.clock.now());
        self.flag_post_hoc_limits(&config, &mut record);

        if record.status == ExecutionStatus::Skipped {
            // A half-open trial granted to a firing that ended up not running.
            self.circuit.release_trial(event_name).await;
        }
        self.complete(&config, record, &payload, scheduled_at).await
    }

    async fn run_agent(&self, config: &TriggerConfig, record: &mut ExecutionRecord, payload: &Value) {
        record.start(DecisionMode::Agent, self.clock.now());
        let Some(executor) = &self.executor else {
            record.fail("no primary executor configured");
            self.run_fallback_after_primary(config, record, payload).await;
            return;
        };

        let max_delay = Duration::from_secs(self.config.retry.max_delay_secs);
        let base_delay = Duration::from_secs(config.retry_delay_seconds);
        loop {
            let attempt = AssertUnwindSafe(executor.execute(
                &config.event_name,
                config.focus.as_deref(),
                payload,
            ))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(TaskClawError::Execution("primary executor panicked".into())));

            match attempt {
                Ok(outcome) => {
                    record.primary_run_id = Some(outcome.run_id);
                    record.llm_call_count = outcome.tool_call_count;
                    record.cost_usd = outcome.cost_usd;
                    record.status = ExecutionStatus::Success;
                    tracing::info!(
                        "✅ '{}' agent run done ({} tool calls)",
                        config.event_name,
                        record.llm_call_count
                    );
                    break;
                }
                Err(e) => {
                    if retry::should_retry(&e, record.retry_count, config.max_retries, config.retry_on_failure) {
                        let delay = retry::calculate_delay(record.retry_count, base_delay, max_delay);
                        tracing::warn!(
                            "🔁 '{}' attempt {} failed: {e}; retrying in {:?}",
                            config.event_name,
                            record.retry_count + 1,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        record.retry_count += 1;
                        continue;
                    }
                    tracing::warn!("❌ '{}' agent run failed: {e}", config.event_name);
                    record.fail(&e.to_string());
                    break;
                }
            }
        }

        self.run_fallback_after_primary(config, record, payload).await;
    }

    /// Per `fallback_strategy`, run the handler after the primary path. Its outcome
    /// never changes the record's status.
    async fn run_fallback_after_primary(&self, config: &TriggerConfig, record: &mut ExecutionRecord, payload: &Value) {
        let failed = record.status == ExecutionStatus::Failed;
        if !decision::fallback_after_primary(config.fallback_strategy, failed) {
            return;
        }
        let Some(handler) = &config.fallback_handler else {
            return;
        };
        record.fallback_invoked = true;
        let ctx = FallbackContext {
            event_name: config.event_name.clone(),
            execution_id: record.execution_id.clone(),
            payload: payload.clone(),
            primary_error: record.error_message.clone(),
        };
        let outcome = AssertUnwindSafe(handler.call(ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(TaskClawError::Execution("fallback handler panicked".into())));
        match outcome {
            Ok(_) => tracing::info!("↩️ '{}' fallback ran after primary", config.event_name),
            Err(e) => tracing::warn!("⚠️ '{}' fallback after primary failed: {e}", config.event_name),
        }
    }

    async fn run_fallback(&self, config: &TriggerConfig, record: &mut ExecutionRecord, payload: &Value) {
        record.start(DecisionMode::Fallback, self.clock.now());
        let Some(handler) = &config.fallback_handler else {
            tracing::info!("⏭️ '{}' routed to fallback but none is configured", config.event_name);
            record.skip("no fallback handler");
            return;
        };
        let ctx = FallbackContext {
            event_name: config.event_name.clone(),
            execution_id: record.execution_id.clone(),
            payload: payload.clone(),
            primary_error: None,
        };
        let outcome = AssertUnwindSafe(handler.call(ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(TaskClawError::Execution("fallback handler panicked".into())));
        match outcome {
            Ok(_) => {
                record.status = ExecutionStatus::Fallback;
                tracing::info!("✅ '{}' fallback run done", config.event_name);
            }
            Err(e) => {
                tracing::warn!("❌ '{}' fallback run failed: {e}", config.event_name);
                record.fail(&e.to_string());
            }
        }
    }

    /// Cost and duration are only known afterwards, so breaches are flags, not vetoes.
    fn flag_post_hoc_limits(&self, config: &TriggerConfig, record: &mut ExecutionRecord) {
        if let Some(max_cost) = config.max_cost_per_run {
            let within = record.cost_usd <= max_cost;
            record
                .governance_checks
                .insert("max_cost_per_run".to_string(), within);
            if !within {
                tracing::warn!(
                    "💸 '{}' cost ${:.4} exceeded max_cost_per_run ${:.4}",
                    config.event_name,
                    record.cost_usd,
                    max_cost
                );
            }
        }
        if let Some(max_duration) = config.max_duration {
            let within = record.duration_seconds <= max_duration as f64;
            record
                .governance_checks
                .insert("max_duration".to_string(), within);
            if !within {
                tracing::warn!(
                    "🐢 '{}' ran {:.1}s, over max_duration {}s",
                    config.event_name,
                    record.duration_seconds,
                    max_duration
                );
            }
        }
    }

    /// Persist and account for a finished (or skipped) firing.
    async fn complete(
        &self,
        config: &TriggerConfig,
        record: ExecutionRecord,
        payload: &Value,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> FireResult {
        let event = record.event_name.as_str();

        if let Some(writer) = &self.writer {
            writer.enqueue(self.ledger_record(config, &record, payload));
        }

        self.metrics
            .record_execution(event, record.status, record.decision_mode);

        if record.status != ExecutionStatus::Skipped {
            self.metrics.observe_duration(event, record.duration_seconds);
            self.metrics.observe_cost(event, record.cost_usd);
            if let (Some(due), Some(started)) = (scheduled_at, record.started_at) {
                let lag = (started - due).num_milliseconds().max(0) as f64 / 1000.0;
                self.metrics.observe_delay(event, lag);
            }

            self.cache.push(event, record.summary()).await;
            let recent = self.cache.recent(event, None).await;
            self.cache
                .set_stats(event, TriggerStats::from_summaries(&recent))
                .await;

            if record.status == ExecutionStatus::Failed {
                self.circuit.evaluate(event, &recent).await;
                let error = record.error_message.as_deref().unwrap_or("unknown error");
                self.notifier.record_failure(event, error);
            } else {
                if self.circuit.state(event).await != CircuitState::Closed {
                    self.circuit.close(event).await;
                }
                self.notifier.record_success(event);
            }
            self.metrics.set_open_circuits(self.circuit.open_count().await);
        }
        self.metrics
            .set_active_tasks(self.concurrency.active_count());

        tracing::debug!(
            "🏁 '{}' {} in {:.3}s ({})",
            event,
            record.status,
            record.duration_seconds,
            record.execution_id
        );
        FireResult::from(&record)
    }

    fn ledger_record(&self, config: &TriggerConfig, record: &ExecutionRecord, payload: &Value) -> LedgerRecord {
        let reasoning = match (&record.skip_reason, record.decision_mode) {
            (Some(reason), _) => format!("skipped: {reason}"),
            (None, Some(mode)) => format!(
                "routed to {mode} (migration weight {:.2})",
                config.migration_weight
            ),
            (None, None) => String::new(),
        };
        LedgerRecord {
            tenant_id: self.config.tenant_id.clone(),
            agent_id: self.config.agent_id.clone(),
            run_id: record
                .primary_run_id
                .clone()
                .unwrap_or_else(|| record.execution_id.clone()),
            capability_name: record.event_name.clone(),
            task_type: TASK_TYPE.to_string(),
            input_params: json!({
                "execution_id": record.execution_id,
                "focus": config.focus,
                "payload": payload,
            }),
            output_result: json!({
                "decision_mode": record.decision_mode,
                "llm_call_count": record.llm_call_count,
                "cost_usd": record.cost_usd,
                "governance_checks": record.governance_checks,
                "retry_count": record.retry_count,
                "fallback_invoked": record.fallback_invoked,
            }),
            reasoning,
            duration_ms: (record.duration_seconds * 1000.0).round() as u64,
            status: record.status.as_str().to_string(),
            error_message: record.error_message.clone(),
            estimated_cost: record.cost_usd,
            created_at: record.triggered_at,
        }
    }

    // ── Queries ────────────────────────────────────────────

    pub async fn get_status(&self, event_name: &str) -> Result<TriggerStatus> {
        let (config, enabled) = {
            let triggers = self.triggers.read().await;
            let entry = triggers
                .get(event_name)
                .ok_or_else(|| TaskClawError::NotFound(event_name.to_string()))?;
            (entry.config.clone(), entry.enabled)
        };

        let stats = match self.cache.get_stats(event_name).await {
            Some(stats) => stats,
            None => {
                let recent = self.cache.recent(event_name, None).await;
                let stats = TriggerStats::from_summaries(&recent);
                self.cache.set_stats(event_name, stats.clone()).await;
                stats
            }
        };

        Ok(TriggerStatus {
            event_name: config.event_name.clone(),
            description: config.description.clone(),
            cron_expression: config.cron_expression.clone(),
            enabled,
            next_fire_time: if enabled {
                ExecutionCache::next_trigger_time(&config.cron_expression, self.clock.now())
            } else {
                None
            },
            circuit_state: self.circuit.state(event_name).await,
            stats,
            consecutive_failures: self.notifier.consecutive_failures(event_name),
            priority: config.priority,
        })
    }

    /// Ledger rows for a trigger, newest first. Empty without a ledger.
    pub async fn get_execution_history(&self, event_name: &str, limit: usize) -> Result<Vec<LedgerRecord>> {
        if !self.triggers.read().await.contains_key(event_name) {
            return Err(TaskClawError::NotFound(event_name.to_string()));
        }
        let Some(ledger) = &self.ledger else {
            return Ok(Vec::new());
        };
        ledger
            .query_records(
                &self.config.tenant_id,
                &LedgerQuery::for_capability(event_name).limit(limit),
            )
            .await
    }

    pub async fn get_health_status(&self) -> HealthStatus {
        let (total, enabled) = {
            let triggers = self.triggers.read().await;
            (triggers.len(), triggers.values().filter(|e| e.enabled).count())
        };
        let backend_connected = match &self.ledger {
            Some(ledger) => ledger.health_check().await,
            None => false,
        };
        let open_circuits = self.circuit.open_count().await;

        let status = if self.ledger.is_some() && !backend_connected {
            HealthState::Unhealthy
        } else if self.ledger.is_none() || open_circuits > 0 {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };

        HealthStatus {
            status,
            total_triggers: total,
            enabled_triggers: enabled,
            disabled_triggers: total - enabled,
            backend_connected,
            open_circuits,
            active_tasks: self.concurrency.active_count(),
            batch: self.writer.as_ref().map(BatchWriter::stats),
        }
    }

    pub async fn metrics(&self) -> MetricsSnapshot {
        self.metrics.set_active_tasks(self.concurrency.active_count());
        self.metrics.set_open_circuits(self.circuit.open_count().await);
        self.metrics.snapshot()
    }

    pub fn notifier(&self) -> &ErrorNotifier {
        &self.notifier
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    // ── Persistence / shutdown ─────────────────────────────

    /// Write out everything enqueued so far.
    pub async fn flush(&self) {
        if let Some(writer) = &self.writer {
            writer.flush().await;
        }
    }

    /// Drain in-flight firings (up to `timeout`), then flush and stop the writer.
    /// Returns whether every firing finished in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        tracing::info!("🛑 Registry shutting down ({} active)", self.concurrency.active_count());
        let drained = self.concurrency.wait_all(timeout).await;
        if let Some(writer) = &self.writer {
            writer.shutdown().await;
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{FixedRandom, SeededRandom};
    use crate::ledger::MemoryLedger;
    use crate::notify::FnChannel;
    use crate::tasks::{FallbackHandler, FallbackStrategy};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};
    use taskclaw_core::{ExecutorOutcome, ManualClock};

    /// Fails the first `fail_first` calls with `error`, then succeeds.
    struct ScriptedExecutor {
        calls: AtomicU32,
        fail_first: u32,
        error: fn() -> TaskClawError,
        cost_usd: f64,
    }

    impl ScriptedExecutor {
        fn ok() -> Self {
            Self::failing(0)
        }

        fn failing(fail_first: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first,
                error: || TaskClawError::Execution("agent crashed".into()),
                cost_usd: 0.05,
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PrimaryExecutor for ScriptedExecutor {
        async fn execute(&self, event_name: &str, _focus: Option<&str>, _payload: &Value) -> Result<ExecutorOutcome> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                return Err((self.error)());
            }
            Ok(ExecutorOutcome {
                run_id: format!("{event_name}-run-{n}"),
                tool_call_count: 2,
                cost_usd: self.cost_usd,
            })
        }
    }

    struct PanickingExecutor;

    #[async_trait]
    impl PrimaryExecutor for PanickingExecutor {
        async fn execute(&self, _event_name: &str, _focus: Option<&str>, _payload: &Value) -> Result<ExecutorOutcome> {
            panic!("executor bug");
        }
    }

    fn test_config() -> SchedulerConfig {
        let mut config = SchedulerConfig::default();
        config.batch.fallback_log_path = std::env::temp_dir()
            .join(format!("taskclaw-registry-{}", uuid::Uuid::new_v4()))
            .join("ledger_fallback.jsonl");
        config
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    fn counting_fallback(counter: Arc<AtomicU32>) -> FallbackHandler {
        FallbackHandler::from_sync(move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "legacy": true }))
        })
    }

    fn agent_trigger(name: &str) -> TriggerConfig {
        TriggerConfig::new(name, "*/5 * * * *").with_migration_weight(1.0)
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates_and_bad_cron() {
        let registry = TriggerRegistry::builder(test_config()).build();
        registry.register(agent_trigger("job-a")).await.unwrap();

        let dup = registry.register(agent_trigger("job-a")).await;
        assert!(matches!(dup, Err(TaskClawError::Validation(_))));

        let bad = registry
            .register(TriggerConfig::new("job-b", "0 9 * *"))
            .await;
        assert!(matches!(bad, Err(TaskClawError::Validation(_))));
        assert_eq!(registry.list_triggers().await.len(), 1);
    }

    #[tokio::test]
    async fn test_pause_resume_and_unknown() {
        let registry = TriggerRegistry::builder(test_config()).build();
        registry.register(agent_trigger("job")).await.unwrap();

        assert!(matches!(registry.pause("nope").await, Err(TaskClawError::NotFound(_))));
        assert!(matches!(registry.resume("nope").await, Err(TaskClawError::NotFound(_))));

        registry.pause("job").await.unwrap();
        registry.pause("job").await.unwrap();
        assert!(!registry.get_status("job").await.unwrap().enabled);
        registry.resume("job").await.unwrap();
        assert!(registry.get_status("job").await.unwrap().enabled);

        let result = registry.fire("nope").await;
        assert_eq!(result.status, ExecutionStatus::Skipped);
        assert_eq!(result.skip_reason.as_deref(), Some("not found"));
    }

    #[tokio::test]
    async fn test_disabled_trigger_never_executes() {
        let executor = Arc::new(ScriptedExecutor::ok());
        let fallback_calls = Arc::new(AtomicU32::new(0));
        let registry = TriggerRegistry::builder(test_config())
            .executor(executor.clone())
            .build();
        registry
            .register(
                TriggerConfig::new("job", "* * * * *")
                    .with_migration_weight(0.5)
                    .with_fallback(counting_fallback(fallback_calls.clone())),
            )
            .await
            .unwrap();
        registry.pause("job").await.unwrap();

        for _ in 0..20 {
            let result = registry.fire("job").await;
            assert_eq!(result.status, ExecutionStatus::Skipped);
            assert_eq!(result.skip_reason.as_deref(), Some("disabled"));
        }
        assert_eq!(executor.calls(), 0);
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_migration_weight_extremes() {
        let executor = Arc::new(ScriptedExecutor::ok());
        let fallback_calls = Arc::new(AtomicU32::new(0));
        let registry = TriggerRegistry::builder(test_config())
            .executor(executor.clone())
            .random_source(Arc::new(SeededRandom::new(3)))
            .build();
        registry
            .register(
                TriggerConfig::new("legacy", "* * * * *")
                    .with_migration_weight(0.0)
                    .with_fallback(counting_fallback(fallback_calls.clone())),
            )
            .await
            .unwrap();
        registry.register(agent_trigger("agent")).await.unwrap();

        for _ in 0..50 {
            let r = registry.fire("legacy").await;
            assert_eq!(r.status, ExecutionStatus::Fallback);
            assert_eq!(r.decision_mode, Some(DecisionMode::Fallback));
            let r = registry.fire("agent").await;
            assert_eq!(r.status, ExecutionStatus::Success);
            assert_eq!(r.decision_mode, Some(DecisionMode::Agent));
        }
        assert_eq!(executor.calls(), 50);
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 50);
    }

    #[tokio::test]
    async fn test_no_fallback_handler_skips() {
        let registry = TriggerRegistry::builder(test_config())
            .random_source(Arc::new(FixedRandom(0.9)))
            .build();
        registry
            .register(TriggerConfig::new("job", "* * * * *").with_migration_weight(0.5))
            .await
            .unwrap();
        let result = registry.fire("job").await;
        assert_eq!(result.status, ExecutionStatus::Skipped);
        assert_eq!(result.skip_reason.as_deref(), Some("no fallback handler"));
    }

    #[tokio::test]
    async fn test_cooldown_end_to_end() {
        let clock = Arc::new(ManualClock::new(start()));
        let ledger = Arc::new(MemoryLedger::new());
        let registry = TriggerRegistry::builder(test_config())
            .clock(clock.clone())
            .ledger(ledger.clone())
            .executor(Arc::new(ScriptedExecutor::ok()))
            .build();
        let mut config = agent_trigger("job-a");
        config.cooldown_seconds = 60;
        registry.register(config).await.unwrap();

        assert_eq!(registry.fire("job-a").await.status, ExecutionStatus::Success);
        registry.flush().await;

        clock.advance(chrono::Duration::seconds(10));
        let second = registry.fire("job-a").await;
        assert_eq!(second.status, ExecutionStatus::Skipped);
        assert_eq!(second.skip_reason.as_deref(), Some("cooldown"));
        registry.flush().await;

        clock.advance(chrono::Duration::seconds(51));
        assert_eq!(registry.fire("job-a").await.status, ExecutionStatus::Success);
        registry.flush().await;

        // Skipped firings are audited too.
        let history = registry.get_execution_history("job-a", 10).await.unwrap();
        let statuses: Vec<&str> = history.iter().map(|r| r.status.as_str()).collect();
        assert_eq!(statuses, vec!["success", "skipped", "success"]);
        assert_eq!(history[1].reasoning, "skipped: cooldown");
    }

    #[tokio::test]
    async fn test_daily_run_limit_end_to_end() {
        let clock = Arc::new(ManualClock::new(start()));
        let registry = TriggerRegistry::builder(test_config())
            .clock(clock.clone())
            .ledger(Arc::new(MemoryLedger::new()))
            .executor(Arc::new(ScriptedExecutor::ok()))
            .build();
        let mut config = agent_trigger("job");
        config.max_daily_runs = Some(2);
        registry.register(config).await.unwrap();

        for _ in 0..2 {
            assert_eq!(registry.fire("job").await.status, ExecutionStatus::Success);
            registry.flush().await;
            clock.advance(chrono::Duration::minutes(5));
        }
        let third = registry.fire("job").await;
        assert_eq!(third.skip_reason.as_deref(), Some("daily run limit"));

        // Next UTC day the quota resets.
        clock.advance(chrono::Duration::days(1));
        assert_eq!(registry.fire("job").await.status, ExecutionStatus::Success);
    }

    #[tokio::test]
    async fn test_primary_failure_runs_fallback_but_stays_failed() {
        let fallback_calls = Arc::new(AtomicU32::new(0));
        let registry = TriggerRegistry::builder(test_config())
            .executor(Arc::new(ScriptedExecutor::failing(u32::MAX)))
            .channel(Arc::new(FnChannel::new("test", |_| {})))
            .build();
        registry
            .register(agent_trigger("job").with_fallback(counting_fallback(fallback_calls.clone())))
            .await
            .unwrap();

        let result = registry.fire("job").await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(result.error_message.unwrap().contains("agent crashed"));
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.notifier().history().len(), 1);
    }

    /// Takes 5s per alert.
    struct SlowChannel {
        delivered: Arc<AtomicU32>,
    }

    #[async_trait]
    impl NotifyChannel for SlowChannel {
        fn name(&self) -> &str {
            "slow"
        }

        async fn send(&self, _notification: &crate::notify::Notification) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_alert_channel_does_not_delay_fire() {
        let delivered = Arc::new(AtomicU32::new(0));
        let registry = TriggerRegistry::builder(test_config())
            .executor(Arc::new(ScriptedExecutor::failing(u32::MAX)))
            .channel(Arc::new(SlowChannel {
                delivered: delivered.clone(),
            }))
            .build();
        registry.register(agent_trigger("job")).await.unwrap();

        let started = tokio::time::Instant::now();
        let result = registry.fire("job").await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
        assert_eq!(registry.notifier().history().len(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fallback_strategies_after_primary() {
        let calls = Arc::new(AtomicU32::new(0));
        let registry = TriggerRegistry::builder(test_config())
            .executor(Arc::new(ScriptedExecutor::ok()))
            .build();

        let mut always = agent_trigger("shadow").with_fallback(counting_fallback(calls.clone()));
        always.fallback_strategy = FallbackStrategy::Always;
        registry.register(always).await.unwrap();

        let mut never = agent_trigger("strict").with_fallback(counting_fallback(calls.clone()));
        never.fallback_strategy = FallbackStrategy::Never;
        registry.register(never).await.unwrap();

        assert_eq!(registry.fire("shadow").await.status, ExecutionStatus::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.fire("strict").await.status, ExecutionStatus::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_fallback_after_primary_is_swallowed() {
        let registry = TriggerRegistry::builder(test_config())
            .executor(Arc::new(ScriptedExecutor::failing(u32::MAX)))
            .build();
        let handler = FallbackHandler::from_async(|_ctx| async {
            Err(TaskClawError::Execution("legacy also down".into()))
        });
        registry
            .register(agent_trigger("job").with_fallback(handler))
            .await
            .unwrap();
        let result = registry.fire("job").await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(result.error_message.unwrap().contains("agent crashed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_failures() {
        let executor = Arc::new(ScriptedExecutor::failing(2));
        let registry = TriggerRegistry::builder(test_config())
            .executor(executor.clone())
            .build();
        let mut config = agent_trigger("job");
        config.retry_on_failure = true;
        config.max_retries = 3;
        config.retry_delay_seconds = 1;
        registry.register(config).await.unwrap();

        let result = registry.fire("job").await;
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(executor.calls(), 3);
    }

    #[tokio::test]
    async fn test_validation_errors_are_not_retried() {
        let executor = Arc::new(ScriptedExecutor {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
            error: || TaskClawError::Validation("bad focus".into()),
            cost_usd: 0.0,
        });
        let registry = TriggerRegistry::builder(test_config())
            .executor(executor.clone())
            .build();
        let mut config = agent_trigger("job");
        config.retry_on_failure = true;
        registry.register(config).await.unwrap();

        assert_eq!(registry.fire("job").await.status, ExecutionStatus::Failed);
        assert_eq!(executor.calls(), 1);
    }

    #[tokio::test]
    async fn test_panicking_executor_is_failed() {
        let registry = TriggerRegistry::builder(test_config())
            .executor(Arc::new(PanickingExecutor))
            .build();
        registry.register(agent_trigger("job")).await.unwrap();
        let result = registry.fire("job").await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(registry.get_health_status().await.active_tasks, 0);
    }

    #[tokio::test]
    async fn test_circuit_opens_then_recovers() {
        let clock = Arc::new(ManualClock::new(start()));
        let executor = Arc::new(ScriptedExecutor::failing(3));
        let registry = TriggerRegistry::builder(test_config())
            .clock(clock.clone())
            .executor(executor.clone())
            .build();
        registry.register(agent_trigger("job")).await.unwrap();

        for _ in 0..3 {
            assert_eq!(registry.fire("job").await.status, ExecutionStatus::Failed);
            clock.advance(chrono::Duration::seconds(1));
        }
        let vetoed = registry.fire("job").await;
        assert_eq!(vetoed.skip_reason.as_deref(), Some("circuit open"));
        assert_eq!(executor.calls(), 3);
        assert_eq!(registry.get_status("job").await.unwrap().circuit_state, CircuitState::Open);
        assert_eq!(registry.metrics().await.open_circuits, 1);

        // After the recovery timeout one trial runs; it succeeds and closes the circuit.
        clock.advance(chrono::Duration::seconds(301));
        assert_eq!(registry.fire("job").await.status, ExecutionStatus::Success);
        assert_eq!(registry.get_status("job").await.unwrap().circuit_state, CircuitState::Closed);
        // Failures 1 and 3 alerted.
        assert_eq!(registry.notifier().history().len(), 2);
        assert_eq!(registry.notifier().consecutive_failures("job"), 0);
    }

    #[tokio::test]
    async fn test_post_hoc_limit_flags() {
        let ledger = Arc::new(MemoryLedger::new());
        let executor = Arc::new(ScriptedExecutor {
            calls: AtomicU32::new(0),
            fail_first: 0,
            error: || TaskClawError::Execution("unused".into()),
            cost_usd: 1.25,
        });
        let registry = TriggerRegistry::builder(test_config())
            .ledger(ledger.clone())
            .executor(executor)
            .build();
        let mut config = agent_trigger("job");
        config.max_cost_per_run = Some(0.5);
        config.max_duration = Some(3_600);
        registry.register(config).await.unwrap();

        // Breaches are flags only.
        assert_eq!(registry.fire("job").await.status, ExecutionStatus::Success);
        registry.flush().await;

        let history = registry.get_execution_history("job", 1).await.unwrap();
        let checks = &history[0].output_result["governance_checks"];
        assert_eq!(checks["max_cost_per_run"], json!(false));
        assert_eq!(checks["max_duration"], json!(true));
        assert_eq!(history[0].estimated_cost, 1.25);
        assert_eq!(history[0].run_id, "job-run-1");
        assert_eq!(history[0].task_type, TASK_TYPE);
    }

    #[tokio::test]
    async fn test_status_and_history_queries() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 2, 0).unwrap()));
        let registry = TriggerRegistry::builder(test_config())
            .clock(clock.clone())
            .executor(Arc::new(ScriptedExecutor::failing(1)))
            .build();
        registry.register(agent_trigger("job")).await.unwrap();

        registry.fire("job").await;
        registry.fire("job").await;
        registry.trigger_now("job").await;

        let status = registry.get_status("job").await.unwrap();
        assert_eq!(
            status.next_fire_time,
            Some(Utc.with_ymd_and_hms(2026, 3, 2, 9, 5, 0).unwrap())
        );
        assert_eq!(status.stats.sample_size, 3);
        assert!((status.stats.success_rate - 2.0 / 3.0).abs() < 1e-9);

        // No ledger: empty history, but unknown names still raise.
        assert!(registry.get_execution_history("job", 5).await.unwrap().is_empty());
        assert!(matches!(
            registry.get_execution_history("nope", 5).await,
            Err(TaskClawError::NotFound(_))
        ));
        assert!(matches!(registry.get_status("nope").await, Err(TaskClawError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_health_status() {
        let no_ledger = TriggerRegistry::builder(test_config()).build();
        no_ledger.register(agent_trigger("a")).await.unwrap();
        no_ledger.register(agent_trigger("b")).await.unwrap();
        no_ledger.pause("b").await.unwrap();
        let health = no_ledger.get_health_status().await;
        assert_eq!(health.status, HealthState::Degraded);
        assert_eq!((health.total_triggers, health.enabled_triggers, health.disabled_triggers), (2, 1, 1));
        assert!(!health.backend_connected);

        let with_ledger = TriggerRegistry::builder(test_config())
            .ledger(Arc::new(MemoryLedger::new()))
            .build();
        let health = with_ledger.get_health_status().await;
        assert_eq!(health.status, HealthState::Healthy);
        assert!(health.backend_connected);
        assert!(with_ledger.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_unregister() {
        let registry = TriggerRegistry::builder(test_config()).build();
        registry.register(agent_trigger("job")).await.unwrap();
        registry.pause("job").await.unwrap();
        let removed = registry.unregister("job").await.unwrap();
        assert!(!removed.enabled);
        assert!(registry.list_triggers().await.is_empty());
        assert!(matches!(registry.unregister("job").await, Err(TaskClawError::NotFound(_))));
        // The name can be registered again.
        registry.register(agent_trigger("job")).await.unwrap();
    }

    #[tokio::test]
    async fn test_metrics_counts_by_mode() {
        let registry = TriggerRegistry::builder(test_config())
            .executor(Arc::new(ScriptedExecutor::ok()))
            .build();
        registry.register(agent_trigger("job")).await.unwrap();
        registry.fire("job").await;
        registry.fire("missing").await;

        let snap = registry.metrics().await;
        assert_eq!(snap.total(ExecutionStatus::Success), 1);
        assert_eq!(snap.executions[0].decision_mode, Some(DecisionMode::Agent));
        assert_eq!(snap.durations["job"].count, 1);
        assert_eq!(snap.active_tasks, 0);
    }
}
