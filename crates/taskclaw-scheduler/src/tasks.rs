//! Trigger definitions and execution records — the core data model.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use taskclaw_core::error::{Result, TaskClawError};

use crate::cron;

/// Execution lifecycle.
///
/// `Pending → Running → {Success | Failed | Skipped | Fallback}`; a disabled trigger or
/// a governance veto goes straight from `Pending` to `Skipped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    Fallback,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Skipped => "skipped",
            ExecutionStatus::Fallback => "fallback",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which path a firing took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionMode {
    /// The primary (LLM agent) executor.
    Agent,
    /// The configured fallback handler.
    Fallback,
}

impl fmt::Display for DecisionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionMode::Agent => write!(f, "agent"),
            DecisionMode::Fallback => write!(f, "fallback"),
        }
    }
}

/// When the fallback handler runs relative to the primary path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    /// Only when the firing was routed to the fallback.
    Never,
    /// Additionally after a primary failure.
    #[default]
    OnFailure,
    /// After every primary run, whatever its outcome (shadow mode during migration).
    Always,
}

/// What a fallback handler receives.
#[derive(Debug, Clone, Serialize)]
pub struct FallbackContext {
    pub event_name: String,
    pub execution_id: String,
    pub payload: serde_json::Value,
    /// Set when the fallback runs after the primary path failed.
    pub primary_error: Option<String>,
}

type HandlerFn = dyn Fn(FallbackContext) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync;

/// The legacy (non-agent) implementation of a trigger. May be sync or async.
#[derive(Clone)]
pub struct FallbackHandler {
    inner: Arc<HandlerFn>,
}

impl FallbackHandler {
    /// Wrap an async handler.
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(FallbackContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        Self {
            inner: Arc::new(move |ctx| Box::pin(f(ctx))),
        }
    }

    /// Wrap a synchronous handler.
    pub fn from_sync<F>(f: F) -> Self
    where
        F: Fn(FallbackContext) -> Result<serde_json::Value> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(move |ctx| {
                let result = f(ctx);
                Box::pin(async move { result })
            }),
        }
    }

    pub async fn call(&self, ctx: FallbackContext) -> Result<serde_json::Value> {
        (self.inner)(ctx).await
    }
}

impl fmt::Debug for FallbackHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FallbackHandler")
    }
}

/// A registered trigger. Immutable after registration except for `enabled`,
/// which the registry tracks separately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Unique key across the registry.
    pub event_name: String,
    /// 5-field cron expression.
    pub cron_expression: String,
    #[serde(default)]
    pub description: String,
    /// Routing hint forwarded to the primary executor.
    #[serde(default)]
    pub focus: Option<String>,
    #[serde(skip)]
    pub fallback_handler: Option<FallbackHandler>,
    #[serde(default)]
    pub fallback_strategy: FallbackStrategy,
    /// Probability of routing a firing to the primary executor.
    #[serde(default)]
    pub migration_weight: f64,

    // ── Governance limits ──
    #[serde(default)]
    pub max_cost_per_run: Option<f64>,
    #[serde(default)]
    pub max_daily_cost: Option<f64>,
    /// Seconds.
    #[serde(default)]
    pub max_duration: Option<u64>,
    #[serde(default)]
    pub cooldown_seconds: u64,
    #[serde(default)]
    pub max_daily_runs: Option<u32>,

    // ── Retry policy (primary path) ──
    #[serde(default)]
    pub retry_on_failure: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: u64,

    /// Higher runs first when several firings are ready at once.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_seconds() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl TriggerConfig {
    /// A trigger with default policy: fallback only, no limits.
    pub fn new(event_name: &str, cron_expression: &str) -> Self {
        Self {
            event_name: event_name.to_string(),
            cron_expression: cron_expression.to_string(),
            description: String::new(),
            focus: None,
            fallback_handler: None,
            fallback_strategy: FallbackStrategy::default(),
            migration_weight: 0.0,
            max_cost_per_run: None,
            max_daily_cost: None,
            max_duration: None,
            cooldown_seconds: 0,
            max_daily_runs: None,
            retry_on_failure: false,
            max_retries: default_max_retries(),
            retry_delay_seconds: default_retry_delay_seconds(),
            priority: 0,
            tags: Vec::new(),
            enabled: true,
        }
    }

    pub fn with_fallback(mut self, handler: FallbackHandler) -> Self {
        self.fallback_handler = Some(handler);
        self
    }

    pub fn with_migration_weight(mut self, weight: f64) -> Self {
        self.migration_weight = weight;
        self
    }

    /// Check the config and clamp `migration_weight` into [0, 1].
    pub fn validated(mut self) -> Result<Self> {
        if self.event_name.trim().is_empty() {
            return Err(TaskClawError::Validation("event_name must not be empty".into()));
        }
        cron::CronSchedule::parse(&self.cron_expression)?;
        if self.migration_weight.is_nan() {
            return Err(TaskClawError::Validation(format!(
                "migration_weight for '{}' is NaN",
                self.event_name
            )));
        }
        self.migration_weight = self.migration_weight.clamp(0.0, 1.0);

        for (name, value) in [
            ("max_cost_per_run", self.max_cost_per_run),
            ("max_daily_cost", self.max_daily_cost),
        ] {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(TaskClawError::Validation(format!(
                        "{name} for '{}' must be a non-negative number, got {v}",
                        self.event_name
                    )));
                }
            }
        }
        Ok(self)
    }
}

/// One firing's record. Owned by the firing until handed to the batch writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub event_name: String,
    pub triggered_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub decision_mode: Option<DecisionMode>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: f64,
    pub primary_run_id: Option<String>,
    pub llm_call_count: u32,
    pub cost_usd: f64,
    /// check name → passed. Includes post-hoc limit flags.
    pub governance_checks: BTreeMap<String, bool>,
    pub skip_reason: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    /// The fallback handler ran in addition to the primary path.
    pub fallback_invoked: bool,
}

impl ExecutionRecord {
    pub fn new(event_name: &str, triggered_at: DateTime<Utc>) -> Self {
        Self {
            execution_id: uuid::Uuid::new_v4().to_string(),
            event_name: event_name.to_string(),
            triggered_at,
            status: ExecutionStatus::Pending,
            decision_mode: None,
            started_at: None,
            completed_at: None,
            duration_seconds: 0.0,
            primary_run_id: None,
            llm_call_count: 0,
            cost_usd: 0.0,
            governance_checks: BTreeMap::new(),
            skip_reason: None,
            error_message: None,
            retry_count: 0,
            fallback_invoked: false,
        }
    }

    /// `Pending → Skipped` (or `Running → Skipped` when there is no fallback to run).
    pub fn skip(&mut self, reason: &str) {
        self.status = ExecutionStatus::Skipped;
        self.skip_reason = Some(reason.to_string());
    }

    pub fn start(&mut self, mode: DecisionMode, at: DateTime<Utc>) {
        self.status = ExecutionStatus::Running;
        self.decision_mode = Some(mode);
        self.started_at = Some(at);
    }

    pub fn fail(&mut self, error: &str) {
        self.status = ExecutionStatus::Failed;
        self.error_message = Some(error.to_string());
    }

    /// Stamp completion time and duration.
    pub fn finish(&mut self, at: DateTime<Utc>) {
        self.completed_at = Some(at);
        if let Some(started) = self.started_at {
            self.duration_seconds = ((at - started).num_milliseconds().max(0) as f64) / 1000.0;
        }
    }

    /// Outcome counted by the circuit breaker and status window.
    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            execution_id: self.execution_id.clone(),
            status: self.status,
            decision_mode: self.decision_mode,
            triggered_at: self.triggered_at,
            duration_seconds: self.duration_seconds,
            cost_usd: self.cost_usd,
        }
    }
}

/// Compact view of a finished firing kept in the in-memory history ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub decision_mode: Option<DecisionMode>,
    pub triggered_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub cost_usd: f64,
}

impl ExecutionSummary {
    pub fn is_failure(&self) -> bool {
        self.status == ExecutionStatus::Failed
    }
}

/// What `fire`/`trigger_now` hand back to the caller. Never an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FireResult {
    pub status: ExecutionStatus,
    pub execution_id: String,
    pub duration_seconds: f64,
    pub decision_mode: Option<DecisionMode>,
    pub skip_reason: Option<String>,
    pub error_message: Option<String>,
}

impl From<&ExecutionRecord> for FireResult {
    fn from(record: &ExecutionRecord) -> Self {
        Self {
            status: record.status,
            execution_id: record.execution_id.clone(),
            duration_seconds: record.duration_seconds,
            decision_mode: record.decision_mode,
            skip_reason: record.skip_reason.clone(),
            error_message: record.error_message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validated_clamps_weight() {
        let config = TriggerConfig::new("job", "0 8 * * *")
            .with_migration_weight(1.7)
            .validated()
            .unwrap();
        assert_eq!(config.migration_weight, 1.0);

        let config = TriggerConfig::new("job", "0 8 * * *")
            .with_migration_weight(-0.2)
            .validated()
            .unwrap();
        assert_eq!(config.migration_weight, 0.0);
    }

    #[test]
    fn test_validated_rejects_bad_cron() {
        let err = TriggerConfig::new("job", "0 8 * *").validated().unwrap_err();
        assert!(matches!(err, TaskClawError::Validation(_)));
    }

    #[test]
    fn test_validated_rejects_negative_cost() {
        let mut config = TriggerConfig::new("job", "* * * * *");
        config.max_daily_cost = Some(-1.0);
        assert!(config.validated().is_err());
    }

    #[test]
    fn test_trigger_config_from_toml() {
        let config: TriggerConfig = toml::from_str(
            r#"
            event_name = "daily-digest"
            cron_expression = "0 8 * * 1-5"
            migration_weight = 0.25
            fallback_strategy = "always"
            cooldown_seconds = 600
            max_daily_runs = 3
            tags = ["email"]
            "#,
        )
        .unwrap();
        assert_eq!(config.event_name, "daily-digest");
        assert_eq!(config.fallback_strategy, FallbackStrategy::Always);
        assert_eq!(config.max_daily_runs, Some(3));
        assert!(config.enabled);
        assert!(config.fallback_handler.is_none());
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_record_lifecycle() {
        let now = Utc::now();
        let mut record = ExecutionRecord::new("job", now);
        assert_eq!(record.status, ExecutionStatus::Pending);
        assert!(!record.status.is_terminal());

        record.start(DecisionMode::Agent, now);
        assert_eq!(record.status, ExecutionStatus::Running);

        record.fail("boom");
        record.finish(now + chrono::Duration::milliseconds(1500));
        assert!(record.status.is_terminal());
        assert_eq!(record.duration_seconds, 1.5);
        assert!(record.summary().is_failure());
    }

    #[tokio::test]
    async fn test_sync_and_async_handlers() {
        let sync = FallbackHandler::from_sync(|ctx| Ok(serde_json::json!({"sync": ctx.event_name})));
        let asynch = FallbackHandler::from_async(|ctx: FallbackContext| async move {
            Ok(serde_json::json!({"async": ctx.execution_id}))
        });
        let ctx = FallbackContext {
            event_name: "job".into(),
            execution_id: "e1".into(),
            payload: serde_json::Value::Null,
            primary_error: None,
        };
        assert_eq!(sync.call(ctx.clone()).await.unwrap()["sync"], "job");
        assert_eq!(asynch.call(ctx).await.unwrap()["async"], "e1");
    }
}
