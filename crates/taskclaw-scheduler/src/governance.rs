//! Governance gate — pre-execution vetoes.
//!
//! Checks run in a fixed order: circuit breaker, cooldown, daily run count, daily
//! cost. The first veto short-circuits. Every check that runs writes its outcome into
//! the record's `governance_checks` map.
//!
//! The three history checks need the ledger. Without one, or when the ledger reports
//! itself unavailable, they pass. Any other ledger error vetoes the firing.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use taskclaw_core::error::Result;
use taskclaw_core::{Clock, Ledger, LedgerQuery, LedgerRecord};

use crate::circuit::CircuitBreaker;
use crate::tasks::{ExecutionRecord, ExecutionStatus, TriggerConfig};

pub const CHECK_CIRCUIT: &str = "circuit_breaker";
pub const CHECK_COOLDOWN: &str = "cooldown";
pub const CHECK_DAILY_RUNS: &str = "daily_run_count";
pub const CHECK_DAILY_COST: &str = "daily_cost";

/// Outcome of the gate for one firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GovernanceDecision {
    pub allowed: bool,
    /// Skip reason when vetoed.
    pub reason: Option<String>,
}

impl GovernanceDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn veto(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

enum CheckOutcome {
    Pass,
    Veto(String),
}

pub struct GovernanceGate {
    circuit: Arc<CircuitBreaker>,
    ledger: Option<Arc<dyn Ledger>>,
    tenant_id: String,
    clock: Arc<dyn Clock>,
}

impl GovernanceGate {
    pub fn new(
        circuit: Arc<CircuitBreaker>,
        ledger: Option<Arc<dyn Ledger>>,
        tenant_id: &str,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            circuit,
            ledger,
            tenant_id: tenant_id.to_string(),
            clock,
        }
    }

    pub async fn check(&self, config: &TriggerConfig, record: &mut ExecutionRecord) -> GovernanceDecision {
        let event = config.event_name.as_str();

        let circuit = self.circuit.check(event).await;
        record
            .governance_checks
            .insert(CHECK_CIRCUIT.to_string(), circuit.allowed);
        if !circuit.allowed {
            return GovernanceDecision::veto(circuit.reason.unwrap_or_else(|| "circuit open".into()));
        }

        for name in [CHECK_COOLDOWN, CHECK_DAILY_RUNS, CHECK_DAILY_COST] {
            let outcome = match name {
                CHECK_COOLDOWN => self.check_cooldown(config).await,
                CHECK_DAILY_RUNS => self.check_daily_runs(config).await,
                _ => self.check_daily_cost(config).await,
            };
            match outcome {
                CheckOutcome::Pass => {
                    record.governance_checks.insert(name.to_string(), true);
                }
                CheckOutcome::Veto(reason) => {
                    record.governance_checks.insert(name.to_string(), false);
                    // A granted half-open trial that never runs goes back.
                    self.circuit.release_trial(event).await;
                    tracing::info!("🛑 '{}' vetoed by governance: {}", event, reason);
                    return GovernanceDecision::veto(reason);
                }
            }
        }

        GovernanceDecision::allow()
    }

    async fn check_cooldown(&self, config: &TriggerConfig) -> CheckOutcome {
        if config.cooldown_seconds == 0 {
            return CheckOutcome::Pass;
        }
        let now = self.clock.now();
        let window = Duration::seconds(i64::try_from(config.cooldown_seconds).unwrap_or(i64::MAX / 1000));
        let since = now - window;
        match self.history(config, since, now, CHECK_COOLDOWN).await {
            HistoryResult::Rows(rows) => {
                let recent = rows.iter().any(|r| now - r.created_at < window);
                if recent {
                    CheckOutcome::Veto("cooldown".into())
                } else {
                    CheckOutcome::Pass
                }
            }
            HistoryResult::Pass => CheckOutcome::Pass,
            HistoryResult::Veto(reason) => CheckOutcome::Veto(reason),
        }
    }

    async fn check_daily_runs(&self, config: &TriggerConfig) -> CheckOutcome {
        let Some(limit) = config.max_daily_runs else {
            return CheckOutcome::Pass;
        };
        let now = self.clock.now();
        match self.history(config, start_of_day(now), now, CHECK_DAILY_RUNS).await {
            HistoryResult::Rows(rows) => {
                if rows.len() as u64 >= u64::from(limit) {
                    CheckOutcome::Veto("daily run limit".into())
                } else {
                    CheckOutcome::Pass
                }
            }
            HistoryResult::Pass => CheckOutcome::Pass,
            HistoryResult::Veto(reason) => CheckOutcome::Veto(reason),
        }
    }

    async fn check_daily_cost(&self, config: &TriggerConfig) -> CheckOutcome {
        let Some(limit) = config.max_daily_cost else {
            return CheckOutcome::Pass;
        };
        let now = self.clock.now();
        match self.history(config, start_of_day(now), now, CHECK_DAILY_COST).await {
            HistoryResult::Rows(rows) => {
                let spent: f64 = rows.iter().map(|r| r.estimated_cost).sum();
                if spent >= limit {
                    CheckOutcome::Veto("daily cost limit".into())
                } else {
                    CheckOutcome::Pass
                }
            }
            HistoryResult::Pass => CheckOutcome::Pass,
            HistoryResult::Veto(reason) => CheckOutcome::Veto(reason),
        }
    }

    /// Executed (non-skipped) ledger rows for this trigger in `[since, until]`.
    async fn history(
        &self,
        config: &TriggerConfig,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        check: &str,
    ) -> HistoryResult {
        let Some(ledger) = &self.ledger else {
            return HistoryResult::Pass;
        };
        let query = LedgerQuery::for_capability(&config.event_name).between(since, until);
        match query_executed(ledger.as_ref(), &self.tenant_id, &query).await {
            Ok(rows) => HistoryResult::Rows(rows),
            Err(e) if e.is_backend_absent() => {
                tracing::debug!("📭 {} check skipped for '{}': {e}", check, config.event_name);
                HistoryResult::Pass
            }
            Err(e) => {
                tracing::warn!("⚠️ {} check failed for '{}': {e}", check, config.event_name);
                HistoryResult::Veto(format!("{check} check error"))
            }
        }
    }
}

enum HistoryResult {
    Rows(Vec<LedgerRecord>),
    Pass,
    Veto(String),
}

async fn query_executed(ledger: &dyn Ledger, tenant_id: &str, query: &LedgerQuery) -> Result<Vec<LedgerRecord>> {
    let skipped = ExecutionStatus::Skipped.as_str();
    let rows = ledger.query_records(tenant_id, query).await?;
    Ok(rows.into_iter().filter(|r| r.status != skipped).collect())
}

/// Midnight UTC of `now`'s day.
pub fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::tasks::ExecutionSummary;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use taskclaw_core::error::TaskClawError;
    use taskclaw_core::config::CircuitConfig;
    use taskclaw_core::ManualClock;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    fn ledger_row(event: &str, at: DateTime<Utc>, status: &str, cost: f64) -> LedgerRecord {
        LedgerRecord {
            tenant_id: "default".into(),
            agent_id: "taskclaw-scheduler".into(),
            run_id: uuid::Uuid::new_v4().to_string(),
            capability_name: event.into(),
            task_type: "scheduled_trigger".into(),
            input_params: serde_json::json!({}),
            output_result: serde_json::json!({}),
            reasoning: String::new(),
            duration_ms: 0,
            status: status.into(),
            error_message: None,
            estimated_cost: cost,
            created_at: at,
        }
    }

    fn gate(ledger: Option<Arc<dyn Ledger>>, clock: Arc<ManualClock>) -> (GovernanceGate, Arc<CircuitBreaker>) {
        let circuit = Arc::new(CircuitBreaker::new(CircuitConfig::default(), clock.clone()));
        (
            GovernanceGate::new(circuit.clone(), ledger, "default", clock),
            circuit,
        )
    }

    struct BrokenLedger {
        absent: bool,
    }

    #[async_trait]
    impl Ledger for BrokenLedger {
        async fn record_execution(&self, _record: &LedgerRecord) -> Result<()> {
            Ok(())
        }

        async fn query_records(&self, _tenant_id: &str, _query: &LedgerQuery) -> Result<Vec<LedgerRecord>> {
            if self.absent {
                Err(TaskClawError::BackendUnavailable("no ledger".into()))
            } else {
                Err(TaskClawError::Ledger("syntax error".into()))
            }
        }
    }

    #[tokio::test]
    async fn test_no_ledger_passes_history_checks() {
        let clock = Arc::new(ManualClock::new(start()));
        let (gate, _) = gate(None, clock.clone());
        let mut config = TriggerConfig::new("job", "* * * * *");
        config.cooldown_seconds = 60;
        config.max_daily_runs = Some(0);
        config.max_daily_cost = Some(0.0);

        let mut record = ExecutionRecord::new("job", clock.now());
        let decision = gate.check(&config, &mut record).await;
        assert!(decision.allowed);
        assert_eq!(record.governance_checks.len(), 4);
        assert!(record.governance_checks.values().all(|passed| *passed));
    }

    #[tokio::test]
    async fn test_cooldown_ignores_skipped_rows() {
        let clock = Arc::new(ManualClock::new(start()));
        let ledger = Arc::new(MemoryLedger::new());
        let now = clock.now();
        ledger
            .record_execution(&ledger_row("job", now - Duration::seconds(10), "skipped", 0.0))
            .await
            .unwrap();
        let (gate, _) = gate(Some(ledger.clone()), clock.clone());
        let mut config = TriggerConfig::new("job", "* * * * *");
        config.cooldown_seconds = 60;

        let mut record = ExecutionRecord::new("job", now);
        assert!(gate.check(&config, &mut record).await.allowed);

        ledger
            .record_execution(&ledger_row("job", now - Duration::seconds(10), "success", 0.0))
            .await
            .unwrap();
        let mut record = ExecutionRecord::new("job", now);
        let decision = gate.check(&config, &mut record).await;
        assert_eq!(decision.reason.as_deref(), Some("cooldown"));
        assert_eq!(record.governance_checks.get(CHECK_COOLDOWN), Some(&false));
        assert!(!record.governance_checks.contains_key(CHECK_DAILY_RUNS));
    }

    #[tokio::test]
    async fn test_daily_limits() {
        let clock = Arc::new(ManualClock::new(start()));
        let ledger = Arc::new(MemoryLedger::new());
        let now = clock.now();
        // Yesterday's run does not count.
        ledger
            .record_execution(&ledger_row("job", now - Duration::days(1), "success", 5.0))
            .await
            .unwrap();
        ledger
            .record_execution(&ledger_row("job", now - Duration::hours(1), "success", 0.6))
            .await
            .unwrap();
        let (gate, _) = gate(Some(ledger.clone()), clock.clone());

        let mut config = TriggerConfig::new("job", "* * * * *");
        config.max_daily_runs = Some(2);
        config.max_daily_cost = Some(1.0);
        let mut record = ExecutionRecord::new("job", now);
        assert!(gate.check(&config, &mut record).await.allowed);

        ledger
            .record_execution(&ledger_row("job", now - Duration::minutes(30), "failed", 0.1))
            .await
            .unwrap();
        let mut record = ExecutionRecord::new("job", now);
        assert_eq!(
            gate.check(&config, &mut record).await.reason.as_deref(),
            Some("daily run limit")
        );

        config.max_daily_runs = Some(10);
        ledger
            .record_execution(&ledger_row("job", now - Duration::minutes(20), "success", 0.3))
            .await
            .unwrap();
        let mut record = ExecutionRecord::new("job", now);
        assert_eq!(
            gate.check(&config, &mut record).await.reason.as_deref(),
            Some("daily cost limit")
        );
    }

    #[tokio::test]
    async fn test_backend_unavailable_fails_open_other_errors_fail_closed() {
        let clock = Arc::new(ManualClock::new(start()));
        let mut config = TriggerConfig::new("job", "* * * * *");
        config.cooldown_seconds = 30;

        let (gate_open, _) = gate(Some(Arc::new(BrokenLedger { absent: true })), clock.clone());
        let mut record = ExecutionRecord::new("job", clock.now());
        assert!(gate_open.check(&config, &mut record).await.allowed);

        let (gate_closed, _) = gate(Some(Arc::new(BrokenLedger { absent: false })), clock.clone());
        let mut record = ExecutionRecord::new("job", clock.now());
        let decision = gate_closed.check(&config, &mut record).await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason.as_deref(), Some("cooldown check error"));
    }

    #[tokio::test]
    async fn test_open_circuit_vetoes_first() {
        let clock = Arc::new(ManualClock::new(start()));
        let (gate, circuit) = gate(None, clock.clone());
        let failures: Vec<ExecutionSummary> = (0..3)
            .map(|i| {
                let mut r = ExecutionRecord::new("job", clock.now());
                r.execution_id = format!("f{i}");
                r.fail("boom");
                r.summary()
            })
            .collect();
        circuit.evaluate("job", &failures).await;

        let config = TriggerConfig::new("job", "* * * * *");
        let mut record = ExecutionRecord::new("job", clock.now());
        let decision = gate.check(&config, &mut record).await;
        assert_eq!(decision.reason.as_deref(), Some("circuit open"));
        assert_eq!(record.governance_checks.len(), 1);
        assert_eq!(record.governance_checks.get(CHECK_CIRCUIT), Some(&false));
    }

    #[test]
    fn test_start_of_day() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 17, 45, 12).unwrap();
        assert_eq!(start_of_day(now), Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap());
    }
}
