//! # TaskClaw Scheduler
//!
//! Governed execution engine for scheduled triggers: decides when, whether, and how
//! a recurring unit of work runs, and leaves an audit trail of every firing.
//!
//! ## Architecture
//! ```text
//! spawn_scheduler (tokio interval) ──┐      trigger_now / fire (manual, webhooks)
//!                                    ▼              │
//!                         TriggerRegistry.fire ◄────┘
//!                           ├── GovernanceGate: circuit → cooldown → daily runs → daily cost
//!                           ├── decision: agent (PrimaryExecutor) | fallback (handler)
//!                           ├── ConcurrencyController (bounded slots)
//!                           ├── RetryStrategy + CircuitBreaker
//!                           ├── ExecutionCache (history ring, TTL stats)
//!                           ├── Metrics + ErrorNotifier → Telegram / Discord / Webhook
//!                           └── BatchWriter ──► Ledger (fallback: local JSONL)
//! ```
//!
//! Without a ledger the engine still runs: history-based governance checks pass and
//! nothing is persisted.

pub mod batch;
pub mod cache;
pub mod circuit;
pub mod concurrency;
pub mod cron;
pub mod decision;
pub mod dispatch;
pub mod engine;
pub mod executor;
pub mod governance;
pub mod ledger;
pub mod metrics;
pub mod notify;
pub mod persistence;
pub mod priority;
pub mod registry;
pub mod retry;
pub mod tasks;

pub use batch::{BatchStats, BatchWriter, FallbackLog};
pub use cache::{ExecutionCache, TriggerStats};
pub use circuit::{CircuitBreaker, CircuitState};
pub use concurrency::ConcurrencyController;
pub use decision::{FixedRandom, RandomSource, SeededRandom, ThreadRandom};
pub use engine::{spawn_scheduler, DueTracker};
pub use executor::HttpExecutor;
pub use governance::GovernanceGate;
pub use ledger::MemoryLedger;
pub use metrics::{Metrics, MetricsSnapshot};
pub use notify::{ErrorNotifier, FnChannel, LogChannel, NotifyChannel};
pub use persistence::{MemoryCircuitStore, SqliteCircuitStore};
pub use priority::PriorityScheduler;
pub use registry::{HealthState, HealthStatus, TriggerRegistry, TriggerStatus};
pub use tasks::{
    DecisionMode, ExecutionRecord, ExecutionStatus, FallbackHandler, FallbackStrategy, FireResult,
    TriggerConfig,
};
