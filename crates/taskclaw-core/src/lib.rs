//! # TaskClaw Core
//!
//! Shared building blocks for the TaskClaw trigger engine:
//! error taxonomy, configuration, the injectable clock, and the
//! collaborator traits the scheduler consumes (primary executor,
//! audit ledger, circuit state store).

pub mod clock;
pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SchedulerConfig;
pub use error::{Result, TaskClawError};
pub use traits::{CircuitStateStore, Ledger, PrimaryExecutor};
pub use types::{ExecutorOutcome, LedgerQuery, LedgerRecord, SortOrder};
