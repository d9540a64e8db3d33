//! Data exchanged with the external collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the primary (agent) executor reports back for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorOutcome {
    pub run_id: String,
    pub tool_call_count: u32,
    /// Actual spend for the run, if the executor tracks it.
    #[serde(default)]
    pub cost_usd: f64,
}

/// One row of the audit ledger, as written and as read back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub tenant_id: String,
    pub agent_id: String,
    pub run_id: String,
    /// The trigger's event name.
    pub capability_name: String,
    pub task_type: String,
    pub input_params: serde_json::Value,
    pub output_result: serde_json::Value,
    pub reasoning: String,
    pub duration_ms: u64,
    /// Lowercase execution status ("success", "failed", "skipped", "fallback").
    pub status: String,
    pub error_message: Option<String>,
    #[serde(default)]
    pub estimated_cost: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Newest first.
    #[default]
    CreatedDesc,
    CreatedAsc,
}

/// Ledger query filters. Dates are inclusive bounds on `created_at`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerQuery {
    pub capability_name: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub order_by: SortOrder,
}

impl LedgerQuery {
    /// Records for one trigger.
    pub fn for_capability(name: &str) -> Self {
        Self {
            capability_name: Some(name.to_string()),
            ..Self::default()
        }
    }

    pub fn between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_date = Some(start);
        self.end_date = Some(end);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a record satisfies the capability and date filters.
    pub fn matches(&self, record: &LedgerRecord) -> bool {
        if let Some(name) = &self.capability_name {
            if &record.capability_name != name {
                return false;
            }
        }
        if let Some(start) = self.start_date {
            if record.created_at < start {
                return false;
            }
        }
        if let Some(end) = self.end_date {
            if record.created_at > end {
                return false;
            }
        }
        true
    }
}
