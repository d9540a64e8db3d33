//! Audit ledger contract.

use async_trait::async_trait;

use crate::error::{Result, TaskClawError};
use crate::types::{LedgerQuery, LedgerRecord};

/// External audit store. Only the read/write contract matters to the engine.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn record_execution(&self, record: &LedgerRecord) -> Result<()>;

    async fn query_records(&self, tenant_id: &str, query: &LedgerQuery) -> Result<Vec<LedgerRecord>>;

    /// Whether [`Ledger::batch_record_executions`] is a native batch API.
    fn supports_batch(&self) -> bool {
        false
    }

    /// Commit a whole chunk atomically. Only called when `supports_batch()` is true.
    async fn batch_record_executions(&self, _records: &[LedgerRecord]) -> Result<()> {
        Err(TaskClawError::Unsupported("batch_record_executions".into()))
    }

    /// Connectivity probe for health reporting.
    async fn health_check(&self) -> bool {
        true
    }
}
