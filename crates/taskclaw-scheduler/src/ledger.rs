//! In-process audit ledger.
//!
//! Holds records per tenant in insertion order. Useful for tests, for the CLI's
//! one-shot `fire`, and as a stand-in wherever no external ledger is wired up.

use std::collections::HashMap;

use async_trait::async_trait;
use taskclaw_core::error::Result;
use taskclaw_core::{Ledger, LedgerQuery, LedgerRecord, SortOrder};
use tokio::sync::RwLock;

pub struct MemoryLedger {
    records: RwLock<HashMap<String, Vec<LedgerRecord>>>,
    native_batch: bool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            native_batch: false,
        }
    }

    /// Advertise a native batch API (`supports_batch() == true`).
    pub fn with_batch_support() -> Self {
        Self {
            native_batch: true,
            ..Self::new()
        }
    }

    /// Total records across all tenants.
    pub async fn len(&self) -> usize {
        self.records.read().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Every record for a tenant, in insertion order.
    pub async fn all(&self, tenant_id: &str) -> Vec<LedgerRecord> {
        self.records
            .read()
            .await
            .get(tenant_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn record_execution(&self, record: &LedgerRecord) -> Result<()> {
        self.records
            .write()
            .await
            .entry(record.tenant_id.clone())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn query_records(&self, tenant_id: &str, query: &LedgerQuery) -> Result<Vec<LedgerRecord>> {
        let records = self.records.read().await;
        let mut matched: Vec<LedgerRecord> = records
            .get(tenant_id)
            .map(|rows| rows.iter().filter(|r| query.matches(r)).cloned().collect())
            .unwrap_or_default();

        // Stable sort keeps insertion order among equal timestamps.
        match query.order_by {
            SortOrder::CreatedAsc => matched.sort_by_key(|r| r.created_at),
            SortOrder::CreatedDesc => {
                matched.reverse();
                matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            }
        }
        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    fn supports_batch(&self) -> bool {
        self.native_batch
    }

    async fn batch_record_executions(&self, batch: &[LedgerRecord]) -> Result<()> {
        let mut records = self.records.write().await;
        for record in batch {
            records
                .entry(record.tenant_id.clone())
                .or_default()
                .push(record.clone());
        }
        Ok(())
    }
}
