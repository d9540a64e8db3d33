//! Primary executor — the agent decision loop a trigger hands work to.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::ExecutorOutcome;

/// Runs the agent path for a firing. Owns its own timeout.
#[async_trait]
pub trait PrimaryExecutor: Send + Sync {
    async fn execute(
        &self,
        event_name: &str,
        focus: Option<&str>,
        payload: &serde_json::Value,
    ) -> Result<ExecutorOutcome>;
}
