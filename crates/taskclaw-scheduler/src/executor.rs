//! HTTP primary executor — hands a firing to a remote agent endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use taskclaw_core::error::{Result, TaskClawError};
use taskclaw_core::{ExecutorOutcome, PrimaryExecutor};

/// POSTs `{event_name, focus, payload}` and reads back `{run_id, tool_call_count, cost_usd}`.
pub struct HttpExecutor {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    bearer_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AgentResponse {
    run_id: String,
    #[serde(default)]
    tool_call_count: u32,
    #[serde(default)]
    cost_usd: f64,
}

impl HttpExecutor {
    pub fn new(url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            timeout: Duration::from_secs(300),
            bearer_token: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_bearer_token(mut self, token: &str) -> Self {
        self.bearer_token = Some(token.to_string());
        self
    }
}

#[async_trait]
impl PrimaryExecutor for HttpExecutor {
    async fn execute(
        &self,
        event_name: &str,
        focus: Option<&str>,
        payload: &serde_json::Value,
    ) -> Result<ExecutorOutcome> {
        tracing::debug!("🤖 Dispatching '{}' to agent at {}", event_name, self.url);
        let mut req = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "event_name": event_name,
                "focus": focus,
                "payload": payload,
            }))
            .timeout(self.timeout);
        if let Some(token) = &self.bearer_token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                TaskClawError::Timeout(format!("agent call for '{event_name}' timed out"))
            } else {
                TaskClawError::Http(format!("agent call for '{event_name}' failed: {e}"))
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            // 4xx is not retried.
            return Err(if status.is_client_error() {
                TaskClawError::Validation(format!("agent rejected '{event_name}' ({status}): {body}"))
            } else {
                TaskClawError::Execution(format!("agent error for '{event_name}' ({status}): {body}"))
            });
        }

        let parsed: AgentResponse = resp
            .json()
            .await
            .map_err(|e| TaskClawError::Execution(format!("bad agent response for '{event_name}': {e}")))?;
        Ok(ExecutorOutcome {
            run_id: parsed.run_id,
            tool_call_count: parsed.tool_call_count,
            cost_usd: parsed.cost_usd,
        })
    }
}
