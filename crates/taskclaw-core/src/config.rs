//! TaskClaw configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, TaskClawError};

/// Root scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Tenant the audit ledger records and queries under.
    #[serde(default = "default_tenant_id")]
    pub tenant_id: String,
    /// Agent identity written into every ledger record.
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
    /// Global cap on concurrently running firings.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Scheduler loop tick interval.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub circuit: CircuitConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

fn default_tenant_id() -> String { "default".into() }
fn default_agent_id() -> String { "taskclaw-scheduler".into() }
fn default_max_concurrency() -> usize { 10 }
fn default_tick_interval_secs() -> u64 { 30 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tenant_id: default_tenant_id(),
            agent_id: default_agent_id(),
            max_concurrency: default_max_concurrency(),
            tick_interval_secs: default_tick_interval_secs(),
            cache: CacheConfig::default(),
            circuit: CircuitConfig::default(),
            batch: BatchConfig::default(),
            retry: RetryConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Load config from the default path (~/.taskclaw/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TaskClawError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| TaskClawError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| TaskClawError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(TaskClawError::Config("max_concurrency must be at least 1".into()));
        }
        if self.cache.history_capacity == 0 {
            return Err(TaskClawError::Config("cache.history_capacity must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.circuit.failure_threshold) {
            return Err(TaskClawError::Config(format!(
                "circuit.failure_threshold must be within [0, 1], got {}",
                self.circuit.failure_threshold
            )));
        }
        if self.circuit.window_size == 0 {
            return Err(TaskClawError::Config("circuit.window_size must be at least 1".into()));
        }
        if self.batch.batch_size == 0 || self.batch.chunk_size == 0 {
            return Err(TaskClawError::Config("batch sizes must be at least 1".into()));
        }
        if self.batch.max_attempts == 0 {
            return Err(TaskClawError::Config("batch.max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the TaskClaw home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".taskclaw")
    }
}

/// Execution history ring and stats cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Recent outcomes kept per trigger (also the status sample window).
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_stats_ttl_secs")]
    pub stats_ttl_secs: u64,
}

fn default_history_capacity() -> usize { 50 }
fn default_stats_ttl_secs() -> u64 { 60 }

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            stats_ttl_secs: default_stats_ttl_secs(),
        }
    }
}

/// Circuit breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// How many recent executed outcomes the failure ratio is computed over.
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Failure ratio at or above which the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: f64,
    /// Outcomes required in the window before the circuit may open.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
    /// Namespace for keys in the external state store.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_window_size() -> usize { 10 }
fn default_failure_threshold() -> f64 { 0.5 }
fn default_min_samples() -> usize { 3 }
fn default_recovery_timeout_secs() -> u64 { 300 }
fn default_key_prefix() -> String { "taskclaw:circuit".into() }

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            failure_threshold: default_failure_threshold(),
            min_samples: default_min_samples(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            key_prefix: default_key_prefix(),
        }
    }
}

/// Batched audit persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Flush once this many records are buffered.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Flush a non-empty buffer after this long even if it is not full.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Commit attempts per record before degrading to the fallback log.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Records per call when the ledger has a native batch API.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Append-only JSONL file for records the ledger never accepted.
    #[serde(default = "default_fallback_log_path")]
    pub fallback_log_path: PathBuf,
}

fn default_batch_size() -> usize { 50 }
fn default_flush_interval_ms() -> u64 { 1_000 }
fn default_max_attempts() -> u32 { 3 }
fn default_retry_base_delay_ms() -> u64 { 200 }
fn default_chunk_size() -> usize { 100 }
fn default_fallback_log_path() -> PathBuf {
    SchedulerConfig::home_dir().join("ledger_fallback.jsonl")
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            chunk_size: default_chunk_size(),
            fallback_log_path: default_fallback_log_path(),
        }
    }
}

/// Retry backoff ceiling for primary executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

fn default_max_delay_secs() -> u64 { 300 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

/// Failure alert sinks. Empty values mean "not configured".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default)]
    pub discord_webhook_url: String,
    #[serde(default)]
    pub telegram_bot_token: String,
    #[serde(default)]
    pub telegram_chat_id: String,
}
