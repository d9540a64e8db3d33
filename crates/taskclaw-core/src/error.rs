//! TaskClaw error types.

use thiserror::Error;

/// Errors surfaced by the trigger engine and its collaborators.
#[derive(Debug, Error)]
pub enum TaskClawError {
    /// Bad cron expression, duplicate trigger, out-of-range config.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Trigger not found: {0}")]
    NotFound(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    /// The audit backend is absent or unreachable. Governance treats this as fail-open.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("State store error: {0}")]
    Store(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Notify error: {0}")]
    Notify(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl TaskClawError {
    /// True when the error means "no backend to ask" rather than "the backend said no".
    pub fn is_backend_absent(&self) -> bool {
        matches!(self, TaskClawError::BackendUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, TaskClawError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_absent() {
        assert!(TaskClawError::BackendUnavailable("down".into()).is_backend_absent());
        assert!(!TaskClawError::Ledger("constraint".into()).is_backend_absent());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err: TaskClawError = io.into();
        assert!(err.to_string().contains("disk full"));
    }
}
