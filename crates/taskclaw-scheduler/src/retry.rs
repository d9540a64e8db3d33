//! Retry decisions and exponential backoff.

use std::time::Duration;

use taskclaw_core::error::TaskClawError;

/// Whether a failed primary run should be attempted again.
///
/// Validation and programmer errors are never retried; transient and timeout-like
/// errors are, until `max_retries` is reached.
pub fn should_retry(
    error: &TaskClawError,
    retry_count: u32,
    max_retries: u32,
    retry_enabled: bool,
) -> bool {
    if !retry_enabled || retry_count >= max_retries {
        return false;
    }
    is_retryable(error)
}

/// Error kinds worth another attempt.
pub fn is_retryable(error: &TaskClawError) -> bool {
    match error {
        TaskClawError::Execution(_)
        | TaskClawError::Timeout(_)
        | TaskClawError::Ledger(_)
        | TaskClawError::BackendUnavailable(_)
        | TaskClawError::Store(_)
        | TaskClawError::Http(_)
        | TaskClawError::Io(_) => true,
        TaskClawError::Validation(_)
        | TaskClawError::NotFound(_)
        | TaskClawError::Unsupported(_)
        | TaskClawError::Config(_)
        | TaskClawError::Notify(_)
        | TaskClawError::Serialization(_)
        | TaskClawError::Other(_) => false,
    }
}

/// `base_delay * 2^retry_count`, capped at `max_delay`.
pub fn calculate_delay(retry_count: u32, base_delay: Duration, max_delay: Duration) -> Duration {
    let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
    base_delay
        .checked_mul(factor)
        .unwrap_or(max_delay)
        .min(max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_retry_transient() {
        let err = TaskClawError::Timeout("agent took too long".into());
        assert!(should_retry(&err, 0, 3, true));
        assert!(should_retry(&err, 2, 3, true));
        assert!(!should_retry(&err, 3, 3, true));
    }

    #[test]
    fn test_should_retry_disabled() {
        let err = TaskClawError::Execution("503".into());
        assert!(!should_retry(&err, 0, 3, false));
    }

    #[test]
    fn test_validation_never_retried() {
        let err = TaskClawError::Validation("bad input".into());
        assert!(!should_retry(&err, 0, 10, true));
        assert!(!should_retry(&TaskClawError::NotFound("x".into()), 0, 10, true));
    }

    #[test]
    fn test_delay_growth() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(60);
        assert_eq!(calculate_delay(0, base, max), Duration::from_secs(1));
        assert_eq!(calculate_delay(1, base, max), Duration::from_secs(2));
        assert_eq!(calculate_delay(3, base, max), Duration::from_secs(8));
        assert_eq!(calculate_delay(6, base, max), max);
    }

    #[test]
    fn test_delay_monotonic_and_capped() {
        let base = Duration::from_millis(250);
        let max = Duration::from_secs(30);
        let mut prev = Duration::ZERO;
        for n in 0..80 {
            let d = calculate_delay(n, base, max);
            assert!(d >= prev, "delay decreased at retry {n}");
            assert!(d <= max);
            prev = d;
        }
    }
}
