//! Workflow-level retry policy: fixed backoff table plus a retryability
//! predicate, applied when the workflow body raises an error the Driver
//! does not already know how to classify (see `ExecutorError`/`steps`).

use std::time::Duration;

/// Seconds to wait before re-attempt N (0-indexed). The table's length is
/// also the maximum attempt count.
const BACKOFF_SECONDS: [u64; 5] = [1, 5, 30, 120, 600];

/// Decides whether a workflow-level failure should be retried, and how
/// long to wait before the next attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    non_retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed()
    }
}

impl RetryPolicy {
    /// The policy described by the executor specification: a 5-slot fixed
    /// backoff table, no jitter.
    pub fn fixed() -> Self {
        Self {
            max_attempts: BACKOFF_SECONDS.len() as u32,
            non_retryable_errors: Vec::new(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_non_retryable_error(mut self, error_class: impl Into<String>) -> Self {
        self.non_retryable_errors.push(error_class.into());
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before attempt `attempt` (0-indexed), clamped to the table's
    /// last entry once `attempt` exceeds it.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let idx = (attempt as usize).min(BACKOFF_SECONDS.len() - 1);
        Duration::from_secs(BACKOFF_SECONDS[idx])
    }

    /// Whether an error of the given class, at the given attempt count,
    /// should be retried at all. The default policy retries while
    /// `attempt_count < 3`, independent of the driver's own attempt cap.
    pub fn should_retry(&self, error_class: Option<&str>, attempt_count: u32) -> bool {
        if attempt_count >= 3 {
            return false;
        }
        match error_class {
            Some(class) => !self.non_retryable_errors.iter().any(|c| c == class),
            None => true,
        }
    }

    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_fixed_five_attempt_table() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 5);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(120));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(600));
    }

    #[test]
    fn delay_clamps_past_table_end() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(99), Duration::from_secs(600));
    }

    #[test]
    fn has_attempts_remaining_respects_max() {
        let policy = RetryPolicy::default().with_max_attempts(3);
        assert!(policy.has_attempts_remaining(0));
        assert!(policy.has_attempts_remaining(2));
        assert!(!policy.has_attempts_remaining(3));
    }

    #[test]
    fn non_retryable_errors_are_refused() {
        let policy = RetryPolicy::fixed().with_non_retryable_error("ValidationError");
        assert!(!policy.should_retry(Some("ValidationError"), 0));
        assert!(policy.should_retry(Some("TimeoutError"), 0));
        assert!(policy.should_retry(None, 0));
    }

    #[test]
    fn default_policy_stops_after_three_attempts() {
        let policy = RetryPolicy::fixed();
        assert!(policy.should_retry(None, 0));
        assert!(policy.should_retry(None, 1));
        assert!(policy.should_retry(None, 2));
        assert!(!policy.should_retry(None, 3));
        assert!(!policy.should_retry(None, 99));
    }
}
