use std::time::Duration;
use tokio::time::Instant;

/// Bounded exponential backoff for compare-and-swap publishes.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total publish attempts, including the first
    pub max_attempts: u32,

    /// Delay after the first conflict
    pub base_delay: Duration,

    /// Upper bound for a single delay
    pub max_delay: Duration,

    /// Hard deadline; a backoff that would cross it is not started
    pub deadline: Option<Instant>,
}

impl RetryPolicy {
    /// Create a policy without a deadline.
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            deadline: None,
        }
    }

    /// Same policy, bounded by `deadline`.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }

    /// Returns true if sleeping `delay` from now would cross the deadline.
    pub fn would_exceed_deadline(&self, delay: Duration) -> bool {
        self.deadline
            .is_some_and(|deadline| Instant::now() + delay >= deadline)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(5, Duration::from_millis(50), Duration::from_secs(2))
    }
}
