//! Poll backoff: maps the outcome of one thread poll to the delay before
//! the next one. Pure state, no I/O, no clock.

use std::time::Duration;

/// What a single poll of a thread produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The poll surfaced at least one new item.
    Items(usize),
    /// The poll succeeded but nothing was new.
    Idle,
    /// Rate limited and the server named a wait.
    RetryAfter(Duration),
    /// Timeouts, 5xx, network failures.
    Retryable,
    /// A 4xx other than rate limiting. Retrying faster cannot fix it.
    ClientError,
}

impl PollOutcome {
    pub fn from_count(count: usize) -> Self {
        if count > 0 {
            PollOutcome::Items(count)
        } else {
            PollOutcome::Idle
        }
    }
}

/// Why the delay has the value it has. Only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffReason {
    Active,
    Idle,
    RateLimited,
    Failure,
    ClientError,
}

impl BackoffReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackoffReason::Active => "active",
            BackoffReason::Idle => "idle",
            BackoffReason::RateLimited => "rate_limited",
            BackoffReason::Failure => "failure",
            BackoffReason::ClientError => "client_error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub idle_cap: Duration,
    pub failure_cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            idle_cap: Duration::from_secs(30),
            failure_cap: Duration::from_secs(60),
        }
    }
}

/// Backoff state of one thread. Starts at zero: a thread that was never
/// polled is due immediately.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollBackoff {
    failure_count: u32,
    current_delay: Duration,
}

impl PollBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    /// Feed one outcome and return the next delay.
    pub fn next(&mut self, outcome: PollOutcome, policy: &BackoffPolicy) -> (Duration, BackoffReason) {
        let reason = match outcome {
            PollOutcome::Items(_) => {
                self.failure_count = 0;
                self.current_delay = policy.base;
                BackoffReason::Active
            }
            PollOutcome::Idle => {
                self.failure_count = 0;
                self.current_delay = (self.current_delay + policy.base).min(policy.idle_cap);
                BackoffReason::Idle
            }
            PollOutcome::RetryAfter(wait) => {
                self.failure_count = self.failure_count.saturating_add(1);
                // The server's wait wins over the exponential curve.
                self.current_delay = wait;
                BackoffReason::RateLimited
            }
            PollOutcome::Retryable => {
                self.failure_count = self.failure_count.saturating_add(1);
                let factor = 1u32
                    .checked_shl(self.failure_count - 1)
                    .unwrap_or(u32::MAX);
                self.current_delay = policy.base.saturating_mul(factor).min(policy.failure_cap);
                BackoffReason::Failure
            }
            PollOutcome::ClientError => {
                self.failure_count = 0;
                self.current_delay = policy.idle_cap;
                BackoffReason::ClientError
            }
        };
        (self.current_delay, reason)
    }
}
