//! Per-thread poll scheduler.
//!
//! One scheduler lives inside each session loop. It keeps:
//! - an independent due-time and backoff curve per thread
//! - the due-time of the next thread discovery
//!
//! It never sleeps or performs I/O itself; the session loop asks it which
//! threads are due, polls them, reports outcomes back, and sleeps until
//! [`PollScheduler::next_wakeup`].

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::backoff::{BackoffPolicy, BackoffReason, PollBackoff, PollOutcome};

/// Configuration for the poll scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub backoff: BackoffPolicy,

    /// Upper bound on a single sleep, so new threads are picked up quickly.
    pub wake_ceiling: Duration,

    /// How often to re-list conversations.
    pub discovery_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            wake_ceiling: Duration::from_secs(5),
            discovery_interval: Duration::from_secs(20 * 60),
        }
    }
}

#[derive(Debug, Clone)]
struct ThreadPollState {
    next_due: Instant,
    backoff: PollBackoff,
}

pub struct PollScheduler {
    config: SchedulerConfig,
    threads: HashMap<String, ThreadPollState>,
    next_discovery: Option<Instant>,
}

impl PollScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            threads: HashMap::new(),
            next_discovery: None,
        }
    }

    /// Discovery runs eagerly on the first check and then on its interval.
    pub fn discovery_due(&self, now: Instant) -> bool {
        self.next_discovery.map_or(true, |due| now >= due)
    }

    pub fn mark_discovery(&mut self, now: Instant) {
        self.next_discovery = Some(now + self.config.discovery_interval);
    }

    /// Make sure every known thread has scheduling state. Newcomers are due
    /// immediately with zero backoff.
    pub fn track_threads<'a, I>(&mut self, thread_ids: I, now: Instant)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for id in thread_ids {
            if !self.threads.contains_key(id) {
                debug!("[SCHEDULER] Tracking new thread {}", id);
                self.threads.insert(
                    id.to_string(),
                    ThreadPollState {
                        next_due: now,
                        backoff: PollBackoff::new(),
                    },
                );
            }
        }
    }

    /// A thread without state was never polled, so it is due.
    pub fn is_due(&self, thread_id: &str, now: Instant) -> bool {
        self.threads
            .get(thread_id)
            .map_or(true, |state| now >= state.next_due)
    }

    /// Feed a poll outcome into the thread's backoff and reschedule it.
    pub fn record(&mut self, thread_id: &str, outcome: PollOutcome, now: Instant) -> (Duration, BackoffReason) {
        let policy = self.config.backoff;
        let state = self
            .threads
            .entry(thread_id.to_string())
            .or_insert_with(|| ThreadPollState {
                next_due: now,
                backoff: PollBackoff::new(),
            });
        let (delay, reason) = state.backoff.next(outcome, &policy);
        state.next_due = now + delay;
        (delay, reason)
    }

    /// Earliest of all thread due-times and the discovery due-time, never
    /// later than `now + wake_ceiling` and never earlier than `now`.
    pub fn next_wakeup(&self, now: Instant) -> Instant {
        let ceiling = now + self.config.wake_ceiling;
        let earliest = self
            .threads
            .values()
            .map(|s| s.next_due)
            .chain(self.next_discovery)
            .min()
            .unwrap_or(ceiling);
        earliest.clamp(now, ceiling)
    }

    pub fn stats(&self, now: Instant) -> SchedulerStats {
        SchedulerStats {
            threads: self.threads.len(),
            failing: self
                .threads
                .values()
                .filter(|s| s.backoff.failure_count() > 0)
                .count(),
            due_now: self.threads.values().filter(|s| now >= s.next_due).count(),
        }
    }
}

/// Statistics about scheduler state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStats {
    pub threads: usize,
    /// Threads whose last poll failed.
    pub failing: usize,
    pub due_now: usize,
}
