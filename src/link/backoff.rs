use std::time::Duration;

use rand::Rng;

/// Reconnect schedule shared by the upstream bridge and the relay.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub ceiling: Duration,
    pub factor: f64,
    pub jitter_ms: u64,
    /// Consecutive failed attempts tolerated before the link gives up.
    pub max_attempts: u32,
    /// How long a session must stay up before it counts as a success and
    /// restores the full budget. Shorter sessions count as failed attempts.
    pub min_stable: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            ceiling: Duration::from_secs(60),
            factor: 2.0,
            jitter_ms: 250,
            max_attempts: 10,
            min_stable: Duration::from_secs(5),
        }
    }
}

/// Per-link retry state: an attempt counter, an exponentially growing base
/// delay, and a hard cap on attempts.
///
/// Returned delays never decrease between resets and never exceed the ceiling,
/// jitter included.
#[derive(Debug, Clone)]
pub struct BackoffState {
    policy: BackoffPolicy,
    attempt: u32,
    next_delay: Duration,
    last_delay: Duration,
}

impl BackoffState {
    pub fn new(policy: BackoffPolicy) -> Self {
        let initial = policy.initial;
        Self {
            policy,
            attempt: 0,
            next_delay: initial,
            last_delay: Duration::ZERO,
        }
    }

    /// Delay before the next attempt, or `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        self.attempt += 1;

        let jitter = if self.policy.jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=self.policy.jitter_ms))
        } else {
            Duration::ZERO
        };
        let delay = (self.next_delay + jitter)
            .min(self.policy.ceiling)
            .max(self.last_delay);

        let grown = self.next_delay.as_secs_f64() * self.policy.factor;
        self.next_delay = Duration::from_secs_f64(grown.min(self.policy.ceiling.as_secs_f64()));
        self.last_delay = delay;

        Some(delay)
    }

    /// Back to the initial delay and a full attempt budget.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.next_delay = self.policy.initial;
        self.last_delay = Duration::ZERO;
    }

    /// Called when a session ends. Only a session that lasted at least
    /// `min_stable` resets the schedule. Returns whether it did.
    pub fn session_ended(&mut self, uptime: Duration) -> bool {
        if uptime >= self.policy.min_stable {
            self.reset();
            true
        } else {
            false
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.policy.max_attempts
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}
