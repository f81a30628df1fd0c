use std::time::Duration;

/// Bounded exponential backoff: `max_attempts` tries with waits of
/// `initial_delay`, `initial_delay * multiplier`, `initial_delay * multiplier²`, …
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    multiplier: u32,
}

impl RetryPolicy {
    /// At least one attempt is always made and the multiplier never shrinks
    /// the delay.
    pub fn new(max_attempts: u32, initial_delay: Duration, multiplier: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            multiplier: multiplier.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Starts a fresh retry state for one operation.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            attempt: 1,
            delay: self.initial_delay,
        }
    }

    /// Every wait a fully failing operation goes through, in order.
    pub fn delays(&self) -> Vec<Duration> {
        let mut backoff = self.backoff();
        std::iter::from_fn(|| backoff.next_delay()).collect()
    }
}

/// Per-operation retry state. Owned by a single call, never shared.
#[derive(Clone, Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
    delay: Duration,
}

impl Backoff {
    /// 1-based number of the attempt about to run (or that just ran).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn has_remaining(&self) -> bool {
        self.attempt < self.policy.max_attempts
    }

    /// Advances to the next attempt and returns the wait before it, or
    /// `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.has_remaining() {
            return None;
        }
        let delay = self.delay;
        self.attempt += 1;
        self.delay = self.delay.saturating_mul(self.policy.multiplier);
        Some(delay)
    }

    /// Sleeps before the next attempt. Returns `false` without sleeping when
    /// no attempts are left.
    pub async fn wait(&mut self) -> bool {
        match self.next_delay() {
            Some(delay) => {
                tokio::time::sleep(delay).await;
                true
            }
            None => false,
        }
    }
}
