use tokio::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Wall-clock limit measured from the budget's creation
    pub deadline: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            deadline: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(500),
        }
    }
}

/// Attempt counter plus deadline carried by one retrying operation.
#[derive(Debug)]
pub struct RetryBudget {
    policy: RetryPolicy,
    attempts: u32,
    started: Instant,
    next_backoff: Duration,
}

impl RetryBudget {
    pub fn new(policy: RetryPolicy) -> Self {
        let next_backoff = policy.initial_backoff;
        Self {
            policy,
            attempts: 0,
            started: Instant::now(),
            next_backoff,
        }
    }

    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn deadline(&self) -> Instant {
        self.started + self.policy.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline().saturating_duration_since(Instant::now())
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= self.policy.max_attempts || self.remaining().is_zero()
    }

    /// Sleep before the next attempt. Returns `false` without sleeping when
    /// the budget is spent.
    pub async fn backoff(&mut self) -> bool {
        if self.exhausted() {
            return false;
        }
        let delay = self.next_backoff.min(self.remaining());
        tokio::time::sleep(delay).await;
        self.next_backoff = (self.next_backoff * 2).min(self.policy.max_backoff);
        !self.remaining().is_zero()
    }
}
