use rand::Rng;
use std::time::Duration;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);
const ONE_HOUR: Duration = Duration::from_secs(60 * 60);

/// Poll loop tuning. Zero values are replaced with sane minimums by [`WorkerConfig::normalized`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Jobs claimed per query.
    pub batch_size: usize,
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Jobs left `running` longer than this are claimed again.
    pub stuck_after: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 10,
            max_attempts: 25,
            backoff: Backoff::default(),
            stuck_after: ONE_HOUR,
        }
    }
}

impl WorkerConfig {
    #[must_use]
    pub fn normalized(self) -> Self {
        let or = |value: Duration, fallback: Duration| {
            if value.is_zero() { fallback } else { value }
        };
        Self {
            poll_interval: or(self.poll_interval, MIN_POLL_INTERVAL),
            batch_size: self.batch_size.max(1),
            max_attempts: self.max_attempts.max(1),
            backoff: self.backoff.normalized(),
            stuck_after: or(self.stuck_after, ONE_HOUR),
        }
    }
}

/// Exponential retry delay: `base * 2^(attempt - 1)`, capped at `max`, then jittered
/// into `[delay / 2, delay]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: ONE_HOUR,
        }
    }
}

impl Backoff {
    #[must_use]
    pub fn normalized(self) -> Self {
        let base = if self.base.is_zero() {
            Duration::from_secs(1)
        } else {
            self.base
        };
        Self {
            base,
            max: self.max.max(base),
        }
    }

    /// Delay before retrying after failed `attempt` (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let raw = self
            .base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max));
        jitter(raw)
    }
}

fn jitter(delay: Duration) -> Duration {
    let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    if millis < 2 {
        return delay;
    }
    let floor = millis / 2;
    Duration::from_millis(floor + rand::thread_rng().gen_range(0..=floor))
}
