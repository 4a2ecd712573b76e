use common::config::RetryStrategy;
use std::time::Duration;

/// Schedule for job status checks.
///
/// The poll interval applies while checks succeed. After a failed check the
/// strategy decides how long to wait, or whether to give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    interval: Duration,
    strategy: RetryStrategy,
}

impl RetryPolicy {
    pub fn new(interval: Duration, strategy: RetryStrategy) -> Self {
        Self { interval, strategy }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Delay before the next check given the number of consecutive failed
    /// checks so far. `None` means stop retrying.
    pub fn next_delay(&self, consecutive_failures: u32) -> Option<Duration> {
        match self.strategy {
            RetryStrategy::Fixed => Some(self.interval),
            RetryStrategy::Bounded { max_attempts } => {
                (consecutive_failures < max_attempts).then_some(self.interval)
            }
            RetryStrategy::Exponential { max_delay_ms } => {
                let cap = Duration::from_millis(max_delay_ms);
                let factor = 2u32.checked_pow(consecutive_failures).unwrap_or(u32::MAX);
                let delay = self.interval.checked_mul(factor).unwrap_or(cap);
                Some(delay.min(cap).max(self.interval))
            }
        }
    }
}
