use tokio::time::Duration;

/// Decides whether, and after how long, a failed replication attempt is retried.
pub trait RetryPolicy: Send + Sync {
    /// `failed_attempts` counts the failures so far, starting at 1. `None` gives up.
    fn next_delay(&self, failed_attempts: u32) -> Option<Duration>;
}

/// Waits the same delay between every attempt.
#[derive(Clone, Debug)]
pub struct FixedBackoff {
    delay: Duration,
    max_attempts: Option<u32>,
}

impl FixedBackoff {
    pub fn forever(delay: Duration) -> Self {
        FixedBackoff {
            delay,
            max_attempts: None,
        }
    }

    /// Gives up once `max_attempts` attempts (the first one included) have failed.
    pub fn limited(delay: Duration, max_attempts: u32) -> Self {
        FixedBackoff {
            delay,
            max_attempts: Some(max_attempts),
        }
    }
}

impl Default for FixedBackoff {
    fn default() -> Self {
        FixedBackoff::forever(Duration::from_secs(1))
    }
}

impl RetryPolicy for FixedBackoff {
    fn next_delay(&self, failed_attempts: u32) -> Option<Duration> {
        match self.max_attempts {
            Some(max_attempts) if failed_attempts >= max_attempts => None,
            _ => Some(self.delay),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn next_delay(&self, _failed_attempts: u32) -> Option<Duration> {
        None
    }
}
