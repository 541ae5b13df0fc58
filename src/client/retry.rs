//! Declarative retry with exponential backoff.
//!
//! A strategy is data (attempt cap, total deadline, backoff curve) rather
//! than a hard-coded loop, so each caller can carry its own tuning.

use std::time::Duration;

use reqwest::StatusCode;
use tokio::time::Instant;

/// Exponential backoff bounded by both attempt count and elapsed time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryStrategy {
    pub max_attempts: u32,
    pub total: Duration,
    pub initial: Duration,
    pub factor: f64,
}

/// Tuning for metadata calls; the total is a bit over three times the
/// metadata client timeout.
pub const DEFAULT_RETRY_STRATEGY: RetryStrategy = RetryStrategy {
    max_attempts: 6,
    total: Duration::from_secs(38),
    initial: Duration::from_millis(350),
    factor: 2.5,
};

pub const DOWNLOAD_RETRY_STRATEGY: RetryStrategy = RetryStrategy {
    max_attempts: 7,
    total: Duration::from_secs(90),
    initial: Duration::from_millis(500),
    factor: 2.5,
};

pub const CONN_CHECK_RETRY_STRATEGY: RetryStrategy = RetryStrategy {
    max_attempts: 3,
    total: Duration::from_secs(38),
    initial: Duration::from_millis(900),
    factor: 1.3,
};

impl RetryStrategy {
    pub fn attempts(&self) -> Attempts {
        Attempts {
            strategy: *self,
            started: Instant::now(),
            attempt: 0,
        }
    }

    /// Backoff slept before attempt `n + 2` (there is no delay before the
    /// first attempt).
    pub fn delay(&self, n: u32) -> Duration {
        self.initial.mul_f64(self.factor.powi(n as i32))
    }
}

/// Iterator-style driver over a [`RetryStrategy`].
pub struct Attempts {
    strategy: RetryStrategy,
    started: Instant,
    attempt: u32,
}

impl Attempts {
    /// Begin the next attempt, sleeping the backoff first. Returns `false`
    /// once the strategy is exhausted.
    pub async fn next(&mut self) -> bool {
        if self.attempt >= self.strategy.max_attempts {
            return false;
        }
        if self.attempt > 0 {
            let delay = self.strategy.delay(self.attempt - 1);
            if self.started.elapsed() + delay > self.strategy.total {
                return false;
            }
            tokio::time::sleep(delay).await;
        }
        self.attempt += 1;
        true
    }

    /// Whether another attempt is available, without consuming it.
    pub fn more(&self) -> bool {
        self.attempt < self.strategy.max_attempts
            && self.started.elapsed() < self.strategy.total
    }

    pub fn current(&self) -> u32 {
        self.attempt
    }
}

/// Transport errors worth retrying: anything that happened on the wire, as
/// opposed to malformed requests.
pub fn should_retry_error(err: &reqwest::Error) -> bool {
    !err.is_builder() && !err.is_redirect()
}

/// Response statuses worth retrying: server-side trouble.
pub fn should_retry_status(status: StatusCode) -> bool {
    status.is_server_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_are_exponential() {
        let s = DEFAULT_RETRY_STRATEGY;
        assert_eq!(s.delay(0), Duration::from_millis(350));
        assert_eq!(s.delay(1), Duration::from_millis(875));
        assert_eq!(s.delay(2), Duration::from_micros(2_187_500));
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_stop_at_cap() {
        let s = RetryStrategy {
            max_attempts: 3,
            total: Duration::from_secs(60),
            initial: Duration::from_millis(10),
            factor: 2.0,
        };
        let mut attempts = s.attempts();
        let mut n = 0;
        while attempts.next().await {
            n += 1;
        }
        assert_eq!(n, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_stop_at_deadline() {
        let s = RetryStrategy {
            max_attempts: 100,
            total: Duration::from_millis(50),
            initial: Duration::from_millis(40),
            factor: 2.0,
        };
        let mut attempts = s.attempts();
        let mut n = 0;
        while attempts.next().await {
            n += 1;
        }
        // first attempt is free; the second fits within the deadline, the
        // third would overshoot it
        assert_eq!(n, 2);
    }

    #[test]
    fn retry_statuses() {
        assert!(should_retry_status(StatusCode::BAD_GATEWAY));
        assert!(should_retry_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!should_retry_status(StatusCode::NOT_FOUND));
        assert!(!should_retry_status(StatusCode::TOO_MANY_REQUESTS));
    }
}
