//! Exponential backoff with random jitter for restarting failed streams
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum BackoffError {
    #[error("min backoff {min:?} exceeds max backoff {max:?}")]
    MinExceedsMax { min: Duration, max: Duration },
    #[error("random factor must be a finite, non-negative number (got {0})")]
    InvalidRandomFactor(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    /// Delay before the first restart
    min_backoff: Duration,
    /// Upper bound of the un-jittered delay
    max_backoff: Duration,
    /// Delays are stretched by a random amount in `[0, random_factor)`
    random_factor: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            random_factor: 0.2,
        }
    }
}

impl ExponentialBackoff {
    pub fn new(
        min_backoff: Duration,
        max_backoff: Duration,
        random_factor: f64,
    ) -> Result<Self, BackoffError> {
        if min_backoff > max_backoff {
            return Err(BackoffError::MinExceedsMax {
                min: min_backoff,
                max: max_backoff,
            });
        }
        if !random_factor.is_finite() || random_factor < 0.0 {
            return Err(BackoffError::InvalidRandomFactor(random_factor));
        }

        Ok(Self {
            min_backoff,
            max_backoff,
            random_factor,
        })
    }

    pub fn min_backoff(&self) -> Duration {
        self.min_backoff
    }

    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    pub fn random_factor(&self) -> f64 {
        self.random_factor
    }

    /// Un-jittered delay for `attempt`: `min(max, min * 2^attempt)`
    pub fn base_delay(&self, attempt: u32) -> Duration {
        self.min_backoff
            .checked_mul(2u32.saturating_pow(attempt))
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }

    /// Jittered delay for `attempt`
    pub fn delay(&self, attempt: u32) -> Duration {
        let sample = rand::thread_rng().gen_range(0.0..1.0);
        self.jittered(self.base_delay(attempt), sample)
    }

    fn jittered(&self, base: Duration, sample: f64) -> Duration {
        base.mul_f64(1.0 + sample * self.random_factor)
    }
}

/// Restart bookkeeping for one supervised stream.
///
/// Every failure bumps the attempt counter; a failure that happens after the stream
/// stayed up for longer than the current backoff interval starts over at attempt zero.
#[derive(Debug)]
pub struct RestartBackoff {
    policy: ExponentialBackoff,
    attempt: u32,
    started_at: Option<Instant>,
}

impl RestartBackoff {
    pub fn new(policy: ExponentialBackoff) -> Self {
        Self {
            policy,
            attempt: 0,
            started_at: None,
        }
    }

    pub fn policy(&self) -> &ExponentialBackoff {
        &self.policy
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Marks the beginning of a new run
    pub fn record_start(&mut self) {
        self.started_at = Some(Instant::now());
    }

    /// Registers a failure and returns how long to wait before the next start
    pub fn next_delay(&mut self) -> Duration {
        if let Some(started_at) = self.started_at.take() {
            let healthy_for = started_at.elapsed();
            if healthy_for > self.policy.base_delay(self.attempt) {
                debug!(
                    healthy_ms = healthy_for.as_millis() as u64,
                    previous_attempt = self.attempt,
                    "Stream was healthy for a full backoff interval, resetting attempts"
                );
                self.attempt = 0;
            }
        }

        let delay = self.policy.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.started_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(random_factor: f64) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(100),
            Duration::from_secs(2),
            random_factor,
        )
        .unwrap()
    }

    #[test]
    fn test_base_delay_doubles_until_capped() {
        let backoff = policy(0.0);

        assert_eq!(backoff.base_delay(0), Duration::from_millis(100));
        assert_eq!(backoff.base_delay(1), Duration::from_millis(200));
        assert_eq!(backoff.base_delay(3), Duration::from_millis(800));
        assert_eq!(backoff.base_delay(5), Duration::from_secs(2));
        assert_eq!(backoff.base_delay(u32::MAX), Duration::from_secs(2));
    }

    #[test]
    fn test_jitter_stays_within_random_factor() {
        let backoff = policy(0.5);

        assert_eq!(
            backoff.jittered(Duration::from_millis(100), 0.0),
            Duration::from_millis(100)
        );
        assert_eq!(
            backoff.jittered(Duration::from_millis(100), 0.5),
            Duration::from_millis(125)
        );

        for attempt in 0..8 {
            let delay = backoff.delay(attempt);
            let base = backoff.base_delay(attempt);
            assert!(delay >= base);
            assert!(delay <= base.mul_f64(1.5));
        }
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        assert!(matches!(
            ExponentialBackoff::new(Duration::from_secs(5), Duration::from_secs(1), 0.1),
            Err(BackoffError::MinExceedsMax { .. })
        ));
        assert_eq!(
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(5), -1.0),
            Err(BackoffError::InvalidRandomFactor(-1.0))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_grow_on_rapid_failures() {
        let mut backoff = RestartBackoff::new(policy(0.0));

        backoff.record_start();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        backoff.record_start();
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        backoff.record_start();
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.attempt(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_reset_after_healthy_run() {
        let mut backoff = RestartBackoff::new(policy(0.0));

        backoff.record_start();
        backoff.next_delay();
        backoff.record_start();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);

        backoff.record_start();
        tokio::time::advance(Duration::from_secs(1)).await;

        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.attempt(), 1);
    }
}
