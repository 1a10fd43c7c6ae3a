//! Fixed-backoff retry policy used for binding callback sockets.

use std::time::Duration;

use tokio::time::sleep;

/// Default pause between bind attempts.
pub const DEFAULT_BIND_BACKOFF: Duration = Duration::from_secs(5);

/// How often and how long to retry an operation.
///
/// `max_attempts: None` retries forever. Sleeping goes through
/// `tokio::time`, so tests drive it with a paused clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    backoff: Duration,
    max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Retries forever with a fixed pause.
    pub const fn unbounded(backoff: Duration) -> Self {
        Self {
            backoff,
            max_attempts: None,
        }
    }

    /// Gives up after `max_attempts` failures (at least one attempt is made).
    pub const fn bounded(backoff: Duration, max_attempts: u32) -> Self {
        Self {
            backoff,
            max_attempts: Some(max_attempts),
        }
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Returns true if another attempt may follow `attempts_made` failures.
    pub fn allows_another(&self, attempts_made: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempts_made < max.max(1),
            None => true,
        }
    }

    /// Runs `op` until it succeeds or the policy is exhausted.
    ///
    /// `op` receives the 1-based attempt number. On exhaustion the last
    /// error is returned.
    pub async fn run<T, E, F>(&self, op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
    {
        self.run_while(op, |_| true).await
    }

    /// Like [`run`](Self::run), but stops at the first error for which
    /// `retryable` returns false.
    pub async fn run_while<T, E, F, P>(&self, mut op: F, retryable: P) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        P: Fn(&E) -> bool,
    {
        let mut attempt: u32 = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !retryable(&e) || !self.allows_another(attempt) {
                        return Err(e);
                    }
                }
            }
            sleep(self.backoff).await;
            attempt = attempt.saturating_add(1);
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unbounded(DEFAULT_BIND_BACKOFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[test]
    fn test_default_is_unbounded() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(), Duration::from_secs(5));
        assert_eq!(policy.max_attempts(), None);
        assert!(policy.allows_another(u32::MAX - 1));
    }

    #[test]
    fn test_bounded_allows() {
        let policy = RetryPolicy::bounded(Duration::from_secs(1), 3);
        assert!(policy.allows_another(1));
        assert!(policy.allows_another(2));
        assert!(!policy.allows_another(3));

        // Zero is treated as a single attempt.
        let policy = RetryPolicy::bounded(Duration::from_secs(1), 0);
        assert!(!policy.allows_another(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_first_try_does_not_sleep() {
        let start = Instant::now();
        let result: Result<u32, ()> = RetryPolicy::default().run(|n| Ok(n)).await;
        assert_eq!(result, Ok(1));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_failures_with_fixed_backoff() {
        let start = Instant::now();
        let result: Result<u32, &str> = RetryPolicy::unbounded(Duration::from_secs(5))
            .run(|n| if n < 4 { Err("busy") } else { Ok(n) })
            .await;

        assert_eq!(result, Ok(4));
        assert_eq!(start.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_returns_last_error() {
        let start = Instant::now();
        let mut calls = 0;
        let result: Result<(), u32> = RetryPolicy::bounded(Duration::from_secs(5), 3)
            .run(|n| {
                calls += 1;
                Err(n)
            })
            .await;

        assert_eq!(result, Err(3));
        assert_eq!(calls, 3);
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_stops_on_permanent_error() {
        let start = Instant::now();
        let mut calls = 0;
        let result: Result<(), &str> = RetryPolicy::unbounded(Duration::from_secs(5))
            .run_while(
                |n| {
                    calls += 1;
                    if n < 3 {
                        Err("busy")
                    } else {
                        Err("gone")
                    }
                },
                |e| *e == "busy",
            )
            .await;

        assert_eq!(result, Err("gone"));
        assert_eq!(calls, 3);
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }
}
