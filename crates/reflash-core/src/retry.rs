//! Bounded retry combinator

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// How often to try an operation and how long to wait in between
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first; zero behaves like one
    pub attempts: u32,
    /// Pause between attempts in milliseconds
    #[serde(default)]
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts,
            backoff_ms: backoff.as_millis() as u64,
        }
    }

    /// Try once, never retry
    pub const fn once() -> Self {
        Self {
            attempts: 1,
            backoff_ms: 0,
        }
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// Run `op` until it succeeds or the attempts are used up
    ///
    /// The closure receives the 1-based attempt number. The last error is
    /// returned when every attempt fails.
    pub async fn run<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.run_until(op, |_| false).await
    }

    /// Like [`run`](Self::run), but stops at the first error `is_fatal` accepts
    pub async fn run_until<T, E, F, Fut, P>(&self, mut op: F, is_fatal: P) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;

        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts || is_fatal(&e) => return Err(e),
                Err(e) => {
                    debug!(attempt, attempts, error = %e, "Attempt failed, retrying");
                    if self.backoff_ms > 0 {
                        tokio::time::sleep(self.backoff()).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::ZERO);

        let result: Result<u32, String> = policy
            .run(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(format!("attempt {attempt}"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_with_last_error() {
        let policy = RetryPolicy::new(4, Duration::ZERO);
        let result: Result<(), String> = policy
            .run(|attempt| async move { Err(format!("attempt {attempt}")) })
            .await;
        assert_eq!(result, Err("attempt 4".to_string()));
    }

    #[tokio::test]
    async fn test_fatal_error_stops_early() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(10, Duration::ZERO);

        let result: Result<(), &str> = policy
            .run_until(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("fatal") }
                },
                |e| *e == "fatal",
            )
            .await;

        assert_eq!(result, Err("fatal"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_between_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(200));
        let start = tokio::time::Instant::now();

        let _: Result<(), &str> = policy.run(|_| async { Err("busy") }).await;

        assert_eq!(start.elapsed(), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let policy = RetryPolicy::new(0, Duration::ZERO);
        let result: Result<u8, &str> = policy.run(|_| async { Ok(7) }).await;
        assert_eq!(result, Ok(7));
    }
}
