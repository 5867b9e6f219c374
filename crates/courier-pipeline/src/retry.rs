use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Knobs for [`RetryPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    /// Total attempts, including the first one. Values below 1 act as 1.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryOptions {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// The operation failed on every attempt.
#[derive(Debug, Error)]
#[error("retries exhausted after {attempts} attempts: {last}")]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last: E,
}

impl<E> RetryExhausted<E> {
    pub fn into_inner(self) -> E {
        self.last
    }
}

/// Result shape of data-fetch style operations that report failure in-band.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult<T, E> {
    pub data: Option<T>,
    pub error: Option<E>,
}

impl<T, E> FetchResult<T, E> {
    pub fn ok(data: T) -> Self {
        Self {
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: E) -> Self {
        Self {
            data: None,
            error: Some(error),
        }
    }

    fn into_result(self) -> Result<T, FetchError<E>> {
        match (self.error, self.data) {
            (Some(e), _) => Err(FetchError::Failed(e)),
            (None, None) => Err(FetchError::Empty),
            (None, Some(data)) => Ok(data),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum FetchError<E> {
    #[error("{0}")]
    Failed(E),

    #[error("fetch returned no data")]
    Empty,
}

/// A future did not finish within its caller-supplied deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("deadline of {0:?} exceeded")]
pub struct DeadlineExceeded(pub Duration);

/// Race `fut` against a timer. The loser is dropped, not cancelled cooperatively.
pub async fn with_deadline<F: Future>(
    deadline: Duration,
    fut: F,
) -> Result<F::Output, DeadlineExceeded> {
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| DeadlineExceeded(deadline))
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy {
    options: RetryOptions,
}

impl RetryPolicy {
    pub fn new(options: RetryOptions) -> Self {
        if options.max_retries == 0 {
            warn!("max_retries of 0 is not meaningful, using 1");
        }
        Self { options }
    }

    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    pub fn max_attempts(&self) -> u32 {
        self.options.max_retries.max(1)
    }

    /// Wait applied after attempt `attempt` (0-based) fails.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let max = self.options.max_delay_ms;
        let exp = attempt.min(64) as i32;
        let raw = self.options.initial_delay_ms as f64 * self.options.backoff_multiplier.powi(exp);
        let bounded = if !raw.is_finite() || raw >= max as f64 {
            max
        } else {
            raw.max(0.0) as u64
        };
        Duration::from_millis(bounded)
    }

    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, RetryExhausted<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.execute_observed(operation, |_, _| {}).await
    }

    /// Like [`execute`](Self::execute), calling `on_retry(failed_attempt, &err)`
    /// each time a retry is about to be scheduled.
    pub async fn execute_observed<T, E, F, Fut, O>(
        &self,
        operation: F,
        on_retry: O,
    ) -> Result<T, RetryExhausted<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        O: FnMut(u32, &E),
    {
        self.execute_with(operation, |_| true, on_retry).await
    }

    /// Full form: errors for which `is_retryable` is false end the loop at once.
    pub async fn execute_with<T, E, F, Fut, R, O>(
        &self,
        mut operation: F,
        is_retryable: R,
        mut on_retry: O,
    ) -> Result<T, RetryExhausted<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        R: Fn(&E) -> bool,
        O: FnMut(u32, &E),
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if !is_retryable(&e) => {
                    warn!("attempt {}/{} failed permanently: {e}", attempt + 1, max_attempts);
                    return Err(RetryExhausted {
                        attempts: attempt + 1,
                        last: e,
                    });
                }
                Err(e) if attempt + 1 >= max_attempts => {
                    return Err(RetryExhausted {
                        attempts: attempt + 1,
                        last: e,
                    });
                }
                Err(e) => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        "attempt {}/{} failed: {e}; retrying in {}ms",
                        attempt + 1,
                        max_attempts,
                        delay.as_millis()
                    );
                    on_retry(attempt, &e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Retry an operation that reports errors as `{data, error}` instead of `Err`.
    pub async fn execute_fetch<T, E, F, Fut>(
        &self,
        mut operation: F,
    ) -> Result<T, RetryExhausted<FetchError<E>>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = FetchResult<T, E>>,
        E: Display,
    {
        self.execute(|| {
            let fut = operation();
            async move { fut.await.into_result() }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;

    fn fast() -> RetryPolicy {
        RetryPolicy::new(RetryOptions {
            initial_delay_ms: 10,
            max_delay_ms: 100,
            ..RetryOptions::default()
        })
    }

    #[test]
    fn default_delays_double_from_one_second() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(4_000));
    }

    #[test]
    fn caps_delay_at_max() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(10_000));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_millis(10_000));
    }

    #[test]
    fn zero_max_retries_still_attempts_once() {
        let policy = RetryPolicy::new(RetryOptions::default().with_max_retries(0));
        assert_eq!(policy.max_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_k_failures_with_k_plus_one_calls() {
        let policy = RetryPolicy::default();
        let mut calls = 0;
        let start = Instant::now();

        let result = policy
            .execute(|| {
                calls += 1;
                let n = calls;
                async move {
                    if n <= 2 {
                        Err(format!("transient {n}"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 3);
        assert_eq!(calls, 3);
        // 1000ms after attempt 0, 2000ms after attempt 1
        assert!(start.elapsed() >= Duration::from_millis(3_000));
        assert!(start.elapsed() < Duration::from_millis(3_100));
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_returns_without_waiting() {
        let policy = RetryPolicy::default();
        let start = Instant::now();
        let value: Result<&str, RetryExhausted<String>> =
            policy.execute(|| async { Ok("ok") }).await;
        assert_eq!(value.unwrap(), "ok");
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_makes_max_retries_calls() {
        let policy = RetryPolicy::default();
        let mut calls = 0;

        let err = policy
            .execute(|| {
                calls += 1;
                let n = calls;
                async move { Err::<(), _>(format!("failure {n}")) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls, 3);
        assert_eq!(err.attempts, 3);
        assert_eq!(err.last, "failure 3");
        assert_eq!(
            err.to_string(),
            "retries exhausted after 3 attempts: failure 3"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn observer_sees_each_scheduled_retry() {
        let mut seen = Vec::new();
        let mut calls = 0;
        let _ = fast()
            .execute_observed(
                || {
                    calls += 1;
                    async { Err::<(), _>("nope") }
                },
                |attempt, err| seen.push((attempt, err.to_string())),
            )
            .await;
        assert_eq!(calls, 3);
        assert_eq!(seen, vec![(0, "nope".to_string()), (1, "nope".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_is_not_retried() {
        let mut calls = 0;
        let start = Instant::now();
        let err = RetryPolicy::default()
            .execute_with(
                || {
                    calls += 1;
                    async { Err::<(), _>("invalid key") }
                },
                |e| !e.starts_with("invalid"),
                |_, _| panic!("no retry expected"),
            )
            .await
            .unwrap_err();
        assert_eq!(calls, 1);
        assert_eq!(err.attempts, 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_variant_retries_error_and_empty() {
        let mut calls = 0;
        let value = fast()
            .execute_fetch(|| {
                calls += 1;
                let n = calls;
                async move {
                    match n {
                        1 => FetchResult::err("row lock"),
                        2 => FetchResult { data: None, error: None },
                        _ => FetchResult::ok(vec![1, 2, 3]),
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, vec![1, 2, 3]);
        assert_eq!(calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_variant_wraps_last_error() {
        let err = fast()
            .execute_fetch(|| async { FetchResult::<(), _>::err("permission denied") })
            .await
            .unwrap_err();
        assert_eq!(err.last, FetchError::Failed("permission denied"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_discards_slow_future() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            "late"
        };
        let err = with_deadline(Duration::from_secs(5), slow).await.unwrap_err();
        assert_eq!(err, DeadlineExceeded(Duration::from_secs(5)));

        let fast = with_deadline(Duration::from_secs(5), async { "quick" }).await;
        assert_eq!(fast.unwrap(), "quick");
    }
}
