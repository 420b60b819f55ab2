use rand::Rng;
use std::{future::Future, time::Duration};
use tokio::time::sleep;
use tracing::warn;

/// Exponential backoff with full decorrelated jitter: the delay before
/// attempt `n` is `min(cap, base * 2^(n-1) * U(0.5, 1.0))`.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3, base_delay: Duration::from_millis(500), max_delay: Duration::from_secs(30) }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self { max_retries, base_delay, max_delay }
    }

    /// The jittered delay to sleep before retry attempt `attempt` (1-based).
    fn delay_before(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let raw = self.base_delay.saturating_mul(1u32 << exponent);
        let jittered = raw.mul_f64(rand::thread_rng().gen_range(0.5..=1.0));
        jittered.min(self.max_delay)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("operation failed after {attempts} attempt(s): {source}")]
pub struct OperationFailed<E: std::error::Error + 'static> {
    pub attempts: u32,
    #[source]
    pub source: E,
}

/// Retry every failure up to the policy's budget.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, op: F) -> Result<T, OperationFailed<E>>
where
    E: std::error::Error + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_if(policy, |_: &E, _| true, op).await
}

/// Attempt `op` up to `max_retries + 1` times, sleeping a jittered backoff
/// between attempts. `should_retry(error, attempt)` can stop early; the last
/// cause is preserved inside the returned [`OperationFailed`].
pub async fn retry_if<T, E, F, Fut, S>(policy: &RetryPolicy, mut should_retry: S, mut op: F) -> Result<T, OperationFailed<E>>
where
    E: std::error::Error + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    S: FnMut(&E, u32) -> bool,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt > policy.max_retries || !should_retry(&e, attempt) {
                    return Err(OperationFailed { attempts: attempt, source: e });
                }
                let delay = policy.delay_before(attempt);
                warn!("Attempt {attempt}/{} failed ({e}), retrying in {delay:?}", policy.max_retries + 1);
                sleep(delay).await;
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("deadline of {deadline:?} exceeded")]
pub struct TimeoutError {
    pub deadline: Duration,
}

/// Race `fut` against a deadline. On expiry the future is dropped, which
/// cancels it at its next suspension point; nothing keeps running behind the
/// caller's back.
pub async fn with_timeout<T, F>(deadline: Duration, fut: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(deadline, fut).await.map_err(|_| TimeoutError { deadline })
}

#[derive(Clone, Copy, Debug)]
pub struct BulkOptions {
    pub concurrency: usize,
    pub stop_on_error: bool,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self { concurrency: 4, stop_on_error: false }
    }
}

#[derive(Debug)]
pub struct BulkOutput<T, E> {
    pub results: Vec<T>,
    pub errors: Vec<E>,
}

impl<T, E> Default for BulkOutput<T, E> {
    fn default() -> Self {
        Self { results: Vec::new(), errors: Vec::new() }
    }
}

/// Run `op` over `items` with at most `concurrency` tasks in flight. With
/// `stop_on_error` the first failure aborts all outstanding tasks. Output
/// order is completion order.
pub async fn bulk<I, T, E, F, Fut>(items: Vec<I>, options: BulkOptions, op: F) -> BulkOutput<T, E>
where
    I: Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    use std::sync::Arc;
    use tokio::{sync::Semaphore, task::JoinSet};

    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let op = Arc::new(op);
    let mut tasks = JoinSet::new();
    for item in items {
        let semaphore = semaphore.clone();
        let op = op.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            op(item).await
        });
    }

    let mut output = BulkOutput::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(value)) => output.results.push(value),
            Ok(Err(e)) => {
                output.errors.push(e);
                if options.stop_on_error {
                    tasks.abort_all();
                    // Drain whatever still completes; aborted tasks surface as
                    // cancelled join errors and are skipped.
                    while let Some(joined) = tasks.join_next().await {
                        match joined {
                            Ok(Ok(value)) => output.results.push(value),
                            Ok(Err(e)) => output.errors.push(e),
                            Err(_) => {}
                        }
                    }
                    break;
                }
            }
            Err(e) => {
                if !e.is_cancelled() {
                    warn!("Bulk task panicked: {e}");
                }
            }
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5));
        let attempts = AtomicU32::new(0);
        let result: Result<u32, _> = retry(&policy, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move { if n < 3 { Err(Boom) } else { Ok(n) } }
        })
        .await;
        assert_eq!(result.expect("retry failed"), 3);
    }

    #[tokio::test]
    async fn retry_exhausts_budget() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(5));
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = retry(&policy, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(Boom) }
        })
        .await;
        let err = result.expect_err("expected failure");
        assert_eq!(err.attempts, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_stops_when_predicate_declines() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1), Duration::from_millis(5));
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = retry_if(
            &policy,
            |_, attempt| attempt < 2,
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(Boom) }
            },
        )
        .await;
        assert_eq!(result.expect_err("expected failure").attempts, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn timeout_fires() {
        let result = with_timeout(Duration::from_millis(10), async {
            sleep(Duration::from_secs(5)).await;
            1
        })
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn timeout_passes_through() {
        let result = with_timeout(Duration::from_millis(200), async { 7 }).await;
        assert_eq!(result.expect("timed out"), 7);
    }

    #[tokio::test]
    async fn bulk_bounds_concurrency() {
        let current = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let (current_ref, peak_ref) = (current.clone(), peak.clone());
        let output: BulkOutput<u32, Boom> = bulk(
            (0..16).collect(),
            BulkOptions { concurrency: 3, stop_on_error: false },
            move |n: u32| {
                let current = current_ref.clone();
                let peak = peak_ref.clone();
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(5)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(n)
                }
            },
        )
        .await;
        assert_eq!(output.results.len(), 16);
        assert!(peak.load(Ordering::SeqCst) <= 3, "peak concurrency {}", peak.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn bulk_stop_on_error_cancels_siblings() {
        let completed = Arc::new(AtomicU32::new(0));
        let completed_ref = completed.clone();
        let output: BulkOutput<u32, Boom> = bulk(
            (0..32).collect(),
            BulkOptions { concurrency: 1, stop_on_error: true },
            move |n: u32| {
                let completed = completed_ref.clone();
                async move {
                    if n == 0 {
                        Err(Boom)
                    } else {
                        sleep(Duration::from_millis(20)).await;
                        completed.fetch_add(1, Ordering::SeqCst);
                        Ok(n)
                    }
                }
            },
        )
        .await;
        assert_eq!(output.errors.len(), 1);
        assert!(output.results.len() < 32);
    }
}
