use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::api::StoreError;

/// How long to keep retrying throttled or failed requests, and how long to wait in between.
///
/// Passed explicitly to whatever needs it, so initialization and the import itself can use
/// different budgets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Upper bound on the total time spent waiting between attempts.
    pub max_wait: Duration,
    /// No retry waits less than this, whatever the store suggests.
    pub backoff_floor: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 10,
            max_wait: Duration::from_secs(60),
            backoff_floor: Duration::from_millis(10),
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Generous budget for one-off setup calls such as fetching the partition layout.
    pub fn initialization() -> Self {
        RetryPolicy {
            max_retries: 9,
            max_wait: Duration::from_secs(30),
            ..RetryPolicy::default()
        }
    }

    pub fn no_retries() -> Self {
        RetryPolicy {
            max_retries: 0,
            max_wait: Duration::ZERO,
            ..RetryPolicy::default()
        }
    }

    /// Delay before retry number `attempt` (zero based). A store hint wins over the
    /// exponential schedule, but never goes below the floor.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let delay = match retry_after {
            Some(hint) => hint,
            None => self.backoff(attempt),
        };
        delay.max(self.backoff_floor)
    }

    /// Whether another retry fits in the budget after `retries` retries and `waited` so far.
    pub fn allows(&self, retries: u32, waited: Duration, next_delay: Duration) -> bool {
        retries < self.max_retries && waited.saturating_add(next_delay) <= self.max_wait
    }

    // Half of the exponential delay is fixed, the other half is jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        let half = exponential / 2;
        let jitter = rand::thread_rng().gen_range(0..=half.as_nanos() as u64);
        half + Duration::from_nanos(jitter)
    }
}

/// Run a store call, retrying transient errors according to `policy`.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut retries = 0;
    let mut waited = Duration::ZERO;

    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let delay = policy.delay_for(retries, err.retry_after());
                if !policy.allows(retries, waited, delay) {
                    return Err(err);
                }
                warn!(operation, retries, ?delay, "retrying after store error: {}", err);
                tokio::time::sleep(delay).await;
                waited += delay;
                retries += 1;
            }
        }
    }
}
