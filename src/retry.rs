//! Backoff policies
//!
//! Two consumers share one [`RetryConfig`]:
//!
//! - [`BackoffLimiter`] tracks consecutive failures per work-queue key and
//!   yields the delay before that key may be processed again.
//! - [`retry_with_backoff`] retries a single async operation with jittered
//!   exponential backoff. It is used for startup calls to the appliance only;
//!   reconciliation never retries inline, the queue owns that policy.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tracing::{error, warn};

/// Exponential backoff configuration
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts for [`retry_with_backoff`] (0 = infinite)
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier applied per consecutive failure
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            ..Default::default()
        }
    }

    /// Delay for the given number of prior failures, without jitter
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exp = self.backoff_multiplier.powi(failures.min(64) as i32);
        let secs = self.initial_delay.as_secs_f64() * exp;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Per-key exponential rate limiter for work-queue requeues
///
/// Each call to [`when`](Self::when) counts one more failure for the key.
/// [`forget`](Self::forget) resets the key after a successful sync.
pub struct BackoffLimiter<K> {
    config: RetryConfig,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K: Eq + Hash + Clone> BackoffLimiter<K> {
    /// Create a limiter with the given backoff policy
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure for `key` and return how long to wait before retrying
    pub fn when(&self, key: &K) -> Duration {
        let mut failures = self.failures.lock();
        let count = failures.entry(key.clone()).or_insert(0);
        let delay = self.config.delay_for(*count);
        *count = count.saturating_add(1);
        delay
    }

    /// Clear the failure history for `key`
    pub fn forget(&self, key: &K) {
        self.failures.lock().remove(key);
    }

    /// Number of times `key` has been requeued since its last success
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries indefinitely (or up to `max_attempts` if set) until success.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                attempt += 1;
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                // 0.5x to 1.5x of the nominal delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let delay = Duration::from_secs_f64(
                    config.delay_for(attempt - 1).as_secs_f64() * jitter,
                );

                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}
