//! Retry utilities with exponential backoff and jitter
//!
//! Remote calls are retried with:
//! - Exponential backoff capped at a maximum delay
//! - Jitter so concurrent workers do not retry in lockstep
//! - A server-supplied `retry_after` hint that raises the delay floor, up to
//!   `max_delay`; a longer hint ends the retry loop
//! - A classifier deciding per error whether to retry at all

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries, just the initial attempt)
    pub max_retries: u32,
    /// Initial delay before first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries (caps exponential growth)
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 = double each time)
    pub multiplier: f64,
    /// Jitter factor (0.0-1.0); the delay is moved by up to this share of itself
    pub jitter: f64,
    /// Draw from `[initial_delay, 3 * delay]` instead of symmetric jitter
    pub decorrelated_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.2,
            decorrelated_jitter: false,
        }
    }
}

impl RetryConfig {
    /// Near-zero delays for tests and in-process adapters
    pub fn fast() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(20),
            multiplier: 2.0,
            jitter: 0.0,
            decorrelated_jitter: false,
        }
    }

    /// Patient settings for rate-limited third-party APIs
    pub fn external_service() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.5,
            decorrelated_jitter: true,
        }
    }

    /// Set the maximum number of retries
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Set the initial delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the maximum delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the multiplier
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the jitter factor
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Calculate delay for a given attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base_delay = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped_delay = base_delay.min(self.max_delay.as_secs_f64());

        let final_delay = if self.jitter > 0.0 && capped_delay > 0.0 {
            let mut rng = rand::thread_rng();
            if self.decorrelated_jitter {
                let min_delay = self.initial_delay.as_secs_f64().min(capped_delay);
                let max_delay = (capped_delay * 3.0).min(self.max_delay.as_secs_f64());
                if max_delay > min_delay {
                    rng.gen_range(min_delay..=max_delay)
                } else {
                    min_delay
                }
            } else {
                let jitter_range = capped_delay * self.jitter;
                let jitter_offset = rng.gen_range(-jitter_range..=jitter_range);
                (capped_delay + jitter_offset).max(0.0)
            }
        } else {
            capped_delay
        };

        Duration::from_secs_f64(final_delay)
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDirective {
    /// Stop and surface the error
    Abort,
    /// Retry after the configured backoff
    Backoff,
    /// Retry after at least this long (a server `retry_after` hint);
    /// a hint beyond `max_delay` is terminal
    After(Duration),
}

/// Result of a retry operation
#[derive(Debug)]
pub struct RetryResult<T, E> {
    /// The final result (success or last error)
    pub result: Result<T, E>,
    /// Number of attempts made (1 = succeeded on first try)
    pub attempts: u32,
    /// Total time spent on retries (including delays)
    pub total_duration: Duration,
}

impl<T, E> RetryResult<T, E> {
    /// Check if the operation succeeded
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Get the result, consuming self
    pub fn into_result(self) -> Result<T, E> {
        self.result
    }
}

/// A retry executor that can run operations with retry logic
pub struct Retry {
    config: RetryConfig,
}

impl Retry {
    /// Create a new retry executor with the given config
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run an operation, retrying every failure up to `max_retries` times
    pub async fn run<F, Fut, T, E>(&self, operation: F) -> RetryResult<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_with_directive(operation, |_| RetryDirective::Backoff)
            .await
    }

    /// Run an operation and let `classify` decide, per error, whether and
    /// how long to wait before the next attempt.
    ///
    /// The operation receives the 1-based attempt number. A
    /// `RetryDirective::After` hint is honored as a floor: the actual delay
    /// is the larger of the hint and the computed backoff. A hint longer
    /// than `max_delay` stops retrying and returns the error, so no single
    /// wait exceeds `max_delay`.
    pub async fn run_with_directive<F, Fut, T, E, C>(
        &self,
        mut operation: F,
        classify: C,
    ) -> RetryResult<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> RetryDirective,
    {
        let start = std::time::Instant::now();
        let mut attempts = 0;

        loop {
            attempts += 1;

            match operation(attempts).await {
                Ok(value) => {
                    return RetryResult {
                        result: Ok(value),
                        attempts,
                        total_duration: start.elapsed(),
                    };
                }
                Err(e) => {
                    let directive = classify(&e);
                    if attempts > self.config.max_retries || directive == RetryDirective::Abort {
                        return RetryResult {
                            result: Err(e),
                            attempts,
                            total_duration: start.elapsed(),
                        };
                    }

                    let backoff = self.config.delay_for_attempt(attempts - 1);
                    let delay = match directive {
                        RetryDirective::After(hint) if hint > self.config.max_delay => {
                            tracing::debug!(
                                attempt = attempts,
                                retry_after_ms = hint.as_millis() as u64,
                                max_delay_ms = self.config.max_delay.as_millis() as u64,
                                "Retry-after hint exceeds max delay, giving up"
                            );
                            return RetryResult {
                                result: Err(e),
                                attempts,
                                total_duration: start.elapsed(),
                            };
                        }
                        RetryDirective::After(hint) => hint.max(backoff),
                        _ => backoff,
                    };

                    tracing::debug!(
                        attempt = attempts,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying remote call after failure"
                    );

                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
