use backoff::backoff::Backoff;
use backoff::exponential::ExponentialBackoff;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_retries: max_retries.max(1),
            base_delay_ms,
        }
    }

    fn backoff(&self) -> ExponentialBackoff<backoff::SystemClock> {
        ExponentialBackoff {
            current_interval: Duration::from_millis(self.base_delay_ms),
            initial_interval: Duration::from_millis(self.base_delay_ms),
            randomization_factor: 0.5, // jitter
            multiplier: 2.0,
            max_interval: Duration::from_secs(30),
            max_elapsed_time: Some(Duration::from_secs(self.max_retries as u64 * 30)),
            ..ExponentialBackoff::default()
        }
    }
}

/// Runs `operation` until it succeeds, returns a non-retryable error, or the
/// policy gives up. `is_retryable` decides which errors earn another attempt.
pub async fn retry_with_backoff<F, Fut, T, E, R>(
    operation: F,
    is_retryable: R,
    policy: RetryPolicy,
    operation_name: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    let mut backoff = policy.backoff();
    let mut attempts = 0;

    loop {
        attempts += 1;

        match operation().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "Operation succeeded after retries"
                    );
                }
                return Ok(result);
            }
            Err(e) if !is_retryable(&e) => {
                warn!(
                    operation = operation_name,
                    attempts,
                    error = %e,
                    "Operation failed with non-retryable error"
                );
                return Err(e);
            }
            Err(e) => {
                if attempts >= policy.max_retries {
                    warn!(
                        operation = operation_name,
                        attempts,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                match backoff.next_backoff() {
                    Some(duration) => {
                        warn!(
                            operation = operation_name,
                            attempt = attempts,
                            retry_after_ms = duration.as_millis(),
                            error = %e,
                            "Operation failed, retrying"
                        );
                        tokio::time::sleep(duration).await;
                    }
                    None => {
                        warn!(
                            operation = operation_name,
                            attempts,
                            error = %e,
                            "Backoff exhausted"
                        );
                        return Err(e);
                    }
                }
            }
        }
    }
}
