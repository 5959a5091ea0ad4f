// Retry policies for external API calls: exponential backoff for transient
// failures wrapped around server-hinted waits for quota responses.

use std::{future::Future, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::api::ApiError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 90_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaRetryConfig {
    pub max_attempts: u32,
}

impl Default for QuotaRetryConfig {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

// Exponential backoff with jitter, capped at `max_backoff_ms`
pub fn calculate_backoff(retry_attempt: u32, config: &RetryConfig) -> Duration {
    let base_backoff_ms = (config.initial_backoff_ms as f64
        * config.backoff_multiplier.powf(retry_attempt as f64))
    .min(config.max_backoff_ms as f64);

    // Apply jitter to prevent thundering herd
    let jitter = rand::random::<f64>() * config.jitter_factor * base_backoff_ms;
    let backoff_ms = (base_backoff_ms * (1.0 - config.jitter_factor / 2.0) + jitter)
        .min(config.max_backoff_ms as f64);

    Duration::from_millis(backoff_ms as u64)
}

/// Two retry layers around one operation.
///
/// The inner layer retries `RateLimited` responses after exactly the wait the
/// server advertised and gives up with `QuotaExceeded`. The outer layer
/// retries transient errors (including ones surfacing from a fresh inner run)
/// with backoff and gives up with the original error. Attempts of the two
/// layers multiply rather than share a budget.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    transient: RetryConfig,
    quota: QuotaRetryConfig,
}

impl RetryPolicy {
    pub fn new(transient: RetryConfig, quota: QuotaRetryConfig) -> Self {
        Self { transient, quota }
    }

    // Single attempt in both layers
    pub fn none() -> Self {
        Self::new(
            RetryConfig {
                max_attempts: 1,
                ..Default::default()
            },
            QuotaRetryConfig { max_attempts: 1 },
        )
    }

    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.run_quota(&mut operation).await {
                Err(error) if error.is_transient() && attempt < self.transient.max_attempts => {
                    let backoff = calculate_backoff(attempt - 1, &self.transient);
                    warn!(%error, attempt, ?backoff, "Transient API failure, backing off");
                    tokio::time::sleep(backoff).await;
                }
                result => return result,
            }
        }
    }

    async fn run_quota<T, F, Fut>(&self, operation: &mut F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation().await {
                Err(ApiError::RateLimited { retry_after }) => {
                    if attempt >= self.quota.max_attempts {
                        return Err(ApiError::QuotaExceeded {
                            attempts: attempt,
                            retry_after,
                        });
                    }
                    info!(attempt, ?retry_after, "Rate limited by server, waiting");
                    tokio::time::sleep(retry_after).await;
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicU32, Ordering},
    };
    use tokio::time::Instant;
    use tokio_test::{assert_err, assert_ok};

    // Plays back scripted results, then succeeds
    struct Script {
        results: Mutex<VecDeque<Result<u32, ApiError>>>,
        calls: AtomicU32,
    }

    impl Script {
        fn new(results: Vec<Result<u32, ApiError>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
                calls: AtomicU32::new(0),
            }
        }

        async fn call(&self) -> Result<u32, ApiError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.results.lock().pop_front().unwrap_or(Ok(n))
        }
    }

    fn server_error() -> ApiError {
        ApiError::ApiResponseError {
            status_code: 503,
            message: "Service temporarily unavailable".into(),
        }
    }

    fn limited(secs: u64) -> ApiError {
        ApiError::RateLimited {
            retry_after: Duration::from_secs(secs),
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(
            RetryConfig {
                initial_backoff_ms: 100,
                max_backoff_ms: 1000,
                ..Default::default()
            },
            QuotaRetryConfig::default(),
        )
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let config = RetryConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            ..Default::default()
        };
        for _ in 0..50 {
            let first = calculate_backoff(0, &config);
            assert!(first >= Duration::from_millis(95) && first <= Duration::from_millis(105));

            let third = calculate_backoff(2, &config);
            assert!(third >= Duration::from_millis(380) && third <= Duration::from_millis(420));

            assert!(calculate_backoff(10, &config) <= Duration::from_millis(1000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retried_until_success() {
        let script = Script::new(vec![Err(server_error()), Err(ApiError::Timeout(100))]);

        let result = policy().run(|| script.call()).await;

        assert_eq!(assert_ok!(result), 3);
        assert_eq!(script.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_exhaustion_propagates_original_error() {
        let script = Script::new(vec![
            Err(server_error()),
            Err(server_error()),
            Err(ApiError::NetworkError("connection reset".into())),
        ]);

        let result = policy().run(|| script.call()).await;

        assert_eq!(
            assert_err!(result),
            ApiError::NetworkError("connection reset".into())
        );
        assert_eq!(script.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_waits_exact_hint_then_gives_up() {
        let script = Script::new(vec![Err(limited(5)), Err(limited(7)), Err(limited(9))]);
        let start = Instant::now();

        let result = policy().run(|| script.call()).await;

        assert_eq!(
            assert_err!(result),
            ApiError::QuotaExceeded {
                attempts: 3,
                retry_after: Duration::from_secs(9)
            }
        );
        assert_eq!(start.elapsed(), Duration::from_secs(12));
        assert_eq!(script.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_layers_compose() {
        // Quota layer absorbs the 429s, the transient layer restarts it after the 503
        let script = Script::new(vec![
            Err(limited(1)),
            Err(limited(1)),
            Err(server_error()),
            Err(limited(1)),
        ]);

        let result = policy().run(|| script.call()).await;

        assert_eq!(assert_ok!(result), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_errors_not_retried() {
        let script = Script::new(vec![Err(ApiError::NotFound("EntityNotFound".into()))]);

        let result = policy().run(|| script.call()).await;

        assert!(matches!(result, Err(ApiError::NotFound(_))));
        assert_eq!(script.calls.load(Ordering::SeqCst), 1);
    }
}
