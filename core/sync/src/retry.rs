//! Backoff for reference fetches and realtime reconnects.
//!
//! A 429 or 503 answer carrying `Retry-After` overrides the computed
//! backoff. A server wait longer than `max_delay` ends the attempt instead
//! of stalling the scheduler; the next reference tick tries again.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use tillsync_common::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    /// Upper bound for both computed and server-requested waits.
    #[serde(with = "millis")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Spread each computed delay over 75%..125%.
    pub jitter: bool,
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Computed wait before retry `retry` (zero-based), capped at `max_delay`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.min(i32::MAX as u32) as i32;
        let cap = self.max_delay.as_millis() as f64;
        let mut millis =
            (self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent)).min(cap);

        if self.jitter {
            millis *= 0.75 + rand::random::<f64>() * 0.5;
        }
        Duration::from_millis(millis as u64)
    }

    /// Wait before retrying after `err`, or `None` to give up.
    fn wait_after(&self, err: &Error, retry: u32) -> Option<Duration> {
        if !is_retryable(err) || retry >= self.max_retries {
            return None;
        }
        match err.retry_after() {
            Some(requested) if requested > self.max_delay => None,
            Some(requested) => Some(requested),
            None => Some(self.backoff(retry)),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Whether a failed remote call may succeed if repeated unchanged.
///
/// `Offline` is excluded: nothing was sent, and the scheduler retries once
/// connectivity returns.
pub fn is_retryable(err: &Error) -> bool {
    !matches!(err, Error::Offline) && err.is_transient()
}

pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `call` until it succeeds, fails permanently, or retries run out.
    /// The last error is returned unchanged.
    pub async fn execute<F, Fut, T>(&self, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry = 0;
        loop {
            let err = match call().await {
                Ok(value) => {
                    if retry > 0 {
                        debug!(retries = retry, "Remote call recovered");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let Some(wait) = self.config.wait_after(&err, retry) else {
                if retry > 0 || err.retry_after().is_some() {
                    warn!(retries = retry, "Giving up on remote call: {}", err);
                }
                return Err(err);
            };

            retry += 1;
            warn!(
                retry,
                wait_ms = wait.as_millis() as u64,
                server_requested = err.retry_after().is_some(),
                "Remote call failed: {}",
                err
            );
            sleep(wait).await;
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

/// `Duration` as whole milliseconds in config files.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn fixed(max_retries: u32) -> RetryConfig {
        RetryConfig::new(max_retries)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false)
    }

    /// Fails with `errors` in order, then returns the number of calls made.
    async fn run(config: RetryConfig, errors: Vec<Error>) -> (Result<u32>, u32) {
        let calls = Arc::new(AtomicU32::new(0));
        let errors = Arc::new(std::sync::Mutex::new(errors.into_iter()));
        let counter = calls.clone();

        let result = RetryExecutor::new(config)
            .execute(move || {
                let counter = counter.clone();
                let next = errors.lock().unwrap().next();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    match next {
                        Some(err) => Err(err),
                        None => Ok(n),
                    }
                }
            })
            .await;
        (result, calls.load(Ordering::SeqCst))
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10))
            .with_jitter(false);

        assert_eq!(config.backoff(0), Duration::from_secs(1));
        assert_eq!(config.backoff(1), Duration::from_secs(2));
        assert_eq!(config.backoff(2), Duration::from_secs(4));
        assert_eq!(config.backoff(6), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let config = RetryConfig::new(3).with_initial_delay(Duration::from_millis(1000));
        for _ in 0..50 {
            let delay = config.backoff(0).as_millis();
            assert!((750..=1250).contains(&delay), "{}", delay);
        }
    }

    #[test]
    fn test_retryable_errors() {
        assert!(is_retryable(&Error::Network("reset".to_string())));
        assert!(is_retryable(&Error::remote_rejected(503, "")));
        assert!(is_retryable(&Error::remote_rejected(429, "")));
        assert!(!is_retryable(&Error::Offline));
        assert!(!is_retryable(&Error::SessionExpired));
        assert!(!is_retryable(&Error::remote_rejected(409, "")));
    }

    #[test]
    fn test_server_wait_replaces_backoff() {
        let config = RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter(false);

        let throttled = Error::remote_rejected(429, "").with_retry_after(Some(5));
        assert_eq!(config.wait_after(&throttled, 0), Some(Duration::from_secs(5)));

        let too_long = Error::remote_rejected(503, "").with_retry_after(Some(120));
        assert_eq!(config.wait_after(&too_long, 0), None);

        let plain = Error::remote_rejected(503, "");
        assert_eq!(config.wait_after(&plain, 1), Some(Duration::from_millis(200)));
        assert_eq!(config.wait_after(&plain, 3), None);
    }

    #[test]
    fn test_config_serialization() {
        let config = RetryConfig::new(5).with_initial_delay(Duration::from_millis(250));
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"initial_delay\":250"));

        let restored: RetryConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, config);
    }

    #[tokio::test]
    async fn test_network_errors_are_retried() {
        let (result, calls) = run(
            fixed(3),
            vec![
                Error::Network("reset".to_string()),
                Error::Network("reset".to_string()),
            ],
        )
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_throttled_call_waits_as_asked() {
        let started = Instant::now();
        let (result, calls) = run(
            fixed(2),
            vec![Error::remote_rejected(429, r#"{"message":"Slow down"}"#).with_retry_after(Some(1))],
        )
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls, 2);
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_long_server_wait_gives_up() {
        let (result, calls) = run(
            fixed(3).with_max_delay(Duration::from_secs(10)),
            vec![Error::remote_rejected(503, "").with_retry_after(Some(600))],
        )
        .await;

        assert_eq!(result.unwrap_err().retry_after(), Some(Duration::from_secs(600)));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let (result, calls) = run(fixed(3), vec![Error::SessionExpired]).await;

        assert!(matches!(result, Err(Error::SessionExpired)));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_retries_run_out() {
        let errors = (0..5).map(|_| Error::Network("down".to_string())).collect();
        let (result, calls) = run(fixed(2), errors).await;

        assert!(result.is_err());
        assert_eq!(calls, 3);
    }
}
