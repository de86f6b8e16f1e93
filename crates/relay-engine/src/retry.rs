use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use relay_core::config::RetryConfig;
use relay_core::error::{RelayError, Result};
use relay_core::traits::Adapter;
use relay_core::types::{Output, RequestConfig};

use crate::stream::{self, Processed, StreamPolicy};

/// Computes the delay before retry number `attempt` (1-based).
pub type DelayFn = Arc<dyn Fn(u32, &RelayError) -> Duration + Send + Sync>;

/// Decides whether a failure is worth another attempt. Receives the error
/// and the index of the attempt that failed (0 = initial call).
pub type RetryPredicate = Arc<dyn Fn(&RelayError, u32) -> bool + Send + Sync>;

/// Bounded retry with fixed, exponential, or caller-computed backoff.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_attempts: u32,
    /// Fixed delay, or the base of the exponential series.
    pub delay: Duration,
    pub exponential: bool,
    /// Upper bound for exponential delays.
    pub max_delay: Option<Duration>,
    pub jitter: bool,
    delay_fn: Option<DelayFn>,
    predicate: Option<RetryPredicate>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(1000),
            exponential: false,
            max_delay: None,
            jitter: false,
            delay_fn: None,
            predicate: None,
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("delay", &self.delay)
            .field("exponential", &self.exponential)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .field("delay_fn", &self.delay_fn.is_some())
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Build from the `[retry]` config section.
    pub fn from_config(config: &RetryConfig) -> Self {
        let policy = Self {
            max_attempts: config.max_attempts,
            delay: Duration::from_millis(config.base_delay_ms),
            exponential: config.exponential,
            max_delay: config.max_delay_ms.map(Duration::from_millis),
            jitter: config.jitter,
            delay_fn: None,
            predicate: None,
        };
        if config.retry_on_status.is_empty() {
            policy
        } else {
            policy.retry_on_status(&config.retry_on_status)
        }
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn exponential(mut self, base: Duration, cap: Option<Duration>) -> Self {
        self.exponential = true;
        self.delay = base;
        self.max_delay = cap;
        self
    }

    pub fn jitter(mut self, on: bool) -> Self {
        self.jitter = on;
        self
    }

    /// Compute each delay with `f(attempt, error)`. Takes precedence over
    /// the fixed and exponential settings.
    pub fn delay_with<F>(mut self, f: F) -> Self
    where
        F: Fn(u32, &RelayError) -> Duration + Send + Sync + 'static,
    {
        self.delay_fn = Some(Arc::new(f));
        self
    }

    /// Replace the default network-class predicate.
    pub fn retry_if<F>(mut self, f: F) -> Self
    where
        F: Fn(&RelayError, u32) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(f));
        self
    }

    /// Retry network-class errors and any error whose recovered status is
    /// in `codes`.
    pub fn retry_on_status(self, codes: &[u16]) -> Self {
        let codes = codes.to_vec();
        self.retry_if(move |err, _| {
            err.is_network_class() || err.status().is_some_and(|s| codes.contains(&s))
        })
    }

    pub fn should_retry(&self, err: &RelayError, attempt: u32) -> bool {
        match &self.predicate {
            Some(predicate) => predicate(err, attempt),
            None => err.is_network_class(),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32, err: &RelayError) -> Duration {
        if let Some(f) = &self.delay_fn {
            return f(attempt, err);
        }

        let mut delay = if self.exponential {
            let factor = 2u32.checked_pow(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
            self.delay.saturating_mul(factor)
        } else {
            self.delay
        };

        if self.jitter {
            // 0.8x to 1.2x
            let jitter = 0.8 + rand::random::<f64>() * 0.4;
            delay = delay.mul_f64(jitter);
        }

        match self.max_delay {
            Some(cap) if self.exponential => delay.min(cap),
            _ => delay,
        }
    }
}

/// Issue a single call and narrow its result, running a stream body
/// through `stream_policy` first.
pub async fn fetch_once(
    adapter: &dyn Adapter,
    config: &RequestConfig,
    stream_policy: Option<&StreamPolicy>,
) -> Result<Output> {
    let response = adapter.execute_request(config).await?;
    let response = match stream_policy {
        Some(policy) => match stream::process_response(response, policy).await? {
            Processed::Accumulated(output) => return Ok(output),
            Processed::Response(response) => response,
        },
        None => response,
    };
    adapter.get_result(response).await
}

/// Run `config` through `adapter`, retrying failures per `policy`.
///
/// Makes at most `max_attempts + 1` calls. The last failure is returned
/// unchanged once the policy gives up.
pub async fn execute(
    adapter: &dyn Adapter,
    config: &RequestConfig,
    policy: &RetryPolicy,
    stream_policy: Option<&StreamPolicy>,
) -> Result<Output> {
    let mut attempt: u32 = 0;
    loop {
        match fetch_once(adapter, config, stream_policy).await {
            Ok(output) => {
                if attempt > 0 {
                    debug!(target_url = %config.target, attempt, "Request succeeded after retry");
                }
                return Ok(output);
            }
            Err(e) => {
                if attempt >= policy.max_attempts || !policy.should_retry(&e, attempt) {
                    return Err(e);
                }
                let next = attempt + 1;
                let delay = policy.delay_for(next, &e);
                warn!(
                    target_url = %config.target,
                    attempt = next,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying request"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use relay_test_utils::MockAdapter;
    use tokio::time::Instant;

    fn network() -> RelayError {
        RelayError::Network("connection reset".into())
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_n_failures() {
        let adapter = MockAdapter::new()
            .fail_times(3, network)
            .respond_json(serde_json::json!({"ok": true}));
        let policy = RetryPolicy::new(3).delay(Duration::from_millis(10));

        let out = execute(&adapter, &RequestConfig::get("https://a.test"), &policy, None)
            .await
            .unwrap();

        assert_eq!(out, Output::Json(serde_json::json!({"ok": true})));
        assert_eq!(adapter.call_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_error_unchanged() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let adapter = MockAdapter::new().fail_with(move || {
            let n = c.fetch_add(1, Ordering::SeqCst);
            RelayError::Network(format!("drop {}", n))
        });
        let policy = RetryPolicy::new(2).delay(Duration::ZERO);

        let err = execute(&adapter, &RequestConfig::get("https://a.test"), &policy, None)
            .await
            .unwrap_err();

        assert_eq!(adapter.call_count(), 3);
        match err {
            RelayError::Network(msg) => assert_eq!(msg, "drop 2"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn non_network_errors_are_not_retried_by_default() {
        let adapter = MockAdapter::new().fail_with(|| RelayError::http_status(400, "bad request"));
        let policy = RetryPolicy::new(5);

        let err = execute(&adapter, &RequestConfig::get("https://a.test"), &policy, None)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(400));
        assert_eq!(adapter.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn status_predicate_is_opt_in() {
        let adapter = MockAdapter::new()
            .fail_times(2, || RelayError::http_status(503, "unavailable"))
            .respond_text("ok");
        let policy = RetryPolicy::new(3)
            .delay(Duration::from_millis(1))
            .retry_on_status(&[503]);

        let out = execute(&adapter, &RequestConfig::get("https://a.test"), &policy, None)
            .await
            .unwrap();
        assert_eq!(out, Output::Text("ok".into()));
        assert_eq!(adapter.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn predicate_sees_failed_attempt_index() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let s = seen.clone();
        let adapter = MockAdapter::new().fail_with(network);
        let policy = RetryPolicy::new(5).delay(Duration::ZERO).retry_if(move |_, attempt| {
            s.lock().unwrap().push(attempt);
            attempt < 2
        });

        let _ = execute(&adapter, &RequestConfig::get("https://a.test"), &policy, None).await;
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(adapter.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exponential_backoff_respects_cap() {
        let adapter = MockAdapter::new().fail_with(network);
        let base = Duration::from_millis(100);
        let cap = Duration::from_millis(300);
        let policy = RetryPolicy::new(4).exponential(base, Some(cap));

        let start = Instant::now();
        let _ = execute(&adapter, &RequestConfig::get("https://a.test"), &policy, None).await;
        let elapsed = start.elapsed();

        // 100 + 200 + 300 (capped from 400) + 300 (capped from 800)
        assert!(elapsed >= Duration::from_millis(900));
        assert!(elapsed < Duration::from_millis(910));
        assert_eq!(adapter.call_count(), 5);
    }

    #[test]
    fn delay_series() {
        let err = network();
        let policy = RetryPolicy::new(5).exponential(Duration::from_millis(50), None);
        assert_eq!(policy.delay_for(1, &err), Duration::from_millis(50));
        assert_eq!(policy.delay_for(2, &err), Duration::from_millis(100));
        assert_eq!(policy.delay_for(4, &err), Duration::from_millis(400));

        let fixed = RetryPolicy::new(5).delay(Duration::from_millis(70));
        assert_eq!(fixed.delay_for(3, &err), Duration::from_millis(70));

        let custom = RetryPolicy::new(5)
            .exponential(Duration::from_millis(50), None)
            .delay_with(|attempt, _| Duration::from_millis(u64::from(attempt) * 7));
        assert_eq!(custom.delay_for(3, &err), Duration::from_millis(21));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let err = network();
        let policy = RetryPolicy::new(3).delay(Duration::from_millis(1000)).jitter(true);
        for _ in 0..50 {
            let d = policy.delay_for(1, &err);
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1200));
        }
    }

    #[test]
    fn from_config_builds_status_predicate() {
        let config = RetryConfig {
            retry_on_status: vec![429],
            ..RetryConfig::default()
        };
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_attempts, 3);
        assert!(policy.should_retry(&RelayError::http_status(429, "slow down"), 0));
        assert!(!policy.should_retry(&RelayError::http_status(500, "oops"), 0));
        assert!(policy.should_retry(&network(), 0));
    }
}
