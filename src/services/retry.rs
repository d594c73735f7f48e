//! Retry with exponential backoff, short-circuited by a circuit breaker.
//!
//! State transitions:
//!
//! ```text
//! Closed ──[failure threshold reached]──> Open
//!    ↑                                      │
//!    │                         [recovery timeout elapsed]
//!    │                                      ↓
//!    └───[success]─── HalfOpen ──[failure]──> Open
//! ```
//!
//! Calls while Open fail fast without invoking the wrapped operation. A
//! single success while HalfOpen closes the breaker; a failure reopens it
//! immediately.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{info, warn};

use crate::config::{BreakerConfig, RetryConfig};
use crate::error::EngineError;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, all calls allowed.
    Closed,
    /// Failing dependency, calls rejected immediately.
    Open,
    /// Recovery probe, a single call allowed through.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Fail-fast guard around a consistently failing dependency.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: RwLock<BreakerInner>,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    open_count: AtomicU64,
}

impl CircuitBreaker {
    /// Create a breaker guarding the named dependency.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: RwLock::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            open_count: AtomicU64::new(0),
        }
    }

    /// Dependency name, for logs and errors.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, transitioning Open -> HalfOpen when the recovery
    /// timeout has elapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.write().expect("breaker lock poisoned");
        self.maybe_half_open(&mut inner);
        inner.state
    }

    /// Whether a call may proceed right now.
    pub fn is_allowed(&self) -> bool {
        !matches!(self.state(), CircuitState::Open)
    }

    /// Record a successful call. Closes the breaker from HalfOpen and clears
    /// the failure streak.
    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.write().expect("breaker lock poisoned");
        if inner.state == CircuitState::HalfOpen {
            info!("Circuit breaker '{}' recovered: half_open -> closed", self.name);
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    /// Record a failed call. Trips the breaker at the failure threshold, or
    /// immediately when a HalfOpen probe fails.
    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.write().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.trip(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                warn!(
                    "Circuit breaker '{}' recovery probe failed: half_open -> open",
                    self.name
                );
                self.trip(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    /// Manually reset to Closed.
    pub fn reset(&self) {
        let mut inner = self.inner.write().expect("breaker lock poisoned");
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        info!("Circuit breaker '{}' manually reset", self.name);
    }

    /// (successes, failures, times opened) since creation.
    pub fn counters(&self) -> (u64, u64, u64) {
        (
            self.total_successes.load(Ordering::Relaxed),
            self.total_failures.load(Ordering::Relaxed),
            self.open_count.load(Ordering::Relaxed),
        )
    }

    fn trip(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        self.open_count.fetch_add(1, Ordering::Relaxed);
        warn!(
            "Circuit breaker '{}' tripped after {} consecutive failures",
            self.name, inner.consecutive_failures
        );
    }

    fn maybe_half_open(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open {
            let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or_default();
            if elapsed >= Duration::from_millis(self.config.recovery_timeout_ms) {
                inner.state = CircuitState::HalfOpen;
                info!("Circuit breaker '{}' probing: open -> half_open", self.name);
            }
        }
    }
}

/// Bounded-retry wrapper with exponential backoff and jitter.
pub struct RetryHandler {
    config: RetryConfig,
}

impl RetryHandler {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `op` up to `max_attempts` times.
    ///
    /// Non-retryable errors propagate immediately. A rate-limit error with a
    /// server-specified delay sleeps exactly that long, bypassing the
    /// exponential schedule. When a breaker is supplied it wraps the whole
    /// attempt sequence: an Open breaker fails fast without invoking `op`,
    /// and exactly one success/failure is recorded per call.
    pub async fn execute<T, F, Fut>(
        &self,
        name: &str,
        breaker: Option<&CircuitBreaker>,
        mut op: F,
    ) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        if let Some(breaker) = breaker {
            if !breaker.is_allowed() {
                return Err(EngineError::CircuitOpen {
                    service: breaker.name().to_string(),
                });
            }
        }

        let mut attempt = 1u32;
        loop {
            match op().await {
                Ok(value) => {
                    if let Some(breaker) = breaker {
                        breaker.record_success();
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let last_attempt = attempt >= self.config.max_attempts;
                    if !err.is_retryable() || last_attempt {
                        if err.is_retryable() {
                            if let Some(breaker) = breaker {
                                breaker.record_failure();
                            }
                        }
                        return Err(err);
                    }

                    let delay = match err.retry_after_ms() {
                        Some(ms) => Duration::from_millis(ms),
                        None => self.backoff_delay(attempt),
                    };
                    warn!(
                        "'{}' attempt {}/{} failed ({}), retrying in {:?}",
                        name, attempt, self.config.max_attempts, err, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.config.base_delay_ms as f64
            * self.config.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = (exp as u64).min(self.config.max_delay_ms);
        let jitter = if self.config.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.config.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(capped + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;
    use std::thread;

    fn breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: threshold,
                recovery_timeout_ms: recovery_ms,
            },
        )
    }

    fn fast_retry(max_attempts: u32) -> RetryHandler {
        RetryHandler::new(RetryConfig {
            max_attempts,
            base_delay_ms: 10,
            max_delay_ms: 100,
            multiplier: 2.0,
            jitter_ms: 0,
        })
    }

    // =========================================================================
    // Circuit breaker
    // =========================================================================

    #[test]
    fn test_breaker_initial_state() {
        let cb = breaker(3, 30_000);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.is_allowed());
    }

    #[test]
    fn test_breaker_opens_at_threshold() {
        let cb = breaker(3, 30_000);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.is_allowed());
    }

    #[test]
    fn test_breaker_success_resets_streak() {
        let cb = breaker(3, 30_000);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_breaker_stays_open_within_recovery_window() {
        let cb = breaker(1, 30_000);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.is_allowed());
        // still inside the window
        assert!(!cb.is_allowed());
    }

    #[test]
    fn test_breaker_half_open_after_timeout() {
        let cb = breaker(1, 50);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        thread::sleep(Duration::from_millis(60));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.is_allowed());
    }

    #[test]
    fn test_breaker_closes_on_half_open_success() {
        let cb = breaker(1, 50);
        cb.record_failure();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_breaker_reopens_on_half_open_failure() {
        let cb = breaker(1, 50);
        cb.record_failure();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        let (_, _, opened) = cb.counters();
        assert_eq!(opened, 2);
    }

    #[test]
    fn test_breaker_manual_reset() {
        let cb = breaker(1, 300_000);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.is_allowed());
    }

    // =========================================================================
    // Retry handler
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_transient_failures() {
        let handler = fast_retry(3);
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result = handler
            .execute("op", None, move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(EngineError::Network("flaky".to_string()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_max_attempts() {
        let handler = fast_retry(3);
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<(), _> = handler
            .execute("op", None, move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(EngineError::Timeout(100))
                }
            })
            .await;

        assert!(matches!(result, Err(EngineError::Timeout(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_propagates_immediately() {
        let handler = fast_retry(5);
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<(), _> = handler
            .execute("op", None, move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(EngineError::Validation("bad input".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(EngineError::Validation(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_honors_server_retry_after() {
        let handler = fast_retry(2);
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let start = tokio::time::Instant::now();

        let result = handler
            .execute("op", None, move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(EngineError::RateLimited {
                            retry_after_ms: Some(1500),
                        })
                    } else {
                        Ok(tokio::time::Instant::now())
                    }
                }
            })
            .await;

        // the server-specified delay is honored verbatim, no jitter
        let resumed_at = result.unwrap();
        assert_eq!(resumed_at.duration_since(start), Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_fails_fast_without_invoking_op() {
        let handler = fast_retry(3);
        let cb = breaker(1, 300_000);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<(), _> = handler
            .execute("op", Some(&cb), move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert!(matches!(result, Err(EngineError::CircuitOpen { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_records_one_outcome_per_call() {
        let handler = fast_retry(3);
        let cb = breaker(2, 300_000);

        // three attempts inside one call, but only one breaker failure
        let result: Result<(), _> = handler
            .execute("op", Some(&cb), || async {
                Err(EngineError::Network("down".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(cb.state(), CircuitState::Closed);

        // second failed call reaches the threshold
        let result: Result<(), _> = handler
            .execute("op", Some(&cb), || async {
                Err(EngineError::Network("down".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_failure_does_not_trip_breaker() {
        let handler = fast_retry(3);
        let cb = breaker(1, 300_000);

        let result: Result<(), _> = handler
            .execute("op", Some(&cb), || async {
                Err(EngineError::Validation("bad".to_string()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_backoff_delay_schedule() {
        let handler = RetryHandler::new(RetryConfig {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
            jitter_ms: 0,
        });

        assert_eq!(handler.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(handler.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(handler.backoff_delay(3), Duration::from_millis(400));
        // capped at max_delay
        assert_eq!(handler.backoff_delay(10), Duration::from_millis(1_000));
    }
}
