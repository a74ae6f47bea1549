/*
 * Podcast Seeder CLI - Rust Edition
 * Copyright (c) 2024 Podcast Seeder Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use parking_lot::Mutex;
use rand::Rng;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    Exponential,
    Linear,
    Constant,
    Fibonacci,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub factor: f64,
    pub strategy: RetryStrategy,
    pub max_delay: Duration,
    pub jitter: bool,
    /// Substring patterns of retryable error text. Empty retries everything
    /// recoverable; non-matching errors fail fast.
    pub retryable_patterns: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            factor: 2.0,
            strategy: RetryStrategy::Exponential,
            max_delay: Duration::from_secs(60),
            jitter: true,
            retryable_patterns: Vec::new(),
        }
    }
}

impl RetryConfig {
    /// delay(attempt) before the attempt+2'th try; attempt is 0-based.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let raw = match self.strategy {
            RetryStrategy::Exponential => self.factor.powi(attempt as i32),
            RetryStrategy::Linear => self.factor * (attempt as f64 + 1.0),
            RetryStrategy::Constant => self.factor,
            RetryStrategy::Fibonacci => {
                let (mut a, mut b) = (1.0f64, 1.0f64);
                for _ in 0..attempt {
                    let next = a + b;
                    a = b;
                    b = next;
                }
                a * self.factor
            }
        };
        Duration::from_secs_f64(raw.min(self.max_delay.as_secs_f64()).max(0.0))
    }

    fn is_retryable(&self, err: &PipelineError) -> bool {
        if !self.retryable_patterns.is_empty() {
            let text = err.to_string().to_lowercase();
            return self.retryable_patterns.iter().any(|p| text.contains(&p.to_lowercase()));
        }
        err.is_recoverable()
    }
}

/// Retry an async operation with configurable backoff. The shutdown token is
/// observed between attempts; the original error surfaces after the last try.
pub async fn retry_async<T, F, Fut>(
    config: &RetryConfig,
    shutdown: Option<&CancellationToken>,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if config.max_retries == 0 {
        return op().await;
    }

    let mut last_err = None;
    for attempt in 0..config.max_retries {
        if let Some(token) = shutdown {
            if token.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt + 1 >= config.max_retries {
                    tracing::error!("Failed after {} attempts: {}", config.max_retries, err);
                    return Err(err);
                }
                if !config.is_retryable(&err) {
                    tracing::error!("Non-retryable error: {}", err);
                    return Err(err);
                }

                let mut delay = config.delay_for_attempt(attempt);
                if config.jitter {
                    let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
                    delay = delay.mul_f64(factor);
                }

                tracing::warn!(
                    "Retryable error on attempt {}/{}, waiting {:.2}s: {}",
                    attempt + 1,
                    config.max_retries,
                    delay.as_secs_f64(),
                    err
                );
                last_err = Some(err);
                tokio::time::sleep(delay).await;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| PipelineError::Invariant("retry loop exited without error".into())))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct CircuitInner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
}

/// Per-dependency circuit breaker: closed -> open after `failure_threshold`
/// consecutive failures, open -> half-open after `recovery_timeout`,
/// half-open -> closed on success / back to open on failure.
/// A threshold of zero never opens.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            recovery_timeout,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open {
            if let Some(last) = inner.last_failure {
                if last.elapsed() > self.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    tracing::info!("Circuit '{}' moving to half-open", self.name);
                }
            }
        }
        inner.state
    }

    /// Gate a call. Fails immediately with `ServiceUnavailable` when open.
    pub fn check(&self) -> Result<()> {
        if self.state() == CircuitState::Open {
            return Err(PipelineError::ServiceUnavailable(format!(
                "circuit '{}' is open",
                self.name
            )));
        }
        Ok(())
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            tracing::info!("Circuit '{}' recovered, closing", self.name);
        }
        inner.failure_count = 0;
        inner.state = CircuitState::Closed;
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());

        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Open;
            tracing::warn!("Circuit '{}' test failed, reopening", self.name);
        } else if self.failure_threshold > 0 && inner.failure_count >= self.failure_threshold {
            inner.state = CircuitState::Open;
            tracing::error!(
                "Circuit '{}' opened after {} failures",
                self.name,
                inner.failure_count
            );
        }
    }

    /// Run `op` through the breaker, recording the outcome.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.check()?;
        match op().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(err)
            }
        }
    }
}

struct BucketInner {
    tokens: f64,
    last_update: tokio::time::Instant,
}

/// Token-bucket rate limiter: `rate` tokens/second, capacity `burst`.
/// `acquire` never fails; it only delays. A rate of zero blocks forever once
/// the initial burst is drained.
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    inner: tokio::sync::Mutex<BucketInner>,
}

impl RateLimiter {
    pub fn new(rate: f64, burst: u32) -> Self {
        Self {
            rate,
            burst: burst as f64,
            inner: tokio::sync::Mutex::new(BucketInner {
                tokens: burst as f64,
                last_update: tokio::time::Instant::now(),
            }),
        }
    }

    /// Acquire `n` tokens, sleeping as needed. Returns the total wait time.
    pub async fn acquire(&self, n: u32) -> Duration {
        let needed = n as f64;
        let started = tokio::time::Instant::now();

        loop {
            let wait = {
                let mut inner = self.inner.lock().await;
                let now = tokio::time::Instant::now();
                let elapsed = now.duration_since(inner.last_update).as_secs_f64();
                inner.tokens = (inner.tokens + elapsed * self.rate).min(self.burst);
                inner.last_update = now;

                if inner.tokens >= needed {
                    inner.tokens -= needed;
                    return started.elapsed();
                }

                if self.rate <= 0.0 {
                    // Unsatisfiable; park until the caller cancels.
                    Duration::from_secs(3600)
                } else {
                    Duration::from_secs_f64((needed - inner.tokens) / self.rate)
                }
            };

            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn exponential_delays_cap_at_max() {
        let config = RetryConfig {
            factor: 2.0,
            max_delay: Duration::from_secs(8),
            jitter: false,
            ..Default::default()
        };
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(8));
    }

    #[test]
    fn fibonacci_delays() {
        let config = RetryConfig {
            factor: 1.0,
            strategy: RetryStrategy::Fibonacci,
            max_delay: Duration::from_secs(100),
            jitter: false,
            ..Default::default()
        };
        let delays: Vec<u64> = (0..5).map(|a| config.delay_for_attempt(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 1, 2, 3, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let attempts = AtomicUsize::new(0);
        let config = RetryConfig {
            max_retries: 5,
            factor: 0.01,
            jitter: false,
            ..Default::default()
        };

        let result = retry_async(&config, None, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(PipelineError::Transient("flaky".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_matching_errors_fail_fast() {
        let attempts = AtomicUsize::new(0);
        let config = RetryConfig {
            max_retries: 5,
            retryable_patterns: vec!["timeout".to_string()],
            jitter: false,
            ..Default::default()
        };

        let result: Result<()> = retry_async(&config, None, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(PipelineError::Transient("connection refused".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn original_error_surfaces_after_last_attempt() {
        let config = RetryConfig {
            max_retries: 3,
            factor: 0.01,
            jitter: false,
            ..Default::default()
        };

        let result: Result<()> = retry_async(&config, None, || async {
            Err(PipelineError::Transient("always down".into()))
        })
        .await;

        match result {
            Err(PipelineError::Transient(msg)) => assert_eq!(msg, "always down"),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn breaker_opens_and_half_opens() {
        let breaker = CircuitBreaker::new("dep", 2, Duration::from_millis(10));
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.check().is_err());

        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.on_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("dep", 1, Duration::from_millis(5));
        breaker.on_failure();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn zero_threshold_never_opens() {
        let breaker = CircuitBreaker::new("dep", 0, Duration::from_secs(1));
        for _ in 0..10 {
            breaker.on_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.check().is_ok());
    }

    #[tokio::test]
    async fn bucket_grants_burst_immediately() {
        let limiter = RateLimiter::new(10.0, 5);
        let waited = limiter.acquire(5).await;
        assert!(waited < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_delays_when_drained() {
        let limiter = RateLimiter::new(10.0, 1);
        limiter.acquire(1).await;
        // Needs ~0.1s of refill for the next token; paused clock auto-advances.
        let waited = limiter.acquire(1).await;
        assert!(waited >= Duration::from_millis(90));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_rate_blocks_until_cancelled() {
        let limiter = RateLimiter::new(0.0, 1);
        limiter.acquire(1).await;

        let blocked = tokio::time::timeout(Duration::from_secs(2), limiter.acquire(1)).await;
        assert!(blocked.is_err());
    }
}
