//! One retry policy for every venue and data call.
//!
//! Only idempotent reads are retried. Order placement is a write: a failed
//! or unacknowledged placement is never re-sent, because a retry could
//! duplicate a live order.

use std::future::Future;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Duration};

use crate::config::env_or;
use crate::error::{DataError, ExecutionError};
use crate::logging::{log, obj, v_num, v_str, Domain, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    /// Balance, position, fill and history queries.
    Read,
    /// Place or cancel.
    Write,
}

impl CallKind {
    pub fn is_idempotent(&self) -> bool {
        matches!(self, CallKind::Read)
    }
}

/// Whether an error is worth another attempt.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for ExecutionError {
    fn is_retryable(&self) -> bool {
        matches!(self, ExecutionError::Venue { .. })
    }
}

impl Retryable for DataError {
    fn is_retryable(&self) -> bool {
        matches!(self, DataError::Source(_))
    }
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts for reads, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 4, base_delay_ms: 100, max_delay_ms: 5000, jitter_factor: 0.3 }
    }
}

impl RetryPolicy {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_attempts: env_or("RETRY_MAX_ATTEMPTS", d.max_attempts).max(1),
            base_delay_ms: env_or("RETRY_BASE_MS", d.base_delay_ms),
            max_delay_ms: env_or("RETRY_MAX_MS", d.max_delay_ms),
            jitter_factor: env_or("RETRY_JITTER", d.jitter_factor),
        }
    }

    /// Exponential backoff, clamped, with ±jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64 * 2.0_f64.powi(attempt as i32);
        let clamped = base.min(self.max_delay_ms as f64);
        let jitter_range = clamped * self.jitter_factor;
        let jitter: f64 = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        Duration::from_millis((clamped + jitter).max(0.0) as u64)
    }

    pub fn attempts_for(&self, kind: CallKind) -> u32 {
        if kind.is_idempotent() {
            self.max_attempts.max(1)
        } else {
            1
        }
    }

    pub async fn run<F, Fut, T, E>(&self, kind: CallKind, name: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + std::fmt::Display,
    {
        let attempts = self.attempts_for(kind);
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    attempt += 1;
                    if attempt >= attempts || !e.is_retryable() {
                        return Err(e);
                    }
                    let delay = self.delay_for_attempt(attempt - 1);
                    log(
                        Level::Warn,
                        Domain::Exec,
                        "retry",
                        obj(&[
                            ("call", v_str(name)),
                            ("attempt", v_num(attempt as f64)),
                            ("of", v_num(attempts as f64)),
                            ("delay_ms", v_num(delay.as_millis() as f64)),
                            ("error", v_str(&e.to_string())),
                        ]),
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

/// HTTP statuses worth retrying on reads.
pub fn is_retryable_http_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryPolicy {
        RetryPolicy { max_attempts: 3, base_delay_ms: 1, max_delay_ms: 5, jitter_factor: 0.0 }
    }

    fn venue_err() -> ExecutionError {
        ExecutionError::Venue { call: "balances".into(), reason: "503".into() }
    }

    #[test]
    fn test_delay_calculation() {
        let p = RetryPolicy { max_attempts: 5, base_delay_ms: 100, max_delay_ms: 1000, jitter_factor: 0.0 };
        assert_eq!(p.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(p.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(p.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(p.delay_for_attempt(4), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn reads_retry_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let out: Result<i32, ExecutionError> = fast()
            .run(CallKind::Read, "balances", || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(venue_err())
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;
        assert_eq!(out.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn writes_are_never_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let out: Result<i32, ExecutionError> = fast()
            .run(CallKind::Write, "place", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(venue_err())
                }
            })
            .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejections_are_not_retryable() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let out: Result<(), ExecutionError> = fast()
            .run(CallKind::Read, "positions", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(ExecutionError::Rejected { order_id: "o".into(), reason: "no".into() })
                }
            })
            .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
