//! Bounded retry with pluggable backoff.
//!
//! Every CRUD handler funnels its store calls through [`retry_with_policy`]
//! so the attempt cap, the per-attempt logging and the backoff are the same
//! for create, update and delete.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::domain::models::DispatchError;
use crate::domain::ports::StoreError;

/// Errors that know whether another attempt could succeed
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

impl Retryable for DispatchError {
    fn is_retryable(&self) -> bool {
        self.should_requeue()
    }
}

/// Delay strategy between attempts
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// Retry immediately
    None,
    /// Same delay before every retry
    Fixed(Duration),
    /// `initial * 2^(attempt - 1)`, capped at `max`, optionally with up to
    /// 50% random jitter added
    Exponential {
        initial: Duration,
        max: Duration,
        jitter: bool,
    },
}

/// Attempt cap plus backoff
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one; at least 1
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                initial: Duration::from_millis(200),
                max: Duration::from_secs(5),
                jitter: true,
            },
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Policy without delays, handy for tests and in-process stores
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Backoff::None)
    }

    /// Delay to wait after the given failed attempt (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match &self.backoff {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential { initial, max, jitter } => {
                let exponent = attempt.saturating_sub(1).min(16);
                let base = initial.saturating_mul(1u32 << exponent).min(*max);
                if *jitter && !base.is_zero() {
                    let extra = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
                    base + Duration::from_millis(extra)
                } else {
                    base
                }
            }
        }
    }
}

/// The last error after the policy gave up, with the number of attempts made
#[derive(Debug, Clone, PartialEq)]
pub struct RetryFailure<E> {
    pub attempts: u32,
    pub error: E,
}

/// Runs `operation` until it succeeds, returns a non-retryable error, or the
/// attempt cap is reached. Each failed attempt is logged with its number.
///
/// # Arguments
/// * `policy` - Attempt cap and backoff
/// * `label` - Operation name used in log lines
/// * `operation` - Produces a fresh future for every attempt
///
/// # Errors
/// Returns `RetryFailure` holding the last error and the attempts made
pub async fn retry_with_policy<F, Fut, T, E>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> Result<T, RetryFailure<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(operation = label, attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => {
                warn!(
                    operation = label,
                    attempt,
                    max_attempts,
                    error = %error,
                    "attempt failed"
                );

                if !error.is_retryable() || attempt >= max_attempts {
                    return Err(RetryFailure { attempts: attempt, error });
                }

                let delay = policy.delay_after(attempt);
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}
