// Copyright (c) 2025 - Cowboy AI, Inc.
//! Retry and Polling
//!
//! - [`with_retry`]: bounded exponential backoff with jitter around one
//!   adapter call; only transient errors are retried
//! - [`poll_until`]: repeated observation of an external transition with
//!   a growing interval and a hard ceiling

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::adapter::AdapterError;
use crate::config::{PollPolicy, RetryPolicy};

/// Last error of a call that did not succeed, with the attempts spent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryError {
    pub error: AdapterError,
    pub attempts: u32,
}

/// Run `operation` until it succeeds, fails with a state error, or the
/// attempt budget is spent
///
/// Returns the value and the number of attempts used.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> Result<(T, u32), RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AdapterError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok((value, attempt)),
            Err(error) if !error.is_retryable() || attempt >= max_attempts => {
                return Err(RetryError {
                    error,
                    attempts: attempt,
                })
            }
            Err(error) => {
                let delay = jittered(policy, attempt - 1);
                warn!(
                    call = label,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Equal jitter: half the backoff delay fixed, half random
fn jittered(policy: &RetryPolicy, attempt: u32) -> Duration {
    let delay = policy.delay_for_attempt(attempt);
    if !policy.jitter || delay.is_zero() {
        return delay;
    }
    let half = delay / 2;
    let span = half.as_millis() as u64;
    half + Duration::from_millis(rand::thread_rng().gen_range(0..=span))
}

/// Outcome of one poll observation
#[derive(Debug, Clone, PartialEq)]
pub enum Probe<T> {
    Ready(T),
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    #[error("not ready after {}ms", .waited.as_millis())]
    TimedOut { waited: Duration },

    #[error(transparent)]
    Adapter(AdapterError),
}

/// Observe until `probe` reports ready or `ceiling` elapses
///
/// Transient observation errors count as "not ready yet"; state errors end
/// the wait.
pub async fn poll_until<T, F, Fut>(
    policy: &PollPolicy,
    ceiling: Duration,
    mut probe: F,
) -> Result<T, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Probe<T>, AdapterError>>,
{
    let started = Instant::now();
    let mut interval = policy.initial_interval();

    loop {
        match probe().await {
            Ok(Probe::Ready(value)) => return Ok(value),
            Ok(Probe::Pending) => trace!("Not ready yet"),
            Err(error) if error.is_retryable() => {
                warn!(%error, "Transient failure while polling")
            }
            Err(error) => return Err(PollError::Adapter(error)),
        }

        let waited = started.elapsed();
        if waited >= ceiling {
            return Err(PollError::TimedOut { waited });
        }
        tokio::time::sleep(interval.min(ceiling - waited)).await;
        interval = (interval * 2).min(policy.max_interval());
    }
}
