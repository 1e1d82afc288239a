//! Named retry policies and the retry loop the services share.
//!
//! Store batches are retried on a [`RetryPolicy::Fixed`] schedule and broker
//! publishes on a [`RetryPolicy::Exponential`] one. Neither policy gives up on
//! its own: only the shutdown token (or a caller-side deadline around the whole
//! call) ends the loop. Sleeping goes through [`Sleeper`] so tests can observe
//! the schedule without waiting on it.

use crate::transport::runtime::sleep_with_shutdown;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

const MIN_MULTIPLIER: f64 = 1.0;
const MAX_MULTIPLIER: f64 = 10.0;

#[derive(Clone, Debug, PartialEq)]
pub enum RetryPolicy {
    Fixed(Duration),
    Exponential {
        initial: Duration,
        max: Duration,
        multiplier: f64,
    },
}

impl RetryPolicy {
    pub const fn fixed(delay: Duration) -> Self {
        RetryPolicy::Fixed(delay)
    }

    pub fn exponential(initial: Duration, max: Duration, multiplier: f64) -> Self {
        let max = max.max(initial);
        let multiplier = if multiplier.is_finite() {
            multiplier.clamp(MIN_MULTIPLIER, MAX_MULTIPLIER)
        } else {
            MIN_MULTIPLIER
        };
        RetryPolicy::Exponential {
            initial,
            max,
            multiplier,
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.clone())
    }
}

/// Delay schedule for one retry sequence.
#[derive(Clone, Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    current: Duration,
}

impl Backoff {
    fn new(policy: RetryPolicy) -> Self {
        let current = match &policy {
            RetryPolicy::Fixed(delay) => *delay,
            RetryPolicy::Exponential { initial, .. } => *initial,
        };
        Self { policy, current }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        if let RetryPolicy::Exponential {
            max, multiplier, ..
        } = &self.policy
        {
            let next = delay.as_secs_f64() * multiplier;
            self.current = if next >= max.as_secs_f64() {
                *max
            } else {
                Duration::from_secs_f64(next)
            };
        }
        delay
    }
}

/// Injectable pause used between retry attempts and poll cycles.
#[async_trait]
pub trait Sleeper: Send + Sync {
    /// Returns `true` when the shutdown token fired before the delay elapsed.
    async fn sleep(&self, duration: Duration, shutdown: &CancellationToken) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration, shutdown: &CancellationToken) -> bool {
        sleep_with_shutdown(duration, shutdown).await
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("retry abandoned after {attempts} attempt(s): shutdown requested")]
pub struct RetryCancelled {
    pub attempts: u32,
}

/// Runs `operation` until it succeeds, pausing per `policy` after each failure.
///
/// `on_failure` sees every error together with the attempt number and the delay
/// about to be slept. The loop only stops early when `shutdown` is cancelled
/// while it is waiting.
pub async fn with_retry<T, E, F, Fut, O>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    shutdown: &CancellationToken,
    mut on_failure: O,
    mut operation: F,
) -> Result<T, RetryCancelled>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    O: FnMut(&E, u32, Duration),
{
    let mut backoff = policy.backoff();
    let mut attempts: u32 = 0;

    loop {
        attempts = attempts.saturating_add(1);
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let delay = backoff.next_delay();
                on_failure(&err, attempts, delay);
                if sleeper.sleep(delay, shutdown).await {
                    return Err(RetryCancelled { attempts });
                }
            }
        }
    }
}
