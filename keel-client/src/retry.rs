//! Bounded exponential backoff with jitter
//!
//! Every control-plane call the agent makes goes through a [`Retry`]: at most
//! `max_attempts` tries, delays doubling from `initial_delay` up to
//! `max_delay`, each delay scaled by a random factor in `1 ± jitter`.
//! Waiting stops early when the supplied cancellation token fires.

use keel_core::plugin::PluginStatus;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ClientError;

/// Whether an error is worth another attempt
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for ClientError {
    fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }
}

impl Retryable for PluginStatus {
    fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Cancelled before an attempt succeeded
    #[error("retry cancelled")]
    Cancelled { last: Option<E> },

    /// Every attempt failed with a retryable error
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    /// The error was not retryable
    #[error("{0}")]
    Permanent(E),
}

impl<E> RetryError<E> {
    /// The last underlying error, if any attempt ran
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Cancelled { last } => last,
            Self::Exhausted { last, .. } => Some(last),
            Self::Permanent(e) => Some(e),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Retry {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    jitter: f64,
}

impl Default for Retry {
    fn default() -> Self {
        Self::control_plane()
    }
}

impl Retry {
    pub const fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }

    /// Envelope for control-plane RPCs: 10 attempts, 500ms doubling, 30s cap
    pub const fn control_plane() -> Self {
        Self::new(10)
    }

    /// Envelope for transient plugin errors during a stage: 2s, 4s, 8s
    pub const fn plugin_stage() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(8),
            jitter: 0.0,
        }
    }

    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub const fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Un-jittered delay after the given failed attempt (1-based)
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        let delay = self.initial_delay.saturating_mul(1u32 << shift);
        delay.min(self.max_delay)
    }

    /// Delay after the given failed attempt, jitter applied
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        base.mul_f64(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, runs out of attempts,
    /// or `cancel` fires. `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> std::result::Result<T, RetryError<E>>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let mut attempt = 0;
        let mut last = None;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled { last });
            }
            attempt += 1;

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled { last }),
                r = op(attempt) => r,
            };

            match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() => return Err(RetryError::Permanent(e)),
                Err(e) => {
                    if attempt >= self.max_attempts {
                        warn!(attempts = attempt, error = %e, "Giving up after retries");
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            last: e,
                        });
                    }
                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Retrying in {} ms",
                        delay.as_millis()
                    );
                    last = Some(e);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RetryError::Cancelled { last }),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}
