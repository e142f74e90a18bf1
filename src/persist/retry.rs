//! Bounded exponential backoff around storage calls.

use crate::config::RetryConfig;
use crate::error::StoreError;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_retry::RetryIf;
use tracing::warn;

/// A storage call that still failed when retrying stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryFailure {
    pub attempts: u32,
    pub error: StoreError,
}

/// Retries transient [`StoreError`]s with doubling delays.
///
/// Delays start at `initial_delay` and double up to `max_delay`. Errors that
/// are not transient fail immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
        }
    }

    /// Delays between attempts; one fewer than `max_attempts`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + use<> {
        let max_delay = self.max_delay;
        std::iter::successors(Some(self.initial_delay), |d| Some(d.saturating_mul(2)))
            .map(move |d| d.min(max_delay))
            .take(self.max_attempts.saturating_sub(1) as usize)
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or
    /// `max_attempts` calls have failed.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, RetryFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let attempts = AtomicU32::new(0);
        let result = RetryIf::start(
            self.delays(),
            || {
                let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                if attempt > 1 {
                    warn!(label, attempt, "Retrying storage call after transient error");
                }
                op()
            },
            |e: &StoreError| e.is_transient(),
        )
        .await;

        result.map_err(|error| RetryFailure {
            attempts: attempts.load(Ordering::Relaxed),
            error,
        })
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.initial_delay(),
            config.max_delay(),
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}
