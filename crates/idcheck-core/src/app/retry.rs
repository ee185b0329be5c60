//! Retry policy: bounded bring-up with staged backoff.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::domain::ConnectivityError;

/// Retry policy for connection bring-up.
///
/// The first `initial_attempts` failures wait `initial_delay`, later ones wait
/// `steady_delay`. After `max_attempts` failures the bring-up gives up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_attempts: u32,
    pub initial_delay: Duration,
    pub steady_delay: Duration,
}

impl RetryPolicy {
    /// Same wait after every failure.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_attempts: 0,
            initial_delay: delay,
            steady_delay: delay,
        }
    }

    /// Longer waits for the first `initial_attempts` failures.
    pub fn staged(
        max_attempts: u32,
        initial_attempts: u32,
        initial_delay: Duration,
        steady_delay: Duration,
    ) -> Self {
        Self {
            max_attempts,
            initial_attempts,
            initial_delay,
            steady_delay,
        }
    }

    /// Registry bring-up: 20 attempts, 10s for the first 5, then 5s.
    pub fn registry_default() -> Self {
        Self::staged(20, 5, Duration::from_secs(10), Duration::from_secs(5))
    }

    /// Broker bring-up on the worker side: 10 attempts, 5s apart.
    pub fn broker_default() -> Self {
        Self::fixed(10, Duration::from_secs(5))
    }

    /// Broker bring-up on the client side: 5 attempts, 5s apart.
    pub fn client_default() -> Self {
        Self::fixed(5, Duration::from_secs(5))
    }

    /// Wait after the `attempts`-th failure (1-indexed).
    pub fn next_delay(&self, attempts: u32) -> Duration {
        if attempts <= self.initial_attempts {
            self.initial_delay
        } else {
            self.steady_delay
        }
    }

    /// Run `op` until it succeeds or the attempt budget is spent.
    ///
    /// No wait follows the final failure.
    pub async fn run<T, E, F, Fut>(&self, target: &str, mut op: F) -> Result<T, ConnectivityError>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(target_name = target, attempt, "connected after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    last_error = err.to_string();
                    if attempt == max_attempts {
                        break;
                    }
                    let delay = self.next_delay(attempt);
                    tracing::warn!(
                        target_name = target,
                        attempt,
                        max_attempts,
                        error = %last_error,
                        "bring-up failed, retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        tracing::error!(target_name = target, max_attempts, error = %last_error, "bring-up exhausted");
        Err(ConnectivityError::Exhausted {
            target: target.to_string(),
            attempts: max_attempts,
            last_error,
        })
    }
}
