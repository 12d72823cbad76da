//! Repeated state fetching until a stability predicate holds.
//!
//! A poll session is one tokio task owning its interval and its
//! [`CancellationToken`]. Cancelling never aborts a fetch already on the
//! wire, it only prevents the next one.

use std::{future::Future, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PollConfig {
    #[serde(with = "humantime_serde")]
    pub initial_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub max_interval: Duration,
    pub multiplier: f64,
    /// Consecutive absorbed failures before the session gives up
    pub max_consecutive_failures: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
            max_consecutive_failures: 5,
        }
    }
}

impl PollConfig {
    /// Caps the interval, keeping the initial one within the cap.
    pub fn with_max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = self.max_interval.min(max_interval);
        self.initial_interval = self.initial_interval.min(self.max_interval);
        self
    }

    fn next_interval(&self, current: Duration) -> Duration {
        Duration::try_from_secs_f64(current.as_secs_f64() * self.multiplier.max(1.0))
            .unwrap_or(self.max_interval)
            .min(self.max_interval)
    }
}

#[derive(Debug)]
pub enum PollOutcome<T> {
    /// The predicate held for this value
    Converged(T),
    Cancelled,
    /// Retryable failures kept coming
    PersistentFailure { failures: u32, last_error: Error },
    /// A failure that polling cannot absorb
    Failed(Error),
}

pub struct PollHandle<T> {
    token: CancellationToken,
    handle: JoinHandle<PollOutcome<T>>,
}

impl<T> PollHandle<T> {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub async fn join(self) -> PollOutcome<T> {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => PollOutcome::Failed(Error::Custom(format!("poll task failed: {e}"))),
        }
    }
}

/// Spawns a poll session with a fresh cancellation token.
pub fn poll<T, F, Fut, S, U>(
    fetch: F,
    is_stable: S,
    on_update: U,
    config: PollConfig,
) -> PollHandle<T>
where
    T: Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    S: Fn(&T) -> bool + Send + 'static,
    U: FnMut(&T) + Send + 'static,
{
    poll_with_token(fetch, is_stable, on_update, config, CancellationToken::new())
}

/// Spawns a poll session that stops once `token` is cancelled.
pub fn poll_with_token<T, F, Fut, S, U>(
    fetch: F,
    is_stable: S,
    on_update: U,
    config: PollConfig,
    token: CancellationToken,
) -> PollHandle<T>
where
    T: Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    S: Fn(&T) -> bool + Send + 'static,
    U: FnMut(&T) + Send + 'static,
{
    let handle = tokio::spawn(run(fetch, is_stable, on_update, config, token.clone()));
    PollHandle { token, handle }
}

/// Runs a poll session on the current task.
pub async fn run<T, F, Fut, S, U>(
    mut fetch: F,
    is_stable: S,
    mut on_update: U,
    config: PollConfig,
    token: CancellationToken,
) -> PollOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    S: Fn(&T) -> bool,
    U: FnMut(&T),
{
    let mut interval = config.initial_interval.min(config.max_interval);
    let mut failures = 0u32;
    loop {
        if token.is_cancelled() {
            return PollOutcome::Cancelled;
        }
        match fetch().await {
            Ok(value) => {
                failures = 0;
                on_update(&value);
                if is_stable(&value) {
                    return PollOutcome::Converged(value);
                }
            }
            Err(e) if e.is_retryable() => {
                failures += 1;
                if failures >= config.max_consecutive_failures {
                    tracing::error!("giving up after {} failed polls: {}", failures, e);
                    return PollOutcome::PersistentFailure {
                        failures,
                        last_error: e,
                    };
                }
                tracing::warn!("poll failed ({}/{}): {}", failures, config.max_consecutive_failures, e);
            }
            Err(e) => return PollOutcome::Failed(e),
        }
        tokio::select! {
            biased;
            _ = token.cancelled() => return PollOutcome::Cancelled,
            _ = tokio::time::sleep(interval) => {}
        }
        interval = config.next_interval(interval);
    }
}
