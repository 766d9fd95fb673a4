//! Bounded retry for backend calls
//!
//! Redis and S3 round trips are wrapped in exponential backoff. Only
//! transient failures (see [`FestivusError::is_transient`]) are retried;
//! the rest surface on the first attempt.

use std::future::Future;
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use serde::Deserialize;
use tracing::warn;

use crate::error::{FestivusError, Result};

/// Backoff bounds for transient backend failures
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry
    #[serde(default = "default_initial_interval", with = "humantime_serde")]
    pub initial_interval: Duration,
    /// Upper bound on a single delay
    #[serde(default = "default_max_interval", with = "humantime_serde")]
    pub max_interval: Duration,
    /// Give up once this much time has passed since the first attempt
    #[serde(default = "default_max_elapsed", with = "humantime_serde")]
    pub max_elapsed: Duration,
}

fn default_initial_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_max_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_max_elapsed() -> Duration {
    Duration::from_secs(30)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: default_initial_interval(),
            max_interval: default_max_interval(),
            max_elapsed: default_max_elapsed(),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> backoff::ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(Some(self.max_elapsed))
            .build()
    }
}

/// Run `op` until it succeeds, fails permanently, or the policy gives up
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    backoff::future::retry_notify(
        policy.backoff(),
        || {
            let attempt = op();
            async move {
                attempt.await.map_err(|e| {
                    if e.is_transient() {
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        },
        |err: FestivusError, wait: Duration| {
            warn!("{} failed, retrying in {:?}: {}", what, wait, err);
        },
    )
    .await
}
