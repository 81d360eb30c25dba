//! Spacing and backoff for GitHub CLI calls.
//!
//! GitHub rejects bursts of comment writes ("was submitted too quickly"), so
//! every gh call goes through a [`RateLimiter`]: an initial pause before the
//! first call, a minimum gap between calls, and a capped exponential backoff
//! when GitHub reports rate limiting. Built on tokio time so tests can run on a paused clock.

use anyhow::Result;
use backon::{ExponentialBuilder, Retryable};
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::config::GithubConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub initial_delay: Duration,
    pub min_delay: Duration,
    /// Total attempts for a rate-limited call
    pub max_attempts: u32,
    /// First backoff; each further one doubles
    pub retry_backoff: Duration,
    pub max_backoff: Duration,
}

impl RateLimitPolicy {
    pub fn from_config(config: &GithubConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            min_delay: Duration::from_millis(config.min_delay_ms),
            max_attempts: config.max_retries.max(1),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// No waiting at all
    pub fn disabled() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            min_delay: Duration::ZERO,
            max_attempts: 1,
            retry_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.retry_backoff)
            .with_max_delay(self.max_backoff.max(self.retry_backoff))
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    policy: RateLimitPolicy,
    last_call: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy,
            last_call: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Wait until the next call is allowed and claim the slot
    pub async fn acquire(&self) {
        let mut last = self.last_call.lock().await;
        let wait = match *last {
            None => self.policy.initial_delay,
            Some(at) => self.policy.min_delay.saturating_sub(at.elapsed()),
        };
        if !wait.is_zero() {
            debug!(?wait, "Rate limiting GitHub call");
            sleep(wait).await;
        }
        *last = Some(Instant::now());
    }

    /// Run `op` under the limiter, backing off while GitHub reports rate limiting.
    /// Other errors are returned immediately.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempt = || {
            let call = op();
            async move {
                self.acquire().await;
                call.await
            }
        };
        attempt
            .retry(self.policy.backoff())
            .sleep(sleep)
            .when(Self::is_rate_limited)
            .notify(|err, dur| warn!("{} rate limited, retrying after {:?}: {}", operation, dur, err))
            .await
    }

    pub fn is_rate_limited(err: &anyhow::Error) -> bool {
        let msg = err.to_string().to_lowercase();
        msg.contains("rate limit") || msg.contains("too quickly")
    }
}
