//! Retry classification and exponential backoff.

use pkd_core::{EngineConfig, TransferError};
use std::time::Duration;

/// What to do with a job whose attempt just failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue; the job is not eligible for dispatch before `delay` elapses.
    Retry { attempt: u32, delay: Duration },
    /// Terminal failure, the cause is kept on the job.
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryManager {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryManager {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.max_retries,
            config.retry_base_delay(),
            config.retry_max_delay(),
        )
    }

    /// `attempt` is the number of retries already spent by the job.
    pub fn decide(&self, attempt: u32, error: &TransferError) -> RetryDecision {
        if !error.is_transient() || attempt >= self.max_retries {
            return RetryDecision::Fail;
        }
        let next = attempt + 1;
        RetryDecision::Retry {
            attempt: next,
            delay: self.backoff(next),
        }
    }

    /// Delay before retry `n` (1-based): `min(base × 2^(n-1), ceiling)`.
    pub fn backoff(&self, n: u32) -> Duration {
        let exp = n.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}
