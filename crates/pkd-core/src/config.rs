//! Engine tunables.

use crate::error::{TransferError, TransferResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration snapshot read at dispatch time and at every job start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Milestone step in percent.
    #[serde(default = "default_progress_granularity")]
    pub progress_granularity: u8,
    #[serde(default = "default_true")]
    pub resume_partial_enabled: bool,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_keepalive")]
    pub keepalive_seconds: u64,
    #[serde(default = "default_retry_base")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_max_sessions")]
    pub max_sessions_per_endpoint: usize,
    #[serde(default = "default_idle_timeout")]
    pub session_idle_timeout_seconds: u64,
    #[serde(default = "default_true")]
    pub verify_destination_size: bool,
}

fn default_max_concurrent() -> usize {
    2
}
fn default_max_retries() -> u32 {
    3
}
fn default_chunk_size() -> usize {
    1024 * 1024
}
fn default_progress_granularity() -> u8 {
    25
}
fn default_true() -> bool {
    true
}
fn default_timeout() -> u64 {
    30
}
fn default_keepalive() -> u64 {
    60
}
fn default_retry_base() -> u64 {
    1_000
}
fn default_retry_max() -> u64 {
    30_000
}
fn default_max_sessions() -> usize {
    2
}
fn default_idle_timeout() -> u64 {
    300
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_retries: default_max_retries(),
            chunk_size: default_chunk_size(),
            progress_granularity: default_progress_granularity(),
            resume_partial_enabled: true,
            timeout_seconds: default_timeout(),
            keepalive_seconds: default_keepalive(),
            retry_base_delay_ms: default_retry_base(),
            retry_max_delay_ms: default_retry_max(),
            max_sessions_per_endpoint: default_max_sessions(),
            session_idle_timeout_seconds: default_idle_timeout(),
            verify_destination_size: true,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> TransferResult<()> {
        if self.max_concurrent == 0 {
            return Err(TransferError::invalid_config(
                "maxConcurrent must be at least 1",
            ));
        }
        if self.chunk_size == 0 {
            return Err(TransferError::invalid_config("chunkSize must be non-zero"));
        }
        if !(1..=100).contains(&self.progress_granularity) {
            return Err(TransferError::invalid_config(
                "progressGranularity must be between 1 and 100",
            ));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(TransferError::invalid_config(
                "retryBaseDelayMs exceeds retryMaxDelayMs",
            ));
        }
        if self.max_sessions_per_endpoint == 0 {
            return Err(TransferError::invalid_config(
                "maxSessionsPerEndpoint must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_seconds)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_concurrent, 2);
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.chunk_size, 1 << 20);
        assert_eq!(cfg.progress_granularity, 25);
        assert!(cfg.resume_partial_enabled);
        assert_eq!(cfg.timeout(), Duration::from_secs(30));
        assert_eq!(cfg.keepalive(), Duration::from_secs(60));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"maxConcurrent":4,"resumePartialEnabled":false}"#).unwrap();
        assert_eq!(cfg.max_concurrent, 4);
        assert!(!cfg.resume_partial_enabled);
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.retry_max_delay_ms, 30_000);
    }

    #[test]
    fn validation_rejects_nonsense() {
        let mut cfg = EngineConfig {
            max_concurrent: 0,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());
        cfg.max_concurrent = 1;
        cfg.progress_granularity = 0;
        assert!(cfg.validate().is_err());
        cfg.progress_granularity = 101;
        assert!(cfg.validate().is_err());
        cfg.progress_granularity = 10;
        cfg.retry_base_delay_ms = 60_000;
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::InvalidConfig);
    }
}
