//! Subscriber setup for embedders that do not install their own.
//!
//! The engine logs through `tracing`; the protocol adapters log through
//! `log`. [`init_logging`] bridges the latter into the former so both end up
//! in one sink, filtered by `RUST_LOG` (default `info`).

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Install the global subscriber and the `log` bridge. Returns `false` if
/// either was already set.
pub fn init_logging(format: LogFormat) -> bool {
    init_with_default(format, "info")
}

pub fn init_with_default(format: LogFormat, default_directive: &str) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_directive))
        .with_target(true);
    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if installed.is_ok() {
        tracing::debug!(?format, "logging initialised");
    }
    installed.is_ok()
}
