//! Logging initialization using tracing.

use std::str::FromStr;

use anyhow::{anyhow, Result};
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human readable, one event per line
    #[default]
    Text,
    /// One JSON object per event, for log aggregation
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(anyhow!("unknown log format '{}'", other)),
        }
    }
}

/// Build the level filter. `RUST_LOG` wins over the requested level.
fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level))
}

/// Initialize the tracing subscriber with the specified log level.
///
/// # Arguments
/// * `level` - Log level string (trace, debug, info, warn, error)
///
/// Logs go to stderr so that command output on stdout stays machine readable.
pub fn init_logging(level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_timer(ChronoLocal::rfc_3339())
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
        )
        .try_init()
        .map_err(|e| anyhow!("failed to install log subscriber: {}", e))
}

/// Initialize logging with JSON output format.
pub fn init_logging_json(level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(
            fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true)
        )
        .try_init()
        .map_err(|e| anyhow!("failed to install log subscriber: {}", e))
}
