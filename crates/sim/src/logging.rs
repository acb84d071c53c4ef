//! Structured logging for the simulation driver.
//!
//! Supports two modes:
//! - Development: Pretty-printed human-readable logs
//! - Batch runs: JSON-formatted logs for log aggregation
//!
//! Set `EMBDIST_LOG_FORMAT=json` for JSON logs.
//! Set `RUST_LOG` to control log levels (default: info).

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log format mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Pretty-printed human-readable logs (default).
    Pretty,
    /// JSON-formatted logs.
    Json,
}

impl LogFormat {
    /// Detect log format from environment.
    pub fn from_env() -> Self {
        match std::env::var("EMBDIST_LOG_FORMAT")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Initialize logging with the format from the environment.
///
/// Respects the following environment variables:
/// - `RUST_LOG`: Log level filter (default: "info")
/// - `EMBDIST_LOG_FORMAT`: "json" for JSON output, anything else for pretty output
pub fn init() -> anyhow::Result<()> {
    init_with_level_and_format("info", LogFormat::from_env())
}

/// Initialize logging with an explicit fallback level, used when `RUST_LOG`
/// is unset.
pub fn init_with_level(level: &str) -> anyhow::Result<()> {
    init_with_level_and_format(level, LogFormat::from_env())
}

/// Initialize logging with an explicit level and format.
///
/// Fails if a global subscriber is already installed.
pub fn init_with_level_and_format(level: &str, format: LogFormat) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let fmt_layer: Box<dyn tracing_subscriber::Layer<_> + Send + Sync> = match format {
        LogFormat::Pretty => Box::new(
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_file(false)
                .with_line_number(false),
        ),
        LogFormat::Json => Box::new(
            fmt::layer()
                .json()
                .with_current_span(false)
                .with_thread_names(true)
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        ),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("logging subscriber init failed: {e}"))
}
