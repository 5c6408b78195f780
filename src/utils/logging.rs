//! Logging utilities with structured JSON output support.
//!
//! Supports both human-readable and JSON log formats for log aggregation.

use tracing_subscriber::{fmt, EnvFilter};

/// Logging format options
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogFormat {
    /// Human-readable format (default)
    Pretty,
    /// JSON format for log aggregation
    Json,
    /// Compact single-line format
    Compact,
}

/// Initialize logging with the default pretty format.
pub fn init_logging() {
    init_logging_with_format(LogFormat::Pretty);
}

/// Initialize logging with the specified format.
///
/// Set `RUST_LOG` environment variable to control log level.
/// Set `SPLATGRID_LOG_FORMAT=json` for JSON output.
///
/// Uses `try_init` so a second call (e.g. from another test in the same
/// process) is a no-op instead of a panic.
pub fn init_logging_with_format(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Pretty => {
            let _ = fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .try_init();
        }
        LogFormat::Json => {
            let _ = fmt()
                .with_env_filter(filter)
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .flatten_event(true)
                .try_init();
        }
        LogFormat::Compact => {
            let _ = fmt()
                .with_env_filter(filter)
                .compact()
                .with_target(false)
                .try_init();
        }
    }
}

/// Initialize logging based on environment variables.
///
/// Checks `SPLATGRID_LOG_FORMAT` for format selection:
/// - "json" -> JSON format
/// - "compact" -> Compact format
/// - anything else -> Pretty format (default)
pub fn init_logging_from_env() {
    let format = std::env::var("SPLATGRID_LOG_FORMAT")
        .map(|s| match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        })
        .unwrap_or(LogFormat::Pretty);

    init_logging_with_format(format);
}
