//! Logging configuration and initialization
//!
//! Centralized logging setup on the `tracing` ecosystem. The allocator
//! itself only emits events; hosts embedding rocpool can either install
//! their own subscriber or call one of the init functions here.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Standard tracing filter (e.g., "info", "rocpool=trace")
//! - `ROCPOOL_LOG_LEVEL`: Simple log level (error, warn, info, debug, trace)
//! - `ROCPOOL_LOG_FORMAT`: Output format ("human" or "json")

use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Global flag to track if tracing has been initialized
static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Environment variable for log level override
const LOG_LEVEL_ENV: &str = "ROCPOOL_LOG_LEVEL";

/// Environment variable for log format (json/human)
const LOG_FORMAT_ENV: &str = "ROCPOOL_LOG_FORMAT";

/// Log level enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Log format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable output (default)
    #[default]
    Human,
    /// JSON structured output
    Json,
}

impl LogFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "human" | "pretty" | "console" => Some(LogFormat::Human),
            "json" | "structured" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Initialize logging from environment variables, falling back to the
/// `warn` level and human-readable output.
///
/// This function is idempotent - calling it multiple times will only
/// initialize the subscriber once.
pub fn init_logging_default() {
    TRACING_INITIALIZED.get_or_init(|| {
        let level = std::env::var(LOG_LEVEL_ENV)
            .ok()
            .and_then(|s| LogLevel::from_str(&s))
            .unwrap_or_default();
        let format = std::env::var(LOG_FORMAT_ENV)
            .ok()
            .and_then(|s| LogFormat::from_str(&s))
            .unwrap_or_default();
        init_internal(level, format);
    });
}

/// Initialize logging with an explicit level and format. Idempotent.
pub fn init_logging(level: LogLevel, format: LogFormat) {
    TRACING_INITIALIZED.get_or_init(|| init_internal(level, format));
}

fn init_internal(level: LogLevel, format: LogFormat) {
    let env_filter = build_env_filter(level);
    match format {
        LogFormat::Json => {
            let layer = fmt::layer().json().with_target(false);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(layer)
                .try_init();
        }
        LogFormat::Human => {
            let layer = fmt::layer().with_target(true);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(layer)
                .try_init();
        }
    }
}

/// Build the environment filter for the log level.
/// RUST_LOG wins when set (standard tracing convention).
fn build_env_filter(default_level: LogLevel) -> EnvFilter {
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        if let Ok(filter) = EnvFilter::try_new(rust_log) {
            return filter;
        }
    }
    EnvFilter::new(default_level.as_filter_str())
}

/// Check if tracing has been initialized
pub fn is_initialized() -> bool {
    TRACING_INITIALIZED.get().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_logging_default();
        init_logging_default();
        init_logging(LogLevel::Debug, LogFormat::Human);
        assert!(is_initialized());
    }

    #[test]
    fn log_level_from_str() {
        assert_eq!(LogLevel::from_str("error"), Some(LogLevel::Error));
        assert_eq!(LogLevel::from_str("warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::from_str("TRACE"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::from_str("bogus"), None);
    }

    #[test]
    fn log_format_from_str() {
        assert_eq!(LogFormat::from_str("human"), Some(LogFormat::Human));
        assert_eq!(LogFormat::from_str("json"), Some(LogFormat::Json));
        assert_eq!(LogFormat::from_str("structured"), Some(LogFormat::Json));
        assert_eq!(LogFormat::from_str("bogus"), None);
    }
}
