//! Logging setup on the tracing stack
//!
//! Human-readable timestamped lines by default, with the output format
//! switchable through the `LOG_FORMAT` environment variable:
//!
//! - `compact` - terminal-friendly lines (default)
//! - `pretty` - indented multi-line output for development
//! - `json` - structured output for log aggregation
//!
//! The base level comes from the `--debug` flag; `LOG_LEVEL` and `RUST_LOG`
//! override it.

use std::env;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log output format options
#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

impl LogFormat {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            _ => LogFormat::Compact,
        }
    }
}

/// Initialize the global subscriber with an explicit level and format.
pub fn init_logging(level: Level, format: LogFormat) {
    let mut filter = EnvFilter::new(level.to_string())
        // Reduce noise from dependencies
        .add_directive("rumqttc=warn".parse().unwrap())
        .add_directive("tokio=warn".parse().unwrap());

    if let Ok(level_override) = env::var("LOG_LEVEL") {
        filter = EnvFilter::new(level_override);
    }
    if let Ok(rust_log) = env::var("RUST_LOG") {
        filter = EnvFilter::new(rust_log);
    }

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Compact => {
            let fmt_layer = fmt::layer().compact().with_ansi(true).with_target(false);
            subscriber.with(fmt_layer).init();
        }
        LogFormat::Pretty => {
            let fmt_layer = fmt::layer().pretty().with_ansi(true);
            subscriber.with(fmt_layer).init();
        }
        LogFormat::Json => {
            let fmt_layer = fmt::layer().json();
            subscriber.with(fmt_layer).init();
        }
    }
}

/// Initialize logging for the listener binary. `debug` raises the base
/// level the way the original `--debug` flag did.
pub fn init_listener_logging(debug: bool) {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    let format = LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_default());
    init_logging(level, format);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert!(matches!(LogFormat::parse("json"), LogFormat::Json));
        assert!(matches!(LogFormat::parse("JSON"), LogFormat::Json));
        assert!(matches!(LogFormat::parse("pretty"), LogFormat::Pretty));
        assert!(matches!(LogFormat::parse("compact"), LogFormat::Compact));
    }

    #[test]
    fn test_log_format_parse_unknown_defaults_to_compact() {
        assert!(matches!(LogFormat::parse(""), LogFormat::Compact));
        assert!(matches!(LogFormat::parse("xml"), LogFormat::Compact));
    }
}
