//! Tracing initialisation
//!
//! Every diagnostic in the crate goes through `tracing` macros with structured
//! fields (`source_id`, `timestamp`, `oldest`, ...). This module installs a
//! `tracing-subscriber` fmt layer in one of three formats (pretty, compact, JSON)
//! behind an `EnvFilter`, so `RUST_LOG` overrides the configured level.
//!
//! # Example
//! ```no_run
//! use rust_evb::{config::EvbConfig, logging};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EvbConfig::load()?;
//! logging::init_from_config(&config)?;
//! info!(build_window_secs = config.builder.build_window_secs, "Event builder starting");
//! # Ok(())
//! # }
//! ```

use crate::config::EvbConfig;
use crate::error::{EvbError, EvbResult};
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Multi-line, coloured (for development)
    #[default]
    Pretty,
    /// One line per event, no colours (for production)
    Compact,
    /// Newline-delimited JSON (for log aggregation)
    Json,
}

impl FromStr for OutputFormat {
    type Err = EvbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(EvbError::Configuration(format!(
                "Invalid log format '{other}'. Must be one of: pretty, compact, json"
            ))),
        }
    }
}

/// Logging configuration options
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Whether to log span NEW/CLOSE events
    pub with_span_events: bool,
    /// Whether to include file and line numbers
    pub with_file_and_line: bool,
    /// Whether to include thread names
    pub with_thread_names: bool,
    /// Whether to enable ANSI colours (pretty format only)
    pub with_ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Logging config from the `[application]` section
    pub fn from_evb_config(config: &EvbConfig) -> EvbResult<Self> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            ..Default::default()
        })
    }

    /// Logging config with the given default level
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable span events
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Enable or disable ANSI colours
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialise logging from the loaded configuration
pub fn init_from_config(config: &EvbConfig) -> EvbResult<()> {
    init(LoggingConfig::from_evb_config(config)?)
}

/// Install the global subscriber
///
/// Idempotent: if a global subscriber is already set (tests, embedding
/// applications) this returns `Ok(())`.
pub fn init(config: LoggingConfig) -> EvbResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_ansi(config.with_ansi)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_ansi(false)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_filter(env_filter)
            .boxed(),
    };

    if tracing_subscriber::registry().with(layer).try_init().is_err() {
        // Already initialised by a test harness or an embedding application.
        tracing::debug!("Global tracing subscriber already set");
    }
    Ok(())
}

/// Parse a log level name (case-insensitive)
pub fn parse_log_level(level: &str) -> EvbResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(EvbError::Configuration(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("trace").unwrap(), Level::TRACE);
        assert_eq!(parse_log_level("warn").unwrap(), Level::WARN);
        assert_eq!(parse_log_level("Debug").unwrap(), Level::DEBUG);
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_output_format_from_str() {
        assert_eq!("json".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!("COMPACT".parse::<OutputFormat>().unwrap(), OutputFormat::Compact);
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_logging_config_from_evb_config() {
        let mut config = EvbConfig::default();
        config.application.log_level = "debug".to_string();

        let logging = LoggingConfig::from_evb_config(&config).unwrap();
        assert_eq!(logging.level, Level::DEBUG);
        assert_eq!(logging.format, OutputFormat::Pretty);
    }

    #[test]
    fn test_logging_config_builder() {
        let config = LoggingConfig::new(Level::WARN)
            .with_format(OutputFormat::Json)
            .with_span_events(true)
            .with_ansi(false);

        assert_eq!(config.level, Level::WARN);
        assert_eq!(config.format, OutputFormat::Json);
        assert!(config.with_span_events);
        assert!(!config.with_ansi);
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig::new(Level::ERROR).with_format(OutputFormat::Compact);
        assert!(init(config.clone()).is_ok());
        assert!(init(config).is_ok());
    }
}
