//! Layered configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, `config/evb.toml` by default)
//! 2. environment variables prefixed with `RUST_EVB_`, nested keys separated by `__`
//!
//! Every field has a default, so an empty or missing file yields a working
//! configuration.
//!
//! # Example
//! ```no_run
//! use rust_evb::config::EvbConfig;
//!
//! let config = EvbConfig::load()?;
//! config.validate()?;
//! println!("Build window: {}s", config.builder.build_window_secs);
//! # Ok::<(), rust_evb::error::EvbError>(())
//! ```

use crate::error::{EvbError, EvbResult};
use crate::handler::{
    HandlerSettings, DEFAULT_BARRIER_TIMEOUT_FACTOR, DEFAULT_TIMESTAMP_JUMP_THRESHOLD,
    DEFAULT_XOFF_THRESHOLD, DEFAULT_XON_THRESHOLD,
};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/evb.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "RUST_EVB_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvbConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Ordering and barrier policy
    #[serde(default)]
    pub builder: BuilderConfig,
    /// Output stage settings
    #[serde(default)]
    pub output: OutputConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

/// Fragment handler policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuilderConfig {
    /// Seconds data is held so slower sources can catch up
    #[serde(default = "default_build_window_secs")]
    pub build_window_secs: u64,
    /// Queued bytes above which Xoff is asserted
    #[serde(default = "default_xoff_threshold")]
    pub xoff_threshold: usize,
    /// Queued bytes at or below which Xon is asserted
    #[serde(default = "default_xon_threshold")]
    pub xon_threshold: usize,
    /// Period of the idle-flush timer
    #[serde(default = "default_idle_poll_interval", with = "humantime_serde")]
    pub idle_poll_interval: Duration,
    /// Barrier timeout in build windows
    #[serde(default = "default_barrier_timeout_factor")]
    pub barrier_timeout_factor: u32,
    /// Output timestamp gap logged as suspicious
    #[serde(default = "default_timestamp_jump_threshold")]
    pub timestamp_jump_threshold: u64,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            build_window_secs: default_build_window_secs(),
            xoff_threshold: default_xoff_threshold(),
            xon_threshold: default_xon_threshold(),
            idle_poll_interval: default_idle_poll_interval(),
            barrier_timeout_factor: default_barrier_timeout_factor(),
            timestamp_jump_threshold: default_timestamp_jump_threshold(),
        }
    }
}

impl BuilderConfig {
    /// Handler settings described by this section.
    pub fn handler_settings(&self) -> HandlerSettings {
        HandlerSettings {
            build_window: Duration::from_secs(self.build_window_secs),
            barrier_timeout_factor: self.barrier_timeout_factor,
            timestamp_jump_threshold: self.timestamp_jump_threshold,
            xon_threshold: self.xon_threshold,
            xoff_threshold: self.xoff_threshold,
        }
    }
}

/// Output stage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Ordered batches buffered between the handler and the output stage
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

// Default value functions
fn default_name() -> String {
    "rust-evb".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_build_window_secs() -> u64 {
    20
}

fn default_xoff_threshold() -> usize {
    DEFAULT_XOFF_THRESHOLD
}

fn default_xon_threshold() -> usize {
    DEFAULT_XON_THRESHOLD
}

fn default_idle_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_barrier_timeout_factor() -> u32 {
    DEFAULT_BARRIER_TIMEOUT_FACTOR
}

fn default_timestamp_jump_threshold() -> u64 {
    DEFAULT_TIMESTAMP_JUMP_THRESHOLD
}

fn default_queue_capacity() -> usize {
    64
}

impl EvbConfig {
    /// Load configuration from the default path and environment variables
    ///
    /// Example override: `RUST_EVB_BUILDER__BUILD_WINDOW_SECS=5`
    pub fn load() -> EvbResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> EvbResult<Self> {
        Self::figment(path.as_ref()).extract().map_err(EvbError::from)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(EvbConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> EvbResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(EvbError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.builder.barrier_timeout_factor == 0 {
            return Err(EvbError::Configuration(
                "barrier_timeout_factor must be at least 1".to_string(),
            ));
        }

        if self.builder.idle_poll_interval.is_zero() {
            return Err(EvbError::Configuration(
                "idle_poll_interval must be non-zero".to_string(),
            ));
        }

        if self.output.queue_capacity == 0 {
            return Err(EvbError::Configuration(
                "output.queue_capacity must be at least 1".to_string(),
            ));
        }

        if self.builder.xon_threshold > self.builder.xoff_threshold {
            warn!(
                xon = self.builder.xon_threshold,
                xoff = self.builder.xoff_threshold,
                "xon_threshold above xoff_threshold; flow control will toggle rapidly"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let config = EvbConfig::load_from("/nonexistent/evb.toml").unwrap();
        assert_eq!(config, EvbConfig::default());
        assert_eq!(config.builder.handler_settings(), HandlerSettings::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_load_partial_file() {
        let file = write_config(
            r#"
            [application]
            log_level = "debug"

            [builder]
            build_window_secs = 5
            idle_poll_interval = "250ms"
            "#,
        );

        let config = EvbConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.application.name, "rust-evb");
        assert_eq!(config.builder.build_window_secs, 5);
        assert_eq!(
            config.builder.idle_poll_interval,
            Duration::from_millis(250)
        );
        assert_eq!(config.builder.barrier_timeout_factor, 4);
        assert_eq!(config.output.queue_capacity, 64);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let file = write_config("[builder]\nbuild_window_secs = 5\n");

        figment::Jail::expect_with(|jail| {
            jail.set_env("RUST_EVB_BUILDER__BUILD_WINDOW_SECS", "9");
            jail.set_env("RUST_EVB_OUTPUT__QUEUE_CAPACITY", "8");
            let config = EvbConfig::load_from(file.path()).map_err(|e| e.to_string())?;
            assert_eq!(config.builder.build_window_secs, 9);
            assert_eq!(config.output.queue_capacity, 8);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = EvbConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(matches!(
            config.validate(),
            Err(EvbError::Configuration(msg)) if msg.contains("loud")
        ));
    }

    #[test]
    fn test_zero_factor_and_capacity_rejected() {
        let mut config = EvbConfig::default();
        config.builder.barrier_timeout_factor = 0;
        assert!(config.validate().is_err());

        let mut config = EvbConfig::default();
        config.output.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_thresholds_only_warn() {
        let mut config = EvbConfig::default();
        config.builder.xon_threshold = 100;
        config.builder.xoff_threshold = 10;
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_malformed_file_is_config_error() {
        let file = write_config("[builder]\nbuild_window_secs = \"soon\"\n");
        assert!(matches!(
            EvbConfig::load_from(file.path()),
            Err(EvbError::Config(_))
        ));
    }
}
