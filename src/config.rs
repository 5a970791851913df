//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::{RecorderError, Result};

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub sampler: SamplerConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub export: ExportConfig,
}

/// Sampler timing configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SamplerConfig {
    /// Tick period in microseconds
    #[serde(default = "default_interval_us")]
    pub interval_us: u64,

    /// Length of the analysis window in seconds
    #[serde(default = "default_total_window_s")]
    pub total_window_s: u32,

    /// Idle time between link checks while disconnected
    #[serde(default = "default_link_backoff_ms")]
    pub link_backoff_ms: u64,

    /// Wait in `stop()` for the in-flight tick to finish
    #[serde(default = "default_stop_settle_ms")]
    pub stop_settle_ms: u64,
}

/// Vehicle health check configuration
#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    #[serde(default = "default_health_enabled")]
    pub enabled: bool,

    #[serde(default = "default_health_window_ms")]
    pub window_ms: u64,

    #[serde(default = "default_min_battery_voltage")]
    pub min_battery_voltage: f32,

    /// Maximum max-min spread of roll and pitch, in radians
    #[serde(default = "default_max_attitude_spread")]
    pub max_attitude_spread: f32,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for daily rotated log files; stdout only when unset
    #[serde(default)]
    pub dir: Option<String>,
}

/// Session export configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ExportConfig {
    #[serde(default = "default_export_dir")]
    pub dir: String,
}

// Default value functions
fn default_interval_us() -> u64 { 50_000 }
fn default_total_window_s() -> u32 { 30 }
fn default_link_backoff_ms() -> u64 { 2000 }
fn default_stop_settle_ms() -> u64 { 100 }

fn default_health_enabled() -> bool { true }
fn default_health_window_ms() -> u64 { 5000 }
fn default_min_battery_voltage() -> f32 { 11.0 }
fn default_max_attitude_spread() -> f32 { 0.1 }

fn default_log_level() -> String { "info".to_string() }
fn default_export_dir() -> String { "./sessions".to_string() }

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval_us: default_interval_us(),
            total_window_s: default_total_window_s(),
            link_backoff_ms: default_link_backoff_ms(),
            stop_settle_ms: default_stop_settle_ms(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: default_health_enabled(),
            window_ms: default_health_window_ms(),
            min_battery_voltage: default_min_battery_voltage(),
            max_attitude_spread: default_max_attitude_spread(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            dir: default_export_dir(),
        }
    }
}

fn invalid(msg: &str) -> RecorderError {
    RecorderError::Config(toml::de::Error::custom(msg))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use telemetry_recorder::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        if self.sampler.interval_us < 1000 || self.sampler.interval_us > 10_000_000 {
            return Err(invalid("interval_us must be between 1000 and 10000000"));
        }

        if self.sampler.total_window_s == 0 || self.sampler.total_window_s > 3600 {
            return Err(invalid("total_window_s must be between 1 and 3600"));
        }

        if self.sampler.link_backoff_ms == 0 || self.sampler.link_backoff_ms > 60000 {
            return Err(invalid("link_backoff_ms must be between 1 and 60000"));
        }

        if self.sampler.stop_settle_ms > 10000 {
            return Err(invalid("stop_settle_ms must not exceed 10000"));
        }

        if self.health.window_ms == 0 || self.health.window_ms > 60000 {
            return Err(invalid("health window_ms must be between 1 and 60000"));
        }

        if !(0.0..=100.0).contains(&self.health.min_battery_voltage) {
            return Err(invalid("min_battery_voltage must be between 0.0 and 100.0"));
        }

        if self.health.max_attitude_spread <= 0.0 || self.health.max_attitude_spread > std::f32::consts::PI {
            return Err(invalid("max_attitude_spread must be in (0, pi]"));
        }

        const VALID_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
        if !VALID_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(invalid(&format!(
                "logging level must be one of {:?}, got {:?}",
                VALID_LEVELS, self.logging.level
            )));
        }

        if self.logging.dir.as_deref().is_some_and(str::is_empty) {
            return Err(invalid("logging dir cannot be empty when set"));
        }

        if self.export.dir.is_empty() {
            return Err(invalid("export dir cannot be empty"));
        }

        Ok(())
    }
}
