//! Shared configuration for the warden sandbox crates.
//!
//! [`Config`] derives [`OrthoConfig`], so values are layered by
//! `ortho_config`: built-in defaults, then a TOML file named by
//! `--config-path` or `WARDEN_CONFIG_PATH`, then `WARDEN_*` environment
//! variables, then command-line flags such as `--log-filter`.

mod defaults;
mod logging;

use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;

use ortho_config::{OrthoConfig, OrthoError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use defaults::{
    DEFAULT_LOG_FILTER, DEFAULT_MAX_MSG_SIZE, DEFAULT_MONITOR_POLL_INTERVAL_MS,
    DEFAULT_WALL_TIME_LIMIT_SECS, default_log_filter, default_log_format,
};
pub use logging::{LogFormat, LogFormatParseError};

/// Environment variable naming the TOML configuration file.
pub const CONFIG_PATH_ENV: &str = "WARDEN_CONFIG_PATH";
/// Environment layer for [`Config::log_filter`].
pub const LOG_FILTER_ENV: &str = "WARDEN_LOG_FILTER";
/// Environment layer for [`Config::log_format`].
pub const LOG_FORMAT_ENV: &str = "WARDEN_LOG_FORMAT";
/// Environment layer for [`Config::max_msg_size`].
pub const MAX_MSG_SIZE_ENV: &str = "WARDEN_MAX_MSG_SIZE";
/// Environment layer for [`Config::monitor_poll_interval`].
pub const MONITOR_POLL_INTERVAL_ENV: &str = "WARDEN_MONITOR_POLL_INTERVAL_MS";
/// Environment layer for [`Config::default_wall_time_limit`].
pub const DEFAULT_WALL_TIME_LIMIT_ENV: &str = "WARDEN_DEFAULT_WALL_TIME_LIMIT_SECS";

/// Command-line flags consumed by the configuration loader.
pub const CONFIG_CLI_FLAGS: &[&str] = &[
    "--config-path",
    "--log-filter",
    "--log-format",
    "--max-msg-size",
    "--monitor-poll-interval-ms",
    "--default-wall-time-limit-secs",
];

/// Errors raised while assembling a [`Config`].
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// A layer could not be read, parsed or merged.
    #[error("failed to load configuration: {0}")]
    Load(#[source] Arc<OrthoError>),
    /// A setting is out of range after all layers were applied.
    #[error("invalid setting {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Settings shared by sandbox hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, OrthoConfig)]
#[ortho_config(prefix = "WARDEN")]
pub struct Config {
    /// Tracing filter directive.
    #[serde(default = "default_log_filter")]
    #[ortho_config(default = default_log_filter())]
    log_filter: String,
    /// Subscriber output format.
    #[serde(default = "default_log_format")]
    #[ortho_config(default = default_log_format())]
    log_format: LogFormat,
    /// Largest comms payload in bytes.
    #[serde(default = "defaults::max_msg_size")]
    #[ortho_config(default = DEFAULT_MAX_MSG_SIZE)]
    max_msg_size: u32,
    /// Monitor deadline poll interval in milliseconds.
    #[serde(default = "defaults::monitor_poll_interval_ms")]
    #[ortho_config(default = DEFAULT_MONITOR_POLL_INTERVAL_MS)]
    monitor_poll_interval_ms: u64,
    /// Wall time limit for sandboxes that set none; zero disables it.
    #[serde(default = "defaults::default_wall_time_limit_secs")]
    #[ortho_config(default = DEFAULT_WALL_TIME_LIMIT_SECS)]
    default_wall_time_limit_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            log_format: default_log_format(),
            max_msg_size: DEFAULT_MAX_MSG_SIZE,
            monitor_poll_interval_ms: DEFAULT_MONITOR_POLL_INTERVAL_MS,
            default_wall_time_limit_secs: DEFAULT_WALL_TIME_LIMIT_SECS,
        }
    }
}

impl Config {
    /// Loads every layer, reading flags from `args` (program name first).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Load`] when a layer fails to parse and
    /// [`ConfigError::Invalid`] when the merged values are out of range.
    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let config = <Self as OrthoConfig>::load_from_iter(args).map_err(ConfigError::Load)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration without command-line flags.
    ///
    /// # Errors
    ///
    /// See [`Config::from_args`].
    pub fn from_environment() -> Result<Self, ConfigError> {
        Self::from_args([env!("CARGO_PKG_NAME")])
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_msg_size == 0 {
            return Err(ConfigError::Invalid {
                field: "max_msg_size",
                reason: String::from("must be positive"),
            });
        }
        if self.monitor_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "monitor_poll_interval_ms",
                reason: String::from("must be positive"),
            });
        }
        Ok(())
    }

    /// Tracing filter directive, in `EnvFilter` syntax.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Output format of the tracing subscriber.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Largest comms payload in bytes.
    #[must_use]
    pub const fn max_msg_size(&self) -> u32 {
        self.max_msg_size
    }

    /// Interval at which the monitor re-checks its deadline.
    #[must_use]
    pub const fn monitor_poll_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_poll_interval_ms)
    }

    /// Wall time limit applied to sandboxes that set none.
    #[must_use]
    pub const fn default_wall_time_limit(&self) -> Option<Duration> {
        match self.default_wall_time_limit_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Returns a copy with a different log filter.
    #[must_use]
    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }

    /// Returns a copy with a different comms payload limit.
    #[must_use]
    pub const fn with_max_msg_size(mut self, size: u32) -> Self {
        self.max_msg_size = size;
        self
    }

    /// Returns a copy with a different default wall time limit.
    #[must_use]
    pub const fn with_default_wall_time_limit(mut self, limit: Option<Duration>) -> Self {
        self.default_wall_time_limit_secs = match limit {
            Some(limit) => limit.as_secs(),
            None => 0,
        };
        self
    }
}

#[cfg(test)]
mod tests;
