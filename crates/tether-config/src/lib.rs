//! Shared configuration for the tether language server host.
//!
//! [`Config`] derives [`OrthoConfig`], which merges four layers, each
//! overriding the last: built-in defaults, a TOML file, `TETHER_*`
//! environment variables and command-line flags. The file is named by
//! `--config-path` or `TETHER_CONFIG_PATH`. Environment lists are
//! comma-separated.
//!
//! [`Config::resolve`] loads and then validates the merged result.

mod defaults;
mod error;
mod formats;

use std::ffi::OsString;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

pub use defaults::{
    CONFIG_PATH_ENV, DEFAULT_KILL_GRACE_MS, DEFAULT_LOG_FILTER, DEFAULT_REQUEST_TIMEOUT_MS,
    DEFAULT_RESTART_BACKOFF_MS, DEFAULT_RESTART_MAX_ATTEMPTS, DEFAULT_RESTART_RESET_AFTER_MS,
    DEFAULT_SHUTDOWN_TIMEOUT_MS, default_log_filter, default_log_format, default_restart_mode,
};
pub use error::ConfigError;
pub use formats::{FormatParseError, LogFormat, RestartMode};

/// Resolved configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "TETHER")]
pub struct Config {
    /// Language server executable; required before a server can start.
    pub server_command: Option<Utf8PathBuf>,
    /// Arguments passed to the language server.
    #[ortho_config(default = Vec::new())]
    pub server_args: Vec<String>,
    /// Working directory for the language server; inherited when unset.
    pub working_dir: Option<Utf8PathBuf>,
    /// Request deadline in milliseconds; 0 disables it.
    #[ortho_config(default = DEFAULT_REQUEST_TIMEOUT_MS)]
    pub request_timeout_ms: u64,
    /// Graceful shutdown deadline in milliseconds.
    #[ortho_config(default = DEFAULT_SHUTDOWN_TIMEOUT_MS)]
    pub shutdown_timeout_ms: u64,
    /// Time a server is given to exit before it is killed, in milliseconds.
    #[ortho_config(default = DEFAULT_KILL_GRACE_MS)]
    pub kill_grace_ms: u64,
    /// Whether crashed servers are restarted.
    #[ortho_config(default = default_restart_mode())]
    pub restart_mode: RestartMode,
    /// Automatic restarts allowed before the server is declared unavailable.
    #[ortho_config(default = DEFAULT_RESTART_MAX_ATTEMPTS)]
    pub restart_max_attempts: u32,
    /// Delays before successive restarts, in milliseconds; the last entry
    /// repeats.
    #[ortho_config(default = DEFAULT_RESTART_BACKOFF_MS.to_vec())]
    pub restart_backoff_ms: Vec<u64>,
    /// Uptime in milliseconds after which the restart budget resets; 0 never
    /// resets it.
    #[ortho_config(default = DEFAULT_RESTART_RESET_AFTER_MS)]
    pub restart_reset_after_ms: u64,
    /// Log filter expression.
    #[ortho_config(default = default_log_filter().to_owned())]
    pub log_filter: String,
    /// Log output format.
    #[ortho_config(default = default_log_format())]
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_command: None,
            server_args: Vec::new(),
            working_dir: None,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            kill_grace_ms: DEFAULT_KILL_GRACE_MS,
            restart_mode: default_restart_mode(),
            restart_max_attempts: DEFAULT_RESTART_MAX_ATTEMPTS,
            restart_backoff_ms: DEFAULT_RESTART_BACKOFF_MS.to_vec(),
            restart_reset_after_ms: DEFAULT_RESTART_RESET_AFTER_MS,
            log_filter: DEFAULT_LOG_FILTER.to_owned(),
            log_format: default_log_format(),
        }
    }
}

impl Config {
    /// Loads configuration from the process arguments and environment, then
    /// validates it.
    ///
    /// # Errors
    ///
    /// See [`resolve_from_iter`](Self::resolve_from_iter).
    pub fn resolve() -> Result<Self, ConfigError> {
        Self::resolve_from_iter(std::env::args_os())
    }

    /// Loads configuration from `args` and the process environment, then
    /// validates it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Load`] when a layer cannot be read or merged
    /// and [`ConfigError::Invalid`] when the merged result is unusable.
    pub fn resolve_from_iter<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let config = Self::load_from_iter(args)?;
        config.validate()?;
        Ok(config)
    }

    /// Returns the language server executable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingServerCommand`] when none is set.
    pub fn server_command(&self) -> Result<&Utf8Path, ConfigError> {
        self.server_command
            .as_deref()
            .ok_or(ConfigError::MissingServerCommand)
    }

    /// Returns the request deadline, or `None` when disabled.
    #[must_use]
    pub const fn request_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.request_timeout_ms)
    }

    /// Returns the graceful shutdown deadline.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Returns the time a server is given to exit before it is killed.
    #[must_use]
    pub const fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// Returns the restart backoff schedule.
    #[must_use]
    pub fn restart_backoff(&self) -> Vec<Duration> {
        self.restart_backoff_ms
            .iter()
            .copied()
            .map(Duration::from_millis)
            .collect()
    }

    /// Returns the uptime that resets the restart budget, or `None` when it
    /// never resets.
    #[must_use]
    pub const fn restart_reset_after(&self) -> Option<Duration> {
        non_zero_millis(self.restart_reset_after_ms)
    }

    /// Returns the log filter expression.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Returns the log output format.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.log_filter.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "log_filter",
                message: "must not be empty".to_owned(),
            });
        }
        if self.shutdown_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "shutdown_timeout_ms",
                message: "must be greater than zero".to_owned(),
            });
        }
        if self
            .server_command
            .as_ref()
            .is_some_and(|command| command.as_str().trim().is_empty())
        {
            return Err(ConfigError::Invalid {
                field: "server_command",
                message: "must not be empty".to_owned(),
            });
        }
        Ok(())
    }
}

const fn non_zero_millis(millis: u64) -> Option<Duration> {
    if millis == 0 {
        None
    } else {
        Some(Duration::from_millis(millis))
    }
}
