//! Built-in configuration values.

use crate::formats::{LogFormat, RestartMode};

/// Environment variable naming a configuration file.
pub const CONFIG_PATH_ENV: &str = "TETHER_CONFIG_PATH";

/// Default request deadline in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Default deadline for a graceful shutdown in milliseconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 2_000;

/// Default time a server is given to exit before it is killed.
pub const DEFAULT_KILL_GRACE_MS: u64 = 500;

/// Default number of automatic restarts before giving up.
pub const DEFAULT_RESTART_MAX_ATTEMPTS: u32 = 4;

/// Default backoff schedule for automatic restarts.
pub const DEFAULT_RESTART_BACKOFF_MS: [u64; 4] = [100, 500, 1_000, 2_000];

/// Default uptime after which a crash no longer counts against the budget.
pub const DEFAULT_RESTART_RESET_AFTER_MS: u64 = 180_000;

/// Default log filter expression used by the binary.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Default log filter expression used by the binary.
#[must_use]
pub const fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Default logging format for the binary.
#[must_use]
pub const fn default_log_format() -> LogFormat {
    LogFormat::Json
}

/// Default restart behaviour.
#[must_use]
pub const fn default_restart_mode() -> RestartMode {
    RestartMode::OnUnexpectedExit
}
