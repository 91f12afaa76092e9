//! Host-facing callbacks for lifecycle events.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::SupervisorError;
use crate::session::SessionState;

const NOTIFIER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::host");

/// What prompted a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartCause {
    /// The host called [`Supervisor::restart`](crate::Supervisor::restart).
    Requested,
    /// The server exited unexpectedly.
    Crash,
}

impl RestartCause {
    /// Returns the cause as a lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Crash => "crash",
        }
    }
}

impl fmt::Display for RestartCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observer trait through which an editor integration follows the server.
///
/// Callbacks run on the task that observed the event and must not block.
pub trait HostNotifier: Send + Sync {
    /// Invoked after every session state transition.
    fn state_changed(&self, state: SessionState);

    /// Invoked for each line the server writes to its standard error.
    fn server_log(&self, line: &str);

    /// Invoked before a restart attempt, after which the supervisor waits
    /// `delay` before launching.
    fn restart_attempt(&self, cause: RestartCause, attempt: u32, delay: Duration);

    /// Invoked when a restart attempt produced a ready session.
    fn restart_succeeded(&self, cause: RestartCause, attempt: u32);

    /// Invoked when a restart attempt failed.
    fn restart_failed(&self, cause: RestartCause, attempt: u32, error: &SupervisorError);

    /// Invoked once the restart budget is exhausted.
    fn server_unavailable(&self, attempts: u32);
}

impl<T> HostNotifier for Arc<T>
where
    T: HostNotifier + ?Sized,
{
    fn state_changed(&self, state: SessionState) {
        (**self).state_changed(state);
    }

    fn server_log(&self, line: &str) {
        (**self).server_log(line);
    }

    fn restart_attempt(&self, cause: RestartCause, attempt: u32, delay: Duration) {
        (**self).restart_attempt(cause, attempt, delay);
    }

    fn restart_succeeded(&self, cause: RestartCause, attempt: u32) {
        (**self).restart_succeeded(cause, attempt);
    }

    fn restart_failed(&self, cause: RestartCause, attempt: u32, error: &SupervisorError) {
        (**self).restart_failed(cause, attempt, error);
    }

    fn server_unavailable(&self, attempts: u32) {
        (**self).server_unavailable(attempts);
    }
}

/// Default notifier that records host events using `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl TracingNotifier {
    /// Builds a new notifier.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl HostNotifier for TracingNotifier {
    fn state_changed(&self, state: SessionState) {
        tracing::info!(
            target: NOTIFIER_TARGET,
            event = "state_changed",
            state = %state,
            "session state changed"
        );
    }

    fn server_log(&self, line: &str) {
        tracing::info!(
            target: NOTIFIER_TARGET,
            event = "server_log",
            line,
            "language server output"
        );
    }

    fn restart_attempt(&self, cause: RestartCause, attempt: u32, delay: Duration) {
        tracing::warn!(
            target: NOTIFIER_TARGET,
            event = "restart_attempt",
            cause = %cause,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "restarting language server"
        );
    }

    fn restart_succeeded(&self, cause: RestartCause, attempt: u32) {
        tracing::info!(
            target: NOTIFIER_TARGET,
            event = "restart_succeeded",
            cause = %cause,
            attempt,
            "language server restarted"
        );
    }

    fn restart_failed(&self, cause: RestartCause, attempt: u32, error: &SupervisorError) {
        tracing::error!(
            target: NOTIFIER_TARGET,
            event = "restart_failed",
            cause = %cause,
            attempt,
            error = %error,
            "language server restart failed"
        );
    }

    fn server_unavailable(&self, attempts: u32) {
        tracing::error!(
            target: NOTIFIER_TARGET,
            event = "server_unavailable",
            attempts,
            "language server unavailable; restart budget exhausted"
        );
    }
}
