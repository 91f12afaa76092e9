//! Notifier that records every event for later assertions.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;

use super::WAIT_LIMIT;
use crate::errors::SupervisorError;
use crate::notifier::{HostNotifier, RestartCause};
use crate::session::SessionState;

/// One recorded notifier callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// `state_changed`.
    StateChanged(SessionState),
    /// `server_log`.
    ServerLog(String),
    /// `restart_attempt`.
    RestartAttempt {
        /// Why the restart happened.
        cause: RestartCause,
        /// One-based attempt number.
        attempt: u32,
        /// Backoff before the launch.
        delay: Duration,
    },
    /// `restart_succeeded`.
    RestartSucceeded {
        /// Why the restart happened.
        cause: RestartCause,
        /// One-based attempt number.
        attempt: u32,
    },
    /// `restart_failed`, with the error rendered as text.
    RestartFailed {
        /// Why the restart happened.
        cause: RestartCause,
        /// One-based attempt number.
        attempt: u32,
        /// The error's display form.
        message: String,
    },
    /// `server_unavailable`.
    ServerUnavailable(u32),
}

/// Collects [`HostEvent`]s in arrival order.
#[derive(Debug)]
pub struct RecordingNotifier {
    events: Mutex<Vec<HostEvent>>,
    changes: watch::Sender<usize>,
}

impl Default for RecordingNotifier {
    fn default() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            events: Mutex::new(Vec::new()),
            changes,
        }
    }
}

impl RecordingNotifier {
    /// Returns a snapshot of the events so far.
    pub fn events(&self) -> Vec<HostEvent> {
        self.events.lock().expect("events lock").clone()
    }

    /// Counts the events matching `predicate`.
    pub fn count<P>(&self, predicate: P) -> usize
    where
        P: Fn(&HostEvent) -> bool,
    {
        self.events
            .lock()
            .expect("events lock")
            .iter()
            .filter(|event| predicate(event))
            .count()
    }

    /// Waits for the first event matching `predicate`.
    pub async fn wait_for<P>(&self, predicate: P) -> HostEvent
    where
        P: Fn(&HostEvent) -> bool,
    {
        self.wait_for_count(predicate, 1)
            .await
            .into_iter()
            .next()
            .expect("at least one event")
    }

    /// Waits until `count` events match `predicate` and returns them.
    pub async fn wait_for_count<P>(&self, predicate: P, count: usize) -> Vec<HostEvent>
    where
        P: Fn(&HostEvent) -> bool,
    {
        let mut changes = self.changes.subscribe();
        let found = tokio::time::timeout(WAIT_LIMIT, async {
            loop {
                let matches: Vec<_> = self
                    .events()
                    .into_iter()
                    .filter(|event| predicate(event))
                    .collect();
                if matches.len() >= count {
                    return matches;
                }
                changes.changed().await.expect("notifier alive");
            }
        })
        .await;
        found.unwrap_or_else(|_| {
            panic!(
                "expected {count} matching host events; recorded {:?}",
                self.events()
            )
        })
    }

    fn record(&self, event: HostEvent) {
        let count = {
            let mut events = self.events.lock().expect("events lock");
            events.push(event);
            events.len()
        };
        self.changes.send_replace(count);
    }
}

impl HostNotifier for RecordingNotifier {
    fn state_changed(&self, state: SessionState) {
        self.record(HostEvent::StateChanged(state));
    }

    fn server_log(&self, line: &str) {
        self.record(HostEvent::ServerLog(line.to_owned()));
    }

    fn restart_attempt(&self, cause: RestartCause, attempt: u32, delay: Duration) {
        self.record(HostEvent::RestartAttempt {
            cause,
            attempt,
            delay,
        });
    }

    fn restart_succeeded(&self, cause: RestartCause, attempt: u32) {
        self.record(HostEvent::RestartSucceeded { cause, attempt });
    }

    fn restart_failed(&self, cause: RestartCause, attempt: u32, error: &SupervisorError) {
        self.record(HostEvent::RestartFailed {
            cause,
            attempt,
            message: error.to_string(),
        });
    }

    fn server_unavailable(&self, attempts: u32) {
        self.record(HostEvent::ServerUnavailable(attempts));
    }
}
