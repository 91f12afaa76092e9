//! Outstanding requests awaiting a response.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use super::{SESSION_TARGET, SessionShared};
use crate::codec::{RequestId, ResponseError};
use crate::errors::SessionError;

/// Recently abandoned ids remembered so late responses are recognised.
const ABANDONED_CAPACITY: usize = 64;

/// How a pending request was settled.
#[derive(Debug)]
pub(crate) enum Completion {
    Result(Value),
    Error(ResponseError),
    Cancelled,
    Terminated,
}

/// Outcome of routing a response to the table.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Resolution {
    Delivered { method: String, elapsed: Duration },
    Abandoned,
    Unknown,
}

#[derive(Debug)]
struct PendingEntry {
    method: String,
    created: Instant,
    slot: oneshot::Sender<Completion>,
}

/// Pending requests keyed by id; each entry is settled exactly once.
#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    entries: HashMap<RequestId, PendingEntry>,
    abandoned: VecDeque<RequestId>,
}

impl PendingTable {
    pub(crate) fn insert(&mut self, id: RequestId, method: &str) -> oneshot::Receiver<Completion> {
        let (slot, receiver) = oneshot::channel();
        self.entries.insert(
            id,
            PendingEntry {
                method: method.to_owned(),
                created: Instant::now(),
                slot,
            },
        );
        receiver
    }

    pub(crate) fn resolve(&mut self, id: &RequestId, completion: Completion) -> Resolution {
        if let Some(entry) = self.entries.remove(id) {
            // The receiver only disappears when its handle is dropped, which
            // abandons the entry first.
            let _ = entry.slot.send(completion);
            return Resolution::Delivered {
                method: entry.method,
                elapsed: entry.created.elapsed(),
            };
        }
        if let Some(position) = self.abandoned.iter().position(|known| known == id) {
            self.abandoned.remove(position);
            return Resolution::Abandoned;
        }
        Resolution::Unknown
    }

    /// Removes the entry without settling it; returns its method if present.
    pub(crate) fn abandon(&mut self, id: &RequestId) -> Option<String> {
        let entry = self.entries.remove(id)?;
        self.remember(id.clone());
        Some(entry.method)
    }

    /// Settles the entry as cancelled; returns its method if present.
    pub(crate) fn cancel(&mut self, id: &RequestId) -> Option<String> {
        let entry = self.entries.remove(id)?;
        let _ = entry.slot.send(Completion::Cancelled);
        self.remember(id.clone());
        Some(entry.method)
    }

    /// Settles every entry as terminated and returns how many there were.
    pub(crate) fn drain(&mut self) -> usize {
        let count = self.entries.len();
        for (_, entry) in self.entries.drain() {
            let _ = entry.slot.send(Completion::Terminated);
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn remember(&mut self, id: RequestId) {
        if self.abandoned.len() == ABANDONED_CAPACITY {
            self.abandoned.pop_front();
        }
        self.abandoned.push_back(id);
    }
}

/// Handle to the eventual response of one request.
///
/// Dropping the handle before the response arrives discards the pending
/// entry; a response arriving later is logged and dropped.
#[must_use = "dropping a PendingResponse discards the request's result"]
pub struct PendingResponse {
    shared: Arc<SessionShared>,
    id: RequestId,
    method: String,
    receiver: Option<oneshot::Receiver<Completion>>,
    timeout: Option<Duration>,
}

impl PendingResponse {
    pub(crate) fn new(
        shared: Arc<SessionShared>,
        id: RequestId,
        method: String,
        receiver: oneshot::Receiver<Completion>,
    ) -> Self {
        let timeout = shared.options.request_timeout;
        Self {
            shared,
            id,
            method,
            receiver: Some(receiver),
            timeout,
        }
    }

    /// Returns the request id.
    #[must_use]
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Returns the request method.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Overrides the session's default timeout; `None` waits indefinitely.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Waits for the response.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Server`] for an error response,
    /// [`SessionError::Timeout`] when the deadline elapses first,
    /// [`SessionError::Cancelled`] when the request was cancelled, and
    /// [`SessionError::Terminated`] when the session ended first.
    pub async fn response(mut self) -> Result<Value, SessionError> {
        let Some(receiver) = self.receiver.take() else {
            return Err(self.terminated());
        };

        let outcome = match self.timeout {
            Some(limit) => {
                if let Ok(outcome) = tokio::time::timeout(limit, receiver).await {
                    outcome
                } else {
                    self.shared.abandon(&self.id);
                    return Err(SessionError::Timeout {
                        method: self.method.clone(),
                        id: self.id.clone(),
                        timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    });
                }
            }
            None => receiver.await,
        };

        match outcome {
            Ok(Completion::Result(value)) => Ok(value),
            Ok(Completion::Error(error)) => Err(SessionError::Server {
                method: self.method.clone(),
                error,
            }),
            Ok(Completion::Cancelled) => Err(SessionError::Cancelled {
                method: self.method.clone(),
                id: self.id.clone(),
            }),
            Ok(Completion::Terminated) | Err(_) => Err(self.terminated()),
        }
    }

    /// Cancels the request, notifying the server when the session is
    /// configured to.
    ///
    /// # Errors
    ///
    /// Returns an error if the `$/cancelRequest` notification cannot be
    /// queued.
    pub fn cancel(self) -> Result<(), SessionError> {
        self.shared.cancel(&self.id).map(|_| ())
    }

    fn terminated(&self) -> SessionError {
        SessionError::Terminated {
            method: self.method.clone(),
            id: self.id.clone(),
        }
    }
}

impl std::fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResponse")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if let Some(method) = self.shared.abandon(&self.id) {
            debug!(
                target: SESSION_TARGET,
                id = %self.id,
                method,
                "pending request abandoned"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    fn resolves_each_entry_once() {
        let mut table = PendingTable::default();
        let mut receiver = table.insert(RequestId::Integer(1), "a");

        let first = table.resolve(&RequestId::Integer(1), Completion::Result(json!(1)));
        let second = table.resolve(&RequestId::Integer(1), Completion::Result(json!(2)));

        assert!(matches!(first, Resolution::Delivered { ref method, .. } if method == "a"));
        assert_eq!(second, Resolution::Unknown);
        assert!(matches!(receiver.try_recv(), Ok(Completion::Result(value)) if value == json!(1)));
    }

    #[rstest]
    fn late_responses_for_abandoned_ids_are_recognised() {
        let mut table = PendingTable::default();
        let _receiver = table.insert(RequestId::Integer(9), "slow");

        assert_eq!(table.abandon(&RequestId::Integer(9)).as_deref(), Some("slow"));
        assert_eq!(
            table.resolve(&RequestId::Integer(9), Completion::Result(Value::Null)),
            Resolution::Abandoned
        );
        assert_eq!(table.len(), 0);
    }

    #[rstest]
    fn abandoned_history_is_bounded() {
        let mut table = PendingTable::default();
        for id in 0..=i64::try_from(ABANDONED_CAPACITY).expect("capacity fits") {
            let _receiver = table.insert(RequestId::Integer(id), "m");
            table.abandon(&RequestId::Integer(id));
        }

        assert_eq!(
            table.resolve(&RequestId::Integer(0), Completion::Result(Value::Null)),
            Resolution::Unknown
        );
        assert_eq!(
            table.resolve(&RequestId::Integer(1), Completion::Result(Value::Null)),
            Resolution::Abandoned
        );
    }

    #[rstest]
    fn drain_terminates_every_entry() {
        let mut table = PendingTable::default();
        let mut receivers: Vec<_> = (1..=3)
            .map(|id| table.insert(RequestId::Integer(id), "m"))
            .collect();

        assert_eq!(table.drain(), 3);
        assert_eq!(table.len(), 0);
        for receiver in &mut receivers {
            assert!(matches!(receiver.try_recv(), Ok(Completion::Terminated)));
        }
    }
}
