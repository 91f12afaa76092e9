//! Handlers for server-initiated requests and notifications.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::codec::ResponseError;
use crate::errors::SessionError;

/// Callback invoked for each inbound notification of one method.
pub type NotificationHandler = Arc<dyn Fn(Option<Value>) + Send + Sync>;

/// Callback answering each inbound request of one method.
///
/// `Ok` is written back as the response result and `Err` as an error
/// response.
pub type RequestHandler = Arc<dyn Fn(Option<Value>) -> Result<Value, ResponseError> + Send + Sync>;

/// Handlers keyed by method, at most one of each kind per method.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    notifications: HashMap<String, NotificationHandler>,
    requests: HashMap<String, RequestHandler>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for notifications named `method`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::DuplicateHandler`] if one is already
    /// registered.
    pub fn add_notification(
        &mut self,
        method: impl Into<String>,
        handler: NotificationHandler,
    ) -> Result<(), SessionError> {
        insert_unique(&mut self.notifications, method.into(), handler)
    }

    /// Registers the handler for requests named `method`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::DuplicateHandler`] if one is already
    /// registered.
    pub fn add_request(
        &mut self,
        method: impl Into<String>,
        handler: RequestHandler,
    ) -> Result<(), SessionError> {
        insert_unique(&mut self.requests, method.into(), handler)
    }

    pub(crate) fn notification(&self, method: &str) -> Option<NotificationHandler> {
        self.notifications.get(method).cloned()
    }

    pub(crate) fn request(&self, method: &str) -> Option<RequestHandler> {
        self.requests.get(method).cloned()
    }

    /// Returns whether no handlers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.notifications.is_empty() && self.requests.is_empty()
    }
}

fn insert_unique<H>(
    handlers: &mut HashMap<String, H>,
    method: String,
    handler: H,
) -> Result<(), SessionError> {
    match handlers.entry(method) {
        Entry::Occupied(entry) => Err(SessionError::DuplicateHandler {
            method: entry.key().clone(),
        }),
        Entry::Vacant(entry) => {
            entry.insert(handler);
            Ok(())
        }
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut notifications: Vec<_> = self.notifications.keys().collect();
        let mut requests: Vec<_> = self.requests.keys().collect();
        notifications.sort();
        requests.sort();
        f.debug_struct("HandlerRegistry")
            .field("notifications", &notifications)
            .field("requests", &requests)
            .finish()
    }
}
