//! One language server connection.
//!
//! A [`Session`] owns the framed connection to a server. A single reader task
//! drains inbound frames, resolving pending requests and dispatching
//! server-initiated messages to registered handlers; a single writer task
//! serialises outbound frames. Every state transition is one compare-and-set
//! on a `watch` channel, so concurrent transitions never interleave.

mod handlers;
mod pending;
mod routing;
mod state;

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use lsp_types::{
    ClientCapabilities, ClientInfo, InitializeParams, InitializeResult, InitializedParams,
};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use handlers::{HandlerRegistry, NotificationHandler, RequestHandler};
pub use pending::PendingResponse;
use pending::PendingTable;
pub use state::{CloseReason, SessionState};

use crate::codec::{Message, RequestId, ResponseError};
use crate::errors::{CodecError, SessionError};
use crate::notifier::{HostNotifier, TracingNotifier};
use crate::transport::{FrameSender, Transport};

pub(crate) const SESSION_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::session");

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CANCEL_METHOD: &str = "$/cancelRequest";

/// States in which the client's own protocol traffic may be sent.
const LIVE_STATES: &[SessionState] = &[
    SessionState::Initializing,
    SessionState::Ready,
    SessionState::ShuttingDown,
];

/// Tunables for a [`Session`].
#[derive(Clone)]
pub struct SessionOptions {
    /// Default deadline for each request; `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
    /// Whether cancelling a request sends `$/cancelRequest` to the server.
    pub cancel_notifications: bool,
    /// Client name reported in the `initialize` request.
    pub client_name: String,
    /// Client version reported in the `initialize` request.
    pub client_version: String,
    /// Receives state changes.
    pub notifier: Arc<dyn HostNotifier>,
    /// Handlers installed when the session connects.
    pub handlers: HandlerRegistry,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            cancel_notifications: true,
            client_name: env!("CARGO_PKG_NAME").to_owned(),
            client_version: env!("CARGO_PKG_VERSION").to_owned(),
            notifier: Arc::new(TracingNotifier),
            handlers: HandlerRegistry::default(),
        }
    }
}

impl SessionOptions {
    /// Sets the default request deadline.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Enables or disables `$/cancelRequest` on cancellation.
    #[must_use]
    pub fn with_cancel_notifications(mut self, enabled: bool) -> Self {
        self.cancel_notifications = enabled;
        self
    }

    /// Sets the client name and version sent during the handshake.
    #[must_use]
    pub fn with_client_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.client_name = name.into();
        self.client_version = version.into();
        self
    }

    /// Sets the notifier.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn HostNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Sets the handlers installed on connect.
    #[must_use]
    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("request_timeout", &self.request_timeout)
            .field("cancel_notifications", &self.cancel_notifications)
            .field("client_name", &self.client_name)
            .field("client_version", &self.client_version)
            .field("handlers", &self.handlers)
            .finish_non_exhaustive()
    }
}

/// A connection to one language server.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

pub(crate) struct SessionShared {
    state: watch::Sender<SessionState>,
    pending: Mutex<PendingTable>,
    handlers: Mutex<HandlerRegistry>,
    next_id: AtomicI64,
    outbound: FrameSender,
    options: SessionOptions,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    close_reason: Mutex<Option<CloseReason>>,
}

impl Session {
    /// Connects over a byte stream pair, spawning the reader and writer
    /// tasks. The session starts `Uninitialized`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect<R, W>(reader: R, writer: W, options: SessionOptions) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (frames, outbound, writer_task) = Transport::new(reader, writer).into_parts();
        let (state, _) = watch::channel(SessionState::Uninitialized);
        let shared = Arc::new(SessionShared {
            state,
            pending: Mutex::new(PendingTable::default()),
            handlers: Mutex::new(options.handlers.clone()),
            next_id: AtomicI64::new(1),
            outbound,
            options,
            tasks: Mutex::new(Vec::with_capacity(2)),
            close_reason: Mutex::new(None),
        });

        {
            let mut tasks = lock(&shared.tasks);
            tasks.push(writer_task);
            tasks.push(tokio::spawn(routing::run(Arc::clone(&shared), frames)));
        }

        Self { shared }
    }

    /// Performs the `initialize`/`initialized` handshake.
    ///
    /// On failure the session is left `Initializing`; its owner is expected
    /// to [`terminate`](Self::terminate) it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidState`] unless the session is
    /// `Uninitialized`, and [`SessionError::Handshake`] if the server
    /// rejects the request, returns an undecodable result, or the
    /// connection ends first.
    pub async fn initialize(
        &self,
        capabilities: ClientCapabilities,
    ) -> Result<InitializeResult, SessionError> {
        self.shared
            .transition(&[SessionState::Uninitialized], SessionState::Initializing)
            .map_err(|state| SessionError::InvalidState {
                operation: "initialize",
                state,
            })?;

        let options = &self.shared.options;
        let initialize = InitializeParams {
            process_id: Some(std::process::id()),
            client_info: Some(ClientInfo {
                name: options.client_name.clone(),
                version: Some(options.client_version.clone()),
            }),
            capabilities,
            ..InitializeParams::default()
        };
        let params = serde_json::to_value(initialize).map_err(|error| {
            SessionError::handshake(
                "cannot encode initialize params",
                Some(CodecError::from(error).into()),
            )
        })?;

        let value = self
            .shared
            .start_request("initialize", Some(params), &[SessionState::Initializing], "initialize")
            .map_err(|error| SessionError::handshake("cannot send initialize", Some(error)))?
            .response()
            .await
            .map_err(|error| SessionError::handshake("initialize request failed", Some(error)))?;

        let result = serde_json::from_value::<InitializeResult>(value).map_err(|error| {
            SessionError::handshake(format!("invalid initialize result: {error}"), None)
        })?;

        let initialized = serde_json::to_value(InitializedParams {}).unwrap_or_else(|_| json!({}));
        self.shared
            .notify("initialized", Some(initialized), &[SessionState::Initializing], "initialize")
            .map_err(|error| SessionError::handshake("cannot send initialized", Some(error)))?;

        self.shared
            .transition(&[SessionState::Initializing], SessionState::Ready)
            .map_err(|state| {
                SessionError::handshake(format!("session became {state} during handshake"), None)
            })?;

        info!(
            target: SESSION_TARGET,
            server = result
                .server_info
                .as_ref()
                .map_or("unknown", |server| server.name.as_str()),
            "session ready"
        );
        Ok(result)
    }

    /// Sends a request and returns a handle to its eventual response.
    ///
    /// The id is allocated and the frame queued before this returns, so
    /// ids follow call order. A `null` `params` is omitted from the wire.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidState`] unless the session is `Ready`,
    /// without writing anything, and [`SessionError::Io`] once the writer
    /// has stopped.
    pub fn request(&self, method: &str, params: Value) -> Result<PendingResponse, SessionError> {
        self.shared.start_request(
            method,
            non_null(params),
            &[SessionState::Ready],
            "send request",
        )
    }

    /// Sends a request and waits for its response.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`request`](Self::request) and of
    /// [`PendingResponse::response`].
    pub async fn send_request(&self, method: &str, params: Value) -> Result<Value, SessionError> {
        self.request(method, params)?.response().await
    }

    /// Sends a notification.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidState`] unless the session is `Ready`
    /// and [`SessionError::Io`] once the writer has stopped.
    pub fn send_notification(&self, method: &str, params: Value) -> Result<(), SessionError> {
        self.shared
            .notify(method, non_null(params), &[SessionState::Ready], "send notification")
    }

    /// Cancels the pending request `id`, resolving its handle with
    /// [`SessionError::Cancelled`]. Returns `false` if it was not pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the `$/cancelRequest` notification cannot be
    /// queued.
    pub fn cancel(&self, id: &RequestId) -> Result<bool, SessionError> {
        self.shared.cancel(id).map(|method| method.is_some())
    }

    /// Registers the handler for server notifications named `method`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::DuplicateHandler`] if one is already
    /// registered.
    pub fn on_notification<F>(&self, method: &str, handler: F) -> Result<(), SessionError>
    where
        F: Fn(Option<Value>) + Send + Sync + 'static,
    {
        self.shared
            .lock_handlers()
            .add_notification(method, Arc::new(handler))
    }

    /// Registers the handler answering server requests named `method`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::DuplicateHandler`] if one is already
    /// registered.
    pub fn on_request<F>(&self, method: &str, handler: F) -> Result<(), SessionError>
    where
        F: Fn(Option<Value>) -> Result<Value, ResponseError> + Send + Sync + 'static,
    {
        self.shared
            .lock_handlers()
            .add_request(method, Arc::new(handler))
    }

    /// Performs the `shutdown`/`exit` sequence and waits for the connection
    /// to close. Returns immediately once the session is closed.
    ///
    /// The wait is unbounded; callers wanting a deadline wrap the call in
    /// [`tokio::time::timeout`].
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidState`] for an `Uninitialized`
    /// session, or the error of the `shutdown` request. `exit` is only sent
    /// once `shutdown` succeeds; after a failure the session stays
    /// `ShuttingDown` until the owner terminates it.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        match self.shared.transition(
            &[SessionState::Initializing, SessionState::Ready],
            SessionState::ShuttingDown,
        ) {
            Ok(_) => {}
            Err(SessionState::ShuttingDown) => {
                self.closed().await;
                return Ok(());
            }
            Err(state) if state.is_terminal() => return Ok(()),
            Err(state) => {
                return Err(SessionError::InvalidState {
                    operation: "shut down",
                    state,
                });
            }
        }

        let acknowledged = match self.shared.start_request(
            "shutdown",
            None,
            &[SessionState::ShuttingDown],
            "shut down",
        ) {
            Ok(pending) => pending.response().await.map(|_| ()),
            Err(error) => Err(error),
        };
        if self.state().is_terminal() {
            return Ok(());
        }
        acknowledged?;

        self.shared
            .notify("exit", None, &[SessionState::ShuttingDown], "shut down")?;
        self.closed().await;
        Ok(())
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Waits until the session is `Stopped` or `Crashed` and returns which.
    pub async fn closed(&self) -> SessionState {
        let mut states = self.shared.state.subscribe();
        let outcome = states
            .wait_for(|state| state.is_terminal())
            .await
            .map(|state| *state);
        outcome.unwrap_or_else(|_| self.state())
    }

    /// Returns why the connection ended, once it has.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        lock(&self.shared.close_reason).clone()
    }

    /// Returns the number of requests awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.lock_pending().len()
    }

    /// Ends the session: `Stopped` if it was shutting down or `reason` is
    /// intentional, `Crashed` otherwise. Every pending request fails with
    /// [`SessionError::Terminated`]. Returns the terminal state; calling it
    /// again has no further effect.
    pub fn terminate(&self, reason: CloseReason) -> SessionState {
        self.shared.terminate(reason)
    }

    /// Returns whether two handles refer to the same connection.
    #[must_use]
    pub fn same_connection(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

impl SessionShared {
    fn lock_pending(&self) -> MutexGuard<'_, PendingTable> {
        lock(&self.pending)
    }

    fn lock_handlers(&self) -> MutexGuard<'_, HandlerRegistry> {
        lock(&self.handlers)
    }

    /// Moves to `to` if the current state is in `allowed`. Returns the
    /// previous state, or the current one when the move was refused.
    fn transition(
        &self,
        allowed: &[SessionState],
        to: SessionState,
    ) -> Result<SessionState, SessionState> {
        let mut observed = to;
        let changed = self.state.send_if_modified(|current| {
            observed = *current;
            if allowed.contains(current) {
                *current = to;
                true
            } else {
                false
            }
        });
        if !changed {
            return Err(observed);
        }
        debug!(
            target: SESSION_TARGET,
            from = %observed,
            to = %to,
            "session state changed"
        );
        self.options.notifier.state_changed(to);
        Ok(observed)
    }

    fn send(&self, message: &Message) -> Result<(), SessionError> {
        let payload = message.encode()?;
        self.outbound.write(payload)?;
        Ok(())
    }

    fn start_request(
        self: &Arc<Self>,
        method: &str,
        params: Option<Value>,
        allowed: &[SessionState],
        operation: &'static str,
    ) -> Result<PendingResponse, SessionError> {
        let mut pending = self.lock_pending();
        let state = *self.state.borrow();
        if !allowed.contains(&state) {
            return Err(SessionError::InvalidState { operation, state });
        }

        let id = RequestId::Integer(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.send(&Message::request(id.clone(), method, params))?;
        // Inserted while the pending lock is held, so the reader cannot see
        // the response before the entry exists.
        let receiver = pending.insert(id.clone(), method);
        drop(pending);

        debug!(target: SESSION_TARGET, id = %id, method, "request sent");
        Ok(PendingResponse::new(
            Arc::clone(self),
            id,
            method.to_owned(),
            receiver,
        ))
    }

    fn notify(
        &self,
        method: &str,
        params: Option<Value>,
        allowed: &[SessionState],
        operation: &'static str,
    ) -> Result<(), SessionError> {
        let state = *self.state.borrow();
        if !allowed.contains(&state) {
            return Err(SessionError::InvalidState { operation, state });
        }
        self.send(&Message::notification(method, params))?;
        debug!(target: SESSION_TARGET, method, "notification sent");
        Ok(())
    }

    fn abandon(&self, id: &RequestId) -> Option<String> {
        self.lock_pending().abandon(id)
    }

    fn cancel(&self, id: &RequestId) -> Result<Option<String>, SessionError> {
        let Some(method) = self.lock_pending().cancel(id) else {
            return Ok(None);
        };
        debug!(target: SESSION_TARGET, id = %id, method, "request cancelled");
        if self.options.cancel_notifications {
            self.notify(CANCEL_METHOD, Some(json!({ "id": id })), LIVE_STATES, "cancel request")?;
        }
        Ok(Some(method))
    }

    fn terminate(&self, reason: CloseReason) -> SessionState {
        let (previous, next, drained) = {
            let mut pending = self.lock_pending();
            let mut previous = SessionState::Uninitialized;
            let mut next = None;
            self.state.send_if_modified(|current| {
                previous = *current;
                if current.is_terminal() {
                    return false;
                }
                let target = if *current == SessionState::ShuttingDown || reason.is_intentional()
                {
                    SessionState::Stopped
                } else {
                    SessionState::Crashed
                };
                *lock(&self.close_reason) = Some(reason.clone());
                *current = target;
                next = Some(target);
                true
            });
            (previous, next, pending.drain())
        };

        let Some(state) = next else {
            return previous;
        };

        for task in std::mem::take(&mut *lock(&self.tasks)) {
            task.abort();
        }

        if state == SessionState::Crashed {
            warn!(
                target: SESSION_TARGET,
                from = %previous,
                reason = %reason,
                failed_requests = drained,
                "session crashed"
            );
        } else {
            info!(
                target: SESSION_TARGET,
                from = %previous,
                reason = %reason,
                failed_requests = drained,
                "session stopped"
            );
        }
        self.options.notifier.state_changed(state);
        state
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}

fn non_null(params: Value) -> Option<Value> {
    (!params.is_null()).then_some(params)
}
