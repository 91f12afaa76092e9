//! Language server supervision.
//!
//! The [`Supervisor`] owns at most one running server at a time: its process
//! handle and its [`Session`]. Host operations are serialised by an async
//! mutex around that slot. Every explicit `start`, `restart` or `stop` bumps
//! an epoch so a pending automatic restart can tell it has been superseded,
//! and each running server carries a serial so a late crash report for a
//! replaced server is ignored.

mod monitor;
mod policy;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use lsp_types::ClientCapabilities;
use serde_json::Value;
use tether_config::Config;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use policy::RestartPolicy;
use policy::RestartBudget;

use crate::codec::ResponseError;
use crate::errors::SupervisorError;
use crate::notifier::{HostNotifier, RestartCause};
use crate::process::{
    LaunchedServer, ProcessHandle, ProcessLauncher, ServerCommand, ServerLauncher,
};
use crate::session::{CloseReason, HandlerRegistry, Session, SessionOptions, SessionState};

pub(crate) const SUPERVISOR_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::supervisor");

/// Tunables for a [`Supervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Options applied to every session; the notifier is replaced by the
    /// supervisor's.
    pub session: SessionOptions,
    /// Capabilities announced in each `initialize` request.
    pub capabilities: ClientCapabilities,
    /// Deadline for a graceful shutdown before the process is killed.
    pub shutdown_timeout: Duration,
    /// Time a process is given to exit on its own before it is killed.
    pub kill_grace: Duration,
    /// Policy applied when the server exits unexpectedly.
    pub restart_policy: RestartPolicy,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            session: SessionOptions::default(),
            capabilities: ClientCapabilities::default(),
            shutdown_timeout: Duration::from_secs(2),
            kill_grace: Duration::from_millis(500),
            restart_policy: RestartPolicy::default(),
        }
    }
}

impl SupervisorOptions {
    /// Builds the options from configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            session: SessionOptions::default().with_request_timeout(config.request_timeout()),
            capabilities: ClientCapabilities::default(),
            shutdown_timeout: config.shutdown_timeout(),
            kill_grace: config.kill_grace(),
            restart_policy: RestartPolicy::from_config(config),
        }
    }
}

/// Starts, restarts and stops one language server on behalf of a host.
///
/// Cloning yields another handle to the same supervisor.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    launcher: Arc<dyn ServerLauncher>,
    options: SupervisorOptions,
    notifier: Arc<dyn HostNotifier>,
    handlers: Mutex<HandlerRegistry>,
    slot: tokio::sync::Mutex<Slot>,
    current: Mutex<Option<Session>>,
    epoch: watch::Sender<u64>,
    serial: AtomicU64,
    restarting: AtomicBool,
    recovering: AtomicBool,
    unavailable: AtomicBool,
    budget: Mutex<RestartBudget>,
}

#[derive(Default)]
struct Slot {
    command: Option<ServerCommand>,
    running: Option<Running>,
}

struct Running {
    session: Session,
    process: ProcessHandle,
    serial: u64,
    started_at: Instant,
}

impl Supervisor {
    /// Creates a supervisor that launches servers as child processes.
    #[must_use]
    pub fn new(options: SupervisorOptions, notifier: Arc<dyn HostNotifier>) -> Self {
        Self::with_launcher(options, notifier, Arc::new(ProcessLauncher))
    }

    /// Creates a supervisor with a custom launcher.
    #[must_use]
    pub fn with_launcher(
        mut options: SupervisorOptions,
        notifier: Arc<dyn HostNotifier>,
        launcher: Arc<dyn ServerLauncher>,
    ) -> Self {
        options.session.notifier = Arc::clone(&notifier);
        let handlers = std::mem::take(&mut options.session.handlers);
        let (epoch, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                launcher,
                options,
                notifier,
                handlers: Mutex::new(handlers),
                slot: tokio::sync::Mutex::new(Slot::default()),
                current: Mutex::new(None),
                epoch,
                serial: AtomicU64::new(0),
                restarting: AtomicBool::new(false),
                recovering: AtomicBool::new(false),
                unavailable: AtomicBool::new(false),
                budget: Mutex::new(RestartBudget::default()),
            }),
        }
    }

    /// Launches `command` and performs the handshake.
    ///
    /// Starting after the server was declared unavailable clears that
    /// condition and resets the restart budget.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::AlreadyRunning`] while a session is live,
    /// [`SupervisorError::BinaryNotFound`] or [`SupervisorError::Spawn`] if
    /// the process cannot start, and [`SupervisorError::Handshake`] if
    /// initialisation fails.
    pub async fn start(&self, command: ServerCommand) -> Result<Session, SupervisorError> {
        let mut slot = self.inner.slot.lock().await;
        if slot
            .running
            .as_ref()
            .is_some_and(|running| !running.session.state().is_terminal())
        {
            return Err(SupervisorError::AlreadyRunning);
        }

        self.inner.bump_epoch();
        if let Some(stale) = slot.running.take() {
            self.inner.teardown(stale, false).await;
        }
        self.inner.lock_budget().reset();
        self.inner.unavailable.store(false, Ordering::SeqCst);
        slot.command = Some(command.clone());

        info!(target: SUPERVISOR_TARGET, command = %command, "starting language server");
        self.inner.launch(&mut slot, &command).await
    }

    /// Shuts the current server down and starts it again with the last
    /// command.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::RestartInProgress`] while another restart,
    /// requested or automatic, is underway, [`SupervisorError::NotRunning`]
    /// if the server was never started, and the errors of
    /// [`start`](Self::start) if relaunching fails.
    pub async fn restart(&self) -> Result<Session, SupervisorError> {
        let Some(_restarting) = FlagGuard::try_raise(&self.inner.restarting) else {
            return Err(SupervisorError::RestartInProgress);
        };
        if self.inner.recovering.load(Ordering::SeqCst) {
            return Err(SupervisorError::RestartInProgress);
        }

        self.inner.bump_epoch();
        let mut slot = self.inner.slot.lock().await;
        let Some(command) = slot.command.clone() else {
            return Err(SupervisorError::NotRunning);
        };
        if let Some(running) = slot.running.take() {
            self.inner.teardown(running, true).await;
        }
        self.inner.lock_budget().reset();
        self.inner.unavailable.store(false, Ordering::SeqCst);

        self.inner
            .notifier
            .restart_attempt(RestartCause::Requested, 1, Duration::ZERO);
        match self.inner.launch(&mut slot, &command).await {
            Ok(session) => {
                self.inner
                    .notifier
                    .restart_succeeded(RestartCause::Requested, 1);
                Ok(session)
            }
            Err(error) => {
                self.inner
                    .notifier
                    .restart_failed(RestartCause::Requested, 1, &error);
                Err(error)
            }
        }
    }

    /// Shuts the server down, killing it if it does not exit in time, and
    /// cancels any pending automatic restart. Stopping a stopped supervisor
    /// does nothing.
    pub async fn stop(&self) {
        self.inner.bump_epoch();
        let mut slot = self.inner.slot.lock().await;
        if let Some(running) = slot.running.take() {
            info!(target: SUPERVISOR_TARGET, serial = running.serial, "stopping language server");
            self.inner.teardown(running, true).await;
        }
    }

    /// Sends a request to the live session and waits for its response.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::NotRunning`] or
    /// [`SupervisorError::ServerUnavailable`] when there is no live session,
    /// otherwise the session's error.
    pub async fn send_request(&self, method: &str, params: Value) -> Result<Value, SupervisorError> {
        let session = self.live_session()?;
        Ok(session.send_request(method, params).await?)
    }

    /// Sends a notification to the live session.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::NotRunning`] or
    /// [`SupervisorError::ServerUnavailable`] when there is no live session,
    /// otherwise the session's error.
    pub fn send_notification(&self, method: &str, params: Value) -> Result<(), SupervisorError> {
        Ok(self.live_session()?.send_notification(method, params)?)
    }

    /// Registers a notification handler on the live session and every later
    /// one.
    ///
    /// # Errors
    ///
    /// Returns a [`SessionError::DuplicateHandler`](crate::SessionError)
    /// if `method` already has a notification handler.
    pub fn on_notification<F>(&self, method: &str, handler: F) -> Result<(), SupervisorError>
    where
        F: Fn(Option<Value>) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        lock(&self.inner.handlers).add_notification(method, handler.clone())?;
        if let Some(session) = self.session() {
            session.on_notification(method, move |params| handler(params))?;
        }
        Ok(())
    }

    /// Registers a request handler on the live session and every later one.
    ///
    /// # Errors
    ///
    /// Returns a [`SessionError::DuplicateHandler`](crate::SessionError)
    /// if `method` already has a request handler.
    pub fn on_request<F>(&self, method: &str, handler: F) -> Result<(), SupervisorError>
    where
        F: Fn(Option<Value>) -> Result<Value, ResponseError> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        lock(&self.inner.handlers).add_request(method, handler.clone())?;
        if let Some(session) = self.session() {
            session.on_request(method, move |params| handler(params))?;
        }
        Ok(())
    }

    /// Returns the live session, if any.
    #[must_use]
    pub fn session(&self) -> Option<Session> {
        lock(&self.inner.current)
            .as_ref()
            .filter(|session| !session.state().is_terminal())
            .cloned()
    }

    /// Returns the state of the most recent session, or `None` before the
    /// first start.
    #[must_use]
    pub fn state(&self) -> Option<SessionState> {
        lock(&self.inner.current).as_ref().map(Session::state)
    }

    /// Returns whether the restart budget ran out; cleared by
    /// [`start`](Self::start) or [`restart`](Self::restart).
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        self.inner.unavailable.load(Ordering::SeqCst)
    }

    /// Returns the command of the most recent start, if any.
    pub async fn command(&self) -> Option<ServerCommand> {
        self.inner.slot.lock().await.command.clone()
    }

    fn live_session(&self) -> Result<Session, SupervisorError> {
        if let Some(session) = self.session() {
            return Ok(session);
        }
        if self.is_unavailable() {
            return Err(SupervisorError::ServerUnavailable {
                attempts: self.inner.lock_budget().attempts(),
            });
        }
        Err(SupervisorError::NotRunning)
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("state", &self.state())
            .field("unavailable", &self.is_unavailable())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn lock_budget(&self) -> MutexGuard<'_, RestartBudget> {
        lock(&self.budget)
    }

    fn current_epoch(&self) -> u64 {
        *self.epoch.borrow()
    }

    fn bump_epoch(&self) {
        self.epoch.send_modify(|epoch| *epoch += 1);
    }

    /// Sleeps for `delay`; returns `false` if the epoch moves on first.
    async fn sleep_unless_superseded(&self, delay: Duration, epoch: u64) -> bool {
        let mut epochs = self.epoch.subscribe();
        tokio::select! {
            () = tokio::time::sleep(delay) => self.current_epoch() == epoch,
            _ = async { epochs.wait_for(|current| *current != epoch).await.is_ok() } => false,
        }
    }

    /// Launches `command`, performs the handshake and installs the result
    /// in `slot`.
    async fn launch(
        self: &Arc<Self>,
        slot: &mut Slot,
        command: &ServerCommand,
    ) -> Result<Session, SupervisorError> {
        let LaunchedServer {
            reader,
            writer,
            mut process,
        } = self.launcher.launch(command, Arc::clone(&self.notifier))?;

        let options = self
            .options
            .session
            .clone()
            .with_handlers(lock(&self.handlers).clone());
        let session = Session::connect(reader, writer, options);
        self.publish(&session);

        if let Err(error) = session.initialize(self.options.capabilities.clone()).await {
            warn!(
                target: SUPERVISOR_TARGET,
                pid = process.pid(),
                error = %error,
                "language server handshake failed"
            );
            session.terminate(CloseReason::Aborted);
            process.kill();
            process.exited().await;
            return Err(SupervisorError::Handshake(error));
        }

        let serial = self.serial.fetch_add(1, Ordering::SeqCst) + 1;
        monitor::spawn(
            Arc::downgrade(self),
            session.clone(),
            process.exit_watch(),
            serial,
        );
        slot.running = Some(Running {
            session: session.clone(),
            process,
            serial,
            started_at: Instant::now(),
        });
        self.unavailable.store(false, Ordering::SeqCst);
        debug!(target: SUPERVISOR_TARGET, serial, "language server ready");
        Ok(session)
    }

    fn publish(&self, session: &Session) {
        *lock(&self.current) = Some(session.clone());
    }

    /// Ends a running server: graceful shutdown when asked and possible,
    /// then the process is given `kill_grace` before being killed.
    async fn teardown(&self, running: Running, graceful: bool) {
        let Running {
            session,
            mut process,
            serial,
            ..
        } = running;

        if graceful && session.state() == SessionState::Ready {
            match tokio::time::timeout(self.options.shutdown_timeout, session.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => warn!(
                    target: SUPERVISOR_TARGET,
                    serial,
                    error = %error,
                    "graceful shutdown failed"
                ),
                Err(_) => warn!(
                    target: SUPERVISOR_TARGET,
                    serial,
                    "graceful shutdown timed out"
                ),
            }
        }

        session.terminate(CloseReason::Stopped);
        let exit = process.terminate(self.options.kill_grace).await;
        debug!(
            target: SUPERVISOR_TARGET,
            serial,
            code = exit.code,
            forced = exit.forced,
            "language server released"
        );
    }
}

/// Holds an [`AtomicBool`] raised for its lifetime.
pub(crate) struct FlagGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> FlagGuard<'a> {
    /// Raises `flag`, or returns `None` if it is already raised.
    pub(crate) fn try_raise(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}
