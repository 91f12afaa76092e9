//! Language server processes and the seam that launches them.
//!
//! [`ProcessLauncher`] spawns the configured command with piped standard
//! streams. A reaper task owns the child: it waits for the exit, or kills the
//! child once its [`ProcessHandle`] asks to or is dropped, and publishes the
//! exit on a `watch` channel. Standard error is forwarded line by line to
//! [`HostNotifier::server_log`].

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tether_config::{Config, ConfigError};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info};

use crate::errors::SupervisorError;
use crate::notifier::HostNotifier;

const PROCESS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::process");

/// Command line used to start a language server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCommand {
    /// Executable to run, resolved through `PATH` when relative.
    pub program: PathBuf,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Working directory; inherited when `None`.
    pub working_dir: Option<PathBuf>,
}

impl ServerCommand {
    /// Creates a command that inherits the working directory.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
        }
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Builds the command from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingServerCommand`] when no server command
    /// is configured.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let program = config.server_command()?;
        let command = Self::new(program.as_std_path(), config.server_args.clone());
        Ok(match &config.working_dir {
            Some(dir) => command.with_working_dir(dir.as_std_path()),
            None => command,
        })
    }
}

impl fmt::Display for ServerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// How a server process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code; `None` when terminated by a signal or unknown.
    pub code: Option<i32>,
    /// Whether the process was killed on request.
    pub forced: bool,
}

impl ProcessExit {
    fn from_status(status: io::Result<ExitStatus>, forced: bool) -> Self {
        Self {
            code: status.ok().and_then(|status| status.code()),
            forced,
        }
    }
}

/// Owning handle to a running server process.
///
/// Dropping the handle kills the process.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    kill: Option<oneshot::Sender<()>>,
    exit: watch::Receiver<Option<ProcessExit>>,
}

/// The other end of a [`ProcessHandle`], held by whatever runs the process.
#[derive(Debug)]
pub struct ProcessControl {
    kill: Option<oneshot::Receiver<()>>,
    exit: watch::Sender<Option<ProcessExit>>,
}

impl ProcessHandle {
    /// Creates a handle and its control end without spawning anything.
    ///
    /// [`ProcessLauncher`] pairs the control end with a reaper task; test
    /// launchers drive it directly.
    #[must_use]
    pub fn detached(pid: Option<u32>) -> (Self, ProcessControl) {
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        (
            Self {
                pid,
                kill: Some(kill_tx),
                exit: exit_rx,
            },
            ProcessControl {
                kill: Some(kill_rx),
                exit: exit_tx,
            },
        )
    }

    /// Returns the OS process id, if known.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the exit, once the process has ended.
    #[must_use]
    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit.borrow()
    }

    /// Returns whether the process is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.exit_status().is_none()
    }

    /// Waits for the process to end.
    pub async fn exited(&self) -> ProcessExit {
        let mut exit = self.exit.clone();
        let outcome = exit.wait_for(Option::is_some).await.map(|state| *state);
        outcome.ok().flatten().unwrap_or(ProcessExit {
            code: None,
            forced: false,
        })
    }

    pub(crate) fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit.clone()
    }

    /// Asks the runner to kill the process; later calls have no effect.
    pub fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }

    /// Waits up to `grace` for the process to exit, then kills it.
    pub async fn terminate(&mut self, grace: Duration) -> ProcessExit {
        if let Ok(exit) = tokio::time::timeout(grace, self.exited()).await {
            return exit;
        }
        debug!(
            target: PROCESS_TARGET,
            pid = self.pid,
            "grace period elapsed; killing language server"
        );
        self.kill();
        self.exited().await
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.kill();
    }
}

impl ProcessControl {
    /// Resolves once the handle requests a kill or is dropped; pends forever
    /// after that.
    pub async fn killed(&mut self) {
        match self.kill.as_mut() {
            Some(receiver) => {
                let _ = receiver.await;
                self.kill = None;
            }
            None => std::future::pending().await,
        }
    }

    /// Publishes the exit; only the first report is kept.
    pub fn report_exit(&self, exit: ProcessExit) {
        self.exit.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(exit);
            true
        });
    }
}

/// Streams and handle of a launched server.
pub struct LaunchedServer {
    /// The server's output stream.
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// The server's input stream.
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// Handle owning the process.
    pub process: ProcessHandle,
}

impl fmt::Debug for LaunchedServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchedServer")
            .field("process", &self.process)
            .finish_non_exhaustive()
    }
}

/// Starts language servers for a supervisor.
pub trait ServerLauncher: Send + Sync {
    /// Launches `command`, forwarding its diagnostics output to `notifier`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::BinaryNotFound`] or
    /// [`SupervisorError::Spawn`] when the process cannot be started.
    fn launch(
        &self,
        command: &ServerCommand,
        notifier: Arc<dyn HostNotifier>,
    ) -> Result<LaunchedServer, SupervisorError>;
}

/// Launches servers as OS child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl ServerLauncher for ProcessLauncher {
    fn launch(
        &self,
        command: &ServerCommand,
        notifier: Arc<dyn HostNotifier>,
    ) -> Result<LaunchedServer, SupervisorError> {
        debug!(
            target: PROCESS_TARGET,
            command = %command.program.display(),
            args = ?command.args,
            "spawning language server process"
        );

        let mut process = Command::new(&command.program);
        process
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.working_dir {
            process.current_dir(dir);
        }

        let mut child = process.spawn().map_err(|source| {
            let program = command.program.display().to_string();
            if source.kind() == io::ErrorKind::NotFound {
                SupervisorError::BinaryNotFound {
                    command: program,
                    source,
                }
            } else {
                SupervisorError::Spawn {
                    command: program,
                    source,
                }
            }
        })?;

        let stdin = child.stdin.take().ok_or_else(|| missing_pipe(command, "stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| missing_pipe(command, "stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr, notifier));
        }

        let pid = child.id();
        let (handle, control) = ProcessHandle::detached(pid);
        tokio::spawn(reap(child, control));

        info!(
            target: PROCESS_TARGET,
            pid,
            command = %command,
            "language server process spawned"
        );

        Ok(LaunchedServer {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            process: handle,
        })
    }
}

fn missing_pipe(command: &ServerCommand, stream: &str) -> SupervisorError {
    SupervisorError::Spawn {
        command: command.program.display().to_string(),
        source: io::Error::other(format!("failed to capture {stream}")),
    }
}

async fn reap(mut child: Child, mut control: ProcessControl) {
    let pid = child.id();
    let exit = tokio::select! {
        status = child.wait() => ProcessExit::from_status(status, false),
        () = control.killed() => {
            if let Err(error) = child.start_kill() {
                debug!(target: PROCESS_TARGET, pid, error = %error, "kill failed");
            }
            ProcessExit::from_status(child.wait().await, true)
        }
    };
    debug!(
        target: PROCESS_TARGET,
        pid,
        code = exit.code,
        forced = exit.forced,
        "language server process exited"
    );
    control.report_exit(exit);
}

/// Forwards stderr line by line; bytes that are not UTF-8 are replaced
/// rather than ending the stream.
async fn forward_stderr(stderr: ChildStderr, notifier: Arc<dyn HostNotifier>) {
    let mut reader = BufReader::new(stderr);
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer).await {
            Ok(0) => break,
            Ok(_) => notifier.server_log(&stderr_line(&buffer)),
            Err(error) => {
                debug!(
                    target: PROCESS_TARGET,
                    error = %error,
                    "stopped reading language server stderr"
                );
                break;
            }
        }
    }
}

fn stderr_line(raw: &[u8]) -> String {
    let trimmed = raw
        .strip_suffix(b"\n")
        .map_or(raw, |line| line.strip_suffix(b"\r").unwrap_or(line));
    String::from_utf8_lossy(trimmed).into_owned()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::tests::support::{HostEvent, RecordingNotifier};

    #[rstest]
    fn command_displays_program_and_arguments() {
        let command = ServerCommand::new("rust-analyzer", vec!["--log".into(), "x".into()]);

        assert_eq!(command.to_string(), "rust-analyzer --log x");
    }

    #[tokio::test]
    async fn missing_binary_is_reported_as_not_found() {
        let notifier = Arc::new(RecordingNotifier::default());
        let command = ServerCommand::new("/nonexistent/tether-test-server", Vec::new());

        let error = ProcessLauncher
            .launch(&command, notifier)
            .expect_err("launch should fail");

        assert!(matches!(error, SupervisorError::BinaryNotFound { .. }));
    }

    #[tokio::test]
    async fn dropping_the_handle_kills_the_runner() {
        let (handle, mut control) = ProcessHandle::detached(None);
        drop(handle);

        tokio::time::timeout(Duration::from_secs(1), control.killed())
            .await
            .expect("kill requested");
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_kills_after_the_grace_period() {
        let (mut handle, mut control) = ProcessHandle::detached(Some(42));
        let runner = tokio::spawn(async move {
            control.killed().await;
            control.report_exit(ProcessExit {
                code: None,
                forced: true,
            });
        });

        let exit = handle.terminate(Duration::from_millis(200)).await;
        runner.await.expect("runner");

        assert!(exit.forced);
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn only_the_first_exit_report_counts() {
        let (handle, control) = ProcessHandle::detached(None);
        control.report_exit(ProcessExit {
            code: Some(0),
            forced: false,
        });
        control.report_exit(ProcessExit {
            code: Some(9),
            forced: true,
        });

        assert_eq!(handle.exited().await.code, Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn forwards_stderr_and_reports_exit_code() {
        let notifier = Arc::new(RecordingNotifier::default());
        let command = ServerCommand::new(
            "/bin/sh",
            vec!["-c".into(), "echo starting up >&2; exit 3".into()],
        );

        let launched = ProcessLauncher
            .launch(&command, notifier.clone())
            .expect("spawn sh");
        let exit = tokio::time::timeout(Duration::from_secs(10), launched.process.exited())
            .await
            .expect("process exits");

        assert_eq!(exit.code, Some(3));
        assert!(!exit.forced);
        notifier
            .wait_for(|event| matches!(event, HostEvent::ServerLog(line) if line == "starting up"))
            .await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn invalid_utf8_on_stderr_does_not_stop_forwarding() {
        let notifier = Arc::new(RecordingNotifier::default());
        let command = ServerCommand::new(
            "/bin/sh",
            vec![
                "-c".into(),
                r"printf 'bad \377\n' >&2; echo after >&2".into(),
            ],
        );

        let launched = ProcessLauncher
            .launch(&command, notifier.clone())
            .expect("spawn sh");
        tokio::time::timeout(Duration::from_secs(10), launched.process.exited())
            .await
            .expect("process exits");

        notifier
            .wait_for(|event| matches!(event, HostEvent::ServerLog(line) if line == "bad \u{fffd}"))
            .await;
        notifier
            .wait_for(|event| matches!(event, HostEvent::ServerLog(line) if line == "after"))
            .await;
    }

    #[rstest]
    #[case::plain(b"ready\n".as_slice(), "ready")]
    #[case::crlf(b"ready\r\n".as_slice(), "ready")]
    #[case::unterminated(b"partial".as_slice(), "partial")]
    #[case::invalid_utf8(b"bad \xff\n".as_slice(), "bad \u{fffd}")]
    fn stderr_lines_are_trimmed_and_lossy(#[case] raw: &[u8], #[case] expected: &str) {
        assert_eq!(stderr_line(raw), expected);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_kills_a_process_that_does_not_exit() {
        let notifier = Arc::new(RecordingNotifier::default());
        let command = ServerCommand::new("/bin/sh", vec!["-c".into(), "sleep 30".into()]);
        let mut launched = ProcessLauncher.launch(&command, notifier).expect("spawn sh");

        let exit = tokio::time::timeout(
            Duration::from_secs(10),
            launched.process.terminate(Duration::from_millis(50)),
        )
        .await
        .expect("terminated");

        assert!(exit.forced);
        assert!(!launched.process.is_running());
    }
}
