//! Line-oriented host driving one supervised language server.
//!
//! Commands arrive one per line (see [`crate::commands`]) and each produces
//! one JSON reply line. Commands run in order; a slow request holds back the
//! lines after it. Shutdown abandons a running command without a reply.

use std::future::Future;
use std::io;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use tether_lsp::{ServerCommand, Supervisor, SupervisorError};

use crate::commands::{CommandError, HostCommand};

const HOST_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::host");

/// Label reported when no server has been started.
const NOT_STARTED: &str = "not_started";
/// Label reported once the restart budget is exhausted.
const UNAVAILABLE: &str = "unavailable";

/// One reply line written to standard output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    /// Verb of the command answered; `invalid` for unparsable lines.
    pub command: &'static str,
    /// Whether the command succeeded.
    pub ok: bool,
    /// Server state after the command.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<&'static str>,
    /// Result of a `request`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    const fn success(command: &'static str, state: &'static str) -> Self {
        Self {
            command,
            ok: true,
            state: Some(state),
            result: None,
            error: None,
        }
    }

    fn failure(command: &'static str, state: &'static str, error: &dyn std::error::Error) -> Self {
        Self {
            command,
            ok: false,
            state: Some(state),
            result: None,
            error: Some(error.to_string()),
        }
    }

    fn rejected(error: &CommandError) -> Self {
        Self {
            command: "invalid",
            ok: false,
            state: None,
            result: None,
            error: Some(error.to_string()),
        }
    }

    fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }
}

/// Missing server command when `start` is issued.
#[derive(Debug, thiserror::Error)]
#[error("no server command configured; set --server-command or TETHER_SERVER_COMMAND")]
struct NoServerCommand;

/// Host wrapping a [`Supervisor`] and the configured server command.
pub struct Host {
    supervisor: Supervisor,
    command: Option<ServerCommand>,
}

impl Host {
    /// Builds a host; `command` is launched by `start`.
    #[must_use]
    pub const fn new(supervisor: Supervisor, command: Option<ServerCommand>) -> Self {
        Self {
            supervisor,
            command,
        }
    }

    /// Returns the supervisor.
    #[must_use]
    pub const fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Returns the configured server command.
    #[must_use]
    pub const fn command(&self) -> Option<&ServerCommand> {
        self.command.as_ref()
    }

    /// Returns the label describing the server's state.
    #[must_use]
    pub fn state_label(&self) -> &'static str {
        if self.supervisor.is_unavailable() {
            return UNAVAILABLE;
        }
        self.supervisor
            .state()
            .map_or(NOT_STARTED, |state| state.as_str())
    }

    /// Runs one command.
    pub async fn execute(&self, command: HostCommand) -> Reply {
        let verb = command.verb();
        debug!(target: HOST_TARGET, command = %command, "executing host command");
        let outcome = match command {
            HostCommand::Start => match &self.command {
                Some(server) => self
                    .supervisor
                    .start(server.clone())
                    .await
                    .map(|_| Value::Null),
                None => return Reply::failure(verb, self.state_label(), &NoServerCommand),
            },
            HostCommand::Restart => self.supervisor.restart().await.map(|_| Value::Null),
            HostCommand::Stop | HostCommand::Quit => {
                self.supervisor.stop().await;
                Ok(Value::Null)
            }
            HostCommand::State => Ok(Value::Null),
            HostCommand::Request { method, params } => {
                self.supervisor.send_request(&method, params).await
            }
            HostCommand::Notify { method, params } => self
                .supervisor
                .send_notification(&method, params)
                .map(|()| Value::Null),
        };
        self.reply(verb, outcome)
    }

    fn reply(&self, verb: &'static str, outcome: Result<Value, SupervisorError>) -> Reply {
        let state = self.state_label();
        match outcome {
            Ok(Value::Null) if verb != "request" => Reply::success(verb, state),
            Ok(result) => Reply::success(verb, state).with_result(result),
            Err(error) => {
                warn!(target: HOST_TARGET, command = verb, error = %error, "host command failed");
                Reply::failure(verb, state, &error)
            }
        }
    }

    /// Launches the configured server, if any, logging a failure.
    pub async fn autostart(&self) {
        if self.command.is_none() {
            return;
        }
        let reply = self.execute(HostCommand::Start).await;
        if reply.ok {
            info!(target: HOST_TARGET, state = reply.state, "language server started");
        }
    }

    /// Reads commands from `input` and writes replies to `output` until
    /// `quit`, end of input or `shutdown` resolves, then stops the server.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when reading a command or writing a reply fails.
    /// The server is stopped either way.
    pub async fn serve<R, W, S>(&self, input: R, mut output: W, shutdown: S) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
        S: Future<Output = ()>,
    {
        let result = self.command_loop(input, &mut output, shutdown).await;
        self.supervisor.stop().await;
        info!(target: HOST_TARGET, "host stopped");
        result
    }

    async fn command_loop<R, W, S>(&self, input: R, output: &mut W, shutdown: S) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
        S: Future<Output = ()>,
    {
        let mut lines = input.lines();
        tokio::pin!(shutdown);
        loop {
            let next = tokio::select! {
                read = lines.next_line() => read?,
                () = &mut shutdown => {
                    info!(target: HOST_TARGET, "shutdown requested");
                    return Ok(());
                }
            };
            let Some(line) = next else {
                debug!(target: HOST_TARGET, "input closed");
                return Ok(());
            };
            if line.trim().is_empty() {
                continue;
            }
            let (reply, quit) = match line.parse::<HostCommand>() {
                Ok(command) => {
                    let is_quit = command == HostCommand::Quit;
                    tokio::select! {
                        done = self.execute(command) => (done, is_quit),
                        () = &mut shutdown => {
                            info!(target: HOST_TARGET, "shutdown requested during a command");
                            return Ok(());
                        }
                    }
                }
                Err(error) => (Reply::rejected(&error), false),
            };
            write_reply(output, &reply).await?;
            if quit {
                return Ok(());
            }
        }
    }
}

async fn write_reply<W>(output: &mut W, reply: &Reply) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(reply).map_err(io::Error::other)?;
    line.push(b'\n');
    output.write_all(&line).await?;
    output.flush().await
}
