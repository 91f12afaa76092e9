//! Session lifecycle states.

use std::fmt;

/// Lifecycle state of one server connection.
///
/// States advance `Uninitialized → Initializing → Ready → ShuttingDown →
/// Stopped`; `Crashed` is reachable from any non-terminal state when the
/// connection ends unexpectedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Connected, handshake not started.
    Uninitialized,
    /// `initialize` sent, awaiting its response.
    Initializing,
    /// Handshake complete; requests are accepted.
    Ready,
    /// `shutdown` sent; new requests are rejected.
    ShuttingDown,
    /// Connection closed after an orderly shutdown or an explicit stop.
    Stopped,
    /// Connection closed unexpectedly.
    Crashed,
}

impl SessionState {
    /// Returns whether the state is final.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed)
    }

    /// Returns the state as a `snake_case` label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session's connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The server closed its output stream.
    EndOfStream,
    /// The inbound byte stream was not validly framed.
    Framing {
        /// Description of the framing error.
        message: String,
    },
    /// A frame did not hold a JSON-RPC message.
    Codec {
        /// Description of the codec error.
        message: String,
    },
    /// The server process exited.
    ProcessExited {
        /// Exit code, if the process exited normally.
        code: Option<i32>,
    },
    /// The owner stopped the session on purpose.
    Stopped,
    /// The owner abandoned the session after a failed handshake.
    Aborted,
}

impl CloseReason {
    /// Returns whether the owner ended the session on purpose.
    #[must_use]
    pub const fn is_intentional(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EndOfStream => f.write_str("server closed the connection"),
            Self::Framing { message } => write!(f, "framing error: {message}"),
            Self::Codec { message } => write!(f, "codec error: {message}"),
            Self::ProcessExited { code: Some(code) } => {
                write!(f, "server process exited with code {code}")
            }
            Self::ProcessExited { code: None } => {
                f.write_str("server process terminated by signal")
            }
            Self::Stopped => f.write_str("session stopped"),
            Self::Aborted => f.write_str("session aborted"),
        }
    }
}
