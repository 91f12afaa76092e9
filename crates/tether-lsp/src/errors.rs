//! Error types for each layer of the client.

use std::io;

use thiserror::Error;

use crate::codec::{RequestId, ResponseError};
use crate::session::SessionState;

/// Errors raised while splitting the inbound byte stream into frames.
#[derive(Debug, Error)]
pub enum FramingError {
    /// I/O error while reading or writing the stream.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The header block ended without a `Content-Length` header.
    #[error("missing Content-Length header")]
    MissingContentLength,

    /// The `Content-Length` value is not a non-negative integer.
    #[error("invalid Content-Length value: {value:?}")]
    InvalidContentLength {
        /// The raw header value.
        value: String,
    },

    /// A header line does not contain a `:` separator.
    #[error("malformed header line: {line:?}")]
    MalformedHeader {
        /// The offending header line.
        line: String,
    },

    /// The header block is not valid UTF-8.
    #[error("header block is not valid UTF-8")]
    NonUtf8Header,

    /// No header terminator was found within the lookahead limit.
    #[error("header block exceeds {limit} bytes")]
    HeaderTooLong {
        /// Maximum header size in bytes.
        limit: usize,
    },

    /// The declared `Content-Length` is above the codec's limit.
    #[error("Content-Length {length} exceeds the frame limit of {limit} bytes")]
    FrameTooLarge {
        /// The declared payload length.
        length: usize,
        /// Largest accepted payload length.
        limit: usize,
    },

    /// The stream ended part way through a frame.
    #[error("stream ended inside a frame ({buffered} bytes buffered)")]
    TruncatedFrame {
        /// Bytes read from the incomplete frame.
        buffered: usize,
    },
}

/// Errors raised when a frame payload is not a valid JSON-RPC 2.0 message.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The payload is not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The payload is valid JSON but not an object.
    #[error("message is not a JSON object")]
    NotAnObject,

    /// The `jsonrpc` member is missing or not `"2.0"`.
    #[error("message does not declare jsonrpc \"2.0\"")]
    InvalidVersion,

    /// The `id` member is neither an integer nor a string.
    #[error("message id must be an integer or a string")]
    InvalidId,

    /// The `method` member is not a string.
    #[error("message method must be a string")]
    InvalidMethod,

    /// The `error` member does not describe a JSON-RPC error.
    #[error("malformed error object: {0}")]
    InvalidError(#[source] serde_json::Error),

    /// The members present match no message kind.
    #[error("message is neither a request, a notification nor a response")]
    Unclassifiable,
}

/// Errors surfaced by a [`Session`](crate::Session).
#[derive(Debug, Error)]
pub enum SessionError {
    /// The operation is not permitted in the session's current state.
    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        /// The attempted operation.
        operation: &'static str,
        /// The state the session was in.
        state: SessionState,
    },

    /// Writing to the server failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An outbound message could not be encoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// No response arrived within the request timeout.
    #[error("request {method} ({id}) timed out after {timeout_ms}ms")]
    Timeout {
        /// Method of the request.
        method: String,
        /// Identifier of the request.
        id: RequestId,
        /// Timeout that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// The session ended before the response arrived.
    #[error("session terminated before {method} ({id}) completed")]
    Terminated {
        /// Method of the request.
        method: String,
        /// Identifier of the request.
        id: RequestId,
    },

    /// The caller cancelled the request.
    #[error("request {method} ({id}) was cancelled")]
    Cancelled {
        /// Method of the request.
        method: String,
        /// Identifier of the request.
        id: RequestId,
    },

    /// The server answered with an error response.
    #[error("server rejected {method}: {error}")]
    Server {
        /// Method of the request.
        method: String,
        /// Error object returned by the server.
        error: ResponseError,
    },

    /// The initialize handshake failed.
    #[error("initialization failed: {message}")]
    Handshake {
        /// Description of the failure.
        message: String,
        /// Underlying session error, if any.
        #[source]
        source: Option<Box<SessionError>>,
    },

    /// A handler is already registered for the method.
    #[error("a handler for {method} is already registered")]
    DuplicateHandler {
        /// Method with the existing registration.
        method: String,
    },
}

impl SessionError {
    pub(crate) fn handshake(message: impl Into<String>, source: Option<Self>) -> Self {
        Self::Handshake {
            message: message.into(),
            source: source.map(Box::new),
        }
    }
}

/// Errors surfaced by a [`Supervisor`](crate::Supervisor).
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The language server binary was not found.
    #[error("language server binary not found: {command}")]
    BinaryNotFound {
        /// The command that was not found.
        command: String,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Spawning the language server failed for another reason.
    #[error("failed to spawn language server {command}: {source}")]
    Spawn {
        /// The command that failed.
        command: String,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The server started but the initialize handshake failed.
    #[error("language server handshake failed: {0}")]
    Handshake(#[source] SessionError),

    /// A host-requested restart is already underway.
    #[error("a restart is already in progress")]
    RestartInProgress,

    /// The restart budget is exhausted; the server stays down until started.
    #[error("language server unavailable after {attempts} restart attempts")]
    ServerUnavailable {
        /// Restart attempts made before giving up.
        attempts: u32,
    },

    /// A server is already running.
    #[error("language server is already running")]
    AlreadyRunning,

    /// No server is running.
    #[error("language server is not running")]
    NotRunning,

    /// An error from the live session.
    #[error(transparent)]
    Session(#[from] SessionError),
}
