//! Language Server Protocol client transport core.
//!
//! The crate spawns and supervises a language server process, frames
//! JSON-RPC 2.0 messages over its standard streams, correlates requests with
//! responses, and recovers from crashes according to a restart policy. It is
//! layered leaves first:
//!
//! - [`transport`]: `Content-Length` framing over a duplex byte stream.
//! - [`codec`]: JSON-RPC envelopes to and from raw payloads.
//! - [`Session`]: one connection's handshake, pending requests and handler
//!   dispatch.
//! - [`Supervisor`]: process lifecycle, crash detection and restarts.
//!
//! Editor integrations sit on top of [`Supervisor`] and observe it through
//! the [`HostNotifier`] trait; they never reach into the layers below.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tether_lsp::{ServerCommand, Supervisor, SupervisorOptions, TracingNotifier};
//!
//! let supervisor = Supervisor::new(SupervisorOptions::default(), Arc::new(TracingNotifier));
//! let session = supervisor
//!     .start(ServerCommand::new("rust-analyzer", Vec::new()))
//!     .await?;
//! let symbols = session
//!     .send_request("workspace/symbol", serde_json::json!({ "query": "main" }))
//!     .await?;
//! supervisor.stop().await;
//! ```

pub mod codec;
mod errors;
mod notifier;
mod process;
mod session;
mod supervisor;
pub mod transport;

#[cfg(test)]
mod tests;

pub use codec::{Message, RequestId, ResponseError};
pub use errors::{CodecError, FramingError, SessionError, SupervisorError};
pub use notifier::{HostNotifier, RestartCause, TracingNotifier};
pub use process::{
    LaunchedServer, ProcessControl, ProcessExit, ProcessHandle, ProcessLauncher, ServerCommand,
    ServerLauncher,
};
pub use session::{
    CloseReason, HandlerRegistry, NotificationHandler, PendingResponse, RequestHandler, Session,
    SessionOptions, SessionState,
};
pub use supervisor::{RestartPolicy, Supervisor, SupervisorOptions};
pub use tether_config::RestartMode;
