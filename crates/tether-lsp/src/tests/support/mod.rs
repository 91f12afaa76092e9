//! Shared fixtures and helpers for session and supervisor tests.

mod fake_server;
mod recording_notifier;

use std::sync::Arc;
use std::time::Duration;

pub use fake_server::{
    FakeAction, FakeLauncher, FakeLink, Responder, ScriptedLaunch, fake_session, responder,
    standard_reply, standard_responder,
};
pub use recording_notifier::{HostEvent, RecordingNotifier};

use crate::{Session, SessionOptions};

/// Upper bound on any wait in tests; with paused time it only elapses when
/// nothing else can make progress.
pub const WAIT_LIMIT: Duration = Duration::from_secs(30);

/// Builds session options reporting to `notifier`.
pub fn options_with(notifier: &Arc<RecordingNotifier>) -> SessionOptions {
    SessionOptions::default().with_notifier(notifier.clone())
}

/// Connects a session to a fake server and completes the handshake.
pub async fn ready_session(responder: Responder, options: SessionOptions) -> (Session, FakeLink) {
    let (session, link) = fake_session(responder, options);
    session
        .initialize(lsp_types::ClientCapabilities::default())
        .await
        .expect("handshake should succeed");
    (session, link)
}
