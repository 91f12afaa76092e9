//! Crash detection and automatic restarts.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use super::{FlagGuard, Inner, SUPERVISOR_TARGET};
use crate::notifier::RestartCause;
use crate::process::ProcessExit;
use crate::session::{CloseReason, Session, SessionState};

/// Spawns the task watching one session and its process.
pub(super) fn spawn(
    inner: Weak<Inner>,
    session: Session,
    exit: watch::Receiver<Option<ProcessExit>>,
    serial: u64,
) {
    tokio::spawn(watch_session(inner, session, exit, serial));
}

/// Hands an unexpected ending of the session to the restart path.
async fn watch_session(
    inner: Weak<Inner>,
    session: Session,
    exit: watch::Receiver<Option<ProcessExit>>,
    serial: u64,
) {
    let state = tokio::select! {
        state = session.closed() => state,
        Some(ended) = process_exit(exit) => {
            session.terminate(CloseReason::ProcessExited { code: ended.code })
        }
    };

    if state != SessionState::Crashed {
        debug!(target: SUPERVISOR_TARGET, serial, state = %state, "session closed");
        return;
    }
    let Some(inner) = inner.upgrade() else {
        return;
    };
    handle_crash(inner, serial).await;
}

async fn process_exit(mut exit: watch::Receiver<Option<ProcessExit>>) -> Option<ProcessExit> {
    exit.wait_for(Option::is_some)
        .await
        .ok()
        .and_then(|state| *state)
}

async fn handle_crash(inner: Arc<Inner>, serial: u64) {
    let _recovering = FlagGuard::try_raise(&inner.recovering);
    let (uptime, epoch) = {
        let mut slot = inner.slot.lock().await;
        let is_current = slot
            .running
            .as_ref()
            .is_some_and(|running| running.serial == serial);
        if !is_current {
            return;
        }
        let Some(mut running) = slot.running.take() else {
            return;
        };
        warn!(
            target: SUPERVISOR_TARGET,
            serial,
            pid = running.process.pid(),
            reason = ?running.session.close_reason(),
            "language server exited unexpectedly"
        );
        running.process.terminate(inner.options.kill_grace).await;
        (running.started_at.elapsed(), inner.current_epoch())
    };

    auto_restart(&inner, uptime, epoch).await;
}

async fn auto_restart(inner: &Arc<Inner>, uptime: Duration, epoch: u64) {
    let policy = &inner.options.restart_policy;
    inner.lock_budget().record_crash(policy, uptime);

    loop {
        let next = inner.lock_budget().next_attempt(policy);
        let Some(attempt) = next else {
            let attempts = inner.lock_budget().attempts();
            inner.unavailable.store(true, Ordering::SeqCst);
            inner.notifier.server_unavailable(attempts);
            return;
        };

        let delay = policy.delay_for(attempt);
        inner
            .notifier
            .restart_attempt(RestartCause::Crash, attempt, delay);
        if !inner.sleep_unless_superseded(delay, epoch).await {
            debug!(target: SUPERVISOR_TARGET, attempt, "automatic restart superseded");
            return;
        }

        let mut slot = inner.slot.lock().await;
        if inner.current_epoch() != epoch || slot.running.is_some() {
            debug!(target: SUPERVISOR_TARGET, attempt, "automatic restart superseded");
            return;
        }
        let Some(command) = slot.command.clone() else {
            return;
        };

        match inner.launch(&mut slot, &command).await {
            Ok(_) => {
                inner.notifier.restart_succeeded(RestartCause::Crash, attempt);
                return;
            }
            Err(error) => {
                inner
                    .notifier
                    .restart_failed(RestartCause::Crash, attempt, &error);
            }
        }
    }
}
