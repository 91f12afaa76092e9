//! Reader task: decodes inbound frames and routes them.

use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

use super::pending::{Completion, Resolution};
use super::state::CloseReason;
use super::{SESSION_TARGET, SessionShared};
use crate::codec::{Message, RequestId, ResponseError};
use crate::transport::FrameCodec;

/// Drains `frames` until the stream ends or fails, then terminates the
/// session with the matching reason.
pub(super) async fn run<R>(shared: Arc<SessionShared>, mut frames: FramedRead<R, FrameCodec>)
where
    R: AsyncRead + Unpin,
{
    let reason = loop {
        let payload = match frames.next().await {
            None => break CloseReason::EndOfStream,
            Some(Err(error)) => {
                warn!(
                    target: SESSION_TARGET,
                    error = %error,
                    "inbound framing error"
                );
                break CloseReason::Framing {
                    message: error.to_string(),
                };
            }
            Some(Ok(payload)) => payload,
        };

        match Message::decode(&payload) {
            Ok(message) => route(&shared, message),
            Err(error) => {
                warn!(
                    target: SESSION_TARGET,
                    error = %error,
                    length = payload.len(),
                    "undecodable inbound message"
                );
                break CloseReason::Codec {
                    message: error.to_string(),
                };
            }
        }
    };

    debug!(target: SESSION_TARGET, reason = %reason, "reader finished");
    shared.terminate(reason);
}

fn route(shared: &SessionShared, message: Message) {
    match message {
        Message::Response { id, result } => deliver(shared, &id, Completion::Result(result)),
        Message::ErrorResponse {
            id: Some(id),
            error,
        } => deliver(shared, &id, Completion::Error(error)),
        Message::ErrorResponse { id: None, error } => {
            warn!(
                target: SESSION_TARGET,
                code = error.code,
                error = %error.message,
                "server reported an error without a request id"
            );
        }
        Message::Request { id, method, params } => answer(shared, id, &method, params),
        Message::Notification { method, params } => dispatch(shared, &method, params),
    }
}

fn deliver(shared: &SessionShared, id: &RequestId, completion: Completion) {
    match shared.lock_pending().resolve(id, completion) {
        Resolution::Delivered { method, elapsed } => debug!(
            target: SESSION_TARGET,
            id = %id,
            method,
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "response delivered"
        ),
        Resolution::Abandoned => debug!(
            target: SESSION_TARGET,
            id = %id,
            "dropping late response for abandoned request"
        ),
        Resolution::Unknown => warn!(
            target: SESSION_TARGET,
            id = %id,
            "dropping response with unknown id"
        ),
    }
}

fn answer(shared: &SessionShared, id: RequestId, method: &str, params: Option<Value>) {
    let handler = shared.lock_handlers().request(method);
    let reply = match handler {
        Some(handler) => match handler(params) {
            Ok(result) => Message::response(id, result),
            Err(error) => Message::error_response(Some(id), error),
        },
        None => {
            debug!(
                target: SESSION_TARGET,
                method,
                "no handler for server request"
            );
            Message::error_response(Some(id), ResponseError::method_not_found(method))
        }
    };

    if let Err(error) = shared.send(&reply) {
        warn!(
            target: SESSION_TARGET,
            method,
            error = %error,
            "failed to answer server request"
        );
    }
}

fn dispatch(shared: &SessionShared, method: &str, params: Option<Value>) {
    let handler = shared.lock_handlers().notification(method);
    match handler {
        Some(handler) => handler(params),
        None => debug!(
            target: SESSION_TARGET,
            method,
            "dropping unhandled notification"
        ),
    }
}
