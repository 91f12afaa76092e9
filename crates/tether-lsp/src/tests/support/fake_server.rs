//! In-process language server speaking framed JSON-RPC over a duplex pipe.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::{AsyncWriteExt, DuplexStream, duplex};
use tokio::sync::{mpsc, watch};
use tokio_util::bytes::Bytes;
use tokio_util::codec::FramedWrite;

use super::WAIT_LIMIT;
use crate::codec::Message;
use crate::errors::SupervisorError;
use crate::notifier::HostNotifier;
use crate::process::{
    LaunchedServer, ProcessControl, ProcessExit, ProcessHandle, ServerCommand, ServerLauncher,
};
use crate::transport::{FrameCodec, read_frames};
use crate::{Session, SessionOptions};

/// Something the fake server does in reaction to a message.
#[derive(Debug, Clone)]
pub enum FakeAction {
    /// Write a message now.
    Send(Message),
    /// Write a message after a delay, without blocking other traffic.
    SendAfter(Duration, Message),
    /// Write raw bytes, bypassing framing.
    Raw(Bytes),
    /// Close the pipe and report an exit with this code.
    Exit(Option<i32>),
}

/// Decides the fake server's reaction to each inbound message.
pub type Responder = Arc<dyn Fn(&Message) -> Vec<FakeAction> + Send + Sync>;

/// Wraps a closure as a [`Responder`].
pub fn responder<F>(reply: F) -> Responder
where
    F: Fn(&Message) -> Vec<FakeAction> + Send + Sync + 'static,
{
    Arc::new(reply)
}

/// A well-behaved server: completes the handshake, acknowledges shutdown,
/// exits on `exit` and echoes the params of every other request.
pub fn standard_reply(message: &Message) -> Vec<FakeAction> {
    match message {
        Message::Request { id, method, params } => {
            let result = match method.as_str() {
                "initialize" => json!({
                    "capabilities": {},
                    "serverInfo": { "name": "fake-server" }
                }),
                "shutdown" => Value::Null,
                _ => params.clone().unwrap_or(Value::Null),
            };
            vec![FakeAction::Send(Message::response(id.clone(), result))]
        }
        Message::Notification { method, .. } if method == "exit" => {
            vec![FakeAction::Exit(Some(0))]
        }
        _ => Vec::new(),
    }
}

/// [`standard_reply`] as a [`Responder`].
pub fn standard_responder() -> Responder {
    responder(standard_reply)
}

#[derive(Debug)]
struct Recorder {
    messages: Mutex<Vec<Message>>,
    changes: watch::Sender<usize>,
}

impl Recorder {
    fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            messages: Mutex::new(Vec::new()),
            changes,
        }
    }

    fn record(&self, message: Message) {
        let count = {
            let mut messages = self.messages.lock().expect("recorder lock");
            messages.push(message);
            messages.len()
        };
        self.changes.send_replace(count);
    }

    fn matching(&self, predicate: &dyn Fn(&Message) -> bool) -> Vec<Message> {
        self.messages
            .lock()
            .expect("recorder lock")
            .iter()
            .filter(|message| predicate(message))
            .cloned()
            .collect()
    }
}

/// Test-side handle on a running fake server.
#[derive(Debug, Clone)]
pub struct FakeLink {
    recorder: Arc<Recorder>,
    inject: mpsc::UnboundedSender<FakeAction>,
}

impl FakeLink {
    /// Returns every message the server has received so far.
    pub fn received(&self) -> Vec<Message> {
        self.recorder.matching(&|_| true)
    }

    /// Waits for the first received message matching `predicate`.
    pub async fn wait_for<P>(&self, predicate: P) -> Message
    where
        P: Fn(&Message) -> bool,
    {
        self.wait_for_count(predicate, 1)
            .await
            .into_iter()
            .next()
            .expect("at least one message")
    }

    /// Waits until `count` received messages match `predicate`.
    pub async fn wait_for_count<P>(&self, predicate: P, count: usize) -> Vec<Message>
    where
        P: Fn(&Message) -> bool,
    {
        let mut changes = self.recorder.changes.subscribe();
        let found = tokio::time::timeout(WAIT_LIMIT, async {
            loop {
                let matches = self.recorder.matching(&predicate);
                if matches.len() >= count {
                    return matches;
                }
                changes.changed().await.expect("recorder alive");
            }
        })
        .await;
        found.expect("fake server did not receive the expected messages in time")
    }

    /// Sends a message from the server.
    pub fn send(&self, message: Message) {
        self.act(FakeAction::Send(message));
    }

    /// Writes raw bytes from the server.
    pub fn send_raw(&self, bytes: &'static [u8]) {
        self.act(FakeAction::Raw(Bytes::from_static(bytes)));
    }

    /// Returns whether the server task is still serving.
    pub fn is_running(&self) -> bool {
        !self.inject.is_closed()
    }

    /// Makes the server exit with `code`.
    pub fn exit(&self, code: Option<i32>) {
        self.act(FakeAction::Exit(code));
    }

    fn act(&self, action: FakeAction) {
        // The server may already be gone; tests assert on outcomes instead.
        let _ = self.inject.send(action);
    }
}

/// Spawns a fake server; returns the client's end of the pipe.
fn spawn_server(responder: Responder, control: Option<ProcessControl>) -> (DuplexStream, FakeLink) {
    let (client, server) = duplex(64 * 1024);
    let (inject, actions) = mpsc::unbounded_channel();
    let link = FakeLink {
        recorder: Arc::new(Recorder::new()),
        inject,
    };
    tokio::spawn(serve(server, responder, link.clone(), actions, control));
    (client, link)
}

async fn serve(
    server: DuplexStream,
    responder: Responder,
    link: FakeLink,
    mut actions: mpsc::UnboundedReceiver<FakeAction>,
    mut control: Option<ProcessControl>,
) {
    let (read, write) = tokio::io::split(server);
    let mut frames = read_frames(read);
    let mut sink = FramedWrite::new(write, FrameCodec::new());

    let exit = 'serve: loop {
        let pending = tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(payload)) => {
                    let message = Message::decode(&payload).expect("client sent a valid message");
                    let reply = responder(&message);
                    link.recorder.record(message);
                    reply
                }
                _ => break 'serve ProcessExit { code: Some(0), forced: false },
            },
            Some(action) = actions.recv() => vec![action],
            () = killed(&mut control) => break 'serve ProcessExit { code: None, forced: true },
        };

        for action in pending {
            match action {
                FakeAction::Send(message) => {
                    let payload = message.encode().expect("encodable message");
                    if sink.send(payload).await.is_err() {
                        break 'serve ProcessExit { code: Some(0), forced: false };
                    }
                }
                FakeAction::SendAfter(delay, message) => {
                    let inject = link.inject.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = inject.send(FakeAction::Send(message));
                    });
                }
                FakeAction::Raw(bytes) => {
                    let writer = sink.get_mut();
                    if writer.write_all(&bytes).await.is_err() {
                        break 'serve ProcessExit { code: Some(0), forced: false };
                    }
                }
                FakeAction::Exit(code) => break 'serve ProcessExit { code, forced: false },
            }
        }
    };

    drop(sink);
    drop(frames);
    if let Some(control) = control {
        control.report_exit(exit);
    }
}

async fn killed(control: &mut Option<ProcessControl>) {
    match control {
        Some(control) => control.killed().await,
        None => std::future::pending().await,
    }
}

/// Connects a session to a fresh fake server.
pub fn fake_session(responder: Responder, options: SessionOptions) -> (Session, FakeLink) {
    let (client, link) = spawn_server(responder, None);
    let (reader, writer) = tokio::io::split(client);
    (Session::connect(reader, writer, options), link)
}

/// One scripted outcome for [`FakeLauncher`].
#[derive(Clone)]
pub enum ScriptedLaunch {
    /// Serve with this responder instead of the default one.
    Serve(Responder),
    /// Fail to spawn as if the binary were missing.
    NotFound,
}

/// Launcher that starts fake servers and remembers each one.
pub struct FakeLauncher {
    responder: Responder,
    script: Mutex<VecDeque<ScriptedLaunch>>,
    links: Mutex<Vec<FakeLink>>,
    launches: AtomicUsize,
    next_pid: AtomicU32,
}

impl FakeLauncher {
    /// Creates a launcher whose servers use `responder` unless scripted
    /// otherwise.
    pub fn new(responder: Responder) -> Self {
        Self {
            responder,
            script: Mutex::new(VecDeque::new()),
            links: Mutex::new(Vec::new()),
            launches: AtomicUsize::new(0),
            next_pid: AtomicU32::new(1000),
        }
    }

    /// Queues an outcome for a future launch.
    pub fn script(&self, launch: ScriptedLaunch) {
        self.script.lock().expect("script lock").push_back(launch);
    }

    /// Returns how many launches were attempted.
    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Returns the link to the most recently launched server.
    pub fn current_link(&self) -> FakeLink {
        self.links
            .lock()
            .expect("links lock")
            .last()
            .cloned()
            .expect("a server has been launched")
    }

    /// Returns links to every server launched so far.
    pub fn links(&self) -> Vec<FakeLink> {
        self.links.lock().expect("links lock").clone()
    }

    /// Makes the most recently launched server exit unexpectedly.
    pub fn crash_current(&self) {
        self.current_link().exit(Some(101));
    }
}

impl ServerLauncher for FakeLauncher {
    fn launch(
        &self,
        command: &ServerCommand,
        _notifier: Arc<dyn HostNotifier>,
    ) -> Result<LaunchedServer, SupervisorError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let scripted = self.script.lock().expect("script lock").pop_front();
        let responder = match scripted {
            Some(ScriptedLaunch::NotFound) => {
                return Err(SupervisorError::BinaryNotFound {
                    command: command.program.display().to_string(),
                    source: io::Error::from(io::ErrorKind::NotFound),
                });
            }
            Some(ScriptedLaunch::Serve(responder)) => responder,
            None => Arc::clone(&self.responder),
        };

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (process, control) = ProcessHandle::detached(Some(pid));
        let (client, link) = spawn_server(responder, Some(control));
        self.links.lock().expect("links lock").push(link);
        let (reader, writer) = tokio::io::split(client);
        Ok(LaunchedServer {
            reader: Box::new(reader),
            writer: Box::new(writer),
            process,
        })
    }
}
