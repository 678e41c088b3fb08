//! Connection to the bridged subprocess.
//!
//! A [`Connection`] is a cheap, cloneable handle to one actor task that owns
//! the subprocess, the pending-command table and the handshake. Every inbound
//! line and every outbound command is processed on that task, so no table is
//! ever shared between threads.

use std::convert::Infallible;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use sidecar_core::protocol::{
    DecodeError, Envelope, Response, ReverseRequest, VersionPolicy, decode_line_with,
    encode_request, encode_response,
};
use sidecar_core::{BridgeConfig, Payload, Store};
use tokio::io::AsyncReadExt;
use tokio::process::ChildStdout;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::auth::AuthDispatcher;
use crate::error::{BridgeError, ExitReason, SpawnError};
use crate::events::{Converter, EventDispatcher, EventHandler, EventMode};
use crate::handshake::{Ack, Handshake};
use crate::lines::LineBuffer;
use crate::pending::{PendingCommand, PendingTable, arm_timer};
use crate::process::Subprocess;

/// Command name of the handshake request.
pub const INIT_COMMAND: &str = "init";

const READ_CHUNK: usize = 64 * 1024;
const LOG_PREVIEW_CHARS: usize = 200;

type Outcome = Result<Payload, BridgeError>;

/// Observable lifecycle of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Starting,
    AwaitingAck,
    Ready,
    Terminated(ExitReason),
}

impl ConnectionStatus {
    const fn exit_reason(&self) -> Option<&ExitReason> {
        match self {
            Self::Terminated(reason) => Some(reason),
            _ => None,
        }
    }
}

#[derive(Debug)]
enum ActorMsg {
    Command {
        cmd: String,
        args: Payload,
        timeout: Option<Duration>,
        reply: oneshot::Sender<Outcome>,
    },
    Shutdown,
}

/// Handle to a running connection.
///
/// Dropping the last handle shuts the connection down.
#[derive(Debug, Clone)]
pub struct Connection {
    inbox: mpsc::UnboundedSender<ActorMsg>,
    status: watch::Receiver<ConnectionStatus>,
    default_timeout: Option<Duration>,
}

impl Connection {
    /// Spawn the subprocess and start the connection task.
    ///
    /// Returns once the process is running; the handshake continues in the
    /// background (see [`wait_ready`](Self::wait_ready)). Must be called from
    /// within a Tokio runtime.
    pub fn start<C, H>(
        config: BridgeConfig,
        store: Arc<dyn Store>,
        mode: EventMode<C>,
        handler: H,
    ) -> Result<Self, SpawnError>
    where
        C: Converter,
        H: EventHandler<C::Output>,
    {
        let mut process = Subprocess::spawn(&config)?;
        let stdout = process
            .take_stdout()
            .ok_or_else(|| SpawnError::SpawnFailed {
                reason: "stdout already taken".to_string(),
            })?;

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Starting);
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();

        let actor = Actor {
            process,
            stdout,
            lines: LineBuffer::new(config.max_line_bytes),
            inbox: inbox_rx,
            status: status_tx,
            pending: PendingTable::new(),
            expired_tx,
            expired_rx,
            handshake: Handshake::new(config.init_timeout()),
            auth: AuthDispatcher::new(store),
            events: EventDispatcher::new(mode, handler),
            policy: config.version_policy,
            init_args: config.init_args.clone(),
            terminate_timeout: config.terminate_timeout(),
        };
        tokio::spawn(actor.run());

        Ok(Self {
            inbox: inbox_tx,
            status: status_rx,
            default_timeout: config.command_timeout(),
        })
    }

    /// [`start`](Self::start) without event conversion.
    pub fn start_raw<H>(config: BridgeConfig, store: Arc<dyn Store>, handler: H) -> Result<Self, SpawnError>
    where
        H: EventHandler<Infallible>,
    {
        Self::start(config, store, EventMode::raw(), handler)
    }

    /// Issue `cmd`. `timeout` of `None` waits indefinitely.
    ///
    /// The command is rejected with [`BridgeError::NotInitialized`] until the
    /// handshake completes, and with [`BridgeError::Closed`] once the
    /// connection has terminated.
    pub fn send(&self, cmd: impl Into<String>, args: Payload, timeout: Option<Duration>) -> PendingReply {
        let (reply, rx) = oneshot::channel();
        let msg = ActorMsg::Command {
            cmd: cmd.into(),
            args,
            timeout,
            reply,
        };
        // If the task is gone the reply sender is dropped with the message
        // and the caller gets the close reason instead.
        self.inbox.send(msg).ok();
        PendingReply {
            reply: rx,
            status: self.status.clone(),
        }
    }

    /// Issue `cmd` with the configured default timeout.
    pub async fn call(&self, cmd: impl Into<String>, args: Payload) -> Result<Payload, BridgeError> {
        self.send(cmd, args, self.default_timeout).await
    }

    pub async fn call_with_timeout(
        &self,
        cmd: impl Into<String>,
        args: Payload,
        timeout: Option<Duration>,
    ) -> Result<Payload, BridgeError> {
        self.send(cmd, args, timeout).await
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// Wait until the handshake completes, or for the reason it never will.
    pub async fn wait_ready(&self) -> Result<(), ExitReason> {
        let mut status = self.status.clone();
        let settled = status
            .wait_for(|s| matches!(s, ConnectionStatus::Ready | ConnectionStatus::Terminated(_)))
            .await
            .map_err(|_| task_gone())?;
        settled.exit_reason().cloned().map_or(Ok(()), Err)
    }

    /// Wait until the connection has terminated and the subprocess is gone.
    pub async fn closed(&self) -> ExitReason {
        exit_reason(self.status.clone()).await
    }

    /// Stop the connection: in-flight commands fail with
    /// `Closed(Shutdown)`, and the subprocess is asked to exit and killed if
    /// it does not.
    pub async fn shutdown(&self) -> ExitReason {
        self.inbox.send(ActorMsg::Shutdown).ok();
        self.closed().await
    }
}

/// A command in flight; await it for the result.
#[derive(Debug)]
pub struct PendingReply {
    reply: oneshot::Receiver<Outcome>,
    status: watch::Receiver<ConnectionStatus>,
}

impl IntoFuture for PendingReply {
    type Output = Outcome;
    type IntoFuture = Pin<Box<dyn Future<Output = Outcome> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            match self.reply.await {
                Ok(outcome) => outcome,
                Err(_) => Err(BridgeError::Closed(exit_reason(self.status).await)),
            }
        })
    }
}

async fn exit_reason(mut status: watch::Receiver<ConnectionStatus>) -> ExitReason {
    status
        .wait_for(|s| s.exit_reason().is_some())
        .await
        .ok()
        .and_then(|s| s.exit_reason().cloned())
        .unwrap_or_else(task_gone)
}

fn task_gone() -> ExitReason {
    ExitReason::Io("connection task ended without a reason".to_string())
}

enum Step {
    Inbox(Option<ActorMsg>),
    Stdout(std::io::Result<usize>),
    Expired(String),
    InitDeadline,
}

struct Actor<C: Converter, H> {
    process: Subprocess,
    stdout: ChildStdout,
    lines: LineBuffer,
    inbox: mpsc::UnboundedReceiver<ActorMsg>,
    status: watch::Sender<ConnectionStatus>,
    pending: PendingTable<Outcome>,
    expired_tx: mpsc::UnboundedSender<String>,
    expired_rx: mpsc::UnboundedReceiver<String>,
    handshake: Handshake,
    auth: AuthDispatcher,
    events: EventDispatcher<C, H>,
    policy: VersionPolicy,
    init_args: Payload,
    terminate_timeout: Duration,
}

impl<C, H> Actor<C, H>
where
    C: Converter,
    H: EventHandler<C::Output>,
{
    async fn run(mut self) {
        let reason = self.drive().await;
        self.teardown(reason).await;
    }

    async fn drive(&mut self) -> ExitReason {
        if let Err(reason) = self.send_init() {
            return reason;
        }

        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let step = tokio::select! {
                msg = self.inbox.recv() => Step::Inbox(msg),
                read = self.stdout.read(&mut buf) => Step::Stdout(read),
                Some(id) = self.expired_rx.recv() => Step::Expired(id),
                () = self.handshake.expired() => Step::InitDeadline,
            };

            let outcome = match step {
                Step::Inbox(Some(ActorMsg::Command {
                    cmd,
                    args,
                    timeout,
                    reply,
                })) => self.on_command(cmd, &args, timeout, reply).await,
                Step::Inbox(Some(ActorMsg::Shutdown) | None) => Err(ExitReason::Shutdown),
                Step::Stdout(Ok(0)) => Err(self.process_gone().await),
                Step::Stdout(Ok(n)) => self.on_output(&buf[..n]),
                Step::Stdout(Err(e)) => Err(ExitReason::Io(e.to_string())),
                Step::Expired(id) => {
                    self.on_expired(&id);
                    Ok(())
                }
                Step::InitDeadline => Err(ExitReason::InitTimeout {
                    timeout: self.handshake.timeout(),
                }),
            };
            if let Err(reason) = outcome {
                return reason;
            }
        }
    }

    fn send_init(&mut self) -> Result<(), ExitReason> {
        let id = self.pending.allocate_id();
        let line = encode_request(&id, INIT_COMMAND, &self.init_args);
        self.process
            .write_line(line)
            .map_err(|e| ExitReason::Io(e.to_string()))?;
        debug!(%id, "Init sent");
        self.handshake.begin(id);
        self.status.send_replace(ConnectionStatus::AwaitingAck);
        Ok(())
    }

    async fn on_command(
        &mut self,
        cmd: String,
        args: &Payload,
        timeout: Option<Duration>,
        reply: oneshot::Sender<Outcome>,
    ) -> Result<(), ExitReason> {
        if !self.handshake.is_ready() {
            debug!(cmd = %cmd, state = ?self.handshake.state(), "Rejecting command before init completed");
            reply.send(Err(BridgeError::NotInitialized)).ok();
            return Ok(());
        }

        let id = self.pending.allocate_id();
        let line = encode_request(&id, &cmd, args);
        let timer = timeout.map(|after| arm_timer(id.clone(), after, self.expired_tx.clone()));
        debug!(%id, cmd = %cmd, ?timeout, "Sending command");
        if let Err(entry) = self
            .pending
            .insert(id.clone(), PendingCommand::new(cmd, reply, timeout, timer))
        {
            error!(%id, "Correlation id already in flight");
            entry.complete(Err(BridgeError::Closed(ExitReason::Io(
                "correlation id collision".to_string(),
            ))));
            return Ok(());
        }

        if self.process.write_line(line).is_err() {
            return Err(self.process_gone().await);
        }
        Ok(())
    }

    fn on_output(&mut self, chunk: &[u8]) -> Result<(), ExitReason> {
        let lines = self
            .lines
            .push(chunk)
            .map_err(|e| ExitReason::LineTooLong { limit: e.limit })?;
        for line in lines {
            self.on_line(&line)?;
        }
        Ok(())
    }

    fn on_line(&mut self, raw: &[u8]) -> Result<(), ExitReason> {
        let Ok(line) = std::str::from_utf8(raw) else {
            warn!(len = raw.len(), "Skipping non-UTF-8 line");
            return Ok(());
        };

        match decode_line_with(line, self.policy) {
            Ok(Envelope::Response(response)) => self.on_response(response),
            Ok(Envelope::Event(event)) => {
                self.events.dispatch(event);
                Ok(())
            }
            Ok(Envelope::ReverseRequest(request)) => {
                self.on_reverse_request(request);
                Ok(())
            }
            Ok(Envelope::Request(request)) => {
                warn!(id = %request.id, cmd = %request.cmd, "Ignoring command sent by subprocess");
                Ok(())
            }
            Err(DecodeError::UnsupportedVersion { found }) => {
                error!(%found, "Subprocess speaks an unsupported protocol version");
                Err(ExitReason::UnsupportedVersion { found })
            }
            Err(DecodeError::InvalidEncoding(reason)) => {
                warn!(%reason, line = preview(line), "Skipping malformed line");
                Ok(())
            }
        }
    }

    fn on_response(&mut self, response: Response) -> Result<(), ExitReason> {
        match self.handshake.on_response(response) {
            Ack::Ready => {
                info!(pid = ?self.process.pid(), "Init acknowledged, connection ready");
                self.status.send_replace(ConnectionStatus::Ready);
                Ok(())
            }
            Ack::Rejected(error) => Err(ExitReason::InitFailed(error)),
            Ack::NotInit(Response { id, result }) => {
                if !self.pending.resolve(&id, result.map_err(BridgeError::Command)) {
                    debug!(%id, "Dropping response for unknown or expired id");
                }
                Ok(())
            }
        }
    }

    fn on_reverse_request(&self, request: ReverseRequest) {
        let ReverseRequest { id, req, args } = request;
        let result = self.auth.handle(&id, &req, args);
        if self.process.write_line(encode_response(&id, &result)).is_err() {
            warn!(%id, %req, "Reverse reply not delivered, stdin closed");
        }
    }

    fn on_expired(&mut self, id: &str) {
        let Some(entry) = self.pending.take(id) else {
            return;
        };
        let timeout = entry.timeout().unwrap_or_default();
        let cmd = entry.cmd().to_string();
        warn!(id, cmd = %cmd, ?timeout, "Command timed out");
        entry.complete(Err(BridgeError::Timeout { cmd, timeout }));
    }

    async fn process_gone(&mut self) -> ExitReason {
        match self.process.exit_status(self.terminate_timeout).await {
            Some(status) => {
                warn!(pid = ?self.process.pid(), ?status, "Subprocess exited");
                ExitReason::ProcessExited {
                    code: status.code(),
                }
            }
            None => ExitReason::Io("subprocess closed its pipes but did not exit".to_string()),
        }
    }

    async fn teardown(mut self, reason: ExitReason) {
        self.handshake.terminate();
        if reason == ExitReason::Shutdown {
            info!("Connection shutting down");
        } else {
            error!(%reason, "Connection terminating");
        }

        let in_flight = self.pending.len();
        for (id, entry) in self.pending.drain() {
            debug!(%id, cmd = entry.cmd(), "Failing in-flight command");
            entry.complete(Err(BridgeError::Closed(reason.clone())));
        }
        if in_flight > 0 {
            info!(in_flight, "Failed in-flight commands");
        }

        self.inbox.close();
        while let Ok(msg) = self.inbox.try_recv() {
            if let ActorMsg::Command { reply, .. } = msg {
                reply.send(Err(BridgeError::Closed(reason.clone()))).ok();
            }
        }

        self.process.terminate(self.terminate_timeout).await;
        info!(
            events = self.events.delivered(),
            buffered = self.lines.pending_len(),
            "Connection closed"
        );
        self.status.send_replace(ConnectionStatus::Terminated(reason));
    }
}

fn preview(line: &str) -> &str {
    line.char_indices()
        .nth(LOG_PREVIEW_CHARS)
        .map_or(line, |(end, _)| &line[..end])
}
