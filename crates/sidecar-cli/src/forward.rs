//! Forwarding between the terminal and a [`Connection`].
//!
//! Input is one JSON object per line: `{"cmd": ..., "args": ..., "id": ...,
//! "timeout_ms": ...}`, where only `cmd` is required. Commands run
//! concurrently; each reply is printed as soon as it resolves, echoing the
//! caller's `id`. Events are printed as they arrive, as protocol event lines.
//! When the connection ends, every in-flight command still gets its reply.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use sidecar_bridge::{BridgeError, Connection, EventData, ExitReason, RawEvent};
use sidecar_core::Payload;
use sidecar_core::protocol::encode_event;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One command read from input.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HostRequest {
    pub cmd: String,
    #[serde(default)]
    pub args: Payload,
    /// Caller's correlation token, echoed on the reply.
    #[serde(default)]
    pub id: Option<Value>,
    pub timeout_ms: Option<u64>,
}

pub fn parse_request(line: &str) -> Result<HostRequest, serde_json::Error> {
    serde_json::from_str(line)
}

/// Render the outcome of `request` as an output line.
pub fn reply_line(request: &HostRequest, result: &Result<Payload, BridgeError>) -> String {
    let mut reply = json!({"cmd": request.cmd});
    if let Some(id) = &request.id {
        reply["id"] = id.clone();
    }
    match result {
        Ok(data) => {
            reply["ok"] = json!(true);
            reply["data"] = data.to_wire();
        }
        Err(BridgeError::Command(error)) => {
            reply["ok"] = json!(false);
            reply["error"] = error.to_wire();
        }
        Err(other) => {
            reply["ok"] = json!(false);
            reply["error"] = json!({"code": error_code(other), "message": other.to_string()});
        }
    }
    reply.to_string()
}

const fn error_code(error: &BridgeError) -> &'static str {
    match error {
        BridgeError::Command(_) => "command_failed",
        BridgeError::Timeout { .. } => "timeout",
        BridgeError::NotInitialized => "not_initialized",
        BridgeError::Closed(_) => "closed",
    }
}

/// Render an event as an output line, in the protocol's own event form.
pub fn event_line(event: &RawEvent) -> String {
    let data = match &event.data {
        EventData::Raw(data) => data,
        EventData::Typed(never) => match *never {},
    };
    encode_event(&event.name, data)
}

/// Forward until input ends and every command has answered, or until the
/// connection terminates. Returns why the connection ended.
pub async fn run<R, W>(
    conn: &Connection,
    mut events: mpsc::UnboundedReceiver<RawEvent>,
    input: R,
    mut output: W,
) -> anyhow::Result<ExitReason>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<String>();
    let mut lines = input.lines();
    let mut input_open = true;
    let mut in_flight = 0usize;

    while input_open || in_flight > 0 {
        tokio::select! {
            line = lines.next_line(), if input_open => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match parse_request(&line) {
                    Ok(request) => {
                        in_flight += 1;
                        spawn_call(conn.clone(), request, done_tx.clone());
                    }
                    Err(e) => warn!(error = %e, "Ignoring malformed input line"),
                },
                None => {
                    debug!(in_flight, "Input closed");
                    input_open = false;
                }
            },
            Some(reply) = done_rx.recv() => {
                in_flight -= 1;
                write_line(&mut output, &reply).await?;
            }
            Some(event) = events.recv() => {
                write_line(&mut output, &event_line(&event)).await?;
            }
            reason = conn.closed() => {
                debug!(in_flight, %reason, "Connection closed; flushing");
                return flush(&mut output, in_flight, &mut done_rx, &mut events, reason).await;
            }
        }
    }

    while let Ok(event) = events.try_recv() {
        write_line(&mut output, &event_line(&event)).await?;
    }
    Ok(conn.shutdown().await)
}

/// Write out what a closed connection still owes: every in-flight reply
/// (each resolves with `Closed` once the actor has torn down) and every
/// event delivered before it ended.
async fn flush<W: AsyncWrite + Unpin>(
    output: &mut W,
    mut in_flight: usize,
    done_rx: &mut mpsc::UnboundedReceiver<String>,
    events: &mut mpsc::UnboundedReceiver<RawEvent>,
    reason: ExitReason,
) -> anyhow::Result<ExitReason> {
    while in_flight > 0 {
        let Some(reply) = done_rx.recv().await else {
            break;
        };
        in_flight -= 1;
        write_line(output, &reply).await?;
    }
    // The sender goes away with the connection task.
    while let Some(event) = events.recv().await {
        write_line(output, &event_line(&event)).await?;
    }
    Ok(reason)
}

fn spawn_call(conn: Connection, request: HostRequest, done: mpsc::UnboundedSender<String>) {
    tokio::spawn(async move {
        let timeout = request.timeout_ms.map(Duration::from_millis);
        let result = match timeout {
            Some(timeout) => {
                conn.call_with_timeout(request.cmd.clone(), request.args.clone(), Some(timeout))
                    .await
            }
            None => conn.call(request.cmd.clone(), request.args.clone()).await,
        };
        done.send(reply_line(&request, &result)).ok();
    });
}

async fn write_line<W: AsyncWrite + Unpin>(output: &mut W, line: &str) -> std::io::Result<()> {
    output.write_all(line.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await
}
