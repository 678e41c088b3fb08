//! Subprocess lifecycle owner.
//!
//! Spawns the configured program with piped stdio and is the only place
//! that touches it: stdin is fed by one writer task, stdout is handed to the
//! connection loop as its single reader, stderr is drained into the log.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use sidecar_core::BridgeConfig;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::SpawnError;

/// The stdin writer has stopped; nothing more can reach the subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("subprocess stdin is closed")]
pub struct StdinClosed;

/// Handle to the running subprocess.
#[derive(Debug)]
pub struct Subprocess {
    child: Child,
    pid: Option<u32>,
    stdin_tx: Option<mpsc::UnboundedSender<String>>,
    stdout: Option<ChildStdout>,
    writer: Option<JoinHandle<()>>,
}

impl Subprocess {
    /// Launch the program described by `config`.
    pub fn spawn(config: &BridgeConfig) -> Result<Self, SpawnError> {
        config.validate()?;

        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        info!(
            program = %config.program.display(),
            args = ?config.args,
            "Spawning subprocess"
        );
        let mut child = cmd.spawn().map_err(|e| SpawnError::SpawnFailed {
            reason: format!("{}: {e}", config.program.display()),
        })?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::SpawnFailed {
                reason: "Failed to capture stdin".to_string(),
            })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::SpawnFailed {
                reason: "Failed to capture stdout".to_string(),
            })?;

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_lines(stdin, stdin_rx, pid));

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr, pid));
        }

        Ok(Self {
            child,
            pid,
            stdin_tx: Some(stdin_tx),
            stdout: Some(stdout),
            writer: Some(writer),
        })
    }

    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Hand out stdout to its single reader. Returns `None` after the first call.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Queue one line for stdin; the terminator is appended here.
    pub fn write_line(&self, mut line: String) -> Result<(), StdinClosed> {
        line.push('\n');
        self.stdin_tx
            .as_ref()
            .ok_or(StdinClosed)?
            .send(line)
            .map_err(|_| StdinClosed)
    }

    /// Exit status if the subprocess exits within `grace`.
    pub async fn exit_status(&mut self, grace: Duration) -> Option<ExitStatus> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!(pid = ?self.pid, error = %e, "Error waiting for subprocess");
                None
            }
            Err(_) => None,
        }
    }

    /// Close stdin, then escalate to SIGTERM and finally SIGKILL, waiting up
    /// to `timeout` at each step.
    pub async fn terminate(&mut self, timeout: Duration) {
        let pid = self.pid;
        debug!(?pid, "Terminating subprocess");

        // Dropping the sender lets the writer flush what is queued and then
        // close the pipe.
        self.stdin_tx.take();
        if let Some(writer) = self.writer.take() {
            if tokio::time::timeout(timeout, writer).await.is_err() {
                warn!(?pid, "Stdin writer did not finish in time");
            }
        }

        if let Some(status) = self.exit_status(timeout).await {
            info!(?pid, ?status, "Subprocess exited after stdin closed");
            return;
        }

        self.signal_terminate();
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(?pid, ?status, "Subprocess exited after SIGTERM");
            }
            Ok(Err(e)) => {
                warn!(?pid, error = %e, "Error waiting for subprocess");
                self.child.kill().await.ok();
            }
            Err(_) => {
                warn!(?pid, "Timeout waiting for graceful shutdown, killing");
                self.child.kill().await.ok();
            }
        }
    }

    #[cfg(unix)]
    fn signal_terminate(&self) {
        if let Some(pid) = self.pid {
            // SAFETY: pid is a valid process ID obtained from our own Child handle.
            // kill(2) with SIGTERM is safe to call on any owned subprocess.
            #[allow(unsafe_code)]
            #[allow(clippy::cast_possible_wrap)]
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                let err = std::io::Error::last_os_error();
                warn!(pid, error = %err, "Failed to send SIGTERM");
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_terminate(&self) {}
}

async fn write_lines(
    mut stdin: ChildStdin,
    mut lines: mpsc::UnboundedReceiver<String>,
    pid: Option<u32>,
) {
    while let Some(line) = lines.recv().await {
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            error!(?pid, "Failed to write to stdin: {}", e);
            break;
        }
        if let Err(e) = stdin.flush().await {
            error!(?pid, "Failed to flush stdin: {}", e);
            break;
        }
    }
    debug!(?pid, "stdin writer finished");
}

async fn drain_stderr(stderr: ChildStderr, pid: Option<u32>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(?pid, "stderr: {}", line);
    }
    debug!(?pid, "stderr reader finished");
}
