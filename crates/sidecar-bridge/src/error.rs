//! Error types for the bridge.

use std::time::Duration;

use sidecar_core::Payload;

/// Why a connection ended. Every non-[`Shutdown`](Self::Shutdown) variant is
/// a fatal condition; restarting is left to whoever supervises the
/// connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExitReason {
    #[error("Connection shut down")]
    Shutdown,

    #[error("Subprocess speaks unsupported protocol version {found}")]
    UnsupportedVersion { found: String },

    #[error("Init rejected by subprocess: {0}")]
    InitFailed(Payload),

    #[error("Init not acknowledged within {timeout:?}")]
    InitTimeout { timeout: Duration },

    #[error("Subprocess exited unexpectedly ({})", describe_exit(.code))]
    ProcessExited { code: Option<i32> },

    #[error("Inbound line exceeded {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("Subprocess I/O error: {0}")]
    Io(String),
}

#[allow(clippy::ref_option)]
fn describe_exit(code: &Option<i32>) -> String {
    code.map_or_else(
        || "killed by signal".to_string(),
        |code| format!("exit code {code}"),
    )
}

/// Outcome of a single command that did not produce data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// The subprocess answered `ok:false`; the payload is its `error` field.
    #[error("Command failed: {0}")]
    Command(Payload),

    #[error("Command '{cmd}' timed out after {timeout:?}")]
    Timeout { cmd: String, timeout: Duration },

    /// The init handshake has not completed; the command was never written.
    #[error("Connection not initialized")]
    NotInitialized,

    #[error("Connection closed: {0}")]
    Closed(ExitReason),
}

/// Errors from starting a connection.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error(transparent)]
    Config(#[from] sidecar_core::Error),

    #[error("Failed to spawn subprocess: {reason}")]
    SpawnFailed { reason: String },
}
