//! Configuration for a bridged subprocess.
//!
//! Resolution order:
//! 1. Built-in defaults
//! 2. Config file (`~/.config/sidecar/sidecar.toml` or an explicit path)
//! 3. Overrides applied by the embedding host or CLI flags

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::payload::Payload;
pub use crate::protocol::VersionPolicy;

/// Default cap on a single inbound line (16 MiB).
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Everything needed to launch and talk to one subprocess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Executable to launch.
    pub program: PathBuf,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Extra environment variables for the subprocess.
    pub env: BTreeMap<String, String>,
    /// Working directory; inherits the host's when unset.
    pub working_dir: Option<PathBuf>,
    /// Arguments of the mandatory `init` command.
    pub init_args: Payload,
    /// Deadline for the `init` acknowledgement.
    pub init_timeout_ms: u64,
    /// Default deadline for ordinary commands; `None` waits forever.
    pub command_timeout_ms: Option<u64>,
    /// Grace period between closing stdin and killing the subprocess.
    pub terminate_timeout_ms: u64,
    /// Longest accepted inbound line, terminator excluded.
    pub max_line_bytes: usize,
    /// Treatment of envelopes without a `v` field.
    pub version_policy: VersionPolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            init_args: Payload::empty_object(),
            init_timeout_ms: 10_000,
            command_timeout_ms: Some(30_000),
            terminate_timeout_ms: 5_000,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            version_policy: VersionPolicy::default(),
        }
    }
}

impl BridgeConfig {
    /// Defaults for launching `program` with `args`.
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub const fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }

    pub const fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }

    /// Reject configurations the bridge cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.program.as_os_str().is_empty() {
            return Err(Error::Config("'program' must be set".into()));
        }
        if self.max_line_bytes == 0 {
            return Err(Error::Config("'max_line_bytes' must be positive".into()));
        }
        if self.init_timeout_ms == 0 {
            return Err(Error::Config("'init_timeout_ms' must be positive".into()));
        }
        Ok(())
    }
}

/// Default config file location (`~/.config/sidecar/sidecar.toml`).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("sidecar").join("sidecar.toml"))
}

/// Load a TOML config file.
///
/// Not validated here: callers may still fill in `program` from elsewhere,
/// so call [`BridgeConfig::validate`] once the config is final.
pub fn load_config(path: &Path) -> Result<BridgeConfig> {
    let content = std::fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| Error::Parse {
        path: path.to_path_buf(),
        source,
    })
}
