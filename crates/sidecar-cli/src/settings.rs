//! Command-line arguments and their merge with the config file.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use sidecar_core::config::{default_config_path, load_config};
use sidecar_core::{BridgeConfig, Payload, VersionPolicy};

#[derive(Parser, Debug)]
#[command(name = "sidecar")]
#[command(version, about = "Drive a line-protocol subprocess over stdin/stdout")]
pub struct CliArgs {
    /// Config file (TOML). Defaults to ~/.config/sidecar/sidecar.toml when it exists
    #[arg(long, env = "SIDECAR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Arguments of the init command, as JSON
    #[arg(long, env = "SIDECAR_INIT_ARGS")]
    pub init_args: Option<String>,

    /// Deadline for the init acknowledgement (ms)
    #[arg(long, env = "SIDECAR_INIT_TIMEOUT_MS")]
    pub init_timeout_ms: Option<u64>,

    /// Default deadline for commands (ms); 0 waits forever
    #[arg(long, env = "SIDECAR_COMMAND_TIMEOUT_MS")]
    pub command_timeout_ms: Option<u64>,

    /// Grace period before the subprocess is killed on shutdown (ms)
    #[arg(long, env = "SIDECAR_TERMINATE_TIMEOUT_MS")]
    pub terminate_timeout_ms: Option<u64>,

    /// Longest accepted line from the subprocess (bytes)
    #[arg(long, env = "SIDECAR_MAX_LINE_BYTES")]
    pub max_line_bytes: Option<usize>,

    /// Reject subprocess messages that carry no protocol version
    #[arg(long, env = "SIDECAR_STRICT_VERSION")]
    pub strict_version: bool,

    /// Emit logs as JSON
    #[arg(long, env = "SIDECAR_LOG_JSON")]
    pub log_json: bool,

    /// Program and arguments to run, after `--`; overrides the config file
    #[arg(last = true)]
    pub command: Vec<String>,
}

impl CliArgs {
    /// Resolve the final config: file values, then flags and environment.
    pub fn build_config(&self) -> anyhow::Result<BridgeConfig> {
        let path = self
            .config
            .clone()
            .or_else(|| default_config_path().filter(|p| p.exists()));
        let mut config = match &path {
            Some(path) => load_config(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => BridgeConfig::default(),
        };

        if let Some((program, args)) = self.command.split_first() {
            config.program = PathBuf::from(program);
            config.args = args.to_vec();
        }
        if let Some(raw) = &self.init_args {
            let value: serde_json::Value =
                serde_json::from_str(raw).context("--init-args is not valid JSON")?;
            config.init_args = Payload::from_wire(value);
        }
        if let Some(ms) = self.init_timeout_ms {
            config.init_timeout_ms = ms;
        }
        if let Some(ms) = self.command_timeout_ms {
            config.command_timeout_ms = (ms > 0).then_some(ms);
        }
        if let Some(ms) = self.terminate_timeout_ms {
            config.terminate_timeout_ms = ms;
        }
        if let Some(bytes) = self.max_line_bytes {
            config.max_line_bytes = bytes;
        }
        if self.strict_version {
            config.version_policy = VersionPolicy::Strict;
        }

        config
            .validate()
            .context("No runnable subprocess configured (pass one after `--` or set `program`)")?;
        Ok(config)
    }
}
