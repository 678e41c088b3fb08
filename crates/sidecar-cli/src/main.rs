//! Sidecar CLI
//!
//! Runs one subprocess behind a bridge connection. Commands are read from
//! stdin as JSON lines; replies and events are written to stdout the same
//! way. Logs go to stderr.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sidecar_bridge::{Connection, ExitReason, RawEvent};
use sidecar_cli::forward;
use sidecar_cli::settings::CliArgs;
use sidecar_core::MemoryStore;
use sidecar_core::tracing_init::init_tracing;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_tracing("sidecar_bridge=info,sidecar_cli=info", args.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting sidecar");
    let config = args.build_config()?;

    // Credentials and keys live only as long as this process.
    let store = Arc::new(MemoryStore::new());
    let (events_tx, events_rx) = mpsc::unbounded_channel::<RawEvent>();
    let conn = Connection::start_raw(config, store, events_tx).context("Failed to start subprocess")?;

    if let Err(reason) = conn.wait_ready().await {
        error!(%reason, "Subprocess never became ready");
        anyhow::bail!("Handshake failed: {reason}");
    }
    info!("Connection ready, reading commands from stdin");

    let reason = forward::run(
        &conn,
        events_rx,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await?;

    if reason == ExitReason::Shutdown {
        info!("Sidecar stopped");
        Ok(())
    } else {
        error!(%reason, "Connection terminated");
        Err(anyhow::anyhow!("Connection terminated: {reason}"))
    }
}
