//! Logging setup for binaries built on the bridge.
//!
//! Output always goes to stderr: stdout belongs to the line protocol in the
//! subprocess and to NDJSON replies in the `sidecar` binary.

use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `default_filter` (e.g. `"sidecar_bridge=info"`).
/// `log_json` switches to one JSON object per log line.
///
/// Returns `false` when a global subscriber was already installed, which is
/// the normal case when a host application embeds the bridge.
pub fn init_tracing(default_filter: &str, log_json: bool) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let fmt = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let fmt = if log_json {
        fmt.json().boxed()
    } else {
        fmt.boxed()
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt)
        .try_init()
        .is_ok()
}
