//! In-flight command table.
//!
//! Maps correlation ids to the caller waiting on them. Each entry is removed
//! exactly once: by its response, by its deadline, or by connection teardown.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::debug;

/// A command awaiting its response.
#[derive(Debug)]
pub struct PendingCommand<R> {
    reply: oneshot::Sender<R>,
    timer: Option<AbortHandle>,
    timeout: Option<Duration>,
    cmd: String,
    started: Instant,
}

impl<R> PendingCommand<R> {
    pub fn new(
        cmd: impl Into<String>,
        reply: oneshot::Sender<R>,
        timeout: Option<Duration>,
        timer: Option<AbortHandle>,
    ) -> Self {
        Self {
            reply,
            timer,
            timeout,
            cmd: cmd.into(),
            started: Instant::now(),
        }
    }

    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Cancel the deadline and hand `outcome` to the caller.
    ///
    /// Returns `false` if the caller stopped waiting.
    pub fn complete(self, outcome: R) -> bool {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        self.reply.send(outcome).is_ok()
    }
}

/// In-flight commands keyed by correlation id.
#[derive(Debug)]
pub struct PendingTable<R> {
    entries: HashMap<String, PendingCommand<R>>,
}

impl<R> Default for PendingTable<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> PendingTable<R> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Draw a fresh random id that is not currently in flight.
    pub fn allocate_id(&self) -> String {
        loop {
            let id = uuid::Uuid::new_v4().to_string();
            if !self.entries.contains_key(&id) {
                return id;
            }
        }
    }

    /// Register a command. An id already in flight is refused and the entry
    /// handed back.
    pub fn insert(&mut self, id: String, entry: PendingCommand<R>) -> Result<(), PendingCommand<R>> {
        if self.entries.contains_key(&id) {
            return Err(entry);
        }
        self.entries.insert(id, entry);
        Ok(())
    }

    /// Remove the entry for `id` without completing it.
    pub fn take(&mut self, id: &str) -> Option<PendingCommand<R>> {
        self.entries.remove(id)
    }

    /// Complete the command for `id`. Unknown or already-resolved ids
    /// return `false` and `outcome` is dropped.
    pub fn resolve(&mut self, id: &str, outcome: R) -> bool {
        let Some(entry) = self.entries.remove(id) else {
            return false;
        };
        #[allow(clippy::cast_possible_truncation)]
        let elapsed_ms = entry.elapsed().as_millis() as u64;
        debug!(id, cmd = %entry.cmd, elapsed_ms, "Command resolved");
        if !entry.complete(outcome) {
            debug!(id, "Caller stopped waiting before the response arrived");
        }
        true
    }

    /// Remove every entry, for teardown.
    pub fn drain(&mut self) -> impl Iterator<Item = (String, PendingCommand<R>)> + '_ {
        self.entries.drain()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Start a deadline timer that reports `id` on `expired` once `after` elapses.
///
/// Aborting the returned handle cancels the timer.
pub fn arm_timer(id: String, after: Duration, expired: mpsc::UnboundedSender<String>) -> AbortHandle {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        // The receiver is gone only once the connection has stopped.
        expired.send(id).ok();
    })
    .abort_handle()
}
