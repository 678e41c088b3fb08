//! Init handshake gating the connection.
//!
//! ```text
//! Starting ──begin()──▶ AwaitingAck ──ok──▶ Ready
//!                            │
//!                            └──error / deadline──▶ Terminating
//! ```
//!
//! Ordinary commands are only accepted in `Ready`, which keeps the init
//! request the first line the subprocess ever receives.

use std::pin::Pin;
use std::time::Duration;

use sidecar_core::Payload;
use sidecar_core::protocol::Response;
use tokio::time::Sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Subprocess launched, init not yet written.
    Starting,
    /// Init written, waiting for its response.
    AwaitingAck,
    Ready,
    Terminating,
}

/// How an inbound response relates to the handshake.
#[derive(Debug, PartialEq, Eq)]
pub enum Ack {
    /// The init command succeeded.
    Ready,
    /// The init command failed with this error payload.
    Rejected(Payload),
    /// Not the init response; route it to the command table.
    NotInit(Response),
}

#[derive(Debug)]
pub struct Handshake {
    state: HandshakeState,
    init_id: Option<String>,
    timeout: Duration,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl Handshake {
    pub const fn new(timeout: Duration) -> Self {
        Self {
            state: HandshakeState::Starting,
            init_id: None,
            timeout,
            deadline: None,
        }
    }

    pub const fn state(&self) -> HandshakeState {
        self.state
    }

    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_ready(&self) -> bool {
        self.state == HandshakeState::Ready
    }

    /// Record that the init request with `init_id` was written and start
    /// the deadline.
    pub fn begin(&mut self, init_id: String) {
        if self.state != HandshakeState::Starting {
            return;
        }
        self.init_id = Some(init_id);
        self.deadline = Some(Box::pin(tokio::time::sleep(self.timeout)));
        self.state = HandshakeState::AwaitingAck;
    }

    /// Claim `response` if it answers the init request.
    ///
    /// Once `Ready`, the init id is forgotten, so a repeated init response
    /// falls through as [`Ack::NotInit`] and is dropped as unknown.
    pub fn on_response(&mut self, response: Response) -> Ack {
        let awaiting = self.state == HandshakeState::AwaitingAck
            && self.init_id.as_deref() == Some(response.id.as_str());
        if !awaiting {
            return Ack::NotInit(response);
        }
        self.init_id = None;
        self.deadline = None;
        match response.result {
            Ok(_) => {
                self.state = HandshakeState::Ready;
                Ack::Ready
            }
            Err(error) => {
                self.state = HandshakeState::Terminating;
                Ack::Rejected(error)
            }
        }
    }

    /// Completes when the init deadline passes; never completes while no
    /// deadline is armed.
    pub async fn expired(&mut self) {
        match self.deadline.as_mut() {
            Some(deadline) => deadline.await,
            None => std::future::pending().await,
        }
    }

    pub fn terminate(&mut self) {
        self.state = HandshakeState::Terminating;
        self.init_id = None;
        self.deadline = None;
    }
}
