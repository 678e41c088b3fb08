//! Sidecar Bridge Library
//!
//! Drives one long-lived subprocess over line-delimited JSON on its standard
//! streams:
//! - Process lifecycle ownership (spawn, single reader/writer, termination)
//! - Request/response correlation with per-command deadlines
//! - Init handshake gating all ordinary traffic
//! - Reverse RPC answering credential/key requests from a [`Store`]
//! - Event dispatch with optional typed conversion
//!
//! [`Store`]: sidecar_core::Store

pub mod auth;
pub mod connection;
pub mod error;
pub mod events;
pub mod handshake;
pub mod lines;
pub mod pending;
pub mod process;

pub use connection::{Connection, ConnectionStatus, INIT_COMMAND, PendingReply};
pub use error::{BridgeError, ExitReason, SpawnError};
pub use events::{
    Converter, Event, EventData, EventHandler, EventMode, NoConversion, RawEvent,
};
