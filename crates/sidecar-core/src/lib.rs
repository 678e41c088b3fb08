//! `Sidecar` Core Library
//!
//! Shared functionality for `Sidecar` components:
//! - Versioned line protocol codec for the subprocess channel
//! - `Payload` value model with the `__b64` binary convention
//! - Store capability answered over reverse RPC
//! - Configuration loading and common error types

pub mod config;
pub mod error;
pub mod payload;
pub mod protocol;
pub mod store;
pub mod tracing_init;

pub use config::{BridgeConfig, VersionPolicy};
pub use error::{Error, Result};
pub use payload::Payload;
pub use store::{KeyChanges, MemoryStore, Store, StoreError};
