//! Sidecar CLI Library
//!
//! Argument handling and the stdin/stdout forwarding loop behind the
//! `sidecar` binary.

pub mod forward;
pub mod settings;
