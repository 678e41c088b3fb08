//! Envelope types for the line protocol.

use serde::{Deserialize, Serialize};

use crate::payload::Payload;

/// The only protocol version this crate speaks.
pub const PROTOCOL_VERSION: u64 = 1;

/// How to treat an envelope that carries no `v` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionPolicy {
    /// Missing `v` is read as version 1 (older peers never send it).
    #[default]
    Lenient,
    /// Missing `v` is rejected like any other unsupported version.
    Strict,
}

/// One decoded protocol line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Request(Request),
    Response(Response),
    Event(EventMessage),
    ReverseRequest(ReverseRequest),
}

/// Host → subprocess command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: String,
    pub cmd: String,
    pub args: Payload,
}

/// Reply to a [`Request`] or a [`ReverseRequest`].
///
/// `Ok` carries the `data` field, `Err` the `error` field, both verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub id: String,
    pub result: Result<Payload, Payload>,
}

/// Unsolicited notification from the subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMessage {
    pub event: String,
    pub data: Payload,
}

/// Subprocess → host call, answered with a [`Response`] carrying the same id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseRequest {
    pub id: String,
    pub req: String,
    pub args: Payload,
}

/// Why a line could not be turned into an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The `v` field is absent (under [`VersionPolicy::Strict`]) or is not
    /// [`PROTOCOL_VERSION`]. `found` is the raw JSON of the field, or
    /// `"missing"`.
    #[error("Unsupported protocol version: {found}")]
    UnsupportedVersion { found: String },

    /// Not JSON, not an object, or missing fields its class requires.
    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),
}
