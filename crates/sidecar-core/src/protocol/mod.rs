//! Line protocol spoken with the bridged subprocess.
//!
//! One JSON object per `\n`-terminated line, tagged with a protocol version.
//! This module encodes outbound envelopes and classifies inbound lines,
//! keeping a malformed line distinct from a version mismatch so that callers
//! can skip the former and terminate on the latter.

mod codec;
mod types;

pub use codec::{
    decode_line, decode_line_with, encode_event, encode_request, encode_response,
    encode_reverse_request,
};
pub use types::{
    DecodeError, Envelope, EventMessage, PROTOCOL_VERSION, Request, Response, ReverseRequest,
    VersionPolicy,
};
