//! Encoder and decoder for protocol lines.
//!
//! Classification of inbound objects: `req` ⇒ reverse request, `ok` ⇒
//! response, `cmd` ⇒ request, anything else ⇒ event. Unknown fields are
//! ignored.

use serde_json::{Map, Value, json};

use super::types::{
    DecodeError, Envelope, EventMessage, PROTOCOL_VERSION, Request, Response, ReverseRequest,
    VersionPolicy,
};
use crate::payload::Payload;

/// Encode a host → subprocess command. The returned line has no terminator.
pub fn encode_request(id: &str, cmd: &str, args: &Payload) -> String {
    json!({
        "v": PROTOCOL_VERSION,
        "id": id,
        "cmd": cmd,
        "args": args.to_wire(),
    })
    .to_string()
}

/// Encode a reply for the request identified by `id`.
pub fn encode_response(id: &str, result: &Result<Payload, Payload>) -> String {
    match result {
        Ok(data) => json!({
            "v": PROTOCOL_VERSION,
            "id": id,
            "ok": true,
            "data": data.to_wire(),
        }),
        Err(error) => json!({
            "v": PROTOCOL_VERSION,
            "id": id,
            "ok": false,
            "error": error.to_wire(),
        }),
    }
    .to_string()
}

/// Encode an event notification.
pub fn encode_event(event: &str, data: &Payload) -> String {
    json!({
        "v": PROTOCOL_VERSION,
        "event": event,
        "data": data.to_wire(),
    })
    .to_string()
}

/// Encode a subprocess → host call.
pub fn encode_reverse_request(id: &str, req: &str, args: &Payload) -> String {
    json!({
        "v": PROTOCOL_VERSION,
        "req": req,
        "id": id,
        "args": args.to_wire(),
    })
    .to_string()
}

/// Decode one line, reading a missing `v` as version 1.
pub fn decode_line(line: &str) -> Result<Envelope, DecodeError> {
    decode_line_with(line, VersionPolicy::Lenient)
}

/// Decode one line under an explicit [`VersionPolicy`].
pub fn decode_line_with(line: &str, policy: VersionPolicy) -> Result<Envelope, DecodeError> {
    let raw: Value = serde_json::from_str(line)
        .map_err(|e| DecodeError::InvalidEncoding(e.to_string()))?;
    let Value::Object(mut obj) = raw else {
        return Err(DecodeError::InvalidEncoding(
            "envelope is not a JSON object".into(),
        ));
    };

    check_version(obj.get("v"), policy)?;

    if let Some(req) = obj.remove("req") {
        return Ok(Envelope::ReverseRequest(ReverseRequest {
            req: string_field(req, "req")?,
            id: take_id(&mut obj)?,
            args: take_payload(&mut obj, "args"),
        }));
    }

    if let Some(ok) = obj.remove("ok") {
        let ok = ok
            .as_bool()
            .ok_or_else(|| DecodeError::InvalidEncoding("'ok' is not a boolean".into()))?;
        let id = take_id(&mut obj)?;
        let result = if ok {
            Ok(take_payload(&mut obj, "data"))
        } else {
            Err(take_payload(&mut obj, "error"))
        };
        return Ok(Envelope::Response(Response { id, result }));
    }

    if let Some(cmd) = obj.remove("cmd") {
        return Ok(Envelope::Request(Request {
            cmd: string_field(cmd, "cmd")?,
            id: take_id(&mut obj)?,
            args: take_payload(&mut obj, "args"),
        }));
    }

    let event = obj
        .remove("event")
        .ok_or_else(|| DecodeError::InvalidEncoding("Missing 'event' field".into()))?;
    Ok(Envelope::Event(EventMessage {
        event: string_field(event, "event")?,
        data: take_payload(&mut obj, "data"),
    }))
}

fn check_version(v: Option<&Value>, policy: VersionPolicy) -> Result<(), DecodeError> {
    match v {
        None if policy == VersionPolicy::Lenient => Ok(()),
        None => Err(DecodeError::UnsupportedVersion {
            found: "missing".into(),
        }),
        Some(v) if v.as_u64() == Some(PROTOCOL_VERSION) => Ok(()),
        Some(v) => Err(DecodeError::UnsupportedVersion {
            found: v.to_string(),
        }),
    }
}

fn take_id(obj: &mut Map<String, Value>) -> Result<String, DecodeError> {
    let id = obj
        .remove("id")
        .ok_or_else(|| DecodeError::InvalidEncoding("Missing 'id' field".into()))?;
    string_field(id, "id")
}

fn string_field(value: Value, name: &str) -> Result<String, DecodeError> {
    match value {
        Value::String(s) => Ok(s),
        _ => Err(DecodeError::InvalidEncoding(format!(
            "'{name}' is not a string"
        ))),
    }
}

fn take_payload(obj: &mut Map<String, Value>, name: &str) -> Payload {
    obj.remove(name).map(Payload::from_wire).unwrap_or_default()
}
