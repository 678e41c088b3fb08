//! Reverse RPC answering credential and key requests.
//!
//! | `req`        | args                                  | reply data                |
//! |--------------|---------------------------------------|---------------------------|
//! | `load_creds` | ignored                               | `{"creds": blob \| null}` |
//! | `save_creds` | `{"creds": blob}`                     | `{}`                      |
//! | `keys_get`   | `{"type": str, "ids": [str]}`         | `{"keys": {id: blob}}`    |
//! | `keys_set`   | `{"data": {type: {id: blob \| null}}}` | `{}`                      |
//!
//! Failures become `ok:false` replies with an `error` of
//! `{"code": ..., "message": ...}`; nothing here can end the connection, not
//! even a [`Store`] that panics.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use sidecar_core::{KeyChanges, Payload, Store, StoreError};
use tracing::{debug, error, warn};

/// A decoded reverse request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRequest {
    LoadCreds,
    SaveCreds(Payload),
    KeysGet { kind: String, ids: Vec<String> },
    KeysSet(KeyChanges),
}

impl AuthRequest {
    /// Decode `req` and its args, or produce the error reply.
    pub fn parse(req: &str, args: Payload) -> Result<Self, Payload> {
        match req {
            "load_creds" => Ok(Self::LoadCreds),
            "save_creds" => {
                let creds = args
                    .into_object()
                    .and_then(|mut obj| obj.remove("creds"))
                    .ok_or_else(|| invalid_args("save_creds expects {\"creds\": ...}"))?;
                Ok(Self::SaveCreds(creds))
            }
            "keys_get" => {
                let kind = args
                    .get("type")
                    .and_then(Payload::as_str)
                    .ok_or_else(|| invalid_args("keys_get expects a string 'type'"))?
                    .to_string();
                let ids = args
                    .get("ids")
                    .and_then(Payload::as_array)
                    .ok_or_else(|| invalid_args("keys_get expects an 'ids' array"))?
                    .iter()
                    .map(|id| id.as_str().map(str::to_string))
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| invalid_args("keys_get ids must be strings"))?;
                Ok(Self::KeysGet { kind, ids })
            }
            "keys_set" => {
                let data = args
                    .into_object()
                    .and_then(|mut obj| obj.remove("data"))
                    .and_then(Payload::into_object)
                    .ok_or_else(|| invalid_args("keys_set expects a 'data' object"))?;
                let mut changes = KeyChanges::new();
                for (kind, entries) in data {
                    let entries = entries.into_object().ok_or_else(|| {
                        invalid_args(format!("keys_set entries for '{kind}' must be an object"))
                    })?;
                    let entries = entries
                        .into_iter()
                        .map(|(id, value)| (id, (!value.is_null()).then_some(value)))
                        .collect();
                    changes.insert(kind, entries);
                }
                Ok(Self::KeysSet(changes))
            }
            other => Err(error_payload(
                "unknown_request",
                format!("unsupported request '{other}'"),
            )),
        }
    }
}

/// Answers reverse requests through the configured [`Store`].
#[derive(Clone)]
pub struct AuthDispatcher {
    store: Arc<dyn Store>,
}

impl std::fmt::Debug for AuthDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthDispatcher").finish_non_exhaustive()
    }
}

impl AuthDispatcher {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Produce the reply for reverse request `id`.
    pub fn handle(&self, id: &str, req: &str, args: Payload) -> Result<Payload, Payload> {
        let request = AuthRequest::parse(req, args).inspect_err(|err| {
            warn!(id, req, error = %err, "Rejecting reverse request");
        })?;
        debug!(id, req, "Answering reverse request");
        match panic::catch_unwind(AssertUnwindSafe(|| self.execute(request))) {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(e)) => {
                error!(id, req, error = %e, "Store operation failed");
                Err(error_payload("store_error", e.to_string()))
            }
            Err(cause) => {
                let message = panic_message(cause.as_ref());
                error!(id, req, panic = %message, "Store panicked");
                Err(error_payload(
                    "store_error",
                    format!("store panicked: {message}"),
                ))
            }
        }
    }

    fn execute(&self, request: AuthRequest) -> Result<Payload, StoreError> {
        match request {
            AuthRequest::LoadCreds => {
                let creds = self.store.load_creds()?.unwrap_or_default();
                Ok(object([("creds", creds)]))
            }
            AuthRequest::SaveCreds(creds) => {
                self.store.save_creds(creds)?;
                Ok(Payload::empty_object())
            }
            AuthRequest::KeysGet { kind, ids } => {
                let found = self.store.get(&kind, &ids)?;
                Ok(object([("keys", Payload::Object(found))]))
            }
            AuthRequest::KeysSet(changes) => {
                self.store.set(changes)?;
                Ok(Payload::empty_object())
            }
        }
    }
}

fn object<const N: usize>(fields: [(&str, Payload); N]) -> Payload {
    Payload::Object(
        fields
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect::<BTreeMap<_, _>>(),
    )
}

fn invalid_args(message: impl Into<String>) -> Payload {
    error_payload("invalid_args", message)
}

fn panic_message(cause: &(dyn Any + Send)) -> String {
    cause
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| cause.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_string())
}

fn error_payload(code: &str, message: impl Into<String>) -> Payload {
    object([
        ("code", Payload::from(code)),
        ("message", Payload::from(message.into())),
    ])
}
