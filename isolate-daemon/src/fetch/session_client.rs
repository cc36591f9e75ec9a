//! `FetchClient` backed by a live IPC session (C8).
//!
//! Grounded on `bridge::callback::ClientCallbackBridge`'s round-trip
//! shape: the daemon has no HTTP client of its own, so a guest `fetch()`
//! is a plain `invoke_client_callback` to whichever callback id the
//! client registered as `callbacks.fetch` at `createRuntime` time. The
//! client answers with a single buffered `{status, statusText, headers,
//! body}` map — streamed responses are a client-side nicety this bridge
//! doesn't ask for (see DESIGN.md's buffered-fetch entry).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{DaemonError, DaemonResult};
use crate::fetch::{FetchClient, GuestBody, GuestResponse, ResponseHead};
use crate::http::{BodySpec, SerializedRequest};
use crate::isolate::headers_to_value;
use crate::proto::Value;
use crate::session::Session;

pub struct SessionFetchClient {
    session: Arc<Session>,
    callback_id: u64,
    timeout: Option<Duration>,
}

impl SessionFetchClient {
    pub fn new(session: Arc<Session>, callback_id: u64, timeout: Option<Duration>) -> Self {
        Self { session, callback_id, timeout }
    }
}

#[async_trait]
impl FetchClient for SessionFetchClient {
    async fn fetch(&self, req: SerializedRequest) -> DaemonResult<GuestResponse> {
        let body = match req.body {
            Some(BodySpec::Inline(bytes)) => Value::Bytes(bytes),
            // Streamed request bodies are buffered upstream of this call
            // (see DESIGN.md); a Stream spec reaching here means that
            // buffering step was skipped.
            Some(BodySpec::Stream(_)) | None => Value::Null,
        };
        let mut fields = std::collections::BTreeMap::new();
        fields.insert("method".to_string(), Value::String(req.method));
        fields.insert("url".to_string(), Value::String(req.url));
        fields.insert("headers".to_string(), headers_to_value(&req.headers));
        fields.insert("body".to_string(), body);

        let result = self
            .session
            .invoke_client_callback(self.callback_id, vec![Value::Map(fields)], self.timeout)
            .await?;

        let Value::Map(fields) = result else {
            return Err(DaemonError::ProtocolError("fetch callback must resolve to a Response-shaped object".into()));
        };

        let status = match fields.get("status") {
            Some(Value::I64(n)) => *n as u16,
            _ => 200,
        };
        let status_text = match fields.get("statusText") {
            Some(Value::String(s)) => s.clone(),
            _ => "OK".to_string(),
        };
        let headers = match fields.get("headers") {
            Some(Value::Map(m)) => m
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect(),
            _ => Vec::new(),
        };
        let body = match fields.get("body") {
            Some(Value::Bytes(b)) => b.clone(),
            Some(Value::String(s)) => s.clone().into_bytes(),
            _ => Vec::new(),
        };

        Ok(GuestResponse {
            head: ResponseHead { status, status_text, headers },
            body: GuestBody::Buffered(body),
        })
    }
}
