//! Guest-initiated fetch (C8).
//!
//! `fetch(url, init)` inside the guest marshals headers/body and hands
//! off to the client's `fetch` callback (a `FetchClient`, implemented by
//! the bridge glue that actually crosses IPC via `bridge::callback`). The
//! client answers either buffered or streamed; both modes funnel through
//! `GuestResponse` so the caller (the bridge kernel, building the guest
//! `Response` object) doesn't need to care which.

pub mod session_client;

use async_trait::async_trait;

use crate::error::{DaemonError, DaemonResult, ScriptErrorInfo};
use crate::http::dispatcher::{BodySpec, SerializedRequest};
use crate::stream::StreamReceiver;

pub use session_client::SessionFetchClient;

/// What the client answered with before any streaming has happened —
/// `status`/`statusText`/headers must be identical in shape whether the
/// body arrives as one buffer or as chunks (§4.8).
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub status_text: String,
    /// Order-preserving so repeated `Set-Cookie` keeps arrival order.
    pub headers: Vec<(String, String)>,
}

pub enum GuestBody {
    Buffered(Vec<u8>),
    Streamed(StreamReceiver),
}

pub struct GuestResponse {
    pub head: ResponseHead,
    pub body: GuestBody,
}

/// The client's `fetch` callback, round-tripped over IPC. Implemented by
/// bridge glue that knows how to turn a `CB_INVOKE`/`CB_RESPONSE` pair
/// (buffered) or a `CB_STREAM_START/CHUNK/END` sequence (streamed) into
/// this shape.
#[async_trait]
pub trait FetchClient: Send + Sync {
    async fn fetch(&self, req: SerializedRequest) -> DaemonResult<GuestResponse>;
}

/// One in-flight guest `fetch()`. Exists mainly to give the bridge kernel
/// somewhere to route an `AbortController` signal: calling `abort()`
/// cancels the backing stream (if any) and the pending guest promise
/// settles with an `AbortError`, matching the browser contract guest code
/// expects from `fetch`.
pub struct FetchHandle {
    receiver: Option<StreamReceiver>,
}

impl FetchHandle {
    pub fn buffered() -> Self {
        Self { receiver: None }
    }

    pub fn streamed(receiver: StreamReceiver) -> Self {
        Self {
            receiver: Some(receiver),
        }
    }

    /// §4.8 "If the guest cancels, the kernel emits `CB_STREAM_CANCEL`."
    pub fn abort(mut self) -> DaemonError {
        if let Some(mut receiver) = self.receiver.take() {
            receiver.cancel();
        }
        DaemonError::ScriptError(ScriptErrorInfo {
            name: "AbortError".to_string(),
            message: "The operation was aborted.".to_string(),
            stack: None,
        })
    }
}

/// Request body capture: a guest `fetch` body that isn't a finite buffer
/// becomes a `ReadableStream`, which the bridge turns into a
/// `StreamSender` uploading chunks to the client as `BodySpec::Stream`
/// (§4.8 "captures the request body as a ReadableStream if it is not a
/// finite buffer").
pub fn request_body_spec(buffered: Option<Vec<u8>>, stream_id: Option<crate::proto::StreamId>) -> Option<BodySpec> {
    match (buffered, stream_id) {
        (Some(bytes), _) => Some(BodySpec::Inline(bytes)),
        (None, Some(id)) => Some(BodySpec::Stream(id)),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn aborting_a_buffered_fetch_yields_an_abort_error() {
        let handle = FetchHandle::buffered();
        let err = handle.abort();
        match err {
            DaemonError::ScriptError(info) => assert_eq!(info.name, "AbortError"),
            other => panic!("expected ScriptError(AbortError), got {other:?}"),
        }
    }

    #[test]
    fn request_body_prefers_inline_when_both_given() {
        let spec = request_body_spec(Some(vec![1, 2, 3]), Some(7));
        assert!(matches!(spec, Some(BodySpec::Inline(b)) if b == vec![1,2,3]));
    }

    #[test]
    fn request_body_falls_back_to_stream() {
        let spec = request_body_spec(None, Some(7));
        assert!(matches!(spec, Some(BodySpec::Stream(7))));
    }

    #[test]
    fn request_body_is_none_for_bodyless_requests() {
        assert!(request_body_spec(None, None).is_none());
    }
}
