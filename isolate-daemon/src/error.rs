//! Error taxonomy (C11).
//!
//! `DaemonError` is the structured kind carried on the wire inside
//! `RESP_ERR`/`CB_RESPONSE.error`. Internal, non-wire-facing fallibility
//! (module init, file adapters) still returns `Result<_, String>` the way
//! the teacher's `ServiceModule` trait does — only the boundary that
//! actually crosses IPC needs a typed enum with a stable `code`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable integer codes clients can key recovery logic on (§7).
/// Never renumber a published variant; append new ones at the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    IsolateNotFound = 1,
    IsolateMemoryLimit = 2,
    IsolateLimit = 3,
    ScriptError = 4,
    ProtocolError = 5,
    ConnectionClosed = 6,
    RequestTimeout = 7,
    NamespaceBusy = 8,
    UnmarshallableValue = 9,
    StreamCancelled = 10,
    BindFailure = 11,
    CorruptFrame = 12,
    UnknownMessageType = 13,
}

/// A guest-observable script error: name/message/stack survive the hop so
/// the guest-side polyfill can re-throw a faithful `Error`/`DOMException`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptErrorInfo {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum DaemonError {
    #[error("isolate {0} not found")]
    IsolateNotFound(u64),

    #[error("isolate exceeded its memory ceiling")]
    IsolateMemoryLimit,

    #[error("daemon is at its isolate cap")]
    IsolateLimit,

    #[error("script error: {0:?}")]
    ScriptError(ScriptErrorInfo),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timed out")]
    RequestTimeout,

    #[error("namespace '{0}' is already bound to another session")]
    NamespaceBusy(String),

    #[error("value cannot be marshalled across the bridge: {0}")]
    UnmarshallableValue(String),

    #[error("stream cancelled")]
    StreamCancelled,

    #[error("failed to bind listener: {0}")]
    BindFailure(String),

    #[error("corrupt frame: {0}")]
    CorruptFrame(String),

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
}

impl DaemonError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DaemonError::IsolateNotFound(_) => ErrorCode::IsolateNotFound,
            DaemonError::IsolateMemoryLimit => ErrorCode::IsolateMemoryLimit,
            DaemonError::IsolateLimit => ErrorCode::IsolateLimit,
            DaemonError::ScriptError(_) => ErrorCode::ScriptError,
            DaemonError::ProtocolError(_) => ErrorCode::ProtocolError,
            DaemonError::ConnectionClosed => ErrorCode::ConnectionClosed,
            DaemonError::RequestTimeout => ErrorCode::RequestTimeout,
            DaemonError::NamespaceBusy(_) => ErrorCode::NamespaceBusy,
            DaemonError::UnmarshallableValue(_) => ErrorCode::UnmarshallableValue,
            DaemonError::StreamCancelled => ErrorCode::StreamCancelled,
            DaemonError::BindFailure(_) => ErrorCode::BindFailure,
            DaemonError::CorruptFrame(_) => ErrorCode::CorruptFrame,
            DaemonError::UnknownMessageType(_) => ErrorCode::UnknownMessageType,
        }
    }

    /// Wire-ready `{code, details}` pair for `RESP_ERR`.
    pub fn to_wire(&self) -> WireError {
        WireError {
            code: self.code(),
            details: self.to_string(),
            script: match self {
                DaemonError::ScriptError(info) => Some(info.clone()),
                _ => None,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub code: ErrorCode,
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<ScriptErrorInfo>,
}

/// Convention from §4.9/§9: DOMException-shaped errors are encoded into a
/// guest-visible `Error.message` as `"[Name]message"`. Kept only at the
/// guest-polyfill serialisation boundary — everywhere else in the daemon a
/// `DomExceptionKind` travels as a structured field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomExceptionKind {
    NotFoundError,
    TypeMismatchError,
    InvalidModificationError,
    InvalidStateError,
}

impl DomExceptionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomExceptionKind::NotFoundError => "NotFoundError",
            DomExceptionKind::TypeMismatchError => "TypeMismatchError",
            DomExceptionKind::InvalidModificationError => "InvalidModificationError",
            DomExceptionKind::InvalidStateError => "InvalidStateError",
        }
    }

    /// Encode as the bracketed sentinel, e.g. `"[NotFoundError]no such file"`.
    pub fn encode(&self, message: &str) -> String {
        format!("[{}]{}", self.as_str(), message)
    }
}

pub type DaemonResult<T> = Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dom_exception_sentinel_round_trips_textually() {
        let encoded = DomExceptionKind::NotFoundError.encode("large.bin");
        assert_eq!(encoded, "[NotFoundError]large.bin");
    }

    #[test]
    fn codes_are_stable_per_variant() {
        assert_eq!(DaemonError::ConnectionClosed.code() as u16, 6);
        assert_eq!(DaemonError::NamespaceBusy("x".into()).code() as u16, 8);
    }
}
