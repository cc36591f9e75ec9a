//! `FileSystemHandler` backed by a live IPC session (C9).
//!
//! One client callback (`callbacks.fs`) fields every operation; each
//! call is an `invoke_client_callback` with an `{op, path, ...}` argument
//! describing which of the eight methods fired. Errors coming back are
//! expected pre-encoded as `"[Name]message"` the way the guest-facing
//! polyfill already writes them (`DomExceptionKind::encode`); anything
//! else collapses to `InvalidStateError` rather than silently discarding
//! the callback's own message.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{DaemonError, DomExceptionKind};
use crate::fs::handle_registry::{DirEntry, FileMetadata, FileSystemHandler, FsError, HandleKind};
use crate::proto::Value;
use crate::session::Session;

pub struct SessionFileSystemHandler {
    session: Arc<Session>,
    callback_id: u64,
    timeout: Option<Duration>,
}

impl SessionFileSystemHandler {
    pub fn new(session: Arc<Session>, callback_id: u64, timeout: Option<Duration>) -> Self {
        Self { session, callback_id, timeout }
    }

    async fn invoke(&self, mut args: BTreeMap<String, Value>, op: &str) -> Result<Value, FsError> {
        args.insert("op".to_string(), Value::String(op.to_string()));
        self.session
            .invoke_client_callback(self.callback_id, vec![Value::Map(args)], self.timeout)
            .await
            .map_err(daemon_error_to_fs_error)
    }
}

/// A `ScriptError` carrying an encoded `"[Name]message"` sentinel round-trips
/// to a structured `FsError`; anything else (a plain protocol failure, a
/// timeout) becomes `InvalidStateError` so the guest still sees a
/// `DOMException` rather than a bare `Error` it has no polyfill for.
fn daemon_error_to_fs_error(err: DaemonError) -> FsError {
    if let DaemonError::ScriptError(info) = &err {
        if let Some(decoded) = decode_sentinel(&info.message) {
            return decoded;
        }
    }
    (DomExceptionKind::InvalidStateError, err.to_string())
}

fn decode_sentinel(message: &str) -> Option<FsError> {
    let rest = message.strip_prefix('[')?;
    let (name, msg) = rest.split_once(']')?;
    let kind = match name {
        "NotFoundError" => DomExceptionKind::NotFoundError,
        "TypeMismatchError" => DomExceptionKind::TypeMismatchError,
        "InvalidModificationError" => DomExceptionKind::InvalidModificationError,
        "InvalidStateError" => DomExceptionKind::InvalidStateError,
        _ => return None,
    };
    Some((kind, msg.to_string()))
}

fn field(key: &str, value: Value) -> (String, Value) {
    (key.to_string(), value)
}

#[async_trait]
impl FileSystemHandler for SessionFileSystemHandler {
    async fn get_file_handle(&self, path: &str, create: bool) -> Result<(), FsError> {
        let args = BTreeMap::from([field("path", Value::String(path.to_string())), field("create", Value::Bool(create))]);
        self.invoke(args, "getFileHandle").await.map(|_| ())
    }

    async fn get_directory_handle(&self, path: &str, create: bool) -> Result<(), FsError> {
        let args = BTreeMap::from([field("path", Value::String(path.to_string())), field("create", Value::Bool(create))]);
        self.invoke(args, "getDirectoryHandle").await.map(|_| ())
    }

    async fn remove_entry(&self, path: &str, recursive: bool) -> Result<(), FsError> {
        let args = BTreeMap::from([field("path", Value::String(path.to_string())), field("recursive", Value::Bool(recursive))]);
        self.invoke(args, "removeEntry").await.map(|_| ())
    }

    async fn read_directory(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let args = BTreeMap::from([field("path", Value::String(path.to_string()))]);
        let result = self.invoke(args, "readDirectory").await?;
        let Value::Array(items) = result else {
            return Ok(Vec::new());
        };
        Ok(items
            .into_iter()
            .filter_map(|item| {
                let Value::Map(m) = item else { return None };
                let name = m.get("name").and_then(Value::as_str)?.to_string();
                let kind = match m.get("kind").and_then(Value::as_str) {
                    Some("directory") => HandleKind::Directory,
                    _ => HandleKind::File,
                };
                Some(DirEntry { name, kind })
            })
            .collect())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, FsError> {
        let args = BTreeMap::from([field("path", Value::String(path.to_string()))]);
        match self.invoke(args, "readFile").await? {
            Value::Bytes(b) => Ok(b),
            Value::String(s) => Ok(s.into_bytes()),
            _ => Ok(Vec::new()),
        }
    }

    async fn write_file(&self, path: &str, bytes: &[u8], position: Option<u64>) -> Result<(), FsError> {
        let args = BTreeMap::from([
            field("path", Value::String(path.to_string())),
            field("bytes", Value::Bytes(bytes.to_vec())),
            field("position", position.map(|p| Value::I64(p as i64)).unwrap_or(Value::Null)),
        ]);
        self.invoke(args, "writeFile").await.map(|_| ())
    }

    async fn truncate_file(&self, path: &str, size: u64) -> Result<(), FsError> {
        let args = BTreeMap::from([field("path", Value::String(path.to_string())), field("size", Value::I64(size as i64))]);
        self.invoke(args, "truncateFile").await.map(|_| ())
    }

    async fn get_file_metadata(&self, path: &str) -> Result<FileMetadata, FsError> {
        let args = BTreeMap::from([field("path", Value::String(path.to_string()))]);
        let result = self.invoke(args, "getFileMetadata").await?;
        let Value::Map(m) = result else {
            return Err((DomExceptionKind::NotFoundError, path.to_string()));
        };
        let size = match m.get("size") {
            Some(Value::I64(n)) => *n as u64,
            _ => 0,
        };
        let last_modified_ms = match m.get("lastModifiedMs") {
            Some(Value::I64(n)) => *n,
            _ => 0,
        };
        Ok(FileMetadata { size, last_modified_ms })
    }
}
