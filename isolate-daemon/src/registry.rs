//! Isolate registry — the op-routing table tying C5–C10 together.
//!
//! Grounded in the teacher's `ModuleRegistry`: one call in (`op`, a
//! free-form payload), one lookup, one typed call out. The difference
//! from the teacher's version is the "modules" here aren't independent
//! services but facets of a single isolate (its dispatcher, its FS
//! mount, its bridge kernel) — so routing is keyed by `(isolateId, op)`
//! rather than by a command-prefix table.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::bridge::BridgeKernel;
use crate::config::Config;
use crate::error::{DaemonError, DaemonResult};
use crate::fetch::{FetchClient, SessionFetchClient};
use crate::fs::{FileSystemHandler, HandleKind, HandleRegistry, SessionFileSystemHandler};
use crate::http::{ConnectionId, Dispatcher, GuestDispatch, WsMessagePayload};
use crate::isolate::{IdentityTransformer, IsolateDeps, IsolateHost, ModuleLoaderClient, TracingConsoleSink};
use crate::pool::IsolatePool;
use crate::proto::{IsolateId, Value};
use crate::session::Session;

/// Everything hung off one isolate besides the `IsolateHost` itself. Held
/// separately from `pool::IsolatePool`'s bookkeeping because it's
/// per-isolate *service* state, not lifecycle state.
pub struct IsolateContext {
    pub dispatcher: Option<Arc<Dispatcher>>,
    pub fs_mount: Option<(Arc<dyn FileSystemHandler>, crate::fs::MountId)>,
}

pub struct IsolateRegistry {
    config: Config,
    pool: IsolatePool,
    contexts: DashMap<IsolateId, IsolateContext>,
    fs_registry: Arc<HandleRegistry>,
    module_loader: Arc<dyn ModuleLoaderClient>,
    /// Live sessions, keyed by connection id. `createRuntime` looks its
    /// caller up here to hand the new isolate session-backed fetch/fs
    /// callbacks instead of the bare `Uuid` `dispatch` receives.
    sessions: DashMap<Uuid, Arc<Session>>,
}

fn map_get<'a>(payload: &'a Value, key: &str) -> Option<&'a Value> {
    payload.as_map().and_then(|m| m.get(key))
}

fn get_str(payload: &Value, key: &str) -> DaemonResult<String> {
    map_get(payload, key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DaemonError::ProtocolError(format!("missing/invalid field '{key}'")))
}

fn get_opt_str(payload: &Value, key: &str) -> Option<String> {
    map_get(payload, key).and_then(Value::as_str).map(str::to_string)
}

fn get_u64(payload: &Value, key: &str) -> DaemonResult<u64> {
    match map_get(payload, key) {
        Some(Value::I64(n)) => Ok(*n as u64),
        _ => Err(DaemonError::ProtocolError(format!("missing/invalid field '{key}'"))),
    }
}

fn as_callback_id(v: &Value) -> Option<u64> {
    match v {
        Value::I64(n) => Some(*n as u64),
        _ => None,
    }
}

/// `callbacks.fs` names a callback id per POSIX-style operation
/// (`readFile`, `writeFile`, ...); `SessionFileSystemHandler` multiplexes
/// every `FileSystemHandler` method onto one callback (tagging the call
/// with an `op` field) rather than tracking eight independent ids, so any
/// one of them identifies the handler the client registered.
fn fs_callback_id(fs: &Value) -> Option<u64> {
    const KEYS: &[&str] = &["readFile", "writeFile", "unlink", "readdir", "mkdir", "rmdir", "stat", "rename"];
    KEYS.iter().find_map(|key| map_get(fs, key).and_then(as_callback_id))
}

fn value_to_headers(v: &Value) -> Vec<(String, String)> {
    match v.as_map() {
        Some(m) => m
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect(),
        None => Vec::new(),
    }
}

impl IsolateRegistry {
    pub fn new(config: Config, module_loader: Arc<dyn ModuleLoaderClient>) -> Self {
        let max_isolates = config.max_isolates;
        Self {
            config,
            pool: IsolatePool::new(max_isolates),
            contexts: DashMap::new(),
            fs_registry: Arc::new(HandleRegistry::new()),
            module_loader,
            sessions: DashMap::new(),
        }
    }

    /// Track a live session so `createRuntime` can look it up by id.
    /// Called once per accepted connection, before its request loop
    /// starts routing through `dispatch`.
    pub fn register_session(&self, session: Arc<Session>) {
        self.sessions.insert(session.id(), session);
    }

    /// Drop a session's bookkeeping on disconnect. Isolates it owned are
    /// released separately by the caller disposing/soft-deleting them;
    /// this only stops `createRuntime` from finding a dead session.
    pub fn unregister_session(&self, session_id: Uuid) {
        self.sessions.remove(&session_id);
    }

    /// Route one decoded `Req` to the matching operation, returning the
    /// `RESP_OK` payload or a structured `DaemonError` to be reported as
    /// `RESP_ERR` by the caller.
    #[instrument(skip(self, payload), fields(op))]
    pub async fn dispatch(&self, session: Uuid, op: &str, payload: Value) -> DaemonResult<Value> {
        match op {
            "createRuntime" => self.create_runtime(session, payload).await,
            "dispose" => self.dispose(payload).await,
            "eval" => self.eval(payload).await,
            "heapUsage" => self.heap_usage(payload).await,
            "hasServeHandler" => self.has_serve_handler(payload),
            "hasActiveConnections" => self.has_active_connections(payload),
            "dispatchWsOpen" => self.dispatch_ws_open(payload),
            "dispatchWsMessage" => self.dispatch_ws_message(payload),
            "dispatchWsClose" => self.dispatch_ws_close(payload),
            "dispatchWsError" => self.dispatch_ws_error(payload),
            "getUpgradeRequest" => self.get_upgrade_request(payload),
            "dispatchRequest" => self.dispatch_request(payload).await,
            "fs.getFileHandle" => self.fs_get_file_handle(payload).await,
            "fs.readFile" => self.fs_read_file(payload).await,
            "fs.writeFile" => self.fs_write_file(payload).await,
            "fs.removeEntry" => self.fs_remove_entry(payload).await,
            "fs.readDirectory" => self.fs_read_directory(payload).await,
            "fs.truncateFile" => self.fs_truncate_file(payload).await,
            "fs.getFileMetadata" => self.fs_get_file_metadata(payload).await,
            "listIsolates" => self.list_isolates(),
            "stats" => self.stats(),
            other => Err(DaemonError::ProtocolError(format!("unknown op '{other}'"))),
        }
    }

    async fn create_runtime(&self, session: Uuid, payload: Value) -> DaemonResult<Value> {
        let namespace_id = get_opt_str(&payload, "namespaceId");
        let memory_limit_mb = map_get(&payload, "memoryLimitMb")
            .and_then(|v| if let Value::I64(n) = v { Some(*n as u32) } else { None })
            .unwrap_or(self.config.isolate_memory_mb);

        let session_handle = self
            .sessions
            .get(&session)
            .map(|r| r.clone())
            .ok_or(DaemonError::ConnectionClosed)?;
        let callbacks = map_get(&payload, "callbacks");
        let fs_handler = self.build_fs_handler(&session_handle, callbacks);
        let deps = self.build_isolate_deps(&session_handle, callbacks, fs_handler.clone());

        let loader = self.module_loader.clone();
        let outcome = self
            .pool
            .create_runtime(namespace_id, session, || {
                IsolateHost::spawn(
                    crate::isolate::next_isolate_id(),
                    memory_limit_mb,
                    loader,
                    Arc::new(IdentityTransformer),
                    deps,
                )
            })
            .await?;

        self.contexts.entry(outcome.isolate_id).or_insert_with(|| {
            let guest = self
                .pool
                .isolate_handle(outcome.isolate_id)
                .map(|host| Arc::new(host) as Arc<dyn GuestDispatch>);
            let fs_mount = fs_handler.map(|handler| {
                let mount = self.fs_registry_mount(handler.clone());
                (handler, mount)
            });
            IsolateContext {
                dispatcher: guest.map(|guest| Arc::new(Dispatcher::new(guest))),
                fs_mount,
            }
        });

        let mut map = BTreeMap::new();
        map.insert("isolateId".to_string(), Value::I64(outcome.isolate_id as i64));
        map.insert("reused".to_string(), Value::Bool(outcome.reused));
        Ok(Value::Map(map))
    }

    /// Build the implementors `IsolateHost` needs straight from the
    /// `createRuntime` payload's `callbacks` object, so `serve()`/`fetch()`
    /// /the FS surface are live from the isolate's first command rather
    /// than wired in after the fact by a caller that remembers to call
    /// `attach_fs_mount`/`attach_dispatcher`.
    ///
    /// `callbacks.fs` names per-operation callback ids in the wire
    /// format; this bridge multiplexes all of them onto the single
    /// `FileSystemHandler` callback the client registers, tagging each
    /// call with an `op` field instead — see `SessionFileSystemHandler`.
    /// `moduleLoader`/`custom`/`playwright`/`testEnvironment` callbacks
    /// are acknowledged but not yet backed by a host-side implementor;
    /// logged rather than silently dropped.
    fn build_fs_handler(&self, session: &Arc<Session>, callbacks: Option<&Value>) -> Option<Arc<dyn FileSystemHandler>> {
        callbacks
            .and_then(|c| map_get(c, "fs"))
            .and_then(fs_callback_id)
            .map(|id| Arc::new(SessionFileSystemHandler::new(session.clone(), id, None)) as Arc<dyn FileSystemHandler>)
    }

    fn build_isolate_deps(
        &self,
        session: &Arc<Session>,
        callbacks: Option<&Value>,
        fs_handler: Option<Arc<dyn FileSystemHandler>>,
    ) -> IsolateDeps {
        let fetch_client = callbacks
            .and_then(|c| map_get(c, "fetch"))
            .and_then(as_callback_id)
            .map(|id| Arc::new(SessionFetchClient::new(session.clone(), id, None)) as Arc<dyn FetchClient>);

        if let Some(c) = callbacks {
            for unsupported in ["moduleLoader", "custom", "playwright", "testEnvironment"] {
                if map_get(c, unsupported).is_some() {
                    warn!(callback = unsupported, "createRuntime callback acknowledged but not backed by a host implementor yet");
                }
            }
        }

        IsolateDeps {
            runtime_handle: tokio::runtime::Handle::current(),
            console: Arc::new(TracingConsoleSink),
            fetch_client,
            fs_handler,
            bridge: Arc::new(BridgeKernel::new()),
        }
    }

    async fn dispose(&self, payload: Value) -> DaemonResult<Value> {
        let isolate_id = get_u64(&payload, "isolateId")?;
        self.pool.dispose(isolate_id).await;
        self.contexts.remove(&isolate_id);
        Ok(Value::Null)
    }

    async fn eval(&self, payload: Value) -> DaemonResult<Value> {
        let isolate_id = get_u64(&payload, "isolateId")?;
        let code = get_str(&payload, "code")?;
        let filename = get_opt_str(&payload, "filename");
        let host = self.require_host(isolate_id)?;
        host.eval(code, filename).await?;
        Ok(Value::Null)
    }

    async fn heap_usage(&self, payload: Value) -> DaemonResult<Value> {
        let isolate_id = get_u64(&payload, "isolateId")?;
        let host = self.require_host(isolate_id)?;
        let bytes = host.heap_usage_bytes().await?;
        Ok(Value::I64(bytes as i64))
    }

    fn require_host(&self, isolate_id: IsolateId) -> DaemonResult<IsolateHost> {
        self.pool
            .owner(isolate_id)
            .ok_or(DaemonError::IsolateNotFound(isolate_id))?;
        // The pool owns isolate lifetimes but hands out hosts by id only
        // through create_runtime; routed ops re-derive nothing here since
        // IsolateHost is cheaply Clone and the pool is the source of truth.
        self.pool.isolate_handle(isolate_id).ok_or(DaemonError::IsolateNotFound(isolate_id))
    }

    fn require_dispatcher(&self, isolate_id: IsolateId) -> DaemonResult<Arc<Dispatcher>> {
        self.contexts
            .get(&isolate_id)
            .and_then(|ctx| ctx.dispatcher.clone())
            .ok_or(DaemonError::IsolateNotFound(isolate_id))
    }

    fn has_serve_handler(&self, payload: Value) -> DaemonResult<Value> {
        let isolate_id = get_u64(&payload, "isolateId")?;
        Ok(Value::Bool(self.require_dispatcher(isolate_id)?.has_serve_handler()))
    }

    fn has_active_connections(&self, payload: Value) -> DaemonResult<Value> {
        let isolate_id = get_u64(&payload, "isolateId")?;
        Ok(Value::Bool(self.require_dispatcher(isolate_id)?.has_active_connections()))
    }

    fn parse_connection_id(payload: &Value) -> DaemonResult<ConnectionId> {
        let raw = get_str(payload, "connectionId")?;
        raw.parse()
            .map_err(|_| DaemonError::ProtocolError("connectionId is not a UUID".to_string()))
    }

    /// `dispatchRequest` (§4.7): the client hands in a request it
    /// accepted on a listening socket of its own; the dispatcher calls
    /// the guest's `serve({fetch})` and the response comes back the same
    /// way. Headers round-trip as a flat map (duplicate header names
    /// collapse), matching the convention `fetch()`'s own request/response
    /// marshalling already uses.
    async fn dispatch_request(&self, payload: Value) -> DaemonResult<Value> {
        let isolate_id = get_u64(&payload, "isolateId")?;
        let method = get_str(&payload, "method")?;
        let url = get_str(&payload, "url")?;
        let headers = map_get(&payload, "headers").map(value_to_headers).unwrap_or_default();
        let body = match map_get(&payload, "body") {
            Some(Value::Bytes(b)) => Some(crate::http::dispatcher::BodySpec::Inline(b.clone())),
            Some(Value::I64(stream_id)) => Some(crate::http::dispatcher::BodySpec::Stream(*stream_id as u32)),
            _ => None,
        };

        let dispatcher = self.require_dispatcher(isolate_id)?;
        let resp = dispatcher
            .dispatch_request(crate::http::dispatcher::SerializedRequest { method, url, headers, body })
            .await?;

        let mut map = BTreeMap::new();
        map.insert("status".to_string(), Value::I64(resp.status as i64));
        map.insert("statusText".to_string(), Value::String(resp.status_text));
        map.insert("headers".to_string(), crate::isolate::headers_to_value(&resp.headers));
        map.insert(
            "body".to_string(),
            match resp.body {
                Some(crate::http::dispatcher::BodySpec::Inline(b)) => Value::Bytes(b),
                Some(crate::http::dispatcher::BodySpec::Stream(id)) => Value::I64(id as i64),
                None => Value::Null,
            },
        );
        Ok(Value::Map(map))
    }

    fn dispatch_ws_open(&self, payload: Value) -> DaemonResult<Value> {
        let isolate_id = get_u64(&payload, "isolateId")?;
        let conn = Self::parse_connection_id(&payload)?;
        self.require_dispatcher(isolate_id)?.dispatch_ws_open(conn);
        Ok(Value::Null)
    }

    fn dispatch_ws_message(&self, payload: Value) -> DaemonResult<Value> {
        let isolate_id = get_u64(&payload, "isolateId")?;
        let conn = Self::parse_connection_id(&payload)?;
        let message = match map_get(&payload, "text") {
            Some(Value::String(text)) => WsMessagePayload::Text(text.clone()),
            _ => match map_get(&payload, "binary") {
                Some(Value::Bytes(bytes)) => WsMessagePayload::Binary(bytes.clone()),
                _ => return Err(DaemonError::ProtocolError("ws message missing text/binary".into())),
            },
        };
        self.require_dispatcher(isolate_id)?.dispatch_ws_message(conn, message);
        Ok(Value::Null)
    }

    fn dispatch_ws_close(&self, payload: Value) -> DaemonResult<Value> {
        let isolate_id = get_u64(&payload, "isolateId")?;
        let conn = Self::parse_connection_id(&payload)?;
        let code = match map_get(&payload, "code") {
            Some(Value::I64(n)) => Some(*n as u16),
            _ => None,
        };
        let reason = get_opt_str(&payload, "reason");
        self.require_dispatcher(isolate_id)?.dispatch_ws_close(conn, code, reason);
        Ok(Value::Null)
    }

    fn dispatch_ws_error(&self, payload: Value) -> DaemonResult<Value> {
        let isolate_id = get_u64(&payload, "isolateId")?;
        let conn = Self::parse_connection_id(&payload)?;
        let error = get_opt_str(&payload, "error").unwrap_or_default();
        self.require_dispatcher(isolate_id)?.dispatch_ws_error(conn, error);
        Ok(Value::Null)
    }

    fn get_upgrade_request(&self, payload: Value) -> DaemonResult<Value> {
        let isolate_id = get_u64(&payload, "isolateId")?;
        match self.require_dispatcher(isolate_id)?.get_upgrade_request() {
            Some((req, data)) => {
                let mut map = BTreeMap::new();
                map.insert("method".to_string(), Value::String(req.method));
                map.insert("url".to_string(), Value::String(req.url));
                map.insert("data".to_string(), data);
                Ok(Value::Map(map))
            }
            None => Ok(Value::Null),
        }
    }

    fn require_fs_mount(&self, isolate_id: IsolateId) -> DaemonResult<(Arc<dyn FileSystemHandler>, crate::fs::MountId)> {
        self.contexts
            .get(&isolate_id)
            .and_then(|ctx| ctx.fs_mount.clone())
            .ok_or_else(|| DaemonError::ProtocolError("no directory mounted for this isolate".to_string()))
    }

    async fn fs_get_file_handle(&self, payload: Value) -> DaemonResult<Value> {
        let isolate_id = get_u64(&payload, "isolateId")?;
        let path = get_str(&payload, "path")?;
        let create = matches!(map_get(&payload, "create"), Some(Value::Bool(true)));
        let (handler, mount) = self.require_fs_mount(isolate_id)?;
        handler
            .get_file_handle(&path, create)
            .await
            .map_err(|(kind, msg)| DaemonError::ScriptError(crate::error::ScriptErrorInfo {
                name: kind.as_str().to_string(),
                message: kind.encode(&msg),
                stack: None,
            }))?;
        let handle_id = self.fs_registry.handle_for(mount, &path, HandleKind::File);
        Ok(Value::I64(handle_id as i64))
    }

    async fn fs_read_file(&self, payload: Value) -> DaemonResult<Value> {
        let isolate_id = get_u64(&payload, "isolateId")?;
        let path = get_str(&payload, "path")?;
        let (handler, _) = self.require_fs_mount(isolate_id)?;
        let bytes = handler.read_file(&path).await.map_err(fs_error_to_daemon_error)?;
        Ok(Value::Bytes(bytes))
    }

    async fn fs_write_file(&self, payload: Value) -> DaemonResult<Value> {
        let isolate_id = get_u64(&payload, "isolateId")?;
        let path = get_str(&payload, "path")?;
        let bytes = match map_get(&payload, "bytes") {
            Some(Value::Bytes(b)) => b.clone(),
            _ => return Err(DaemonError::ProtocolError("writeFile missing bytes".into())),
        };
        let position = match map_get(&payload, "position") {
            Some(Value::I64(n)) => Some(*n as u64),
            _ => None,
        };
        let (handler, _) = self.require_fs_mount(isolate_id)?;
        handler
            .write_file(&path, &bytes, position)
            .await
            .map_err(fs_error_to_daemon_error)?;
        Ok(Value::Null)
    }

    async fn fs_remove_entry(&self, payload: Value) -> DaemonResult<Value> {
        let isolate_id = get_u64(&payload, "isolateId")?;
        let path = get_str(&payload, "path")?;
        let recursive = matches!(map_get(&payload, "recursive"), Some(Value::Bool(true)));
        let (handler, _) = self.require_fs_mount(isolate_id)?;
        handler.remove_entry(&path, recursive).await.map_err(fs_error_to_daemon_error)?;
        Ok(Value::Null)
    }

    async fn fs_read_directory(&self, payload: Value) -> DaemonResult<Value> {
        let isolate_id = get_u64(&payload, "isolateId")?;
        let path = get_str(&payload, "path")?;
        let (handler, mount) = self.require_fs_mount(isolate_id)?;
        let entries = handler.read_directory(&path).await.map_err(fs_error_to_daemon_error)?;
        let registered = self.fs_registry.register_listing(mount, &path, &entries);
        let items = registered
            .into_iter()
            .map(|(id, entry)| {
                let mut m = BTreeMap::new();
                m.insert("handleId".to_string(), Value::I64(id as i64));
                m.insert("name".to_string(), Value::String(entry.name));
                m.insert(
                    "kind".to_string(),
                    Value::String(match entry.kind {
                        HandleKind::File => "file".to_string(),
                        HandleKind::Directory => "directory".to_string(),
                    }),
                );
                Value::Map(m)
            })
            .collect();
        Ok(Value::Array(items))
    }

    async fn fs_truncate_file(&self, payload: Value) -> DaemonResult<Value> {
        let isolate_id = get_u64(&payload, "isolateId")?;
        let path = get_str(&payload, "path")?;
        let size = get_u64(&payload, "size")?;
        let (handler, _) = self.require_fs_mount(isolate_id)?;
        handler.truncate_file(&path, size).await.map_err(fs_error_to_daemon_error)?;
        Ok(Value::Null)
    }

    async fn fs_get_file_metadata(&self, payload: Value) -> DaemonResult<Value> {
        let isolate_id = get_u64(&payload, "isolateId")?;
        let path = get_str(&payload, "path")?;
        let (handler, _) = self.require_fs_mount(isolate_id)?;
        let meta = handler.get_file_metadata(&path).await.map_err(fs_error_to_daemon_error)?;
        let mut map = BTreeMap::new();
        map.insert("size".to_string(), Value::I64(meta.size as i64));
        map.insert("lastModifiedMs".to_string(), Value::I64(meta.last_modified_ms));
        Ok(Value::Map(map))
    }

    fn fs_registry_mount(&self, handler: Arc<dyn FileSystemHandler>) -> crate::fs::MountId {
        self.fs_registry.mount(handler)
    }

    /// Stateless read-only query surface, in the spirit of the teacher's
    /// `HealthModule` sitting alongside the main command table.
    fn list_isolates(&self) -> DaemonResult<Value> {
        let rows = self
            .pool
            .snapshot()
            .into_iter()
            .map(|(id, namespace, idle)| {
                let mut m = BTreeMap::new();
                m.insert("isolateId".to_string(), Value::I64(id as i64));
                m.insert(
                    "namespaceId".to_string(),
                    namespace.map(Value::String).unwrap_or(Value::Null),
                );
                m.insert("idle".to_string(), Value::Bool(idle));
                Value::Map(m)
            })
            .collect();
        Ok(Value::Array(rows))
    }

    fn stats(&self) -> DaemonResult<Value> {
        let snapshot = self.pool.snapshot();
        let idle = snapshot.iter().filter(|(_, _, idle)| *idle).count();
        let mut m = BTreeMap::new();
        m.insert("isolateCount".to_string(), Value::I64(snapshot.len() as i64));
        m.insert("idleCount".to_string(), Value::I64(idle as i64));
        m.insert("maxIsolates".to_string(), Value::I64(self.config.max_isolates as i64));
        Ok(Value::Map(m))
    }
}

fn fs_error_to_daemon_error((kind, msg): (crate::error::DomExceptionKind, String)) -> DaemonError {
    DaemonError::ScriptError(crate::error::ScriptErrorInfo {
        name: kind.as_str().to_string(),
        message: kind.encode(&msg),
        stack: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    struct NoopLoader;
    impl ModuleLoaderClient for NoopLoader {
        fn load(&self, _s: &str, _d: &str) -> DaemonResult<crate::isolate::module_loader::LoadedSource> {
            Err(DaemonError::ProtocolError("no loader in test".into()))
        }
    }

    fn registry() -> IsolateRegistry {
        let cfg = Config::parse_from(["isolate-daemon"]);
        IsolateRegistry::new(cfg, Arc::new(NoopLoader))
    }

    /// `createRuntime` builds its isolate's callbacks from a registered
    /// session, so tests that create isolates need a live one — a
    /// connected-to-nothing duplex pipe is enough since nothing in these
    /// tests actually invokes a client callback.
    fn registered_session(reg: &IsolateRegistry) -> Uuid {
        let (client, _server) = tokio::io::duplex(4096);
        let (session, _inbound) = Session::spawn(client, 1 << 20);
        let id = session.id();
        reg.register_session(session);
        id
    }

    #[tokio::test]
    async fn unknown_op_reports_protocol_error() {
        let reg = registry();
        let err = reg.dispatch(Uuid::new_v4(), "bogus", Value::Null).await.unwrap_err();
        assert!(matches!(err, DaemonError::ProtocolError(_)));
    }

    #[tokio::test]
    async fn create_and_dispose_round_trip() {
        let reg = registry();
        let session = registered_session(&reg);
        let mut payload = BTreeMap::new();
        payload.insert("memoryLimitMb".to_string(), Value::I64(32));
        let resp = reg.dispatch(session, "createRuntime", Value::Map(payload)).await.unwrap();
        let isolate_id = match &resp {
            Value::Map(m) => match m.get("isolateId").unwrap() {
                Value::I64(n) => *n as u64,
                _ => panic!("expected i64 isolateId"),
            },
            _ => panic!("expected map response"),
        };

        let mut dispose_payload = BTreeMap::new();
        dispose_payload.insert("isolateId".to_string(), Value::I64(isolate_id as i64));
        reg.dispatch(session, "dispose", Value::Map(dispose_payload)).await.unwrap();
    }

    #[tokio::test]
    async fn stats_reports_isolate_count_after_create() {
        let reg = registry();
        let session = registered_session(&reg);
        reg.dispatch(session, "createRuntime", Value::Null).await.unwrap();
        let resp = reg.dispatch(Uuid::new_v4(), "stats", Value::Null).await.unwrap();
        match resp {
            Value::Map(m) => assert_eq!(m.get("isolateCount"), Some(&Value::I64(1))),
            _ => panic!("expected map response"),
        }
    }

    #[tokio::test]
    async fn eval_against_unknown_isolate_reports_not_found() {
        let reg = registry();
        let mut payload = BTreeMap::new();
        payload.insert("isolateId".to_string(), Value::I64(999));
        payload.insert("code".to_string(), Value::String("1".to_string()));
        let err = reg.dispatch(Uuid::new_v4(), "eval", Value::Map(payload)).await.unwrap_err();
        assert!(matches!(err, DaemonError::IsolateNotFound(999)));
    }
}
