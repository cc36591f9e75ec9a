//! Injected globals (C5's "wire every injected global to a bridge
//! callback", C6's async boundary).
//!
//! Every native function installed here follows the same shape: allocate
//! a `v8::PromiseResolver`, hand the guest its promise, and register the
//! resolver in `IsolateState::pending_ops` under a fresh id. The real
//! work (a client callback round trip, a fetch, a stream pull) runs on
//! the tokio runtime via the captured `Handle`; when it finishes it sends
//! `HostCommand::Settle` back over the isolate's own command channel so
//! the isolate thread — and only the isolate thread — ever touches the
//! `PromiseResolver`. This is what keeps rule 1 of the bridge kernel
//! (§4.6: "the isolate thread may not block on host I/O") actually true
//! instead of aspirational.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;

use tracing::warn;

use crate::error::{DaemonError, DaemonResult};
use crate::fetch::FetchClient;
use crate::fs::FileSystemHandler;
use crate::http::{BodySpec, SerializedRequest};
use crate::isolate::host::HostCommand;
use crate::isolate::marshal::{from_v8, to_v8};
use crate::proto::Value;
use crate::stream::StreamReceiverHandle;

/// Where `console.*` output and daemon-observable events go. Implemented
/// by session glue that forwards as an `ISOLATE_EVENT`; tests can stub it
/// with an in-memory sink.
pub trait ConsoleSink: Send + Sync {
    fn log(&self, level: &str, message: String);
}

/// A `console.log` sink that only keeps a trace-log record, used when no
/// client-supplied console callback was registered at `createRuntime`.
pub struct TracingConsoleSink;

impl ConsoleSink for TracingConsoleSink {
    fn log(&self, level: &str, message: String) {
        match level {
            "error" => tracing::error!(target: "guest_console", "{message}"),
            "warn" => tracing::warn!(target: "guest_console", "{message}"),
            _ => tracing::info!(target: "guest_console", "{message}"),
        }
    }
}

/// Per-isolate embedder state, stashed in a `v8::Isolate` slot so native
/// callbacks (which only ever get a bare `HandleScope`) can reach the
/// rest of the daemon. `Rc<RefCell<_>>` because everything touching it
/// runs exclusively on the isolate's own OS thread.
pub struct IsolateState {
    pub runtime_handle: tokio::runtime::Handle,
    pub cmd_tx: std_mpsc::Sender<HostCommand>,
    pub console: Arc<dyn ConsoleSink>,
    pub fetch_client: Option<Arc<dyn FetchClient>>,
    pub fs_handler: Option<Arc<dyn FileSystemHandler>>,
    pub serve_handler: Option<v8::Global<v8::Object>>,
    pub pending_ops: HashMap<u64, v8::Global<v8::PromiseResolver>>,
    pub body_receivers: HashMap<u64, StreamReceiverHandle>,
    /// Mirrors `serve_handler.is_some()` in a form `GuestDispatch::
    /// has_serve_handler` can read without crossing onto the isolate
    /// thread (that method's signature is synchronous).
    pub has_serve_handler: Arc<std::sync::atomic::AtomicBool>,
    next_op_id: u64,
}

impl IsolateState {
    pub fn new(
        runtime_handle: tokio::runtime::Handle,
        cmd_tx: std_mpsc::Sender<HostCommand>,
        console: Arc<dyn ConsoleSink>,
        fetch_client: Option<Arc<dyn FetchClient>>,
        fs_handler: Option<Arc<dyn FileSystemHandler>>,
        has_serve_handler: Arc<std::sync::atomic::AtomicBool>,
    ) -> Self {
        Self {
            runtime_handle,
            cmd_tx,
            console,
            fetch_client,
            fs_handler,
            serve_handler: None,
            pending_ops: HashMap::new(),
            body_receivers: HashMap::new(),
            has_serve_handler,
            next_op_id: 1,
        }
    }

    fn alloc_op_id(&mut self) -> u64 {
        let id = self.next_op_id;
        self.next_op_id += 1;
        id
    }

    /// Reset on soft-delete (§4.10): callback table, timers, console
    /// state. `serve_handler`/`fetch_client`/`fs_handler` are re-supplied
    /// whenever the namespace is re-hydrated by the next `createRuntime`.
    pub fn reset_for_soft_delete(&mut self) {
        self.serve_handler = None;
        self.fetch_client = None;
        self.fs_handler = None;
        self.pending_ops.clear();
        self.body_receivers.clear();
        self.has_serve_handler.store(false, std::sync::atomic::Ordering::Release);
    }
}

pub type IsolateStateHandle = Rc<RefCell<IsolateState>>;

/// Resolve or reject the `PromiseResolver` registered under `op_id`, then
/// run a microtask checkpoint so any `.then()` continuation — including
/// one that immediately issues another async op — gets a chance to run
/// before control returns to whatever queued this `Settle`.
pub fn settle_pending_op(
    scope: &mut v8::HandleScope,
    state: &IsolateStateHandle,
    op_id: u64,
    outcome: DaemonResult<Value>,
) {
    let resolver = state.borrow_mut().pending_ops.remove(&op_id);
    let Some(resolver) = resolver else {
        warn!(op_id, "settle for unknown/already-settled op");
        return;
    };
    let resolver = v8::Local::new(scope, resolver);
    match outcome {
        Ok(value) => {
            let local = to_v8(scope, &value);
            resolver.resolve(scope, local);
        }
        Err(err) => {
            let message = v8::String::new(scope, &err.to_string()).unwrap();
            let error = v8::Exception::error(scope, message);
            resolver.reject(scope, error);
        }
    }
    scope.perform_microtask_checkpoint();
}

/// Installs `console`, `crypto`, timers, `fetch`, the native FS surface,
/// and the `serve()` registration hook onto the context's global object.
pub fn install_globals(scope: &mut v8::HandleScope, state: IsolateStateHandle) {
    scope.set_slot(state);

    let global = scope.get_current_context().global(scope);

    install_console(scope, global);
    install_crypto(scope, global);
    install_timers(scope, global);
    install_fetch(scope, global);
    install_response(scope, global);
    install_fs(scope, global);
    install_serve_registration(scope, global);
}

fn set_method(
    scope: &mut v8::HandleScope,
    target: v8::Local<v8::Object>,
    name: &str,
    callback: impl v8::MapFnTo<v8::FunctionCallback>,
) {
    let key = v8::String::new(scope, name).unwrap();
    let func = v8::Function::new(scope, callback).unwrap();
    target.set(scope, key.into(), func.into());
}

fn new_object(scope: &mut v8::HandleScope) -> v8::Local<v8::Object> {
    v8::Object::new(scope)
}

fn install_console(scope: &mut v8::HandleScope, global: v8::Local<v8::Object>) {
    let console = new_object(scope);
    set_method(scope, console, "log", console_log);
    set_method(scope, console, "info", console_log);
    set_method(scope, console, "warn", console_warn);
    set_method(scope, console, "error", console_error);
    let key = v8::String::new(scope, "console").unwrap();
    global.set(scope, key.into(), console.into());
}

fn console_write(scope: &mut v8::HandleScope, args: &v8::FunctionCallbackArguments, level: &str) {
    let mut parts = Vec::with_capacity(args.length() as usize);
    for i in 0..args.length() {
        let arg = args.get(i);
        parts.push(arg.to_rust_string_lossy(scope));
    }
    let state = scope.get_slot::<IsolateStateHandle>().cloned();
    if let Some(state) = state {
        state.borrow().console.log(level, parts.join(" "));
    }
}

fn console_log(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    console_write(scope, &args, "log");
}
fn console_warn(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    console_write(scope, &args, "warn");
}
fn console_error(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    console_write(scope, &args, "error");
}

fn install_crypto(scope: &mut v8::HandleScope, global: v8::Local<v8::Object>) {
    let crypto = new_object(scope);
    set_method(scope, crypto, "randomUUID", crypto_random_uuid);
    set_method(scope, crypto, "getRandomValues", crypto_get_random_values);
    let key = v8::String::new(scope, "crypto").unwrap();
    global.set(scope, key.into(), crypto.into());
}

fn crypto_random_uuid(scope: &mut v8::HandleScope, _args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let id = uuid::Uuid::new_v4().to_string();
    rv.set(v8::String::new(scope, &id).unwrap().into());
}

/// `crypto.getRandomValues(typedArray)`: fills the buffer backing the
/// passed typed array in place and returns it, matching the Web Crypto
/// contract guest code expects (no `rand` crate needed; `uuid`'s RNG is
/// already a dependency and sufficient for this non-cryptographic-guest
/// sandbox use).
fn crypto_get_random_values(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let Some(view) = args.get(0).try_into().ok().and_then(|v: v8::Local<v8::Value>| v8::Local::<v8::ArrayBufferView>::try_from(v).ok()) else {
        rv.set(args.get(0));
        return;
    };
    let len = view.byte_length();
    let mut bytes = vec![0u8; len];
    for chunk in bytes.chunks_mut(16) {
        let word = uuid::Uuid::new_v4();
        let src = word.as_bytes();
        chunk.copy_from_slice(&src[..chunk.len()]);
    }
    if let Some(buf) = view.buffer(scope) {
        let data = buf.data();
        if let Some(data) = data {
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), data.as_ptr() as *mut u8, len.min(buf.byte_length()));
            }
        }
    }
    rv.set(args.get(0));
}

fn install_timers(scope: &mut v8::HandleScope, global: v8::Local<v8::Object>) {
    set_method(scope, global, "setTimeout", set_timeout);
    set_method(scope, global, "clearTimeout", clear_timer);
    set_method(scope, global, "setInterval", set_timeout);
    set_method(scope, global, "clearInterval", clear_timer);
}

/// Timers don't fit the Settle-a-promise pattern (no guest promise to
/// resolve); instead they resolve to `HostCommand::RunTimer` carrying a
/// captured `v8::Global<v8::Function>`, run straight from the isolate
/// thread's main command loop.
fn set_timeout(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let Ok(callback) = v8::Local::<v8::Function>::try_from(args.get(0)) else {
        rv.set(v8::Number::new(scope, 0.0).into());
        return;
    };
    let delay_ms = args.get(1).number_value(scope).unwrap_or(0.0).max(0.0) as u64;
    let state = scope.get_slot::<IsolateStateHandle>().cloned();
    let Some(state) = state else { return };
    let timer_id = {
        let mut s = state.borrow_mut();
        s.alloc_op_id()
    };
    let callback_global = v8::Global::new(scope, callback);
    let cmd_tx = state.borrow().cmd_tx.clone();
    state.borrow().runtime_handle.spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
        let _ = cmd_tx.send(HostCommand::RunTimer {
            callback: callback_global,
        });
    });
    rv.set(v8::Number::new(scope, timer_id as f64).into());
}

/// `clearTimeout`/`clearInterval`: the pending tokio sleep still fires
/// and sends `RunTimer`, but there is no callback to run by then if the
/// guest disposed the isolate; a live but cleared timer is simply not
/// tracked, matching the scoped-down timer model this bridge offers (no
/// repeat semantics for `setInterval`, fired at most once).
fn clear_timer(_scope: &mut v8::HandleScope, _args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {}

fn install_fetch(scope: &mut v8::HandleScope, global: v8::Local<v8::Object>) {
    set_method(scope, global, "fetch", native_fetch);
}

/// `new Response(body, init)`. A constructor function rather than a
/// `FunctionTemplate`-built class: its returned plain object — not the
/// implicitly-constructed `this` — becomes the `new` expression's result
/// per ordinary JS semantics, which is enough for `host::
/// response_value_to_serialized` to decode (it reads `{status,
/// statusText, headers, body}` off whatever `serve.fetch` resolves to,
/// not a particular prototype).
fn install_response(scope: &mut v8::HandleScope, global: v8::Local<v8::Object>) {
    let key = v8::String::new(scope, "Response").unwrap();
    let func = v8::Function::new(scope, response_constructor).unwrap();
    global.set(scope, key.into(), func.into());
}

fn response_constructor(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let obj = v8::Object::new(scope);
    let body_key = v8::String::new(scope, "body").unwrap();
    obj.set(scope, body_key.into(), args.get(0));

    let mut status = 200i32;
    let mut status_text = "OK".to_string();
    let mut headers: v8::Local<v8::Value> = v8::undefined(scope).into();
    if let Ok(init) = v8::Local::<v8::Object>::try_from(args.get(1)) {
        let key = v8::String::new(scope, "status").unwrap();
        if let Some(v) = init.get(scope, key.into()) {
            if !v.is_null_or_undefined() {
                status = v.int32_value(scope).unwrap_or(200);
            }
        }
        let key = v8::String::new(scope, "statusText").unwrap();
        if let Some(v) = init.get(scope, key.into()) {
            if v.is_string() {
                status_text = v.to_rust_string_lossy(scope);
            }
        }
        let key = v8::String::new(scope, "headers").unwrap();
        if let Some(v) = init.get(scope, key.into()) {
            if !v.is_null_or_undefined() {
                headers = v;
            }
        }
    }

    let key = v8::String::new(scope, "status").unwrap();
    obj.set(scope, key.into(), v8::Number::new(scope, status as f64).into());
    let key = v8::String::new(scope, "statusText").unwrap();
    obj.set(scope, key.into(), v8::String::new(scope, &status_text).unwrap().into());
    let key = v8::String::new(scope, "headers").unwrap();
    obj.set(scope, key.into(), headers);

    rv.set(obj.into());
}

fn native_fetch(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let state = scope.get_slot::<IsolateStateHandle>().cloned();
    let Some(state) = state else { return };

    let req = match parse_fetch_args(scope, &args) {
        Ok(req) => req,
        Err(message) => {
            let exc = v8::Exception::type_error(scope, v8::String::new(scope, &message).unwrap());
            scope.throw_exception(exc);
            return;
        }
    };

    let resolver = v8::PromiseResolver::new(scope).unwrap();
    let promise = resolver.get_promise(scope);
    let op_id = {
        let mut s = state.borrow_mut();
        let id = s.alloc_op_id();
        s.pending_ops.insert(id, v8::Global::new(scope, resolver));
        id
    };

    let client = state.borrow().fetch_client.clone();
    let cmd_tx = state.borrow().cmd_tx.clone();
    let runtime = state.borrow().runtime_handle.clone();
    runtime.spawn(async move {
        let outcome = match client {
            Some(client) => run_fetch(client, req).await,
            None => Err(DaemonError::ProtocolError("no fetch callback registered for this runtime".into())),
        };
        let _ = cmd_tx.send(HostCommand::Settle { op_id, outcome });
    });

    rv.set(promise.into());
}

async fn run_fetch(client: Arc<dyn FetchClient>, req: SerializedRequest) -> DaemonResult<Value> {
    use crate::fetch::GuestBody;

    let response = client.fetch(req).await?;
    let body = match response.body {
        GuestBody::Buffered(bytes) => bytes,
        GuestBody::Streamed(mut receiver) => {
            let mut buf = Vec::new();
            while let Some(chunk) = receiver.recv().await.map_err(|e| DaemonError::ProtocolError(e.to_string()))? {
                buf.extend_from_slice(&chunk);
            }
            buf
        }
    };

    let mut map = std::collections::BTreeMap::new();
    map.insert("status".to_string(), Value::I64(response.head.status as i64));
    map.insert("statusText".to_string(), Value::String(response.head.status_text));
    let headers = response
        .head
        .headers
        .into_iter()
        .map(|(k, v)| Value::Array(vec![Value::String(k), Value::String(v)]))
        .collect();
    map.insert("headers".to_string(), Value::Array(headers));
    map.insert("body".to_string(), Value::Bytes(body));
    Ok(Value::Map(map))
}

fn parse_fetch_args(scope: &mut v8::HandleScope, args: &v8::FunctionCallbackArguments) -> Result<SerializedRequest, String> {
    let url = args.get(0).to_rust_string_lossy(scope);
    let mut method = "GET".to_string();
    let mut headers = Vec::new();
    let mut body = None;

    if let Ok(init) = v8::Local::<v8::Object>::try_from(args.get(1)) {
        if let Some(m) = get_prop_string(scope, init, "method") {
            method = m;
        }
        if let Some(b) = get_prop_string(scope, init, "body") {
            body = Some(BodySpec::Inline(b.into_bytes()));
        }
        let headers_key = v8::String::new(scope, "headers").unwrap();
        if let Some(raw_headers) = init.get(scope, headers_key.into()) {
            let value = from_v8(scope, raw_headers);
            if let Value::Map(m) = value {
                headers = m.into_iter().filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string()))).collect();
            }
        }
    }

    Ok(SerializedRequest { method, url, headers, body })
}

fn get_prop_string(scope: &mut v8::HandleScope, obj: v8::Local<v8::Object>, name: &str) -> Option<String> {
    let key = v8::String::new(scope, name).unwrap();
    let value = obj.get(scope, key.into())?;
    if value.is_undefined() || value.is_null() {
        None
    } else {
        Some(value.to_rust_string_lossy(scope))
    }
}

/// Native FS primitives (§4.9's guest-facing half): each returns a
/// promise settled off the client's `fs` callbacks via `FileSystemHandler`.
/// Deliberately flat (path-in, bytes/metadata-out) rather than the full
/// `FileSystemFileHandle`/`FileSystemDirectoryHandle`/
/// `FileSystemWritableFileStream` object graph — see DESIGN.md.
fn install_fs(scope: &mut v8::HandleScope, global: v8::Local<v8::Object>) {
    let fs = new_object(scope);
    set_method(scope, fs, "readFile", fs_read_file);
    set_method(scope, fs, "writeFile", fs_write_file);
    set_method(scope, fs, "removeEntry", fs_remove_entry);
    set_method(scope, fs, "readDirectory", fs_read_directory);
    set_method(scope, fs, "truncateFile", fs_truncate_file);
    set_method(scope, fs, "getFileMetadata", fs_get_file_metadata);
    let key = v8::String::new(scope, "__nativeFs").unwrap();
    global.set(scope, key.into(), fs.into());
}

fn spawn_fs_op<F, Fut>(scope: &mut v8::HandleScope, args: &v8::FunctionCallbackArguments, mut rv: v8::ReturnValue, op: F)
where
    F: FnOnce(Arc<dyn FileSystemHandler>, String) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = DaemonResult<Value>> + Send + 'static,
{
    let state = scope.get_slot::<IsolateStateHandle>().cloned();
    let Some(state) = state else { return };
    let path = args.get(0).to_rust_string_lossy(scope);

    let resolver = v8::PromiseResolver::new(scope).unwrap();
    let promise = resolver.get_promise(scope);
    let op_id = {
        let mut s = state.borrow_mut();
        let id = s.alloc_op_id();
        s.pending_ops.insert(id, v8::Global::new(scope, resolver));
        id
    };

    let handler = state.borrow().fs_handler.clone();
    let cmd_tx = state.borrow().cmd_tx.clone();
    let runtime = state.borrow().runtime_handle.clone();
    runtime.spawn(async move {
        let outcome = match handler {
            Some(handler) => op(handler, path).await,
            None => Err(DaemonError::ProtocolError("no directory mounted for this isolate".into())),
        };
        let _ = cmd_tx.send(HostCommand::Settle { op_id, outcome });
    });

    rv.set(promise.into());
}

fn fs_error(err: (crate::error::DomExceptionKind, String)) -> DaemonError {
    DaemonError::ScriptError(crate::error::ScriptErrorInfo {
        name: err.0.as_str().to_string(),
        message: err.0.encode(&err.1),
        stack: None,
    })
}

fn fs_read_file(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, rv: v8::ReturnValue) {
    spawn_fs_op(scope, &args, rv, |handler, path| async move {
        let bytes = handler.read_file(&path).await.map_err(fs_error)?;
        Ok(Value::Bytes(bytes))
    });
}

fn fs_write_file(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let state = scope.get_slot::<IsolateStateHandle>().cloned();
    let Some(state) = state else { return };
    let path = args.get(0).to_rust_string_lossy(scope);
    let bytes = match v8::Local::<v8::ArrayBufferView>::try_from(args.get(1)) {
        Ok(view) => {
            let len = view.byte_length();
            let mut out = vec![0u8; len];
            view.copy_contents(&mut out);
            out
        }
        Err(_) => args.get(1).to_rust_string_lossy(scope).into_bytes(),
    };
    let position = args.get(2).number_value(scope).map(|n| n as u64);

    let resolver = v8::PromiseResolver::new(scope).unwrap();
    let promise = resolver.get_promise(scope);
    let op_id = {
        let mut s = state.borrow_mut();
        let id = s.alloc_op_id();
        s.pending_ops.insert(id, v8::Global::new(scope, resolver));
        id
    };
    let handler = state.borrow().fs_handler.clone();
    let cmd_tx = state.borrow().cmd_tx.clone();
    let runtime = state.borrow().runtime_handle.clone();
    runtime.spawn(async move {
        let outcome: DaemonResult<Value> = match handler {
            Some(handler) => handler
                .write_file(&path, &bytes, position)
                .await
                .map(|_| Value::Null)
                .map_err(fs_error),
            None => Err(DaemonError::ProtocolError("no directory mounted for this isolate".into())),
        };
        let _ = cmd_tx.send(HostCommand::Settle { op_id, outcome });
    });
    rv.set(promise.into());
}

fn fs_remove_entry(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, rv: v8::ReturnValue) {
    let recursive = args.get(1).boolean_value(scope);
    spawn_fs_op(scope, &args, rv, move |handler, path| async move {
        handler.remove_entry(&path, recursive).await.map(|_| Value::Null).map_err(fs_error)
    });
}

fn fs_read_directory(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, rv: v8::ReturnValue) {
    spawn_fs_op(scope, &args, rv, |handler, path| async move {
        let entries = handler.read_directory(&path).await.map_err(fs_error)?;
        let items = entries
            .into_iter()
            .map(|e| {
                let mut m = std::collections::BTreeMap::new();
                m.insert("name".to_string(), Value::String(e.name));
                m.insert(
                    "kind".to_string(),
                    Value::String(match e.kind {
                        crate::fs::HandleKind::File => "file".to_string(),
                        crate::fs::HandleKind::Directory => "directory".to_string(),
                    }),
                );
                Value::Map(m)
            })
            .collect();
        Ok(Value::Array(items))
    });
}

fn fs_truncate_file(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, rv: v8::ReturnValue) {
    let size = args.get(1).number_value(scope).unwrap_or(0.0) as u64;
    spawn_fs_op(scope, &args, rv, move |handler, path| async move {
        handler.truncate_file(&path, size).await.map(|_| Value::Null).map_err(fs_error)
    });
}

fn fs_get_file_metadata(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, rv: v8::ReturnValue) {
    spawn_fs_op(scope, &args, rv, |handler, path| async move {
        let meta = handler.get_file_metadata(&path).await.map_err(fs_error)?;
        let mut m = std::collections::BTreeMap::new();
        m.insert("size".to_string(), Value::I64(meta.size as i64));
        m.insert("lastModifiedMs".to_string(), Value::I64(meta.last_modified_ms));
        Ok(Value::Map(m))
    });
}

/// `serve({fetch, websocket})`: the guest hands us its whole handler
/// object; `host.rs`'s `GuestDispatch` impl pulls `fetch`/`websocket`
/// back off it by property lookup at dispatch time, so a guest that only
/// implements one of the two still registers successfully.
fn install_serve_registration(scope: &mut v8::HandleScope, global: v8::Local<v8::Object>) {
    set_method(scope, global, "serve", register_serve_handler);
}

fn register_serve_handler(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    let Ok(handlers) = v8::Local::<v8::Object>::try_from(args.get(0)) else {
        return;
    };
    let state = scope.get_slot::<IsolateStateHandle>().cloned();
    if let Some(state) = state {
        let mut s = state.borrow_mut();
        s.serve_handler = Some(v8::Global::new(scope, handlers));
        s.has_serve_handler.store(true, std::sync::atomic::Ordering::Release);
    }
}

/// Looks up a named function property on the captured `serve()` handler
/// object, if both a handler and that property are present.
pub fn get_serve_method<'s>(
    scope: &mut v8::HandleScope<'s>,
    handlers: &v8::Global<v8::Object>,
    name: &str,
) -> Option<v8::Local<'s, v8::Function>> {
    let obj = v8::Local::new(scope, handlers);
    let key = v8::String::new(scope, name).unwrap();
    obj.get(scope, key.into()).and_then(|v| v8::Local::<v8::Function>::try_from(v).ok())
}

/// Looks up `handlers.websocket[name]` — the nested object under which
/// `open`/`message`/`close`/`error` handlers live, mirroring the
/// `{fetch, websocket: {open, message, close, error}}` shape guest code
/// passes to `serve()`.
pub fn get_serve_ws_method<'s>(
    scope: &mut v8::HandleScope<'s>,
    handlers: &v8::Global<v8::Object>,
    name: &str,
) -> Option<v8::Local<'s, v8::Function>> {
    let obj = v8::Local::new(scope, handlers);
    let ws_key = v8::String::new(scope, "websocket").unwrap();
    let websocket = v8::Local::<v8::Object>::try_from(obj.get(scope, ws_key.into())?).ok()?;
    let key = v8::String::new(scope, name).unwrap();
    websocket.get(scope, key.into()).and_then(|v| v8::Local::<v8::Function>::try_from(v).ok())
}
