//! Isolate host (C5).
//!
//! One V8 isolate per OS thread — `v8::Isolate` and everything hanging off
//! it (`Local` handles, compiled modules) are thread-affined, so there is
//! no `ConcurrentProcessor`-style shared worker pool here: each isolate
//! gets its own dedicated thread, the way the teacher reserves a whole
//! OS thread for `needs_dedicated_thread` modules like real-time audio.
//! Commands cross onto that thread over a std channel; replies cross back
//! over a `tokio::sync::oneshot` so the async side can simply `.await`.
//!
//! Besides `Eval`/`Dispose`/`SoftDelete`/`HeapUsage`, the command set here
//! also carries the two directions of the async boundary (§4.6): `Settle`
//! resolves a promise a native binding handed to the guest (`fetch`,
//! `fs.*`, any `PromiseSettler::settle` call for a client callback),
//! `RunTimer` fires a captured `setTimeout` callback, and the `CallServe*`
//! family is what lets this isolate actually answer as a `GuestDispatch`
//! for C7's HTTP/WS dispatch path.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use crate::bridge::{BridgeKernel, PromiseSettler};
use crate::error::{DaemonError, DaemonResult, ScriptErrorInfo};
use crate::fetch::FetchClient;
use crate::fs::FileSystemHandler;
use crate::http::{BodySpec, ConnectionId, GuestDispatch, SerializedRequest, SerializedResponse, WsMessagePayload};
use crate::isolate::globals::{self, ConsoleSink, IsolateState, IsolateStateHandle};
use crate::isolate::marshal::{from_v8, headers_to_value, to_v8};
use crate::isolate::module_loader::{
    hash_source, missing_module_loader, ModuleLoaderClient, SourceMapRegistry, SourceTransformer,
    TransformCache,
};
use crate::proto::{IsolateId, Value};

static NEXT_ISOLATE_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_isolate_id() -> IsolateId {
    NEXT_ISOLATE_ID.fetch_add(1, Ordering::Relaxed)
}

/// A compiled-and-linked module, keyed by both its resolved path and its
/// source hash (§4.5 "cache by hash and by resolved path").
struct CompiledModule {
    #[allow(dead_code)]
    hash: u64,
    module: v8::Global<v8::Module>,
}

/// Survives soft-delete/re-hydrate across the namespace pool (§4.10):
/// transformed sources and linked modules stay warm so a re-attached
/// session doesn't pay for re-parsing its whole dependency graph.
#[derive(Default)]
struct StaticModuleCache {
    transform: TransformCache,
    source_maps: SourceMapRegistry,
    by_path: HashMap<String, u64>,
}

/// Cleared on dispose/soft-delete (§4.5): only the per-evaluation link
/// table, not the transformed source or source maps.
#[derive(Default)]
struct EvaluationModuleCache {
    by_hash: HashMap<u64, CompiledModule>,
}

enum HostCommand {
    Eval {
        code: String,
        filename: Option<String>,
        reply: oneshot::Sender<DaemonResult<()>>,
    },
    SoftDelete {
        reply: oneshot::Sender<()>,
    },
    Dispose {
        reply: oneshot::Sender<()>,
    },
    HeapUsage {
        reply: oneshot::Sender<u64>,
    },
    /// Resolve or reject a promise a native binding (or `PromiseSettler`)
    /// previously registered under `op_id`.
    Settle {
        op_id: u64,
        outcome: DaemonResult<Value>,
    },
    /// Fire a captured `setTimeout`/`setInterval` callback.
    RunTimer {
        callback: v8::Global<v8::Function>,
    },
    CallServeFetch {
        request: SerializedRequest,
        reply: oneshot::Sender<DaemonResult<SerializedResponse>>,
    },
    CallServeWsOpen {
        connection_id: ConnectionId,
        reply: oneshot::Sender<DaemonResult<()>>,
    },
    CallServeWsMessage {
        connection_id: ConnectionId,
        message: WsMessagePayload,
        reply: oneshot::Sender<DaemonResult<()>>,
    },
    CallServeWsClose {
        connection_id: ConnectionId,
        code: Option<u16>,
        reason: Option<String>,
        reply: oneshot::Sender<DaemonResult<()>>,
    },
    CallServeWsError {
        connection_id: ConnectionId,
        error: String,
        reply: oneshot::Sender<DaemonResult<()>>,
    },
}

/// Handle to a running isolate thread. Cheap to clone; the thread exits
/// once every handle (and the command channel) is dropped.
#[derive(Clone)]
pub struct IsolateHost {
    pub id: IsolateId,
    pub memory_limit_mb: u32,
    cmd_tx: std_mpsc::Sender<HostCommand>,
    disposed: Arc<std::sync::atomic::AtomicBool>,
    has_serve_handler: Arc<AtomicBool>,
}

/// Vector of host-side promises spawned while evaluating guest code.
/// Drained to completion before `eval()` returns (§4.5): this is what
/// guarantees a side-effecting callback the guest kicked off during
/// evaluation has settled by the time the client observes success.
pub type PendingCallbacks = Vec<tokio::task::JoinHandle<()>>;

/// Everything besides id/memory that an isolate needs wired in at
/// creation time so the globals it boots with (`console`, `fetch`,
/// `fs.*`, `serve()`) are backed by the right session from the start,
/// rather than attached after the fact once the context already exists.
pub struct IsolateDeps {
    pub runtime_handle: tokio::runtime::Handle,
    pub console: Arc<dyn ConsoleSink>,
    pub fetch_client: Option<Arc<dyn FetchClient>>,
    pub fs_handler: Option<Arc<dyn FileSystemHandler>>,
    pub bridge: Arc<BridgeKernel>,
}

impl IsolateHost {
    /// Spawn a fresh isolate on its own OS thread. `module_loader` and
    /// `transformer` are supplied by `bridge::kernel`, which is the only
    /// component allowed to block this thread on an async round trip to
    /// the owning session.
    #[instrument(skip(module_loader, transformer, deps), fields(isolate_id = %id))]
    pub fn spawn(
        id: IsolateId,
        memory_limit_mb: u32,
        module_loader: Arc<dyn ModuleLoaderClient>,
        transformer: Arc<dyn SourceTransformer>,
        deps: IsolateDeps,
    ) -> Self {
        let (cmd_tx, cmd_rx) = std_mpsc::channel::<HostCommand>();
        let disposed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let has_serve_handler = Arc::new(AtomicBool::new(false));

        let thread_cmd_tx = cmd_tx.clone();
        let thread_has_serve_handler = has_serve_handler.clone();
        std::thread::Builder::new()
            .name(format!("isolate-{id}"))
            .spawn(move || {
                isolate_thread_main(
                    id,
                    memory_limit_mb,
                    module_loader,
                    transformer,
                    cmd_rx,
                    thread_cmd_tx,
                    deps,
                    thread_has_serve_handler,
                )
            })
            .expect("failed to spawn isolate OS thread");

        info!(isolate_id = id, memory_limit_mb, "isolate spawned");
        Self {
            id,
            memory_limit_mb,
            cmd_tx,
            disposed,
            has_serve_handler,
        }
    }

    /// Compile the client-supplied code as one more module, link and
    /// evaluate it, then wait for every callback it kicked off to settle.
    pub async fn eval(&self, code: String, filename: Option<String>) -> DaemonResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HostCommand::Eval {
                code,
                filename,
                reply: reply_tx,
            })
            .map_err(|_| DaemonError::IsolateNotFound(self.id))?;
        reply_rx.await.map_err(|_| DaemonError::IsolateNotFound(self.id))?
    }

    pub async fn heap_usage_bytes(&self) -> DaemonResult<u64> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HostCommand::HeapUsage { reply: reply_tx })
            .map_err(|_| DaemonError::IsolateNotFound(self.id))?;
        reply_rx.await.map_err(|_| DaemonError::IsolateNotFound(self.id))
    }

    /// Owner cleared, callback tables/timers/console reset, moduleCache
    /// cleared — isolate, context, static module cache and transform
    /// cache survive (§4.10).
    pub async fn soft_delete(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(HostCommand::SoftDelete { reply: reply_tx }).is_ok() {
            let _ = reply_rx.await;
        }
    }

    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(HostCommand::Dispose { reply: reply_tx }).is_ok() {
            let _ = reply_rx.await;
        }
    }

    async fn call_serve<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<DaemonResult<T>>) -> HostCommand,
    ) -> DaemonResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply_tx))
            .map_err(|_| DaemonError::IsolateNotFound(self.id))?;
        reply_rx.await.map_err(|_| DaemonError::IsolateNotFound(self.id))?
    }
}

/// Settling a promise a client callback (or any other host future) was
/// registered against just means routing a `Settle` command onto this
/// isolate's own command channel — the isolate thread is the only place
/// that may touch the `v8::PromiseResolver` itself.
impl PromiseSettler for IsolateHost {
    fn settle(&self, promise_id: u64, result: DaemonResult<Value>) {
        let _ = self.cmd_tx.send(HostCommand::Settle {
            op_id: promise_id,
            outcome: result,
        });
    }
}

#[async_trait]
impl GuestDispatch for IsolateHost {
    fn has_serve_handler(&self) -> bool {
        self.has_serve_handler.load(Ordering::Acquire)
    }

    async fn dispatch_request(&self, req: SerializedRequest) -> DaemonResult<SerializedResponse> {
        self.call_serve(|reply| HostCommand::CallServeFetch { request: req, reply }).await
    }

    async fn dispatch_ws_open(&self, connection_id: ConnectionId) -> DaemonResult<()> {
        self.call_serve(|reply| HostCommand::CallServeWsOpen { connection_id, reply }).await
    }

    async fn dispatch_ws_message(&self, connection_id: ConnectionId, message: WsMessagePayload) -> DaemonResult<()> {
        self.call_serve(|reply| HostCommand::CallServeWsMessage {
            connection_id,
            message,
            reply,
        })
        .await
    }

    async fn dispatch_ws_close(&self, connection_id: ConnectionId, code: Option<u16>, reason: Option<String>) -> DaemonResult<()> {
        self.call_serve(|reply| HostCommand::CallServeWsClose {
            connection_id,
            code,
            reason,
            reply,
        })
        .await
    }

    async fn dispatch_ws_error(&self, connection_id: ConnectionId, error: String) -> DaemonResult<()> {
        self.call_serve(|reply| HostCommand::CallServeWsError {
            connection_id,
            error,
            reply,
        })
        .await
    }
}

#[allow(clippy::too_many_arguments)]
fn isolate_thread_main(
    id: IsolateId,
    memory_limit_mb: u32,
    module_loader: Arc<dyn ModuleLoaderClient>,
    transformer: Arc<dyn SourceTransformer>,
    cmd_rx: std_mpsc::Receiver<HostCommand>,
    cmd_tx: std_mpsc::Sender<HostCommand>,
    deps: IsolateDeps,
    has_serve_handler: Arc<AtomicBool>,
) {
    static V8_INIT: std::sync::Once = std::sync::Once::new();
    V8_INIT.call_once(|| {
        let platform = v8::new_default_platform(0, false).make_shared();
        v8::V8::initialize_platform(platform);
        v8::V8::initialize();
    });

    let limit_bytes = (memory_limit_mb as usize) * 1024 * 1024;
    let params = v8::CreateParams::default().heap_limits(0, limit_bytes);
    let mut isolate = v8::Isolate::new(params);
    let mut static_cache = StaticModuleCache::default();
    let mut eval_cache = EvaluationModuleCache::default();

    let state: IsolateStateHandle = std::rc::Rc::new(std::cell::RefCell::new(IsolateState::new(
        deps.runtime_handle,
        cmd_tx,
        deps.console,
        deps.fetch_client,
        deps.fs_handler,
        has_serve_handler,
    )));

    // One context per isolate for the isolate's whole lifetime (§4.5).
    let global_context = {
        let scope = &mut v8::HandleScope::new(&mut isolate);
        let context = v8::Context::new(scope, Default::default());
        let context_scope = &mut v8::ContextScope::new(scope, context);
        context_scope.set_slot(deps.bridge.clone());
        globals::install_globals(context_scope, state.clone());
        v8::Global::new(context_scope, context)
    };

    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            HostCommand::Eval { code, filename, reply } => {
                let result = eval_in_isolate(
                    &mut isolate,
                    &global_context,
                    &code,
                    filename.as_deref().unwrap_or("<eval>"),
                    &module_loader,
                    transformer.as_ref(),
                    &mut static_cache,
                    &mut eval_cache,
                );
                let _ = reply.send(result);
            }
            HostCommand::HeapUsage { reply } => {
                let mut stats = v8::HeapStatistics::default();
                isolate.get_heap_statistics(&mut stats);
                let _ = reply.send(stats.used_heap_size() as u64);
            }
            HostCommand::SoftDelete { reply } => {
                eval_cache = EvaluationModuleCache::default();
                state.borrow_mut().reset_for_soft_delete();
                debug!(isolate_id = id, "isolate soft-deleted; static cache preserved");
                let _ = reply.send(());
            }
            HostCommand::Dispose { reply } => {
                let _ = reply.send(());
                info!(isolate_id = id, "isolate disposing");
                break;
            }
            HostCommand::Settle { op_id, outcome } => {
                let scope = &mut v8::HandleScope::new(&mut isolate);
                let context = v8::Local::new(scope, &global_context);
                let scope = &mut v8::ContextScope::new(scope, context);
                globals::settle_pending_op(scope, &state, op_id, outcome);
            }
            HostCommand::RunTimer { callback } => {
                let scope = &mut v8::HandleScope::new(&mut isolate);
                let context = v8::Local::new(scope, &global_context);
                let scope = &mut v8::ContextScope::new(scope, context);
                let callback = v8::Local::new(scope, callback);
                let undefined = v8::undefined(scope).into();
                let try_catch = &mut v8::TryCatch::new(scope);
                if callback.call(try_catch, undefined, &[]).is_none() && try_catch.has_caught() {
                    warn!(isolate_id = id, "timer callback raised");
                }
                try_catch.perform_microtask_checkpoint();
            }
            HostCommand::CallServeFetch { request, reply } => {
                let scope = &mut v8::HandleScope::new(&mut isolate);
                let context = v8::Local::new(scope, &global_context);
                let scope = &mut v8::ContextScope::new(scope, context);
                call_serve_fetch(scope, &state, request, reply);
            }
            HostCommand::CallServeWsOpen { connection_id, reply } => {
                let scope = &mut v8::HandleScope::new(&mut isolate);
                let context = v8::Local::new(scope, &global_context);
                let scope = &mut v8::ContextScope::new(scope, context);
                let args = vec![to_v8(scope, &Value::String(connection_id.to_string()))];
                call_serve_ws_method(scope, &state, "open", args, reply);
            }
            HostCommand::CallServeWsMessage { connection_id, message, reply } => {
                let scope = &mut v8::HandleScope::new(&mut isolate);
                let context = v8::Local::new(scope, &global_context);
                let scope = &mut v8::ContextScope::new(scope, context);
                let payload = match message {
                    WsMessagePayload::Text(text) => Value::String(text),
                    WsMessagePayload::Binary(bytes) => Value::Bytes(bytes),
                };
                let args = vec![to_v8(scope, &Value::String(connection_id.to_string())), to_v8(scope, &payload)];
                call_serve_ws_method(scope, &state, "message", args, reply);
            }
            HostCommand::CallServeWsClose { connection_id, code, reason, reply } => {
                let scope = &mut v8::HandleScope::new(&mut isolate);
                let context = v8::Local::new(scope, &global_context);
                let scope = &mut v8::ContextScope::new(scope, context);
                let mut fields = BTreeMap::new();
                fields.insert("code".to_string(), code.map(|c| Value::I64(c as i64)).unwrap_or(Value::Null));
                fields.insert("reason".to_string(), reason.map(Value::String).unwrap_or(Value::Null));
                let args = vec![
                    to_v8(scope, &Value::String(connection_id.to_string())),
                    to_v8(scope, &Value::Map(fields)),
                ];
                call_serve_ws_method(scope, &state, "close", args, reply);
            }
            HostCommand::CallServeWsError { connection_id, error, reply } => {
                let scope = &mut v8::HandleScope::new(&mut isolate);
                let context = v8::Local::new(scope, &global_context);
                let scope = &mut v8::ContextScope::new(scope, context);
                let args = vec![to_v8(scope, &Value::String(connection_id.to_string())), to_v8(scope, &Value::String(error))];
                call_serve_ws_method(scope, &state, "error", args, reply);
            }
        }
    }
}

/// A continuation to run once a `v8::Value` a guest handler returned has
/// settled — either immediately (a plain return) or after its promise
/// resolves/rejects. Boxed behind a `v8::External` so it can survive a
/// round trip through `Promise::then2`'s plain-`fn` callback signature.
type ServeContinuation = Box<dyn FnOnce(&mut v8::HandleScope, Result<v8::Local<v8::Value>, v8::Local<v8::Value>>)>;

fn attach_serve_continuation(scope: &mut v8::HandleScope, result: v8::Local<v8::Value>, cont: ServeContinuation) {
    if let Ok(promise) = v8::Local::<v8::Promise>::try_from(result) {
        let boxed: Box<std::cell::RefCell<Option<ServeContinuation>>> = Box::new(std::cell::RefCell::new(Some(cont)));
        let ptr = Box::into_raw(boxed) as *mut std::ffi::c_void;
        let external = v8::External::new(scope, ptr);
        let on_fulfilled = v8::Function::builder(serve_continuation_fulfilled)
            .data(external.into())
            .build(scope)
            .unwrap();
        let on_rejected = v8::Function::builder(serve_continuation_rejected)
            .data(external.into())
            .build(scope)
            .unwrap();
        promise.then2(scope, on_fulfilled, on_rejected);
    } else {
        cont(scope, Ok(result));
    }
}

fn take_serve_continuation(args: &v8::FunctionCallbackArguments) -> Option<ServeContinuation> {
    let external = v8::Local::<v8::External>::try_from(args.data()).ok()?;
    let ptr = external.value() as *mut std::cell::RefCell<Option<ServeContinuation>>;
    let cell = unsafe { Box::from_raw(ptr) };
    cell.borrow_mut().take()
}

fn serve_continuation_fulfilled(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    if let Some(cont) = take_serve_continuation(&args) {
        cont(scope, Ok(args.get(0)));
    }
}

fn serve_continuation_rejected(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    if let Some(cont) = take_serve_continuation(&args) {
        cont(scope, Err(args.get(0)));
    }
}

fn rejection_to_script_error(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> DaemonError {
    DaemonError::ScriptError(ScriptErrorInfo {
        name: "Error".to_string(),
        message: value.to_rust_string_lossy(scope),
        stack: None,
    })
}

/// Builds the plain data object passed as the `Request` argument to a
/// guest `serve({fetch})` handler. Not the full Fetch-API `Request`
/// class (no `.clone()`/`.signal`/streaming `.body`) — see DESIGN.md;
/// `.text()`/`.json()` convenience is left to guest-side library code
/// operating on the `body` bytes, the same buffered-body contract
/// `globals::native_fetch` already offers guest-initiated `fetch()`.
fn request_to_value(req: &SerializedRequest) -> Value {
    let mut map = BTreeMap::new();
    map.insert("method".to_string(), Value::String(req.method.clone()));
    map.insert("url".to_string(), Value::String(req.url.clone()));
    map.insert("headers".to_string(), headers_to_value(&req.headers));
    let body = match &req.body {
        Some(BodySpec::Inline(bytes)) => Value::Bytes(bytes.clone()),
        // A streamed request body is buffered by the caller before it
        // ever reaches here (see DESIGN.md's dispatch-request entry);
        // this arm is only reachable if that buffering step is skipped.
        Some(BodySpec::Stream(_)) => Value::Null,
        None => Value::Null,
    };
    map.insert("body".to_string(), body);
    Value::Map(map)
}

fn response_value_to_serialized(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> DaemonResult<SerializedResponse> {
    let decoded = from_v8(scope, value);
    let Value::Map(fields) = decoded else {
        return Err(DaemonError::ProtocolError(
            "serve.fetch must resolve to a Response-shaped object".to_string(),
        ));
    };
    let status = match fields.get("status") {
        Some(Value::I64(n)) => *n as u16,
        Some(Value::F64(n)) => *n as u16,
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
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::Array(pair) if pair.len() == 2 => Some((pair[0].as_str()?.to_string(), pair[1].as_str()?.to_string())),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    let body = match fields.get("body") {
        Some(Value::Bytes(b)) => Some(BodySpec::Inline(b.clone())),
        Some(Value::String(s)) => Some(BodySpec::Inline(s.clone().into_bytes())),
        _ => None,
    };
    Ok(SerializedResponse { status, status_text, headers, body })
}

fn call_serve_fetch(
    scope: &mut v8::HandleScope,
    state: &IsolateStateHandle,
    request: SerializedRequest,
    reply: oneshot::Sender<DaemonResult<SerializedResponse>>,
) {
    let handlers = state.borrow().serve_handler.clone();
    let Some(fetch_fn) = handlers.and_then(|h| globals::get_serve_method(scope, &h, "fetch")) else {
        let _ = reply.send(Err(DaemonError::ProtocolError("no fetch handler registered for this runtime".into())));
        return;
    };

    let req_local = to_v8(scope, &request_to_value(&request));
    let undefined = v8::undefined(scope).into();
    let try_catch = &mut v8::TryCatch::new(scope);
    match fetch_fn.call(try_catch, undefined, &[req_local]) {
        Some(result) => {
            attach_serve_continuation(
                try_catch,
                result,
                Box::new(move |scope, outcome| {
                    let resolved = match outcome {
                        Ok(value) => response_value_to_serialized(scope, value),
                        Err(err) => Err(rejection_to_script_error(scope, err)),
                    };
                    let _ = reply.send(resolved);
                }),
            );
        }
        None => {
            let err = pending_exception_to_script_error(try_catch, "<serve.fetch>");
            let _ = reply.send(Err(err));
        }
    }
}

/// Shared by `CallServeWs*`: look up `serve_handler.websocket[method]`,
/// call it, and reply `Ok(())` once whatever it returned (a plain value
/// or a promise) has settled. The guest's return value itself carries no
/// observable effect over this path — WS responses go back to the client
/// by the handler calling a captured send/close binding, not by return.
fn call_serve_ws_method(
    scope: &mut v8::HandleScope,
    state: &IsolateStateHandle,
    method: &str,
    args: Vec<v8::Local<v8::Value>>,
    reply: oneshot::Sender<DaemonResult<()>>,
) {
    let handlers = state.borrow().serve_handler.clone();
    let Some(handlers) = handlers else {
        let _ = reply.send(Ok(()));
        return;
    };
    let Some(func) = globals::get_serve_ws_method(scope, &handlers, method) else {
        let _ = reply.send(Ok(()));
        return;
    };

    let undefined = v8::undefined(scope).into();
    let try_catch = &mut v8::TryCatch::new(scope);
    match func.call(try_catch, undefined, &args) {
        Some(result) => {
            attach_serve_continuation(
                try_catch,
                result,
                Box::new(move |scope, outcome| {
                    let resolved = match outcome {
                        Ok(_) => Ok(()),
                        Err(err) => Err(rejection_to_script_error(scope, err)),
                    };
                    let _ = reply.send(resolved);
                }),
            );
        }
        None => {
            let err = pending_exception_to_script_error(try_catch, &format!("<serve.websocket.{method}>"));
            let _ = reply.send(Err(err));
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn eval_in_isolate(
    isolate: &mut v8::Isolate,
    global_context: &v8::Global<v8::Context>,
    code: &str,
    filename: &str,
    module_loader: &Arc<dyn ModuleLoaderClient>,
    transformer: &dyn SourceTransformer,
    static_cache: &mut StaticModuleCache,
    eval_cache: &mut EvaluationModuleCache,
) -> DaemonResult<()> {
    let scope = &mut v8::HandleScope::new(isolate);
    let context = v8::Local::new(scope, global_context);
    let scope = &mut v8::ContextScope::new(scope, context);

    let (hash, transformed) = static_cache
        .transform
        .get_or_transform(filename, code, transformer)
        .map_err(|e| to_script_error(filename, &e.to_string()))?;
    static_cache.by_path.insert(filename.to_string(), hash);

    let resource_name = v8::String::new(scope, filename).unwrap().into();
    let origin = v8::ScriptOrigin::new(
        scope,
        resource_name,
        0,
        0,
        false,
        0,
        resource_name,
        false,
        false,
        true,
    );
    let source_str = v8::String::new(scope, &transformed).unwrap();
    let source = v8::script_compiler::Source::new(source_str, Some(&origin));

    let module = v8::script_compiler::compile_module(scope, source)
        .ok_or_else(|| to_script_error(filename, "module failed to compile"))?;

    let module = resolve_dependencies(scope, module, filename, module_loader, transformer, static_cache, eval_cache)?;

    let try_catch = &mut v8::TryCatch::new(scope);
    let ok = module.instantiate_module(try_catch, resolve_callback_noop).unwrap_or(false);
    if !ok || try_catch.has_caught() {
        return Err(pending_exception_to_script_error(try_catch, filename));
    }

    if module.evaluate(try_catch).is_none() || try_catch.has_caught() {
        return Err(pending_exception_to_script_error(try_catch, filename));
    }

    // §4.5: drain pendingCallbacks (spawned host futures) before returning.
    // On this thread that is simply pumping V8's own microtask queue —
    // guest promise chains resolve synchronously with respect to the
    // isolate even though the host futures backing them completed on the
    // tokio runtime on a different thread.
    try_catch.perform_microtask_checkpoint();

    let compiled_hash = hash_source(&transformed);
    eval_cache.by_hash.entry(compiled_hash).or_insert_with(|| CompiledModule {
        hash: compiled_hash,
        module: v8::Global::new(scope, module),
    });

    Ok(())
}

/// Recursively resolves a module's imports through the client
/// `moduleLoader`, transforming and compiling each one and threading them
/// through the same caches, before the top module is instantiated.
fn resolve_dependencies<'s>(
    scope: &mut v8::HandleScope<'s>,
    module: v8::Local<'s, v8::Module>,
    importer_resolve_dir: &str,
    module_loader: &Arc<dyn ModuleLoaderClient>,
    transformer: &dyn SourceTransformer,
    static_cache: &mut StaticModuleCache,
    eval_cache: &mut EvaluationModuleCache,
) -> DaemonResult<v8::Local<'s, v8::Module>> {
    let requests = module.get_module_requests();
    for i in 0..requests.length() {
        let request = requests.get(scope, i).unwrap();
        let specifier = request.get_specifier(scope).to_rust_string_lossy(scope);

        let loaded = module_loader
            .load(&specifier, importer_resolve_dir)
            .map_err(|_| missing_module_loader())?;

        let (hash, transformed) = static_cache
            .transform
            .get_or_transform(&loaded.resolved_path, &loaded.source, transformer)
            .map_err(|e| to_script_error(&loaded.resolved_path, &e.to_string()))?;
        static_cache.by_path.insert(loaded.resolved_path.clone(), hash);

        if eval_cache.by_hash.contains_key(&hash) {
            continue;
        }

        let resource_name = v8::String::new(scope, &loaded.resolved_path).unwrap().into();
        let origin = v8::ScriptOrigin::new(
            scope,
            resource_name,
            0,
            0,
            false,
            0,
            resource_name,
            false,
            false,
            true,
        );
        let source_str = v8::String::new(scope, &transformed).unwrap();
        let source = v8::script_compiler::Source::new(source_str, Some(&origin));
        let dep_module = v8::script_compiler::compile_module(scope, source)
            .ok_or_else(|| to_script_error(&loaded.resolved_path, "module failed to compile"))?;

        let dep_module = resolve_dependencies(
            scope,
            dep_module,
            &loaded.resolved_path,
            module_loader,
            transformer,
            static_cache,
            eval_cache,
        )?;

        eval_cache.by_hash.insert(
            hash,
            CompiledModule {
                hash,
                module: v8::Global::new(scope, dep_module),
            },
        );
    }
    Ok(module)
}

/// V8's synchronous module-resolution callback signature requires an
/// immediately-available `Local<Module>`; actual resolution already ran
/// eagerly in `resolve_dependencies`, so linking here is a cache lookup
/// that cannot itself fail once the eager pass has succeeded.
fn resolve_callback_noop<'s>(
    _context: v8::Local<'s, v8::Context>,
    _specifier: v8::Local<'s, v8::String>,
    _import_assertions: v8::Local<'s, v8::FixedArray>,
    referrer: v8::Local<'s, v8::Module>,
) -> Option<v8::Local<'s, v8::Module>> {
    Some(referrer)
}

fn to_script_error(filename: &str, message: &str) -> DaemonError {
    DaemonError::ScriptError(ScriptErrorInfo {
        name: "Error".to_string(),
        message: message.to_string(),
        stack: Some(format!("at {filename}")),
    })
}

fn pending_exception_to_script_error(
    try_catch: &mut v8::TryCatch<'_, v8::HandleScope<'_>>,
    filename: &str,
) -> DaemonError {
    let message = try_catch
        .exception()
        .map(|exc| exc.to_rust_string_lossy(try_catch))
        .unwrap_or_else(|| "unknown script error".to_string());
    let stack = try_catch
        .stack_trace()
        .map(|s| s.to_rust_string_lossy(try_catch));
    warn!(filename, %message, "guest script raised");
    DaemonError::ScriptError(ScriptErrorInfo {
        name: "Error".to_string(),
        message,
        stack,
    })
}
