//! Bridge kernel (C6).
//!
//! Everything here is deliberately V8-agnostic data bookkeeping: which
//! daemon-local id maps to which host callable/promise/iterator, and what
//! cleanup runs when the guest discards one. The actual "enqueue a
//! microtask that invokes the captured resolver" step needs a live
//! `v8::HandleScope` and therefore has to happen on the owning isolate's
//! dedicated thread — `isolate::host::IsolateHost` drives that half by
//! accepting settle/invoke commands keyed by the ids this module hands
//! out. Keeping the split here means the bookkeeping is unit-testable
//! without a V8 build.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{DaemonError, DaemonResult};
use crate::proto::Value;
use crate::proto::value::{HostRefKind, RefAllocator};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A host-side callable the guest received back from some earlier call
/// (e.g. a `FileSystemWritableFileStream`'s `close` method, or a
/// `ReadableStreamDefaultReader`'s `read`). Guest invocations of a
/// daemon-local id run this directly on the daemon thread, never over
/// IPC (§4.6 rule 2 "Back-references").
pub trait HostCallable: Send + Sync {
    fn call(&self, args: Vec<Value>) -> BoxFuture<DaemonResult<Value>>;
}

impl<F> HostCallable for F
where
    F: Fn(Vec<Value>) -> BoxFuture<DaemonResult<Value>> + Send + Sync,
{
    fn call(&self, args: Vec<Value>) -> BoxFuture<DaemonResult<Value>> {
        (self)(args)
    }
}

/// Runs when a registered callback/iterator/promise is removed from its
/// table, either because the guest discarded it or the isolate disposed.
pub type CleanupFn = Box<dyn Fn() + Send + Sync>;

struct Registration {
    callable: Option<Arc<dyn HostCallable>>,
    cleanup: Option<CleanupFn>,
}

/// Allocates and owns every daemon-local id for one isolate: returned
/// callables, live promises, and live async iterators all share the id
/// space (§4.6 "registers each in the isolate's returned-callable table
/// at a daemon-local id") but are bookkept separately here so cleanup can
/// be kind-specific (a promise has no cancel hook, an iterator does).
pub struct BridgeKernel {
    next_id: AtomicU64,
    callables: DashMap<u64, Registration>,
    promises: DashMap<u64, ()>,
    iterators: DashMap<u64, Registration>,
}

impl Default for BridgeKernel {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(crate::proto::value::DAEMON_LOCAL_ID_THRESHOLD),
            callables: DashMap::new(),
            promises: DashMap::new(),
            iterators: DashMap::new(),
        }
    }
}

impl BridgeKernel {
    pub fn new() -> Self {
        Self::default()
    }

    fn next(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a returned callable and hand back its daemon-local id.
    /// IDs are never reused within an isolate's lifetime (§4.6).
    pub fn register_callable(&self, callable: Arc<dyn HostCallable>, cleanup: Option<CleanupFn>) -> u64 {
        let id = self.next();
        self.callables.insert(
            id,
            Registration {
                callable: Some(callable),
                cleanup,
            },
        );
        id
    }

    /// Invoke a previously-returned callable without crossing IPC.
    pub async fn invoke_callable(&self, id: u64, args: Vec<Value>) -> DaemonResult<Value> {
        let callable = self
            .callables
            .get(&id)
            .and_then(|entry| entry.callable.clone())
            .ok_or_else(|| DaemonError::ProtocolError(format!("no returned callable with id {id}")))?;
        callable.call(args).await
    }

    /// The guest discarded a returned callable (e.g. dropped a stream
    /// controller): run its cleanup, if any, and forget it. Does not
    /// reuse `id` afterwards.
    pub fn discard_callable(&self, id: u64) {
        if let Some((_, reg)) = self.callables.remove(&id) {
            if let Some(cleanup) = reg.cleanup {
                cleanup();
            }
        }
    }

    /// Mint an id for a promise the host is handing to the guest. The
    /// isolate thread is the one that actually stores the
    /// `v8::Global<PromiseResolver>` for this id and settles it later;
    /// this table exists only so `is_live`/bookkeeping work without
    /// touching V8 types.
    pub fn register_promise(&self) -> u64 {
        let id = self.next();
        self.promises.insert(id, ());
        id
    }

    pub fn settle_promise(&self, id: u64) {
        self.promises.remove(&id);
    }

    pub fn promise_is_live(&self, id: u64) -> bool {
        self.promises.contains_key(&id)
    }

    /// Register a live async iterator with a cancellation hook, run when
    /// the guest calls its `return()` path or the kernel tears the
    /// isolate down (§4.6 rule 3).
    pub fn register_iterator(&self, cleanup: CleanupFn) -> u64 {
        let id = self.next();
        self.iterators.insert(
            id,
            Registration {
                callable: None,
                cleanup: Some(cleanup),
            },
        );
        id
    }

    pub fn cancel_iterator(&self, id: u64) {
        if let Some((_, reg)) = self.iterators.remove(&id) {
            if let Some(cleanup) = reg.cleanup {
                cleanup();
            }
        }
    }

    pub fn iterator_is_live(&self, id: u64) -> bool {
        self.iterators.contains_key(&id)
    }

    /// Tear everything down — called on full isolate disposal (not
    /// soft-delete, which the namespace pool handles by clearing the
    /// callback table directly; see `pool::mod`).
    pub fn clear_all(&self) {
        for entry in self.callables.iter() {
            if let Some(cleanup) = &entry.cleanup {
                cleanup();
            }
        }
        self.callables.clear();
        for entry in self.iterators.iter() {
            if let Some(cleanup) = &entry.cleanup {
                cleanup();
            }
        }
        self.iterators.clear();
        self.promises.clear();
    }
}

impl RefAllocator for BridgeKernel {
    fn allocate(&self, kind: HostRefKind) -> u64 {
        match kind {
            HostRefKind::Promise => self.register_promise(),
            HostRefKind::AsyncIterator => self.register_iterator(Box::new(|| {})),
            HostRefKind::Callback => {
                // A bare allocate (no callable yet bound) is only used by
                // the marshaller's total-function contract in tests; real
                // callers go through `register_callable` directly so the
                // id and its callable are never observed out of sync.
                self.next()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn echo_callable() -> Arc<dyn HostCallable> {
        Arc::new(|args: Vec<Value>| -> BoxFuture<DaemonResult<Value>> {
            Box::pin(async move { Ok(args.into_iter().next().unwrap_or(Value::Null)) })
        })
    }

    #[tokio::test]
    async fn registered_callable_is_invokable_by_id() {
        let kernel = BridgeKernel::new();
        let id = kernel.register_callable(echo_callable(), None);
        assert!(Value::is_daemon_local(id));
        let result = kernel.invoke_callable(id, vec![Value::I64(7)]).await.unwrap();
        assert_eq!(result, Value::I64(7));
    }

    #[tokio::test]
    async fn discarding_a_callable_runs_cleanup_and_forgets_it() {
        let kernel = BridgeKernel::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let id = kernel.register_callable(echo_callable(), Some(Box::new(move || {
            ran2.store(true, Ordering::SeqCst);
        })));

        kernel.discard_callable(id);
        assert!(ran.load(Ordering::SeqCst));
        assert!(kernel.invoke_callable(id, vec![]).await.is_err());
    }

    #[test]
    fn iterator_cancellation_is_idempotent() {
        let kernel = BridgeKernel::new();
        let calls = Arc::new(AtomicU64::new(0));
        let calls2 = calls.clone();
        let id = kernel.register_iterator(Box::new(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(kernel.iterator_is_live(id));
        kernel.cancel_iterator(id);
        kernel.cancel_iterator(id);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!kernel.iterator_is_live(id));
    }

    #[test]
    fn ids_are_never_reused() {
        let kernel = BridgeKernel::new();
        let a = kernel.register_promise();
        kernel.settle_promise(a);
        let b = kernel.register_promise();
        assert_ne!(a, b);
    }
}
