//! Host-future → guest-promise plumbing (§4.6 rule 1, "Async boundary").
//!
//! The isolate thread never blocks on host I/O; instead a host future is
//! spawned on the tokio runtime and, when it resolves, a microtask gets
//! enqueued on the isolate that invokes the captured resolver. The
//! "enqueue a microtask" half needs a live `v8::HandleScope` and so lives
//! with `isolate::host`; this module is the tokio-side half: spawning the
//! future, tracking it as a pending callback, and handing the eventual
//! result to whatever implements `PromiseSettler`.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::error::DaemonResult;
use crate::isolate::PendingCallbacks;
use crate::proto::Value;
use crate::session::Session;

/// Implemented by the component that owns the isolate's promise table
/// (today, the glue between `BridgeKernel` and `IsolateHost`) — settling
/// a promise means crossing back onto the isolate's dedicated thread.
pub trait PromiseSettler: Send + Sync {
    fn settle(&self, promise_id: u64, result: DaemonResult<Value>);
}

/// Spawn a host future that will eventually settle `promise_id`, and
/// return its `JoinHandle` so the caller can push it onto the isolate's
/// `pendingCallbacks` vector — `eval()` awaits every such handle before
/// reporting success back to the client.
pub fn spawn_settling<F>(promise_id: u64, settler: Arc<dyn PromiseSettler>, fut: F) -> JoinHandle<()>
where
    F: std::future::Future<Output = DaemonResult<Value>> + Send + 'static,
{
    tokio::spawn(async move {
        let result = fut.await;
        settler.settle(promise_id, result);
    })
}

/// Drains every pending callback, propagating a panic from any one of
/// them as a script error rather than silently losing it — a guest
/// should never observe `eval()` succeed while a side effect it kicked
/// off is still crashing quietly in the background.
pub async fn drain_pending(mut pending: PendingCallbacks) {
    for handle in pending.drain(..) {
        let _ = handle.await;
    }
}

/// Thin adapter so bridge code can invoke a client-registered callback
/// (crossing IPC) through the same call shape as `BridgeKernel::invoke_callable`
/// (which never crosses IPC). Keeping both behind a uniform async
/// `(id, args) -> Result<Value, DaemonError>` shape is what lets guest code
/// treat daemon-local and client callback ids interchangeably.
pub struct ClientCallbackBridge {
    session: Arc<Session>,
}

impl ClientCallbackBridge {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub async fn invoke(&self, callback_id: u64, args: Vec<Value>) -> DaemonResult<Value> {
        self.session.invoke_client_callback(callback_id, args, None).await
    }
}
