//! Bridge kernel (C6): injected-global polyfills, the async boundary, and
//! back-reference/cancellation bookkeeping.

pub mod callback;
pub mod kernel;

pub use callback::{spawn_settling, ClientCallbackBridge, PromiseSettler};
pub use kernel::{BridgeKernel, CleanupFn, HostCallable};
