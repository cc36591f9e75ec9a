//! Isolate host (C5): one V8 isolate + context per OS thread.

pub mod globals;
pub mod host;
pub mod marshal;
pub mod module_loader;

pub use globals::{ConsoleSink, IsolateState, IsolateStateHandle, TracingConsoleSink};
pub use host::{next_isolate_id, IsolateDeps, IsolateHost, PendingCallbacks};
pub use marshal::{from_v8, headers_to_value, to_v8};
pub use module_loader::{IdentityTransformer, LoadedSource, ModuleLoaderClient, SourceTransformer};
