//! Sandboxed JavaScript isolate runtime daemon.
//!
//! Module layout mirrors the component split in the design notes: a
//! framed IPC transport (`proto`, `session`), a credited stream layer on
//! top of it (`stream`), per-isolate V8 hosting (`isolate`), the
//! host/guest reference bridge (`bridge`), the HTTP/WebSocket surface
//! guests can register against (`http`), guest-initiated fetch
//! (`fetch`), a virtual filesystem (`fs`), the namespace-aware isolate
//! pool (`pool`), the op-routing table tying all of that together
//! (`registry`), CLI configuration (`config`), and the accept loop
//! (`daemon`).

pub mod bridge;
pub mod config;
pub mod daemon;
pub mod error;
pub mod fetch;
pub mod fs;
pub mod http;
pub mod isolate;
pub mod pool;
pub mod proto;
pub mod registry;
pub mod session;
pub mod stream;
