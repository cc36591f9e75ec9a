//! Per-connection IPC session (C3).

pub mod session;

pub use session::{AsyncDuplex, Inbound, Session};
