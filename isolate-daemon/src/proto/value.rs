//! Value marshaller (C2).
//!
//! `Value` is the closed set of cross-boundary primitives from spec.md §4.2.
//! Marshalling a `Value` over the wire is just serde + msgpack (see
//! `rmpv`-shaped structure below); the interesting contract is the other
//! direction — turning a *host* value (a Rust closure, a pending future, a
//! live async iterator) into a `Value` requires allocating a daemon-local
//! id from the owning isolate's tables. That allocation is expressed here
//! as the `RefAllocator` trait so this module stays free of any dependency
//! on the isolate/bridge internals that implement it (`bridge::kernel`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::DaemonError;

/// Daemon-local ids for returned callables start at this threshold so they
/// are trivially distinguishable from client-registered callback ids
/// (§3 "Isolate instance" invariant: "client-callback ids are disjoint from
/// daemon-local ids (by threshold)").
pub const DAEMON_LOCAL_ID_THRESHOLD: u64 = 1 << 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    String(String),
    #[serde(with = "serde_bytes")]
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
    PromiseRef { promise_id: u64 },
    AsyncIteratorRef { iterator_id: u64 },
    CallbackRef { callback_id: u64 },
}

impl Value {
    pub fn is_daemon_local(id: u64) -> bool {
        id >= DAEMON_LOCAL_ID_THRESHOLD
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}

/// What kind of host value is being rewritten into a ref. The allocator
/// uses this to pick the right table (promises / iterators / callables all
/// share the daemon-local id space but are stored separately — see
/// `bridge::kernel::ReturnedCallableTable`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostRefKind {
    Promise,
    AsyncIterator,
    Callback,
}

/// Supplied by the owning isolate so the marshaller can rewrite a host
/// value (function, promise, iterator) into the matching `Value::*Ref`
/// variant. Kept as a trait so C2 never has to know about V8 types.
pub trait RefAllocator {
    /// Allocate (or reuse) a daemon-local id for a host value of `kind`,
    /// returning the id to embed in the wire-visible ref.
    fn allocate(&self, kind: HostRefKind) -> u64;
}

/// What the marshaller was asked to encode, described abstractly so this
/// module has no V8 dependency. `bridge::kernel` supplies the concrete
/// inspection of a `v8::Local<Value>` and calls `encode_host_value` with
/// the right variant.
pub enum HostValue<'a> {
    Null,
    Bool(bool),
    Number(f64),
    Str(&'a str),
    Bytes(&'a [u8]),
    Array(Vec<HostValue<'a>>),
    Map(Vec<(String, HostValue<'a>)>),
    /// A function/promise/iterator that isn't representable as data and
    /// must be rewritten into a ref via the allocator.
    Unrepresentable { kind: Option<HostRefKind>, reason: &'static str },
}

/// Encode a host-side value into the wire `Value`. Total for every
/// representable shape; `Unrepresentable` with `kind: None` always fails
/// with `UnmarshallableValue` *before* any id is allocated (spec.md §4.2
/// contract) — ids are only minted for the three kinds the bridge knows
/// how to resurrect on the other side.
pub fn encode_host_value(
    v: HostValue<'_>,
    alloc: &dyn RefAllocator,
) -> Result<Value, DaemonError> {
    Ok(match v {
        HostValue::Null => Value::Null,
        HostValue::Bool(b) => Value::Bool(b),
        HostValue::Number(n) => Value::F64(n),
        HostValue::Str(s) => Value::String(s.to_string()),
        HostValue::Bytes(b) => Value::Bytes(b.to_vec()),
        HostValue::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(encode_host_value(item, alloc)?);
            }
            Value::Array(out)
        }
        HostValue::Map(entries) => {
            let mut out = BTreeMap::new();
            for (k, val) in entries {
                out.insert(k, encode_host_value(val, alloc)?);
            }
            Value::Map(out)
        }
        HostValue::Unrepresentable { kind: Some(kind), .. } => {
            let id = alloc.allocate(kind);
            match kind {
                HostRefKind::Promise => Value::PromiseRef { promise_id: id },
                HostRefKind::AsyncIterator => Value::AsyncIteratorRef { iterator_id: id },
                HostRefKind::Callback => Value::CallbackRef { callback_id: id },
            }
        }
        HostValue::Unrepresentable { kind: None, reason } => {
            return Err(DaemonError::UnmarshallableValue(reason.to_string()));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingAllocator(AtomicU64);

    impl RefAllocator for CountingAllocator {
        fn allocate(&self, _kind: HostRefKind) -> u64 {
            DAEMON_LOCAL_ID_THRESHOLD + self.0.fetch_add(1, Ordering::SeqCst)
        }
    }

    #[test]
    fn representable_values_encode_without_allocating() {
        let alloc = CountingAllocator(AtomicU64::new(0));
        let v = encode_host_value(
            HostValue::Array(vec![HostValue::Bool(true), HostValue::Number(2.0)]),
            &alloc,
        )
        .unwrap();
        assert_eq!(v, Value::Array(vec![Value::Bool(true), Value::F64(2.0)]));
        assert_eq!(alloc.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn promise_gets_a_daemon_local_ref() {
        let alloc = CountingAllocator(AtomicU64::new(0));
        let v = encode_host_value(
            HostValue::Unrepresentable { kind: Some(HostRefKind::Promise), reason: "" },
            &alloc,
        )
        .unwrap();
        match v {
            Value::PromiseRef { promise_id } => assert!(Value::is_daemon_local(promise_id)),
            _ => panic!("expected PromiseRef"),
        }
    }

    #[test]
    fn truly_unrepresentable_value_fails_before_allocating() {
        let alloc = CountingAllocator(AtomicU64::new(0));
        let err = encode_host_value(
            HostValue::Unrepresentable { kind: None, reason: "raw socket" },
            &alloc,
        )
        .unwrap_err();
        assert!(matches!(err, DaemonError::UnmarshallableValue(_)));
        assert_eq!(alloc.0.load(Ordering::SeqCst), 0);
    }
}
