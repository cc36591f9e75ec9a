//! Guest-value marshalling (C2's other half): converting between
//! `v8::Local<Value>` and the wire `proto::Value`. `proto::value` defines
//! the closed set and the *total* encoding function for it
//! (`encode_host_value`); this module is the thing that actually calls
//! it with a real inspected `v8::Local<Value>`, and the reverse
//! direction for handing a `Value` back to the guest.

use std::collections::BTreeMap;

use crate::bridge::BridgeKernel;
use crate::proto::value::{encode_host_value, HostRefKind, HostValue, RefAllocator};
use crate::proto::Value;

/// `Value` → guest. Refs are not resurrected as live objects here (no
/// production path currently sends a `Value::*Ref` back into a guest
/// that didn't itself mint it), so they degrade to the bare id — callers
/// that build guest-visible refs do so directly against
/// `bridge::kernel`'s tables instead of through this function.
pub fn to_v8<'s>(scope: &mut v8::HandleScope<'s>, value: &Value) -> v8::Local<'s, v8::Value> {
    match value {
        Value::Null => v8::null(scope).into(),
        Value::Bool(b) => v8::Boolean::new(scope, *b).into(),
        Value::I64(n) => v8::Number::new(scope, *n as f64).into(),
        Value::F64(n) => v8::Number::new(scope, *n).into(),
        Value::String(s) => v8::String::new(scope, s).unwrap().into(),
        Value::Bytes(bytes) => bytes_to_uint8array(scope, bytes).into(),
        Value::Array(items) => {
            let arr = v8::Array::new(scope, items.len() as i32);
            for (i, item) in items.iter().enumerate() {
                let local = to_v8(scope, item);
                arr.set_index(scope, i as u32, local);
            }
            arr.into()
        }
        Value::Map(entries) => {
            let obj = v8::Object::new(scope);
            for (k, v) in entries {
                let key = v8::String::new(scope, k).unwrap();
                let local = to_v8(scope, v);
                obj.set(scope, key.into(), local);
            }
            obj.into()
        }
        Value::PromiseRef { promise_id } | Value::AsyncIteratorRef { iterator_id: promise_id } | Value::CallbackRef { callback_id: promise_id } => {
            v8::Number::new(scope, *promise_id as f64).into()
        }
    }
}

fn bytes_to_uint8array<'s>(scope: &mut v8::HandleScope<'s>, bytes: &[u8]) -> v8::Local<'s, v8::Uint8Array> {
    let store = v8::ArrayBuffer::new_backing_store_from_vec(bytes.to_vec()).make_shared();
    let buffer = v8::ArrayBuffer::with_backing_store(scope, &store);
    v8::Uint8Array::new(scope, buffer, 0, bytes.len()).unwrap()
}

/// Guest → `Value`, total per §4.2's contract. Plain data converts
/// directly; a function or promise leaf goes through `encode_host_value`
/// so minting its `CallbackRef`/`PromiseRef` id still goes through one
/// allocation path regardless of caller (`bridge::kernel`'s own direct
/// callers included).
pub fn from_v8(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> Value {
    let bridge = scope.get_slot::<std::sync::Arc<BridgeKernel>>().cloned();
    to_value(scope, value, bridge.as_deref().map(|b| b as &dyn RefAllocator))
}

fn encode_ref(kind: HostRefKind, alloc: Option<&dyn RefAllocator>) -> Value {
    match alloc {
        Some(alloc) => encode_host_value(HostValue::Unrepresentable { kind: Some(kind), reason: "" }, alloc)
            .unwrap_or(Value::Null),
        None => Value::Null,
    }
}

fn to_value(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>, alloc: Option<&dyn RefAllocator>) -> Value {
    if value.is_null_or_undefined() {
        Value::Null
    } else if value.is_boolean() {
        Value::Bool(value.boolean_value(scope))
    } else if value.is_number() {
        Value::F64(value.number_value(scope).unwrap_or(0.0))
    } else if value.is_string() {
        Value::String(value.to_rust_string_lossy(scope))
    } else if let Ok(view) = v8::Local::<v8::ArrayBufferView>::try_from(value) {
        let len = view.byte_length();
        let mut bytes = vec![0u8; len];
        view.copy_contents(&mut bytes);
        Value::Bytes(bytes)
    } else if value.is_function() {
        encode_ref(HostRefKind::Callback, alloc)
    } else if value.is_promise() {
        encode_ref(HostRefKind::Promise, alloc)
    } else if let Ok(arr) = v8::Local::<v8::Array>::try_from(value) {
        let len = arr.length();
        let mut items = Vec::with_capacity(len as usize);
        for i in 0..len {
            let item = arr.get_index(scope, i).unwrap_or_else(|| v8::undefined(scope).into());
            items.push(to_value(scope, item, alloc));
        }
        Value::Array(items)
    } else if let Ok(obj) = v8::Local::<v8::Object>::try_from(value) {
        let mut entries = BTreeMap::new();
        if let Some(keys) = obj.get_own_property_names(scope, Default::default()) {
            for i in 0..keys.length() {
                let Some(key) = keys.get_index(scope, i) else { continue };
                let key_str = key.to_rust_string_lossy(scope);
                let Some(v) = obj.get(scope, key) else { continue };
                entries.insert(key_str, to_value(scope, v, alloc));
            }
        }
        Value::Map(entries)
    } else {
        Value::Null
    }
}

/// Builds a small JS object for a `Vec<(String, String)>` header list —
/// shared by `fetch`'s request marshalling and the dispatch-request path.
pub fn headers_to_value(headers: &[(String, String)]) -> Value {
    let mut map = BTreeMap::new();
    for (k, v) in headers {
        map.insert(k.clone(), Value::String(v.clone()));
    }
    Value::Map(map)
}
