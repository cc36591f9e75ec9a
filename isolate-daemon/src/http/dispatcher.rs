//! HTTP/WS dispatcher (C7).
//!
//! The guest registers one `serve({fetch, websocket})` handler; everything
//! here is routing and ordering discipline around calling into it. The
//! actual guest call (building a `Request` object, invoking the handler
//! function, awaiting its `Response`) needs a live isolate and is behind
//! the `GuestDispatch` trait so this module stays unit-testable — tests
//! below stand in a fake guest that records what it was asked to do.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{instrument, warn};

use crate::error::DaemonResult;
use crate::proto::Value;

pub type ConnectionId = uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SerializedRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<BodySpec>,
}

#[derive(Debug, Clone)]
pub enum BodySpec {
    Inline(Vec<u8>),
    Stream(crate::proto::StreamId),
}

#[derive(Debug, Clone)]
pub struct SerializedResponse {
    pub status: u16,
    pub status_text: String,
    /// Preserves arrival order for duplicate keys (e.g. repeated
    /// `Set-Cookie`) per §4.8's header contract, which C7 shares.
    pub headers: Vec<(String, String)>,
    pub body: Option<BodySpec>,
}

#[derive(Debug, Clone)]
pub enum WsMessagePayload {
    Text(String),
    Binary(Vec<u8>),
}

/// The isolate-facing half of the dispatcher: building guest objects,
/// invoking the registered handler, and reporting back what it did.
/// Implemented by the glue that owns the isolate + bridge kernel.
#[async_trait]
pub trait GuestDispatch: Send + Sync {
    fn has_serve_handler(&self) -> bool;
    async fn dispatch_request(&self, req: SerializedRequest) -> DaemonResult<SerializedResponse>;
    async fn dispatch_ws_open(&self, connection_id: ConnectionId) -> DaemonResult<()>;
    async fn dispatch_ws_message(&self, connection_id: ConnectionId, message: WsMessagePayload) -> DaemonResult<()>;
    async fn dispatch_ws_close(&self, connection_id: ConnectionId, code: Option<u16>, reason: Option<String>) -> DaemonResult<()>;
    async fn dispatch_ws_error(&self, connection_id: ConnectionId, error: String) -> DaemonResult<()>;
}

enum WsEvent {
    Open,
    Message(WsMessagePayload),
    Close { code: Option<u16>, reason: Option<String> },
    Error(String),
}

struct ConnectionHandle {
    tx: mpsc::UnboundedSender<WsEvent>,
}

/// `server.upgrade(req, {data})`'s recorded effect: the last request that
/// carried valid WebSocket handshake headers, together with its typed
/// `data` payload (§4.7 `get_upgrade_request`).
struct UpgradeSlot {
    request: SerializedRequest,
    data: Value,
}

pub struct Dispatcher {
    guest: Arc<dyn GuestDispatch>,
    connections: DashMap<ConnectionId, ConnectionHandle>,
    upgrade_slot: Mutex<Option<UpgradeSlot>>,
    active_connection_count: std::sync::atomic::AtomicU64,
}

impl Dispatcher {
    pub fn new(guest: Arc<dyn GuestDispatch>) -> Self {
        Self {
            guest,
            connections: DashMap::new(),
            upgrade_slot: Mutex::new(None),
            active_connection_count: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn has_serve_handler(&self) -> bool {
        self.guest.has_serve_handler()
    }

    pub fn has_active_connections(&self) -> bool {
        self.active_connection_count.load(Ordering::Acquire) > 0
    }

    #[instrument(skip(self, req))]
    pub async fn dispatch_request(&self, req: SerializedRequest) -> DaemonResult<SerializedResponse> {
        self.guest.dispatch_request(req).await
    }

    /// `upgrade(req, {data})`: records the request iff it carries the
    /// required handshake headers, returning whether it did. Only the
    /// handler calling this (guest-side) decides to record; this is just
    /// the slot it writes into.
    pub fn record_upgrade(&self, req: SerializedRequest, data: Value) -> bool {
        if !carries_websocket_handshake(&req) {
            return false;
        }
        *self.upgrade_slot.lock() = Some(UpgradeSlot { request: req, data });
        true
    }

    pub fn get_upgrade_request(&self) -> Option<(SerializedRequest, Value)> {
        self.upgrade_slot.lock().take().map(|slot| (slot.request, slot.data))
    }

    /// Registers a connection's ordering queue and spawns its single
    /// serializing worker — `open → message* → close` can never reorder
    /// or coalesce because only this one task ever calls into the guest
    /// for this `connection_id` (§4.7 "Ordering guarantees").
    pub fn open_connection(&self, connection_id: ConnectionId) {
        let (tx, mut rx) = mpsc::unbounded_channel::<WsEvent>();
        self.connections.insert(connection_id, ConnectionHandle { tx });
        self.active_connection_count.fetch_add(1, Ordering::AcqRel);

        let guest = self.guest.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let result = match event {
                    WsEvent::Open => guest.dispatch_ws_open(connection_id).await,
                    WsEvent::Message(msg) => guest.dispatch_ws_message(connection_id, msg).await,
                    WsEvent::Close { code, reason } => {
                        let result = guest.dispatch_ws_close(connection_id, code, reason).await;
                        if let Err(err) = result {
                            warn!(connection_id, %err, "guest websocket close handler raised");
                        }
                        break;
                    }
                    WsEvent::Error(err) => guest.dispatch_ws_error(connection_id, err).await,
                };
                if let Err(err) = result {
                    warn!(connection_id, %err, "guest websocket handler raised");
                }
            }
        });
    }

    fn queue(&self, connection_id: ConnectionId, event: WsEvent) {
        if let Some(handle) = self.connections.get(&connection_id) {
            let _ = handle.tx.send(event);
        } else {
            warn!(connection_id, "websocket event for unknown/closed connection dropped");
        }
    }

    pub fn dispatch_ws_open(&self, connection_id: ConnectionId) {
        self.open_connection(connection_id);
        self.queue(connection_id, WsEvent::Open);
    }

    pub fn dispatch_ws_message(&self, connection_id: ConnectionId, message: WsMessagePayload) {
        self.queue(connection_id, WsEvent::Message(message));
    }

    pub fn dispatch_ws_close(&self, connection_id: ConnectionId, code: Option<u16>, reason: Option<String>) {
        self.queue(connection_id, WsEvent::Close { code, reason });
        self.connections.remove(&connection_id);
        self.active_connection_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn dispatch_ws_error(&self, connection_id: ConnectionId, error: String) {
        self.queue(connection_id, WsEvent::Error(error));
    }
}

fn carries_websocket_handshake(req: &SerializedRequest) -> bool {
    let has = |name: &str, value_contains: &str| {
        req.headers
            .iter()
            .any(|(k, v)| k.eq_ignore_ascii_case(name) && v.to_ascii_lowercase().contains(value_contains))
    };
    has("upgrade", "websocket") && has("connection", "upgrade")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct FakeGuest {
        events: Arc<AsyncMutex<Vec<String>>>,
    }

    #[async_trait]
    impl GuestDispatch for FakeGuest {
        fn has_serve_handler(&self) -> bool {
            true
        }
        async fn dispatch_request(&self, req: SerializedRequest) -> DaemonResult<SerializedResponse> {
            Ok(SerializedResponse {
                status: 200,
                status_text: "OK".into(),
                headers: vec![],
                body: req.body,
            })
        }
        async fn dispatch_ws_open(&self, connection_id: ConnectionId) -> DaemonResult<()> {
            self.events.lock().await.push(format!("open:{connection_id}"));
            Ok(())
        }
        async fn dispatch_ws_message(&self, connection_id: ConnectionId, message: WsMessagePayload) -> DaemonResult<()> {
            let text = match message {
                WsMessagePayload::Text(t) => t,
                WsMessagePayload::Binary(b) => format!("<{} bytes>", b.len()),
            };
            self.events.lock().await.push(format!("message:{connection_id}:{text}"));
            Ok(())
        }
        async fn dispatch_ws_close(&self, connection_id: ConnectionId, _code: Option<u16>, _reason: Option<String>) -> DaemonResult<()> {
            self.events.lock().await.push(format!("close:{connection_id}"));
            Ok(())
        }
        async fn dispatch_ws_error(&self, connection_id: ConnectionId, error: String) -> DaemonResult<()> {
            self.events.lock().await.push(format!("error:{connection_id}:{error}"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn websocket_events_arrive_strictly_ordered() {
        let events = Arc::new(AsyncMutex::new(Vec::new()));
        let guest = Arc::new(FakeGuest { events: events.clone() });
        let dispatcher = Dispatcher::new(guest);

        let conn = uuid::Uuid::new_v4();
        dispatcher.dispatch_ws_open(conn);
        for i in 0..20 {
            dispatcher.dispatch_ws_message(conn, WsMessagePayload::Text(format!("m{i}")));
        }
        dispatcher.dispatch_ws_close(conn, Some(1000), None);

        // Give the serializing worker a chance to drain.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let log = events.lock().await;
        assert_eq!(log.first().unwrap(), &format!("open:{conn}"));
        assert_eq!(log.last().unwrap(), &format!("close:{conn}"));
        for (i, entry) in log.iter().skip(1).take(20).enumerate() {
            assert_eq!(entry, &format!("message:{conn}:m{i}"));
        }
    }

    #[tokio::test]
    async fn upgrade_is_only_recorded_with_handshake_headers() {
        let guest = Arc::new(FakeGuest::default());
        let dispatcher = Dispatcher::new(guest);

        let plain = SerializedRequest {
            method: "GET".into(),
            url: "/ws".into(),
            headers: vec![],
            body: None,
        };
        assert!(!dispatcher.record_upgrade(plain, Value::Null));
        assert!(dispatcher.get_upgrade_request().is_none());

        let handshake = SerializedRequest {
            method: "GET".into(),
            url: "/ws".into(),
            headers: vec![
                ("Upgrade".into(), "websocket".into()),
                ("Connection".into(), "Upgrade".into()),
            ],
            body: None,
        };
        assert!(dispatcher.record_upgrade(handshake, Value::I64(42)));
        let (_, data) = dispatcher.get_upgrade_request().unwrap();
        assert_eq!(data, Value::I64(42));
        // Slot is consumed by the read.
        assert!(dispatcher.get_upgrade_request().is_none());
    }

    #[tokio::test]
    async fn has_active_connections_tracks_open_and_close() {
        let guest = Arc::new(FakeGuest::default());
        let dispatcher = Dispatcher::new(guest);
        let conn = uuid::Uuid::new_v4();
        assert!(!dispatcher.has_active_connections());
        dispatcher.dispatch_ws_open(conn);
        assert!(dispatcher.has_active_connections());
        dispatcher.dispatch_ws_close(conn, None, None);
        assert!(!dispatcher.has_active_connections());
    }
}
