//! `ServerWebSocket` proxy (§4.7): the guest-visible object handed to
//! `websocket.{open,message,close,error}`. Its `send`/`close` methods
//! don't write to a socket directly — they emit `WS_CMD`/`ISOLATE_EVENT`
//! that the owning session forwards to whichever client is actually
//! driving the physical connection (this daemon never terminates TLS or
//! owns the listening socket itself; the client proxies bytes to it).

use rmpv::Value as RmpValue;

use crate::error::DaemonResult;
use crate::http::dispatcher::ConnectionId;
use crate::proto::{IsolateId, Value};
use crate::session::Session;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum ServerWsCommand {
    SendText(String),
    SendBinary(Vec<u8>),
    Close { code: Option<u16>, reason: Option<String> },
}

impl ServerWsCommand {
    fn into_wire_value(self) -> Value {
        match self {
            ServerWsCommand::SendText(text) => {
                let mut map = std::collections::BTreeMap::new();
                map.insert("kind".to_string(), Value::String("text".into()));
                map.insert("text".to_string(), Value::String(text));
                Value::Map(map)
            }
            ServerWsCommand::SendBinary(bytes) => {
                let mut map = std::collections::BTreeMap::new();
                map.insert("kind".to_string(), Value::String("binary".into()));
                map.insert("data".to_string(), Value::Bytes(bytes));
                Value::Map(map)
            }
            ServerWsCommand::Close { code, reason } => {
                let mut map = std::collections::BTreeMap::new();
                map.insert("kind".to_string(), Value::String("close".into()));
                map.insert(
                    "code".to_string(),
                    code.map(|c| Value::I64(c as i64)).unwrap_or(Value::Null),
                );
                map.insert(
                    "reason".to_string(),
                    reason.map(Value::String).unwrap_or(Value::Null),
                );
                Value::Map(map)
            }
        }
    }
}

/// Guest-facing handle for one open WebSocket connection.
pub struct ServerWebSocket {
    isolate_id: IsolateId,
    connection_id: ConnectionId,
    session: Arc<Session>,
}

impl ServerWebSocket {
    pub fn new(isolate_id: IsolateId, connection_id: ConnectionId, session: Arc<Session>) -> Self {
        Self {
            isolate_id,
            connection_id,
            session,
        }
    }

    pub fn send_text(&self, text: String) -> DaemonResult<()> {
        self.emit(ServerWsCommand::SendText(text))
    }

    pub fn send_binary(&self, bytes: Vec<u8>) -> DaemonResult<()> {
        self.emit(ServerWsCommand::SendBinary(bytes))
    }

    pub fn close(&self, code: Option<u16>, reason: Option<String>) -> DaemonResult<()> {
        self.emit(ServerWsCommand::Close { code, reason })
    }

    fn emit(&self, cmd: ServerWsCommand) -> DaemonResult<()> {
        let mut payload = std::collections::BTreeMap::new();
        payload.insert(
            "connectionId".to_string(),
            Value::String(self.connection_id.to_string()),
        );
        payload.insert("command".to_string(), cmd.into_wire_value());
        self.session
            .dispatch_event(self.isolate_id, "ws_cmd", Value::Map(payload));
        Ok(())
    }
}

/// Placeholder kept for symmetry with the wire `WsCmd.command` field,
/// which is an opaque `rmpv::Value` blob rather than the typed
/// `Value` — clients are free to shape it however their transport proxy
/// expects. Unused until a client-defined command schema is adopted.
pub type RawWsCommand = RmpValue;
