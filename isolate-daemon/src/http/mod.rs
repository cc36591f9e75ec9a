//! HTTP/WS dispatcher (C7).

pub mod dispatcher;
pub mod websocket;

pub use dispatcher::{
    BodySpec, ConnectionId, Dispatcher, GuestDispatch, SerializedRequest, SerializedResponse, WsMessagePayload,
};
pub use websocket::{ServerWebSocket, ServerWsCommand};
