//! IPC session (C3).
//!
//! One `Session` per accepted connection. A single reader task drains the
//! socket's read half through the `FrameCodec` and demultiplexes by
//! message type; a single writer task owns the write half so frames from
//! different callers are never interleaved mid-body (§4.3 "a single
//! write-serialiser"). Everything else — `send_request`,
//! `invoke_client_callback`, `dispatch_event` — is a thin façade over
//! those two tasks, in the spirit of the teacher's `ConcurrentProcessor`
//! (one channel in, a fixed-shape worker loop, callers never touch the
//! socket directly).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::{DaemonError, DaemonResult};
use crate::proto::message::{
    CbInvoke, CbResponse, IsolateEvent as IsolateEventBody, Req, RespErr, RespOk,
};
use crate::proto::value::Value;
use crate::proto::{FrameCodec, MessageType, RequestId, StreamId, WireMessage};
use crate::stream::{StreamReceiverHandle, StreamSender};

/// Split out so transports other than a raw stream (tests, in-memory
/// pipes) can drive a `Session` without a real socket.
pub trait AsyncDuplex: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static> AsyncDuplex for T {}

type PendingRequestTable = DashMap<RequestId, oneshot::Sender<Result<Value, DaemonError>>>;
type PendingCallbackTable = DashMap<RequestId, oneshot::Sender<Result<Value, DaemonError>>>;

/// Dispatched to the rest of the daemon for every inbound message the
/// session can't answer by itself (i.e. everything except `RESP_*`/
/// `CB_RESPONSE`, which settle a pending waker here).
pub enum Inbound {
    Req(Req),
    CbResponseConsumed,
    StreamFrame(WireMessage),
    WsCmd(WireMessage),
    Ping(u64),
}

pub struct Session {
    id: Uuid,
    next_request_id: AtomicU32,
    pending_requests: Arc<PendingRequestTable>,
    pending_callbacks: Arc<PendingCallbackTable>,
    write_tx: mpsc::UnboundedSender<WireMessage>,
    closed: Arc<std::sync::atomic::AtomicBool>,
    /// Owned by whichever side of a body transfer is receiving bytes
    /// (an uploaded `StreamId::Stream` request body, a streamed `fetch`
    /// response this session's guest is consuming).
    stream_receivers: DashMap<StreamId, StreamReceiverHandle>,
    /// Owned by whichever side is generating bytes (a response body this
    /// session is pushing out, a streamed `fetch` body it's uploading).
    stream_senders: DashMap<StreamId, Arc<StreamSender>>,
}

impl Session {
    /// Spawn the reader/writer tasks for an accepted connection. Returns
    /// the session handle plus a receiver the caller drains for messages
    /// that need daemon-wide handling (`Req`, stream frames, WS commands).
    pub fn spawn<D: AsyncDuplex>(
        io: D,
        max_frame_bytes: u32,
    ) -> (Arc<Session>, mpsc::UnboundedReceiver<Inbound>) {
        let (read_half, write_half) = tokio::io::split(io);
        let (write_tx, write_rx) = mpsc::unbounded_channel::<WireMessage>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Inbound>();

        let pending_requests: Arc<PendingRequestTable> = Arc::new(DashMap::new());
        let pending_callbacks: Arc<PendingCallbackTable> = Arc::new(DashMap::new());
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let session = Arc::new(Session {
            id: Uuid::new_v4(),
            next_request_id: AtomicU32::new(1),
            pending_requests: pending_requests.clone(),
            pending_callbacks: pending_callbacks.clone(),
            write_tx: write_tx.clone(),
            closed: closed.clone(),
            stream_receivers: DashMap::new(),
            stream_senders: DashMap::new(),
        });

        tokio::spawn(writer_loop(write_half, write_rx));
        tokio::spawn(reader_loop(
            read_half,
            max_frame_bytes,
            pending_requests,
            pending_callbacks,
            inbound_tx,
            closed,
            write_tx,
        ));

        (session, inbound_rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn alloc_request_id(&self) -> RequestId {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// `send_request(msg) -> future<response>` (§4.3). `op` names the
    /// requested operation; `payload` is the request body.
    #[instrument(skip(self, payload), fields(session = %self.id, op = op))]
    pub async fn send_request(
        &self,
        op: &str,
        payload: Value,
        deadline: Option<Duration>,
    ) -> DaemonResult<Value> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DaemonError::ConnectionClosed);
        }
        let id = self.alloc_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending_requests.insert(id, tx);

        if self
            .write_tx
            .send(WireMessage::Req(Req {
                id,
                op: op.to_string(),
                payload,
            }))
            .is_err()
        {
            self.pending_requests.remove(&id);
            return Err(DaemonError::ConnectionClosed);
        }

        let result = match deadline {
            Some(d) => match tokio::time::timeout(d, rx).await {
                Ok(inner) => inner,
                Err(_) => {
                    // Expiration cancels the waker *and* emits no follow-up
                    // message — if the response arrives late it is simply
                    // dropped when it finds no entry in the table (§4.3).
                    self.pending_requests.remove(&id);
                    return Err(DaemonError::RequestTimeout);
                }
            },
            None => rx.await,
        };

        result.unwrap_or(Err(DaemonError::ConnectionClosed))
    }

    /// `invoke_client_callback(cbId, args) -> future<value>` (§4.3). A
    /// rejection maps `RESP_ERR`'s `{name, message, stack}` onto a
    /// `ScriptError` so the bridge can re-surface it faithfully in the
    /// guest.
    #[instrument(skip(self, args), fields(session = %self.id, callback_id))]
    pub async fn invoke_client_callback(
        &self,
        callback_id: u64,
        args: Vec<Value>,
        deadline: Option<Duration>,
    ) -> DaemonResult<Value> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DaemonError::ConnectionClosed);
        }
        let id = self.alloc_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending_callbacks.insert(id, tx);

        if self
            .write_tx
            .send(WireMessage::CbInvoke(CbInvoke { id, callback_id, args }))
            .is_err()
        {
            self.pending_callbacks.remove(&id);
            return Err(DaemonError::ConnectionClosed);
        }

        let result = match deadline {
            Some(d) => match tokio::time::timeout(d, rx).await {
                Ok(inner) => inner,
                Err(_) => {
                    self.pending_callbacks.remove(&id);
                    return Err(DaemonError::RequestTimeout);
                }
            },
            None => rx.await,
        };

        result.unwrap_or(Err(DaemonError::ConnectionClosed))
    }

    /// Fire-and-forget `ISOLATE_EVENT` (§4.3).
    pub fn dispatch_event(&self, isolate_id: u64, name: &str, payload: Value) {
        let _ = self.write_tx.send(WireMessage::IsolateEvent(IsolateEventBody {
            isolate_id,
            name: name.to_string(),
            payload,
        }));
    }

    /// Send a pre-built message (used by the stream multiplexer and HTTP
    /// dispatcher, which construct `RESP_OK`/`RESP_STREAM_*`/`WS_CMD`
    /// frames directly).
    pub fn send_message(&self, msg: WireMessage) -> DaemonResult<()> {
        self.write_tx
            .send(msg)
            .map_err(|_| DaemonError::ConnectionClosed)
    }

    /// Cancels all pending request/callback wakers with `ConnectionClosed`
    /// (§4.3 `close()`).
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let ids: Vec<RequestId> = self.pending_requests.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending_requests.remove(&id) {
                let _ = tx.send(Err(DaemonError::ConnectionClosed));
            }
        }
        let ids: Vec<RequestId> = self.pending_callbacks.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending_callbacks.remove(&id) {
                let _ = tx.send(Err(DaemonError::ConnectionClosed));
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn register_stream_receiver(&self, id: StreamId, handle: StreamReceiverHandle) {
        self.stream_receivers.insert(id, handle);
    }

    pub fn register_stream_sender(&self, id: StreamId, sender: Arc<StreamSender>) {
        self.stream_senders.insert(id, sender);
    }

    /// Routes one demultiplexed stream-family frame (`Inbound::StreamFrame`)
    /// to the receiver/sender it belongs to. `CB_STREAM_*` frames have no
    /// registered owner — this bridge's `fetch`/client-callback path is
    /// buffered rather than streaming (see DESIGN.md), so they are logged
    /// and dropped rather than silently ignored.
    pub fn route_stream_frame(&self, msg: WireMessage) {
        match msg {
            WireMessage::StreamPush(body) => match self.stream_receivers.get(&body.stream_id) {
                Some(h) => h.push_chunk(Bytes::from(body.bytes)),
                None => warn!(stream_id = body.stream_id, "STREAM_PUSH for unknown stream"),
            },
            WireMessage::StreamClose(body) => match self.stream_receivers.remove(&body.stream_id) {
                Some((_, h)) => h.end(),
                None => warn!(stream_id = body.stream_id, "STREAM_CLOSE for unknown stream"),
            },
            WireMessage::StreamError(body) => {
                if let Some((_, h)) = self.stream_receivers.remove(&body.stream_id) {
                    h.error(body.text);
                } else if let Some(s) = self.stream_senders.get(&body.stream_id) {
                    s.cancel();
                } else {
                    warn!(stream_id = body.stream_id, "STREAM_ERROR for unknown stream");
                }
            }
            WireMessage::StreamPull(body) => match self.stream_senders.get(&body.stream_id) {
                Some(s) => s.grant_credit(body.max_bytes),
                None => warn!(stream_id = body.stream_id, "STREAM_PULL for unknown stream"),
            },
            WireMessage::CbStreamStart(_) | WireMessage::CbStreamChunk(_) | WireMessage::CbStreamEnd(_) | WireMessage::CbStreamCancel(_) => {
                debug!("dropping CB_STREAM_* frame: client callbacks are buffered, not streamed");
            }
            other => warn!(msg_type = ?other.message_type(), "unroutable frame reached route_stream_frame"),
        }
    }
}

async fn writer_loop<W: tokio::io::AsyncWrite + Unpin>(
    mut write_half: W,
    mut rx: mpsc::UnboundedReceiver<WireMessage>,
) {
    while let Some(msg) = rx.recv().await {
        let encoded = match msg.encode() {
            Ok(b) => b,
            Err(e) => {
                warn!("dropping unencodable message: {e}");
                continue;
            }
        };
        if write_half.write_all(&encoded).await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

#[allow(clippy::too_many_arguments)]
async fn reader_loop<R: tokio::io::AsyncRead + Unpin>(
    mut read_half: R,
    max_frame_bytes: u32,
    pending_requests: Arc<PendingRequestTable>,
    pending_callbacks: Arc<PendingCallbackTable>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    closed: Arc<std::sync::atomic::AtomicBool>,
    write_tx: mpsc::UnboundedSender<WireMessage>,
) {
    let mut codec = FrameCodec::new(max_frame_bytes);
    let mut buf = vec![0u8; 64 * 1024];

    'outer: loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("session read error: {e}");
                break;
            }
        };
        codec.feed(&buf[..n]);

        loop {
            let raw = match codec.next_frame() {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(e) => {
                    warn!("corrupt frame, closing session: {e}");
                    break 'outer;
                }
            };
            let msg_type = MessageType::try_from(raw.msg_type);
            let decoded = match msg_type {
                Ok(_) => WireMessage::decode(raw),
                Err(e) => {
                    // Unknown tag: per-frame failure, stream stays aligned.
                    warn!("{e}");
                    continue;
                }
            };
            let msg = match decoded {
                Ok(m) => m,
                Err(e) => {
                    warn!("failed to decode message body: {e}");
                    continue;
                }
            };

            match msg {
                WireMessage::RespOk(RespOk { id, payload }) => {
                    if let Some((_, tx)) = pending_requests.remove(&id) {
                        let _ = tx.send(Ok(payload));
                    }
                }
                WireMessage::RespErr(RespErr { id, error }) => {
                    if let Some((_, tx)) = pending_requests.remove(&id) {
                        let _ = tx.send(Err(wire_error_to_daemon_error(error)));
                    }
                }
                WireMessage::CbResponse(CbResponse { id, result, error }) => {
                    if let Some((_, tx)) = pending_callbacks.remove(&id) {
                        let outcome = match error {
                            Some(e) => Err(wire_error_to_daemon_error(e)),
                            None => Ok(result.unwrap_or(Value::Null)),
                        };
                        let _ = tx.send(outcome);
                    }
                }
                WireMessage::Req(req) => {
                    let _ = inbound_tx.send(Inbound::Req(req));
                }
                WireMessage::Ping(crate::proto::message::Ping { nonce }) => {
                    let _ = write_tx.send(WireMessage::Pong(crate::proto::message::Pong { nonce }));
                    let _ = inbound_tx.send(Inbound::Ping(nonce));
                }
                WireMessage::Pong(_) => {}
                ws_msg @ WireMessage::WsCmd(_) => {
                    let _ = inbound_tx.send(Inbound::WsCmd(ws_msg));
                }
                stream_msg @ (WireMessage::StreamPush(_)
                | WireMessage::StreamPull(_)
                | WireMessage::StreamClose(_)
                | WireMessage::StreamError(_)
                | WireMessage::RespStreamStart(_)
                | WireMessage::RespStreamChunk(_)
                | WireMessage::RespStreamEnd(_)
                | WireMessage::CbStreamStart(_)
                | WireMessage::CbStreamChunk(_)
                | WireMessage::CbStreamEnd(_)
                | WireMessage::CbStreamCancel(_)) => {
                    let _ = inbound_tx.send(Inbound::StreamFrame(stream_msg));
                }
                WireMessage::Hello(_) | WireMessage::ClientEvent(_) | WireMessage::IsolateEvent(_) => {
                    // Server does not expect these inbound after handshake;
                    // ignore rather than tear down the session.
                }
            }
        }
    }

    closed.store(true, Ordering::Release);
    let ids: Vec<RequestId> = pending_requests.iter().map(|e| *e.key()).collect();
    for id in ids {
        if let Some((_, tx)) = pending_requests.remove(&id) {
            let _ = tx.send(Err(DaemonError::ConnectionClosed));
        }
    }
    let ids: Vec<RequestId> = pending_callbacks.iter().map(|e| *e.key()).collect();
    for id in ids {
        if let Some((_, tx)) = pending_callbacks.remove(&id) {
            let _ = tx.send(Err(DaemonError::ConnectionClosed));
        }
    }
}

fn wire_error_to_daemon_error(err: crate::error::WireError) -> DaemonError {
    if let Some(script) = err.script {
        DaemonError::ScriptError(script)
    } else {
        DaemonError::ProtocolError(err.details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn request_resolves_when_resp_ok_arrives() {
        let (client, server) = duplex(4096);
        let (session, _inbound) = Session::spawn(server, 1 << 20);

        // Drive the "client" side: read the REQ, write back RESP_OK.
        let (mut client_read, mut client_write) = tokio::io::split(client);
        tokio::spawn(async move {
            let mut codec = FrameCodec::new(1 << 20);
            let mut buf = [0u8; 4096];
            loop {
                let n = client_read.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                codec.feed(&buf[..n]);
                while let Some(raw) = codec.next_frame().unwrap() {
                    if let WireMessage::Req(req) = WireMessage::decode(raw).unwrap() {
                        let resp = WireMessage::RespOk(RespOk {
                            id: req.id,
                            payload: Value::String("pong".into()),
                        });
                        client_write.write_all(&resp.encode().unwrap()).await.unwrap();
                        return;
                    }
                }
            }
        });

        let result = session
            .send_request("ping", Value::Null, Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(result, Value::String("pong".into()));
    }

    #[tokio::test]
    async fn timeout_discards_a_late_response() {
        let (client, server) = duplex(4096);
        let (session, _inbound) = Session::spawn(server, 1 << 20);
        drop(client); // nobody will ever answer

        let result = session
            .send_request("ping", Value::Null, Some(Duration::from_millis(20)))
            .await;
        assert!(matches!(result, Err(DaemonError::RequestTimeout)));
    }

    #[tokio::test]
    async fn close_cancels_pending_requests() {
        let (client, server) = duplex(4096);
        let (session, _inbound) = Session::spawn(server, 1 << 20);
        let _keep_alive = client;

        let session2 = session.clone();
        let handle = tokio::spawn(async move {
            session2
                .send_request("ping", Value::Null, None)
                .await
        });

        tokio::task::yield_now().await;
        session.close();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(DaemonError::ConnectionClosed)));
    }
}
