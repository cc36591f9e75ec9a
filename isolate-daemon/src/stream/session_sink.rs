//! `StreamSink` backed by a live IPC session (C4 and C7's shared body
//! transport).
//!
//! `StreamSender`/`StreamReceiver` are flavor-agnostic; this is the one
//! place that actually knows which wire message each flavor/direction
//! maps onto. `CallbackResponse` only has wire support for its `CB_STREAM_
//! START/CHUNK/END/CANCEL` family, not an error frame — callback replies
//! are buffered end-to-end in this bridge (see DESIGN.md), so that arm is
//! reachable only if a future caller starts a callback stream without
//! checking that.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::{DaemonError, DaemonResult};
use crate::proto::message::{
    CbStreamCancelBody, CbStreamChunkBody, CbStreamEndBody, StreamChunkBody, StreamEndBody, StreamErrorBody,
    StreamPullBody,
};
use crate::proto::{StreamId, WireMessage};
use crate::session::Session;
use crate::stream::{StreamFlavor, StreamSink};

pub struct SessionStreamSink {
    session: Arc<Session>,
}

impl SessionStreamSink {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    fn send(&self, msg: WireMessage) -> DaemonResult<()> {
        self.session.send_message(msg)
    }
}

impl StreamSink for SessionStreamSink {
    fn push_chunk(&self, id: StreamId, flavor: StreamFlavor, bytes: Bytes) -> DaemonResult<()> {
        match flavor {
            StreamFlavor::ResponseBody => self.send(WireMessage::RespStreamChunk(StreamChunkBody { stream_id: id, bytes: bytes.to_vec() })),
            StreamFlavor::RequestBody => self.send(WireMessage::StreamPush(StreamChunkBody { stream_id: id, bytes: bytes.to_vec() })),
            StreamFlavor::CallbackResponse => {
                self.send(WireMessage::CbStreamChunk(CbStreamChunkBody { callback_request_id: id, bytes: bytes.to_vec() }))
            }
        }
    }

    fn close(&self, id: StreamId, flavor: StreamFlavor) -> DaemonResult<()> {
        match flavor {
            StreamFlavor::ResponseBody => self.send(WireMessage::RespStreamEnd(StreamEndBody { stream_id: id })),
            StreamFlavor::RequestBody => self.send(WireMessage::StreamClose(StreamEndBody { stream_id: id })),
            StreamFlavor::CallbackResponse => self.send(WireMessage::CbStreamEnd(CbStreamEndBody { callback_request_id: id })),
        }
    }

    fn error(&self, id: StreamId, flavor: StreamFlavor, text: String) -> DaemonResult<()> {
        match flavor {
            StreamFlavor::ResponseBody | StreamFlavor::RequestBody => {
                self.send(WireMessage::StreamError(StreamErrorBody { stream_id: id, text }))
            }
            StreamFlavor::CallbackResponse => Err(DaemonError::ProtocolError(
                "no wire error frame for CB_STREAM_*; callback replies are buffered".to_string(),
            )),
        }
    }

    fn pull(&self, id: StreamId, flavor: StreamFlavor, max_bytes: u32) -> DaemonResult<()> {
        match flavor {
            StreamFlavor::ResponseBody | StreamFlavor::RequestBody => {
                self.send(WireMessage::StreamPull(StreamPullBody { stream_id: id, max_bytes }))
            }
            StreamFlavor::CallbackResponse => Ok(()),
        }
    }

    fn cancel(&self, id: StreamId, flavor: StreamFlavor) -> DaemonResult<()> {
        match flavor {
            StreamFlavor::ResponseBody | StreamFlavor::RequestBody => {
                self.send(WireMessage::StreamError(StreamErrorBody { stream_id: id, text: "cancelled".to_string() }))
            }
            StreamFlavor::CallbackResponse => self.send(WireMessage::CbStreamCancel(CbStreamCancelBody { callback_request_id: id })),
        }
    }
}
