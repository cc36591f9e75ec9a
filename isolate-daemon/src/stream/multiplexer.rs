//! Stream multiplexer (C4).
//!
//! Credit-based chunked byte streams for request bodies, response bodies,
//! and callback-response bodies (§4.4). All three share the same credit
//! primitive; they differ only in which wire messages carry the chunk
//! (`STREAM_PUSH`/`PULL`/`CLOSE`/`ERROR` for body streams, `CB_STREAM_*`
//! for a streaming `fetch` callback reply).
//!
//! Credit is modelled as a `tokio::sync::Semaphore`: the receiver "grants"
//! credit by adding permits, the sender "spends" it by acquiring `n`
//! permits for an `n`-byte chunk and immediately forgetting them so they
//! are never returned — overshoot is structurally impossible since
//! `acquire_many` simply waits rather than letting the counter go
//! negative, which is the §8 "Credit safety" invariant made true by
//! construction rather than checked after the fact.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Notify, Semaphore};

use crate::error::{DaemonError, DaemonResult};
use crate::proto::{StreamId, STREAM_CHUNK_SIZE};

/// Which wire message family a stream uses. The credit/cancellation
/// mechanics are identical; only the message constructors differ, which
/// callers supply via `StreamSink`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFlavor {
    RequestBody,
    ResponseBody,
    CallbackResponse,
}

/// Abstracts "write this stream event to the wire" so the multiplexer has
/// no direct dependency on `Session` and is unit-testable with an
/// in-memory sink.
pub trait StreamSink: Send + Sync {
    fn push_chunk(&self, id: StreamId, flavor: StreamFlavor, bytes: Bytes) -> DaemonResult<()>;
    fn close(&self, id: StreamId, flavor: StreamFlavor) -> DaemonResult<()>;
    fn error(&self, id: StreamId, flavor: StreamFlavor, text: String) -> DaemonResult<()>;
    fn pull(&self, id: StreamId, flavor: StreamFlavor, max_bytes: u32) -> DaemonResult<()>;
    fn cancel(&self, id: StreamId, flavor: StreamFlavor) -> DaemonResult<()>;
}

struct Credit {
    semaphore: Semaphore,
}

impl Credit {
    fn new(initial: u32) -> Self {
        Self {
            semaphore: Semaphore::new(initial as usize),
        }
    }

    fn grant(&self, n: u32) {
        if n > 0 {
            self.semaphore.add_permits(n as usize);
        }
    }

    /// Waits for `n` bytes of credit, then permanently removes them.
    /// Returns `Err` only if the semaphore was closed (stream cancelled).
    async fn spend(&self, n: usize) -> Result<(), ()> {
        if n == 0 {
            return Ok(());
        }
        match self.semaphore.acquire_many(n as u32).await {
            Ok(permit) => {
                permit.forget();
                Ok(())
            }
            Err(_) => Err(()),
        }
    }

    fn close(&self) {
        self.semaphore.close();
    }
}

/// Sends a byte stream under credit. One per outbound stream (request
/// upload echoed by a guest, a response body, or a streaming callback
/// reply).
pub struct StreamSender {
    id: StreamId,
    flavor: StreamFlavor,
    credit: Arc<Credit>,
    cancelled: Arc<AtomicBool>,
    sink: Arc<dyn StreamSink>,
}

impl StreamSender {
    pub fn new(id: StreamId, flavor: StreamFlavor, initial_credit: u32, sink: Arc<dyn StreamSink>) -> Self {
        Self {
            id,
            flavor,
            credit: Arc::new(Credit::new(initial_credit)),
            cancelled: Arc::new(AtomicBool::new(false)),
            sink,
        }
    }

    /// Called when a `STREAM_PULL`/credit-grant arrives for this stream.
    pub fn grant_credit(&self, n: u32) {
        self.credit.grant(n);
    }

    /// Mark cancelled (peer sent `STREAM_ERROR`/`CB_STREAM_CANCEL`, or the
    /// local generator is being torn down). Wakes anything blocked on
    /// credit so it observes the cancellation instead of hanging forever.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.credit.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Send the whole body, splitting at `STREAM_CHUNK_SIZE` and awaiting
    /// credit before each chunk (§4.4 "Chunks are split at
    /// STREAM_CHUNK_SIZE"). Stops early — without emitting a terminal
    /// message — if cancelled mid-flight; the caller decides whether that
    /// counts as success.
    pub async fn send_all(&self, data: Bytes) -> DaemonResult<bool> {
        let mut offset = 0usize;
        while offset < data.len() {
            if self.is_cancelled() {
                return Ok(false);
            }
            let end = (offset + STREAM_CHUNK_SIZE).min(data.len());
            let chunk = data.slice(offset..end);
            if self.credit.spend(chunk.len()).await.is_err() {
                return Ok(false);
            }
            if self.is_cancelled() {
                return Ok(false);
            }
            self.sink.push_chunk(self.id, self.flavor, chunk)?;
            offset = end;
        }
        Ok(true)
    }

    /// Push exactly one chunk under credit (used by producers that
    /// generate data incrementally rather than having the whole body up
    /// front, e.g. a guest `ReadableStream` source).
    pub async fn send_chunk(&self, chunk: Bytes) -> DaemonResult<bool> {
        if self.credit.spend(chunk.len()).await.is_err() || self.is_cancelled() {
            return Ok(false);
        }
        self.sink.push_chunk(self.id, self.flavor, chunk)?;
        Ok(true)
    }

    pub fn finish(&self) -> DaemonResult<()> {
        self.sink.close(self.id, self.flavor)
    }

    pub fn abort(&self, text: String) -> DaemonResult<()> {
        self.cancel();
        self.sink.error(self.id, self.flavor, text)
    }
}

enum ReceiverEvent {
    Chunk(Bytes),
    End,
    Error(String),
}

/// Receives a byte stream under credit, granting more as its internal
/// buffer drains below a watermark.
pub struct StreamReceiver {
    id: StreamId,
    flavor: StreamFlavor,
    rx: mpsc::UnboundedReceiver<ReceiverEvent>,
    sink: Arc<dyn StreamSink>,
    granted: AtomicU32,
    ended: AtomicBool,
}

/// Feeds a `StreamReceiver` from the session's demultiplex loop.
pub struct StreamReceiverHandle {
    tx: mpsc::UnboundedSender<ReceiverEvent>,
}

impl StreamReceiverHandle {
    pub fn push_chunk(&self, bytes: Bytes) {
        let _ = self.tx.send(ReceiverEvent::Chunk(bytes));
    }
    pub fn end(&self) {
        let _ = self.tx.send(ReceiverEvent::End);
    }
    pub fn error(&self, text: String) {
        let _ = self.tx.send(ReceiverEvent::Error(text));
    }
}

impl StreamReceiver {
    pub fn new(
        id: StreamId,
        flavor: StreamFlavor,
        sink: Arc<dyn StreamSink>,
    ) -> (Self, StreamReceiverHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let initial = crate::proto::STREAM_DEFAULT_CREDIT;
        // Grant initial credit immediately: the sender starts out able to
        // push up to STREAM_DEFAULT_CREDIT bytes without waiting on us.
        let _ = sink.pull(id, flavor, initial);
        (
            Self {
                id,
                flavor,
                rx,
                sink,
                granted: AtomicU32::new(initial),
                ended: AtomicBool::new(false),
            },
            StreamReceiverHandle { tx },
        )
    }

    /// Pull the next chunk, or `None` once the stream has ended. Grants a
    /// fresh `STREAM_DEFAULT_CREDIT` window once the consumer has drained
    /// what it was already granted.
    pub async fn recv(&mut self) -> Option<DaemonResult<Bytes>> {
        if self.ended.load(Ordering::Acquire) {
            return None;
        }
        match self.rx.recv().await {
            Some(ReceiverEvent::Chunk(bytes)) => {
                let remaining = self
                    .granted
                    .fetch_sub(bytes.len() as u32, Ordering::AcqRel)
                    .saturating_sub(bytes.len() as u32);
                if remaining < crate::proto::STREAM_DEFAULT_CREDIT / 2 {
                    let grant = crate::proto::STREAM_DEFAULT_CREDIT;
                    if self.sink.pull(self.id, self.flavor, grant).is_ok() {
                        self.granted.fetch_add(grant, Ordering::AcqRel);
                    }
                }
                Some(Ok(bytes))
            }
            Some(ReceiverEvent::End) => {
                self.ended.store(true, Ordering::Release);
                None
            }
            Some(ReceiverEvent::Error(text)) => {
                self.ended.store(true, Ordering::Release);
                Some(Err(DaemonError::ProtocolError(text)))
            }
            None => {
                self.ended.store(true, Ordering::Release);
                None
            }
        }
    }

    /// The consumer (guest `ReadableStream.cancel()`, or a dropped daemon
    /// receiver) abandoned the stream before it ended: emit the
    /// flavor-appropriate cancellation so the sender stops generating and
    /// releases anything blocked on credit (§4.4 "Cancellation").
    pub fn cancel(&mut self) {
        if !self.ended.swap(true, Ordering::AcqRel) {
            let _ = self.sink.cancel(self.id, self.flavor);
        }
    }
}

impl Drop for StreamReceiver {
    fn drop(&mut self) {
        if !self.ended.load(Ordering::Acquire) {
            let _ = self.sink.cancel(self.id, self.flavor);
        }
    }
}

/// Allocates session-scoped stream ids (§4.4 "Streams are numbered with
/// session-scoped u32 ids").
#[derive(Default)]
pub struct StreamIdAllocator {
    next: AtomicU32,
}

impl StreamIdAllocator {
    pub fn alloc(&self) -> StreamId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        pushed: Mutex<Vec<Bytes>>,
        pulls: Mutex<Vec<u32>>,
        closed: Mutex<bool>,
        cancelled: Mutex<bool>,
    }

    impl StreamSink for RecordingSink {
        fn push_chunk(&self, _id: StreamId, _flavor: StreamFlavor, bytes: Bytes) -> DaemonResult<()> {
            self.pushed.lock().push(bytes);
            Ok(())
        }
        fn close(&self, _id: StreamId, _flavor: StreamFlavor) -> DaemonResult<()> {
            *self.closed.lock() = true;
            Ok(())
        }
        fn error(&self, _id: StreamId, _flavor: StreamFlavor, _text: String) -> DaemonResult<()> {
            Ok(())
        }
        fn pull(&self, _id: StreamId, _flavor: StreamFlavor, max_bytes: u32) -> DaemonResult<()> {
            self.pulls.lock().push(max_bytes);
            Ok(())
        }
        fn cancel(&self, _id: StreamId, _flavor: StreamFlavor) -> DaemonResult<()> {
            *self.cancelled.lock() = true;
            Ok(())
        }
    }

    #[tokio::test]
    async fn sender_blocks_until_credit_is_granted() {
        let sink = Arc::new(RecordingSink::default());
        let sender = StreamSender::new(1, StreamFlavor::ResponseBody, 0, sink.clone());

        let data = Bytes::from_static(b"hello world");
        let send_fut = sender.send_all(data.clone());
        tokio::pin!(send_fut);

        // No credit yet: the future should not resolve within a yield.
        tokio::select! {
            _ = &mut send_fut => panic!("should not have sent without credit"),
            _ = tokio::task::yield_now() => {}
        }

        sender.grant_credit(data.len() as u32);
        let ok = send_fut.await.unwrap();
        assert!(ok);
        assert_eq!(sink.pushed.lock().concat(), data.to_vec());
    }

    #[tokio::test]
    async fn body_round_trip_conserves_bytes() {
        // §8 "Stream conservation": concatenation of chunks in arrival
        // order equals the original body byte-for-byte.
        let sink = Arc::new(RecordingSink::default());
        let sender = StreamSender::new(1, StreamFlavor::ResponseBody, 1 << 20, sink.clone());

        let mut data = Vec::new();
        for i in 0..200_000u32 {
            data.extend_from_slice(&i.to_le_bytes());
        }
        let data = Bytes::from(data);
        sender.send_all(data.clone()).await.unwrap();
        sender.finish().unwrap();

        let received: Vec<u8> = sink.pushed.lock().concat();
        assert_eq!(received, data.to_vec());
        assert!(*sink.closed.lock());
    }

    #[tokio::test]
    async fn cancellation_releases_a_blocked_sender() {
        let sink = Arc::new(RecordingSink::default());
        let sender = Arc::new(StreamSender::new(1, StreamFlavor::CallbackResponse, 0, sink));

        let s = sender.clone();
        let handle = tokio::spawn(async move { s.send_all(Bytes::from_static(b"abc")).await });

        tokio::task::yield_now().await;
        sender.cancel();

        let sent = handle.await.unwrap().unwrap();
        assert!(!sent);
    }

    #[tokio::test]
    async fn receiver_grants_initial_credit_on_construction() {
        let sink = Arc::new(RecordingSink::default());
        let (_recv, _handle) = StreamReceiver::new(1, StreamFlavor::RequestBody, sink.clone());
        assert_eq!(sink.pulls.lock().as_slice(), &[crate::proto::STREAM_DEFAULT_CREDIT]);
    }

    #[tokio::test]
    async fn dropping_an_unfinished_receiver_cancels_upstream() {
        let sink = Arc::new(RecordingSink::default());
        let (recv, _handle) = StreamReceiver::new(1, StreamFlavor::RequestBody, sink.clone());
        drop(recv);
        assert!(*sink.cancelled.lock());
    }
}
