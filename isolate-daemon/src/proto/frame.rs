//! Frame codec (C1).
//!
//! Wire layout: `be_u32 length | u8 type | msgpack body`, `length` covers
//! `type` + `body`. The codec is a stateful parser: feed it arbitrary byte
//! slices as they arrive off the socket and drain whole frames one at a
//! time. Unknown `type` tags are reported per-frame without desynchronising
//! the byte stream (the `length` prefix is always honoured); a bad length
//! or a header that can't be parsed at all poisons the codec permanently,
//! matching the teacher's "one terminal error, then stop" posture for
//! transport-level corruption (see `session/session.rs`'s `close()`).

use bytes::{Buf, BytesMut};

use crate::error::DaemonError;

/// Hard ceiling independent of the configured soft max — guards against a
/// hostile/garbled length prefix causing an unbounded allocation before the
/// configured limit is even consulted.
pub const ABSOLUTE_MAX_FRAME_BYTES: u32 = 256 * 1024 * 1024;

const LENGTH_PREFIX_BYTES: usize = 4;
const TYPE_BYTES: usize = 1;

/// One undecoded frame: the raw message-type tag plus its msgpack body.
/// `message.rs` turns this into a typed `WireMessage`.
#[derive(Debug)]
pub struct RawFrame {
    pub msg_type: u8,
    pub body: BytesMut,
}

pub struct FrameCodec {
    buf: BytesMut,
    max_frame_bytes: u32,
    /// Set once a terminal `CorruptFrame` has been surfaced; every further
    /// call to `next_frame` re-raises it instead of attempting to recover a
    /// byte stream we no longer trust the alignment of.
    poisoned: Option<DaemonError>,
}

impl FrameCodec {
    pub fn new(max_frame_bytes: u32) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_bytes: max_frame_bytes.min(ABSOLUTE_MAX_FRAME_BYTES),
            poisoned: None,
        }
    }

    /// Append freshly-read bytes to the internal buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next whole frame, if one is buffered. Call in a loop after
    /// every `feed()` until it returns `Ok(None)`.
    pub fn next_frame(&mut self) -> Result<Option<RawFrame>, DaemonError> {
        if let Some(err) = &self.poisoned {
            return Err(err.clone());
        }

        if self.buf.len() < LENGTH_PREFIX_BYTES {
            return Ok(None);
        }

        let length = u32::from_be_bytes(self.buf[..LENGTH_PREFIX_BYTES].try_into().unwrap());

        if length as usize > self.max_frame_bytes as usize || (length as usize) < TYPE_BYTES {
            let err = DaemonError::CorruptFrame(format!(
                "frame length {length} outside [{TYPE_BYTES}, {}]",
                self.max_frame_bytes
            ));
            self.poisoned = Some(err.clone());
            return Err(err);
        }

        let total = LENGTH_PREFIX_BYTES + length as usize;
        if self.buf.len() < total {
            // Partial frame: wait for more bytes. Reserve so a large
            // `STREAM_CHUNK` doesn't cause repeated small reallocations.
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(LENGTH_PREFIX_BYTES);
        let msg_type = self.buf[0];
        self.buf.advance(TYPE_BYTES);
        let body = self.buf.split_to(length as usize - TYPE_BYTES);

        Ok(Some(RawFrame { msg_type, body }))
    }
}

/// Encode a frame ready to write to the socket. `body` is the msgpack bytes
/// for the message, already serialised by `message.rs`.
pub fn encode_frame(msg_type: u8, body: &[u8]) -> Result<BytesMut, DaemonError> {
    let length = TYPE_BYTES + body.len();
    if length > ABSOLUTE_MAX_FRAME_BYTES as usize {
        return Err(DaemonError::CorruptFrame(format!(
            "outgoing frame of {length} bytes exceeds the absolute ceiling"
        )));
    }
    let mut out = BytesMut::with_capacity(LENGTH_PREFIX_BYTES + length);
    out.extend_from_slice(&(length as u32).to_be_bytes());
    out.extend_from_slice(&[msg_type]);
    out.extend_from_slice(body);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_bytes(msg_type: u8, body: &[u8]) -> BytesMut {
        encode_frame(msg_type, body).unwrap()
    }

    #[test]
    fn parses_a_single_whole_frame() {
        let mut codec = FrameCodec::new(1024);
        codec.feed(&frame_bytes(7, b"hello"));
        let frame = codec.next_frame().unwrap().unwrap();
        assert_eq!(frame.msg_type, 7);
        assert_eq!(&frame.body[..], b"hello");
        assert!(codec.next_frame().unwrap().is_none());
    }

    #[test]
    fn frame_completeness_under_arbitrary_byte_splits() {
        // §8 "Frame completeness": any partitioning of a valid frame stream
        // yields the same ordered sequence of messages as one big push.
        let mut whole = BytesMut::new();
        let msgs: Vec<(u8, &[u8])> = vec![(1, b"a"), (2, b"bbbb"), (3, b"")];
        for (t, b) in &msgs {
            whole.extend_from_slice(&frame_bytes(*t, b));
        }

        for split in [1usize, 2, 3, 5, 7, 64] {
            let mut codec = FrameCodec::new(4096);
            let mut remaining = &whole[..];
            let mut out = Vec::new();
            while !remaining.is_empty() {
                let take = split.min(remaining.len());
                codec.feed(&remaining[..take]);
                remaining = &remaining[take..];
                while let Some(f) = codec.next_frame().unwrap() {
                    out.push((f.msg_type, f.body.to_vec()));
                }
            }
            let expected: Vec<(u8, Vec<u8>)> =
                msgs.iter().map(|(t, b)| (*t, b.to_vec())).collect();
            assert_eq!(out, expected, "split size {split} diverged");
        }
    }

    #[test]
    fn oversized_length_is_terminal_corruption() {
        let mut codec = FrameCodec::new(16);
        let mut bytes = BytesMut::new();
        bytes.extend_from_slice(&1000u32.to_be_bytes());
        bytes.extend_from_slice(&[0u8; 4]);
        codec.feed(&bytes);
        assert!(matches!(
            codec.next_frame(),
            Err(DaemonError::CorruptFrame(_))
        ));
        // Poisoned: keeps re-raising rather than trying to resync.
        assert!(matches!(
            codec.next_frame(),
            Err(DaemonError::CorruptFrame(_))
        ));
    }

    #[test]
    fn partial_header_waits_for_more_bytes() {
        let mut codec = FrameCodec::new(1024);
        codec.feed(&[0, 0]);
        assert!(codec.next_frame().unwrap().is_none());
        codec.feed(&[0, 6, 9, b'h', b'i']);
        let frame = codec.next_frame().unwrap().unwrap();
        assert_eq!(frame.msg_type, 9);
        assert_eq!(&frame.body[..], b"hi");
    }
}
