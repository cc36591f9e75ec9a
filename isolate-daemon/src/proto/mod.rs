//! Wire protocol: frame codec (C1), message catalogue (§3/§6), and the
//! cross-boundary value marshaller (C2).

pub mod frame;
pub mod message;
pub mod value;

pub use frame::{FrameCodec, RawFrame};
pub use message::{CallbackId, IsolateId, MessageType, RequestId, StreamId, WireMessage, PROTOCOL_VERSION};
pub use value::Value;

/// Bodies with a known content-length at or under this many bytes travel
/// inline inside their carrying frame instead of opening a stream (§4.4
/// "Thresholding"). Configurable via `--stream-chunk-size`/CLI but this is
/// the spec-given default.
pub const STREAM_THRESHOLD: usize = 64 * 1024;

/// Default per-stream credit granted before the first `STREAM_PULL` (§4.4).
pub const STREAM_DEFAULT_CREDIT: u32 = 256 * 1024;

/// Chunks are split at this size when pushed under credit (§4.4).
pub const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Soft default for the frame codec; overridable by `--max-frame-bytes`.
pub const DEFAULT_MAX_FRAME_BYTES: u32 = 8 * 1024 * 1024;
