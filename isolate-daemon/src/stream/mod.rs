//! Credit-based stream multiplexer (C4).

pub mod multiplexer;
pub mod session_sink;

pub use multiplexer::{
    StreamFlavor, StreamIdAllocator, StreamReceiver, StreamReceiverHandle, StreamSender, StreamSink,
};
pub use session_sink::SessionStreamSink;
