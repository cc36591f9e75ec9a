//! Daemon configuration (CLI flags via `clap`, the teacher's own choice
//! for every one of its binaries).

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "isolate-daemon", about = "Sandboxed JS isolate runtime daemon")]
pub struct Config {
    /// Address to accept IPC connections on: a `host:port` pair for TCP,
    /// or a filesystem path for a Unix domain socket (preferred — see
    /// `daemon::ListenAddr::parse`).
    #[arg(long, default_value = "/tmp/isolate-daemon.sock")]
    pub listen: String,

    /// Per-isolate V8 heap ceiling, in megabytes.
    #[arg(long, default_value_t = 256)]
    pub isolate_memory_mb: u32,

    /// Maximum number of live isolates (bound + soft-deleted) the
    /// namespace pool will hold before evicting the oldest idle one.
    #[arg(long, default_value_t = 64)]
    pub max_isolates: usize,

    /// Hard ceiling on a single frame's body length.
    #[arg(long, default_value_t = crate::proto::DEFAULT_MAX_FRAME_BYTES)]
    pub max_frame_bytes: u32,

    /// Chunk size used when splitting a credited stream push.
    #[arg(long, default_value_t = crate::proto::STREAM_CHUNK_SIZE)]
    pub stream_chunk_size: usize,

    /// Initial credit granted to a stream sender before its first
    /// `STREAM_PULL`.
    #[arg(long, default_value_t = crate::proto::STREAM_DEFAULT_CREDIT)]
    pub stream_credit: u32,

    /// Default timeout, in milliseconds, applied to `send_request`/
    /// `invoke_client_callback` calls that don't specify their own
    /// deadline. `0` disables the default (waits forever).
    #[arg(long, default_value_t = 30_000)]
    pub default_timeout_ms: u64,

    /// `tracing-subscriber` filter directive, e.g. `info` or
    /// `isolate_daemon=debug,tower=warn`.
    #[arg(long, default_value = "info")]
    pub log_filter: String,
}

impl Config {
    pub fn default_timeout(&self) -> Option<std::time::Duration> {
        if self.default_timeout_ms == 0 {
            None
        } else {
            Some(std::time::Duration::from_millis(self.default_timeout_ms))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_program_name_alone() {
        let cfg = Config::parse_from(["isolate-daemon"]);
        assert_eq!(cfg.listen, "/tmp/isolate-daemon.sock");
        assert_eq!(cfg.isolate_memory_mb, 256);
        assert!(cfg.default_timeout().is_some());
    }

    #[test]
    fn zero_timeout_disables_the_default_deadline() {
        let cfg = Config::parse_from(["isolate-daemon", "--default-timeout-ms", "0"]);
        assert!(cfg.default_timeout().is_none());
    }
}
