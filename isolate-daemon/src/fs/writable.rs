//! `FileSystemWritableFileStream` semantics (§4.9).
//!
//! Deliberately not buffered end-to-end: every `write(chunk)` call turns
//! into exactly one `writeFile` call on the underlying handler at the
//! stream's current position, which then advances by the chunk length.
//! This is what makes the streamed-upload test property in §8 checkable
//! at the handler level ("exactly 16 `writeFile` calls, each 65536
//! bytes, in order") — the stream never coalesces or reorders.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::DomExceptionKind;
use crate::fs::handle_registry::{FileSystemHandler, FsError};

#[derive(Debug, Clone)]
pub enum WriteParams {
    Chunk(Vec<u8>),
    Seek { position: u64 },
    Truncate { size: u64 },
}

struct State {
    position: u64,
    closed: bool,
}

pub struct WritableFileStream {
    handler: Arc<dyn FileSystemHandler>,
    path: String,
    state: Mutex<State>,
}

impl WritableFileStream {
    pub fn new(handler: Arc<dyn FileSystemHandler>, path: String) -> Self {
        Self {
            handler,
            path,
            state: Mutex::new(State { position: 0, closed: false }),
        }
    }

    fn ensure_open(&self) -> Result<(), FsError> {
        if self.state.lock().closed {
            return Err((
                DomExceptionKind::InvalidStateError,
                "stream is closed".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn write(&self, params: WriteParams) -> Result<(), FsError> {
        self.ensure_open()?;
        match params {
            WriteParams::Chunk(bytes) => {
                let position = self.state.lock().position;
                self.handler.write_file(&self.path, &bytes, Some(position)).await?;
                self.state.lock().position = position + bytes.len() as u64;
                Ok(())
            }
            WriteParams::Seek { position } => {
                self.state.lock().position = position;
                Ok(())
            }
            WriteParams::Truncate { size } => {
                self.handler.truncate_file(&self.path, size).await?;
                let mut state = self.state.lock();
                if state.position > size {
                    state.position = size;
                }
                Ok(())
            }
        }
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
    }

    /// Discards future writes the same way `close()` does; the guest
    /// distinguishes the two only by which promise (`close()`'s vs.
    /// `abort()`'s) resolved.
    pub fn abort(&self, _reason: Option<String>) {
        self.state.lock().closed = true;
    }

    pub fn position(&self) -> u64 {
        self.state.lock().position
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::handle_registry::{DirEntry, FileMetadata};
    use async_trait::async_trait;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct RecordingHandler {
        calls: AsyncMutex<Vec<(u64, usize)>>,
        truncations: AsyncMutex<Vec<u64>>,
    }

    #[async_trait]
    impl FileSystemHandler for RecordingHandler {
        async fn get_file_handle(&self, _path: &str, _create: bool) -> Result<(), FsError> {
            Ok(())
        }
        async fn get_directory_handle(&self, _path: &str, _create: bool) -> Result<(), FsError> {
            Ok(())
        }
        async fn remove_entry(&self, _path: &str, _recursive: bool) -> Result<(), FsError> {
            Ok(())
        }
        async fn read_directory(&self, _path: &str) -> Result<Vec<DirEntry>, FsError> {
            Ok(vec![])
        }
        async fn read_file(&self, _path: &str) -> Result<Vec<u8>, FsError> {
            Ok(vec![])
        }
        async fn write_file(&self, _path: &str, bytes: &[u8], position: Option<u64>) -> Result<(), FsError> {
            self.calls.lock().await.push((position.unwrap_or(0), bytes.len()));
            Ok(())
        }
        async fn truncate_file(&self, _path: &str, size: u64) -> Result<(), FsError> {
            self.truncations.lock().await.push(size);
            Ok(())
        }
        async fn get_file_metadata(&self, _path: &str) -> Result<FileMetadata, FsError> {
            Ok(FileMetadata { size: 0, last_modified_ms: 0 })
        }
    }

    #[tokio::test]
    async fn sixteen_64kib_chunks_produce_sixteen_ordered_writes() {
        let handler = Arc::new(RecordingHandler::default());
        let stream = WritableFileStream::new(handler.clone(), "/large.bin".to_string());

        let chunk = vec![0u8; 65536];
        for _ in 0..16 {
            stream.write(WriteParams::Chunk(chunk.clone())).await.unwrap();
        }

        let calls = handler.calls.lock().await;
        assert_eq!(calls.len(), 16);
        for (i, (position, len)) in calls.iter().enumerate() {
            assert_eq!(*position, (i as u64) * 65536);
            assert_eq!(*len, 65536);
        }
        assert_eq!(stream.position(), 16 * 65536);
    }

    #[tokio::test]
    async fn seek_moves_position_without_writing() {
        let handler = Arc::new(RecordingHandler::default());
        let stream = WritableFileStream::new(handler.clone(), "/f.bin".to_string());
        stream.write(WriteParams::Seek { position: 100 }).await.unwrap();
        assert_eq!(stream.position(), 100);
        assert!(handler.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn truncate_clips_position_only_when_smaller() {
        let handler = Arc::new(RecordingHandler::default());
        let stream = WritableFileStream::new(handler.clone(), "/f.bin".to_string());
        stream.write(WriteParams::Seek { position: 500 }).await.unwrap();
        stream.write(WriteParams::Truncate { size: 100 }).await.unwrap();
        assert_eq!(stream.position(), 100);
        assert_eq!(*handler.truncations.lock().await, vec![100]);

        stream.write(WriteParams::Seek { position: 10 }).await.unwrap();
        stream.write(WriteParams::Truncate { size: 100 }).await.unwrap();
        assert_eq!(stream.position(), 10);
    }

    #[tokio::test]
    async fn operations_after_close_fail_with_invalid_state() {
        let handler = Arc::new(RecordingHandler::default());
        let stream = WritableFileStream::new(handler, "/f.bin".to_string());
        stream.close();
        let err = stream.write(WriteParams::Chunk(vec![1])).await.unwrap_err();
        assert_eq!(err.0, DomExceptionKind::InvalidStateError);
    }

    #[tokio::test]
    async fn abort_also_discards_future_writes() {
        let handler = Arc::new(RecordingHandler::default());
        let stream = WritableFileStream::new(handler, "/f.bin".to_string());
        stream.abort(Some("cancelled".to_string()));
        assert!(stream.is_closed());
        assert!(stream.write(WriteParams::Chunk(vec![1])).await.is_err());
    }
}
