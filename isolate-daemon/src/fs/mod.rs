//! Virtual FS surface (C9).

pub mod handle_registry;
pub mod session_handler;
pub mod writable;

pub use handle_registry::{
    DirEntry, FileMetadata, FileSystemHandler, FsError, HandleId, HandleKind, HandleRegistry, MountId,
};
pub use session_handler::SessionFileSystemHandler;
pub use writable::{WritableFileStream, WriteParams};
