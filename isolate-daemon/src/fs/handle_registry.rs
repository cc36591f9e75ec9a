//! Virtual FS handle registry (C9).
//!
//! `getDirectory(path)` asks the host for a `FileSystemHandler` rooted at
//! `path`; every subsequent operation (`getFileHandle`, `readDirectory`,
//! …) goes through that one handler. The registry's job is purely
//! bookkeeping: mint a stable instance id for every handle the guest
//! holds a reference to, keyed by `(mount, path)` so re-requesting the
//! same path returns the same id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::DomExceptionKind;

pub type HandleId = u64;
pub type MountId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    File,
    Directory,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub kind: HandleKind,
}

#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub size: u64,
    pub last_modified_ms: i64,
}

/// A DOMException-shaped failure, kept structured everywhere except the
/// guest-polyfill serialisation boundary (`DomExceptionKind::encode`).
pub type FsError = (DomExceptionKind, String);

/// One mounted root, supplied by the client (the actual disk/virtual
/// backing is out of scope here — this is the seam, not an
/// implementation of any particular backing store).
#[async_trait]
pub trait FileSystemHandler: Send + Sync {
    async fn get_file_handle(&self, path: &str, create: bool) -> Result<(), FsError>;
    async fn get_directory_handle(&self, path: &str, create: bool) -> Result<(), FsError>;
    async fn remove_entry(&self, path: &str, recursive: bool) -> Result<(), FsError>;
    async fn read_directory(&self, path: &str) -> Result<Vec<DirEntry>, FsError>;
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, FsError>;
    async fn write_file(&self, path: &str, bytes: &[u8], position: Option<u64>) -> Result<(), FsError>;
    async fn truncate_file(&self, path: &str, size: u64) -> Result<(), FsError>;
    async fn get_file_metadata(&self, path: &str) -> Result<FileMetadata, FsError>;
}

struct HandleEntry {
    mount: MountId,
    path: String,
    kind: HandleKind,
}

/// Tracks every handle instance a guest is holding, and every mounted
/// `FileSystemHandler` it was minted from.
#[derive(Default)]
pub struct HandleRegistry {
    next_mount: AtomicU64,
    next_handle: AtomicU64,
    mounts: DashMap<MountId, Arc<dyn FileSystemHandler>>,
    handles: DashMap<HandleId, HandleEntry>,
    /// `(mount, path, kind)` → existing handle id, so re-requesting the
    /// same path returns the same instance rather than minting a fresh one.
    by_path: DashMap<(MountId, String, HandleKind), HandleId>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mount(&self, handler: Arc<dyn FileSystemHandler>) -> MountId {
        let id = self.next_mount.fetch_add(1, Ordering::Relaxed);
        self.mounts.insert(id, handler);
        id
    }

    pub fn handler(&self, mount: MountId) -> Option<Arc<dyn FileSystemHandler>> {
        self.mounts.get(&mount).map(|e| e.clone())
    }

    /// Register (or reuse) a handle id for `(mount, path)` of `kind`.
    pub fn handle_for(&self, mount: MountId, path: &str, kind: HandleKind) -> HandleId {
        let key = (mount, path.to_string(), kind);
        if let Some(existing) = self.by_path.get(&key) {
            return *existing;
        }
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(
            id,
            HandleEntry {
                mount,
                path: path.to_string(),
                kind,
            },
        );
        self.by_path.insert(key, id);
        id
    }

    pub fn resolve(&self, id: HandleId) -> Option<(MountId, String, HandleKind)> {
        self.handles.get(&id).map(|e| (e.mount, e.path.clone(), e.kind))
    }

    /// Every listed entry gets its own fresh instance id (§4.9 "Directory
    /// listing... each listed entry is registered as a new handle") even
    /// when an earlier `getFileHandle` already registered one for that
    /// path — listings are iterators of typed handles, not a cache lookup.
    pub fn register_listing(&self, mount: MountId, dir_path: &str, entries: &[DirEntry]) -> Vec<(HandleId, DirEntry)> {
        entries
            .iter()
            .map(|entry| {
                let full_path = join_path(dir_path, &entry.name);
                let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
                self.handles.insert(
                    id,
                    HandleEntry {
                        mount,
                        path: full_path,
                        kind: entry.kind,
                    },
                );
                (id, entry.clone())
            })
            .collect()
    }

    pub fn forget(&self, id: HandleId) {
        if let Some((_, entry)) = self.handles.remove(&id) {
            self.by_path.remove(&(entry.mount, entry.path, entry.kind));
        }
    }
}

fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() || dir == "/" {
        format!("/{name}")
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct FakeHandler {
        files: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl FileSystemHandler for FakeHandler {
        async fn get_file_handle(&self, path: &str, create: bool) -> Result<(), FsError> {
            let mut files = self.files.lock().await;
            if !files.contains_key(path) {
                if create {
                    files.insert(path.to_string(), Vec::new());
                } else {
                    return Err((DomExceptionKind::NotFoundError, path.to_string()));
                }
            }
            Ok(())
        }
        async fn get_directory_handle(&self, _path: &str, _create: bool) -> Result<(), FsError> {
            Ok(())
        }
        async fn remove_entry(&self, path: &str, _recursive: bool) -> Result<(), FsError> {
            self.files.lock().await.remove(path);
            Ok(())
        }
        async fn read_directory(&self, _path: &str) -> Result<Vec<DirEntry>, FsError> {
            Ok(vec![])
        }
        async fn read_file(&self, path: &str) -> Result<Vec<u8>, FsError> {
            self.files
                .lock()
                .await
                .get(path)
                .cloned()
                .ok_or_else(|| (DomExceptionKind::NotFoundError, path.to_string()))
        }
        async fn write_file(&self, path: &str, bytes: &[u8], position: Option<u64>) -> Result<(), FsError> {
            let mut files = self.files.lock().await;
            let buf = files.entry(path.to_string()).or_default();
            let pos = position.unwrap_or(0) as usize;
            if buf.len() < pos + bytes.len() {
                buf.resize(pos + bytes.len(), 0);
            }
            buf[pos..pos + bytes.len()].copy_from_slice(bytes);
            Ok(())
        }
        async fn truncate_file(&self, path: &str, size: u64) -> Result<(), FsError> {
            self.files
                .lock()
                .await
                .entry(path.to_string())
                .or_default()
                .resize(size as usize, 0);
            Ok(())
        }
        async fn get_file_metadata(&self, path: &str) -> Result<FileMetadata, FsError> {
            let files = self.files.lock().await;
            let buf = files.get(path).ok_or_else(|| (DomExceptionKind::NotFoundError, path.to_string()))?;
            Ok(FileMetadata {
                size: buf.len() as u64,
                last_modified_ms: 0,
            })
        }
    }

    #[tokio::test]
    async fn repeated_get_file_handle_returns_the_same_id() {
        let registry = HandleRegistry::new();
        let mount = registry.mount(Arc::new(FakeHandler::default()));
        let a = registry.handle_for(mount, "/a.txt", HandleKind::File);
        let b = registry.handle_for(mount, "/a.txt", HandleKind::File);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn distinct_paths_get_distinct_ids() {
        let registry = HandleRegistry::new();
        let mount = registry.mount(Arc::new(FakeHandler::default()));
        let a = registry.handle_for(mount, "/a.txt", HandleKind::File);
        let b = registry.handle_for(mount, "/b.txt", HandleKind::File);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn directory_listing_mints_fresh_ids_even_for_known_paths() {
        let registry = HandleRegistry::new();
        let mount = registry.mount(Arc::new(FakeHandler::default()));
        let existing = registry.handle_for(mount, "/dir/a.txt", HandleKind::File);
        let listed = registry.register_listing(
            mount,
            "/dir",
            &[DirEntry {
                name: "a.txt".to_string(),
                kind: HandleKind::File,
            }],
        );
        assert_eq!(listed.len(), 1);
        assert_ne!(listed[0].0, existing);
    }

    #[tokio::test]
    async fn missing_file_reports_not_found() {
        let handler = FakeHandler::default();
        let err = handler.get_file_handle("/missing.txt", false).await.unwrap_err();
        assert_eq!(err.0, DomExceptionKind::NotFoundError);
    }
}
