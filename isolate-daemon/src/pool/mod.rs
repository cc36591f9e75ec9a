//! Namespace pool (C10).
//!
//! Only namespace-bound instances are pooled: a create-runtime request
//! with no `namespaceId` gets a plain isolate that is fully disposed the
//! moment its session releases it. One that does carry a `namespaceId`
//! survives its owner disconnecting — soft-deleted, then re-hydrated by
//! whichever client shows up next with the same id.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::{DaemonError, DaemonResult};
use crate::isolate::IsolateHost;
use crate::proto::IsolateId;

pub struct CreateOutcome {
    pub isolate_id: IsolateId,
    pub reused: bool,
}

struct Entry {
    isolate: IsolateHost,
    namespace_id: Option<String>,
    owner_session: Option<Uuid>,
    last_used: Instant,
}

/// Owns every live isolate the daemon has created. `max_isolates` bounds
/// the *live* set (bound + soft-deleted-but-cached); past that, the
/// oldest soft-deleted entry is evicted for real to make room.
pub struct IsolatePool {
    max_isolates: usize,
    entries: Mutex<HashMap<IsolateId, Entry>>,
    by_namespace: Mutex<HashMap<String, IsolateId>>,
}

impl IsolatePool {
    pub fn new(max_isolates: usize) -> Self {
        Self {
            max_isolates,
            entries: Mutex::new(HashMap::new()),
            by_namespace: Mutex::new(HashMap::new()),
        }
    }

    /// `namespaceId` absent: always a fresh isolate, never pooled once
    /// released. `namespaceId` present and previously soft-deleted: rebind
    /// to `session`, `reused=true`. `namespaceId` present and still owned
    /// by a live session: `NamespaceBusy`.
    #[instrument(skip(self, spawn))]
    pub async fn create_runtime(
        &self,
        namespace_id: Option<String>,
        session: Uuid,
        spawn: impl FnOnce() -> IsolateHost,
    ) -> DaemonResult<CreateOutcome> {
        if let Some(ns) = &namespace_id {
            let existing_id = self.by_namespace.lock().get(ns).copied();
            if let Some(id) = existing_id {
                let mut entries = self.entries.lock();
                let entry = entries.get_mut(&id).expect("namespace index points at a live entry");
                if let Some(owner) = entry.owner_session {
                    if owner == session {
                        // Idempotent re-bind: same session asking again for
                        // the namespace it already holds is a no-op.
                        return Ok(CreateOutcome { isolate_id: id, reused: true });
                    }
                    return Err(DaemonError::NamespaceBusy(ns.clone()));
                }
                entry.owner_session = Some(session);
                entry.last_used = Instant::now();
                info!(namespace = %ns, isolate_id = id, "namespace re-hydrated");
                return Ok(CreateOutcome { isolate_id: id, reused: true });
            }
        }

        self.make_room_for_one()?;

        let isolate = spawn();
        let isolate_id = isolate.id;
        self.entries.lock().insert(
            isolate_id,
            Entry {
                isolate,
                namespace_id: namespace_id.clone(),
                owner_session: Some(session),
                last_used: Instant::now(),
            },
        );
        if let Some(ns) = namespace_id {
            self.by_namespace.lock().insert(ns, isolate_id);
        }
        Ok(CreateOutcome { isolate_id, reused: false })
    }

    /// Evicts the oldest soft-deleted (idle, namespace-bound) entry if
    /// the pool is at capacity. Returns `IsolateLimit` if every slot is
    /// occupied by a live, actively-owned isolate.
    fn make_room_for_one(&self) -> DaemonResult<()> {
        let mut entries = self.entries.lock();
        if entries.len() < self.max_isolates {
            return Ok(());
        }
        let victim = entries
            .iter()
            .filter(|(_, e)| e.owner_session.is_none())
            .min_by_key(|(_, e)| e.last_used)
            .map(|(id, _)| *id);

        match victim {
            Some(id) => {
                let entry = entries.remove(&id).expect("victim id came from this map");
                if let Some(ns) = &entry.namespace_id {
                    self.by_namespace.lock().remove(ns);
                }
                drop(entries);
                info!(isolate_id = id, "evicting idle isolate to make room");
                // Disposal itself is async (crosses to the isolate's OS
                // thread); fire-and-forget since nothing awaits eviction.
                tokio::spawn(async move { entry.isolate.dispose().await });
                Ok(())
            }
            None => Err(DaemonError::IsolateLimit),
        }
    }

    /// `dispose(isolateId)` (owner releasing it, or the session closing).
    /// Namespace-bound instances are soft-deleted and kept warm; bare
    /// instances are fully torn down.
    pub async fn dispose(&self, isolate_id: IsolateId) {
        let (is_namespaced, isolate) = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&isolate_id) {
                Some(entry) if entry.namespace_id.is_some() => {
                    entry.owner_session = None;
                    entry.last_used = Instant::now();
                    (true, None)
                }
                Some(_) => {
                    let entry = entries.remove(&isolate_id).unwrap();
                    (false, Some(entry.isolate))
                }
                None => return,
            }
        };

        if is_namespaced {
            if let Some(entry) = self.entries.lock().get(&isolate_id) {
                entry.isolate.soft_delete().await;
            }
        } else if let Some(isolate) = isolate {
            isolate.dispose().await;
        }
    }

    pub fn owner(&self, isolate_id: IsolateId) -> Option<Uuid> {
        self.entries.lock().get(&isolate_id).and_then(|e| e.owner_session)
    }

    pub fn isolate_handle(&self, isolate_id: IsolateId) -> Option<IsolateHost> {
        self.entries.lock().get(&isolate_id).map(|e| e.isolate.clone())
    }

    /// Read-only snapshot for the health/introspection surface:
    /// `(isolateId, namespaceId, isIdle)` per live entry.
    pub fn snapshot(&self) -> Vec<(IsolateId, Option<String>, bool)> {
        self.entries
            .lock()
            .iter()
            .map(|(id, e)| (*id, e.namespace_id.clone(), e.owner_session.is_none()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeKernel;
    use crate::error::DaemonResult as Res;
    use crate::isolate::{IdentityTransformer, IsolateDeps, ModuleLoaderClient, TracingConsoleSink};
    use std::sync::Arc;

    struct NoopLoader;
    impl ModuleLoaderClient for NoopLoader {
        fn load(&self, _specifier: &str, _importer_resolve_dir: &str) -> Res<crate::isolate::module_loader::LoadedSource> {
            Err(DaemonError::ProtocolError("no loader in test".into()))
        }
    }

    fn spawn_fn() -> IsolateHost {
        IsolateHost::spawn(
            crate::isolate::next_isolate_id(),
            64,
            Arc::new(NoopLoader),
            Arc::new(IdentityTransformer),
            IsolateDeps {
                runtime_handle: tokio::runtime::Handle::current(),
                console: Arc::new(TracingConsoleSink),
                fetch_client: None,
                fs_handler: None,
                bridge: Arc::new(BridgeKernel::new()),
            },
        )
    }

    #[tokio::test]
    async fn namespace_is_busy_while_its_owner_is_still_bound() {
        let pool = IsolatePool::new(8);
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();
        let outcome = pool
            .create_runtime(Some("ns-a".to_string()), s1, spawn_fn)
            .await
            .unwrap();
        assert!(!outcome.reused);

        let err = pool
            .create_runtime(Some("ns-a".to_string()), s2, spawn_fn)
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::NamespaceBusy(ns) if ns == "ns-a"));
    }

    #[tokio::test]
    async fn same_session_rebind_is_idempotent_not_busy() {
        let pool = IsolatePool::new(8);
        let s1 = Uuid::new_v4();
        let first = pool
            .create_runtime(Some("ns-c".to_string()), s1, spawn_fn)
            .await
            .unwrap();
        assert!(!first.reused);

        // Same session asking again for the namespace it already owns:
        // idempotent no-op, not NamespaceBusy.
        let second = pool
            .create_runtime(Some("ns-c".to_string()), s1, spawn_fn)
            .await
            .unwrap();
        assert!(second.reused);
        assert_eq!(second.isolate_id, first.isolate_id);
        assert_eq!(pool.owner(first.isolate_id), Some(s1));
    }

    #[tokio::test]
    async fn disposing_a_namespaced_isolate_allows_rehydration() {
        let pool = IsolatePool::new(8);
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();
        let first = pool
            .create_runtime(Some("ns-b".to_string()), s1, spawn_fn)
            .await
            .unwrap();

        pool.dispose(first.isolate_id).await;

        let second = pool
            .create_runtime(Some("ns-b".to_string()), s2, spawn_fn)
            .await
            .unwrap();
        assert!(second.reused);
        assert_eq!(second.isolate_id, first.isolate_id);
        assert_eq!(pool.owner(first.isolate_id), Some(s2));
    }

    #[tokio::test]
    async fn non_namespaced_isolates_are_fully_removed_on_dispose() {
        let pool = IsolatePool::new(8);
        let outcome = pool.create_runtime(None, Uuid::new_v4(), spawn_fn).await.unwrap();
        assert_eq!(pool.len(), 1);
        pool.dispose(outcome.isolate_id).await;
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn at_capacity_with_no_idle_entries_reports_isolate_limit() {
        let pool = IsolatePool::new(1);
        let _first = pool.create_runtime(None, Uuid::new_v4(), spawn_fn).await.unwrap();
        let err = pool.create_runtime(None, Uuid::new_v4(), spawn_fn).await.unwrap_err();
        assert!(matches!(err, DaemonError::IsolateLimit));
    }

    #[tokio::test]
    async fn idle_namespaced_entries_are_evicted_lru_first_at_capacity() {
        let pool = IsolatePool::new(1);
        let owner = Uuid::new_v4();
        let first = pool
            .create_runtime(Some("ns-lru".to_string()), owner, spawn_fn)
            .await
            .unwrap();
        pool.dispose(first.isolate_id).await;

        // Pool is at capacity but the only entry is idle (soft-deleted):
        // creating a fresh, differently-namespaced isolate should evict it.
        let second = pool
            .create_runtime(Some("ns-other".to_string()), Uuid::new_v4(), spawn_fn)
            .await
            .unwrap();
        assert!(!second.reused);
        assert_eq!(pool.len(), 1);
    }
}
