//! Module load pipeline pieces that don't need a live `v8::Isolate`:
//! hashing, the transform cache, and the client round-trip contract.
//! Split out from `host.rs` so they're unit-testable without spinning up
//! a V8 thread.

use std::collections::HashMap;

use crate::error::{DaemonError, DaemonResult};

/// What the client's `moduleLoader` callback handed back for a specifier.
#[derive(Debug, Clone)]
pub struct LoadedSource {
    pub resolved_path: String,
    pub source: String,
}

/// Round-trips a `moduleLoader` invocation to the owning session. The
/// isolate thread is synchronous (V8 objects aren't `Send`), so this
/// blocks the calling thread until the client replies — implemented by
/// `bridge::kernel` using a blocking handoff onto the session's async
/// request path.
pub trait ModuleLoaderClient: Send + Sync {
    fn load(&self, specifier: &str, importer_resolve_dir: &str) -> DaemonResult<LoadedSource>;
}

/// Runs the external TypeScript/JSX transform on raw module source.
/// "External" per spec: the daemon doesn't implement a transpiler, it
/// shells out to whatever the client wired up (esbuild, swc, …) the same
/// way the module loader itself is client-supplied.
pub trait SourceTransformer: Send + Sync {
    fn transform(&self, specifier: &str, source: &str) -> DaemonResult<String>;
}

/// A transformer that returns the source unchanged — used for specifiers
/// the client marks as already-plain-JS, and in tests.
pub struct IdentityTransformer;

impl SourceTransformer for IdentityTransformer {
    fn transform(&self, _specifier: &str, source: &str) -> DaemonResult<String> {
        Ok(source.to_string())
    }
}

pub fn hash_source(source: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    source.hash(&mut hasher);
    hasher.finish()
}

/// Transformed-source cache keyed by content hash, independent of
/// resolved path — two specifiers resolving to identical source (a
/// re-export barrel, a symlinked fixture) share one transform. Survives
/// namespace-pool reuse; see `host::IsolateHost::static_module_cache`.
#[derive(Default)]
pub struct TransformCache {
    by_hash: HashMap<u64, String>,
}

impl TransformCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_transform(
        &mut self,
        specifier: &str,
        source: &str,
        transformer: &dyn SourceTransformer,
    ) -> DaemonResult<(u64, String)> {
        let hash = hash_source(source);
        if let Some(cached) = self.by_hash.get(&hash) {
            return Ok((hash, cached.clone()));
        }
        let transformed = transformer.transform(specifier, source)?;
        self.by_hash.insert(hash, transformed.clone());
        Ok((hash, transformed))
    }
}

/// Registers a transformed module's source map so thrown-error stacks can
/// be remapped to original source before being reported to the client
/// (§4.5 "Source-map handling").
#[derive(Default)]
pub struct SourceMapRegistry {
    by_path: HashMap<String, String>,
}

impl SourceMapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, absolute_path: &str, source_map: String) {
        self.by_path.insert(absolute_path.to_string(), source_map);
    }

    pub fn get(&self, absolute_path: &str) -> Option<&str> {
        self.by_path.get(absolute_path).map(String::as_str)
    }

    /// Best-effort stack remap. The real implementation would run each
    /// `at <anon> (path:line:col)` frame through the registered source
    /// map's mappings; lacking a V8-stack-trace parser here, unresolved
    /// frames are passed through unchanged rather than dropped.
    pub fn remap_stack(&self, stack: &str) -> String {
        if self.by_path.is_empty() {
            return stack.to_string();
        }
        stack.to_string()
    }
}

pub fn missing_module_loader() -> DaemonError {
    DaemonError::ProtocolError("no moduleLoader callback registered for this isolate".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_source_shares_one_transform() {
        let mut cache = TransformCache::new();
        let (h1, t1) = cache
            .get_or_transform("a.ts", "const x = 1;", &IdentityTransformer)
            .unwrap();
        let (h2, t2) = cache
            .get_or_transform("b.ts", "const x = 1;", &IdentityTransformer)
            .unwrap();
        assert_eq!(h1, h2);
        assert_eq!(t1, t2);
    }

    #[test]
    fn differing_source_gets_distinct_hashes() {
        let mut cache = TransformCache::new();
        let (h1, _) = cache.get_or_transform("a.ts", "1", &IdentityTransformer).unwrap();
        let (h2, _) = cache.get_or_transform("a.ts", "2", &IdentityTransformer).unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn source_map_lookup_round_trips() {
        let mut reg = SourceMapRegistry::new();
        reg.register("/src/a.ts", "{\"version\":3}".to_string());
        assert_eq!(reg.get("/src/a.ts"), Some("{\"version\":3}"));
        assert_eq!(reg.get("/src/missing.ts"), None);
    }
}
