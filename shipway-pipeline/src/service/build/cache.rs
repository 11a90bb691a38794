//! Build cache
//!
//! Three namespaces of cached build inputs, each keyed by the fingerprint of
//! the content that produced them. The cache is advisory: a lookup that
//! points at something no longer usable is invalidated by the backend and
//! the build proceeds from scratch.

use chrono::{DateTime, Utc};
use shipway_core::domain::artifact::Fingerprint;
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheNamespace {
    /// Unpacked source trees
    Source,
    /// Image layers reused by `podman build --layers`
    DockerLayer,
    /// Directories the build command chooses to keep (dependency caches)
    Custom,
}

impl CacheNamespace {
    pub const ALL: [CacheNamespace; 3] = [
        CacheNamespace::Source,
        CacheNamespace::DockerLayer,
        CacheNamespace::Custom,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            CacheNamespace::Source => "source",
            CacheNamespace::DockerLayer => "layers",
            CacheNamespace::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub location: PathBuf,
    pub last_used: DateTime<Utc>,
    pub hits: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Cache state shared by every build of one executor
///
/// Not synchronized itself; the build executor hands out `&mut` access
/// under its build lock.
#[derive(Debug)]
pub struct BuildCache {
    root: PathBuf,
    entries: HashMap<(CacheNamespace, Fingerprint), CacheEntry>,
    stats: CacheStats,
}

impl BuildCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: HashMap::new(),
            stats: CacheStats::default(),
        }
    }

    /// Directory holding a namespace's entries
    pub fn namespace_dir(&self, namespace: CacheNamespace) -> PathBuf {
        self.root.join(namespace.dir_name())
    }

    /// Throwaway working tree of one build
    pub fn scratch_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join("scratch").join(run_id.simple().to_string())
    }

    /// Location for a new entry
    pub fn entry_path(&self, namespace: CacheNamespace, fingerprint: &Fingerprint) -> PathBuf {
        self.namespace_dir(namespace).join(fingerprint.short())
    }

    /// Looks up an entry, counting the hit or miss
    pub fn lookup(&mut self, namespace: CacheNamespace, fingerprint: &Fingerprint) -> Option<PathBuf> {
        match self.entries.get_mut(&(namespace, fingerprint.clone())) {
            Some(entry) => {
                entry.hits += 1;
                entry.last_used = Utc::now();
                self.stats.hits += 1;
                Some(entry.location.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    pub fn record(
        &mut self,
        namespace: CacheNamespace,
        fingerprint: &Fingerprint,
        location: impl Into<PathBuf>,
    ) {
        self.entries.insert(
            (namespace, fingerprint.clone()),
            CacheEntry {
                location: location.into(),
                last_used: Utc::now(),
                hits: 0,
            },
        );
    }

    /// Drops an entry whose content turned out to be unusable
    pub fn invalidate(&mut self, namespace: CacheNamespace, fingerprint: &Fingerprint) {
        self.entries.remove(&(namespace, fingerprint.clone()));
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_counts_hits_and_misses() {
        let mut cache = BuildCache::new("/tmp/cache");
        let fp = Fingerprint::of(b"tree");

        assert_eq!(cache.lookup(CacheNamespace::Source, &fp), None);

        let location = cache.entry_path(CacheNamespace::Source, &fp);
        cache.record(CacheNamespace::Source, &fp, location.clone());

        assert_eq!(cache.lookup(CacheNamespace::Source, &fp), Some(location));
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1 });
    }

    #[test]
    fn test_namespaces_are_independent() {
        let mut cache = BuildCache::new("/tmp/cache");
        let fp = Fingerprint::of(b"tree");

        cache.record(CacheNamespace::Source, &fp, "/tmp/cache/source/x");
        assert!(cache.lookup(CacheNamespace::DockerLayer, &fp).is_none());
        assert!(cache.lookup(CacheNamespace::Source, &fp).is_some());

        cache.invalidate(CacheNamespace::Source, &fp);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_namespace_dirs() {
        let cache = BuildCache::new("/var/shipway/cache");
        let dirs: Vec<PathBuf> = CacheNamespace::ALL
            .iter()
            .map(|ns| cache.namespace_dir(*ns))
            .collect();
        assert_eq!(
            dirs,
            vec![
                PathBuf::from("/var/shipway/cache/source"),
                PathBuf::from("/var/shipway/cache/layers"),
                PathBuf::from("/var/shipway/cache/custom"),
            ]
        );
    }
}
