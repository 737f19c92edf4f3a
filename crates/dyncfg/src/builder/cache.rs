//! Cache of managed builders keyed by resolved file name

use arc_swap::ArcSwap;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;

use super::FileBasedBuilder;

type BuilderMap = DashMap<String, Arc<FileBasedBuilder>>;

/// Concurrent map from resolved key to its managed builder.
///
/// Insertion is insert-if-absent per key, so at most one builder is ever
/// installed for a key. The map sits behind an `ArcSwap`: [`clear`](Self::clear)
/// swaps in an empty map in one step, and lookups never see a partly cleared one.
pub struct ManagedBuilders {
    map: ArcSwap<BuilderMap>,
}

impl ManagedBuilders {
    pub fn new() -> Self {
        Self {
            map: ArcSwap::from_pointee(DashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<FileBasedBuilder>> {
        self.map.load().get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Install `candidate` unless a builder exists for `key`.
    ///
    /// Returns the installed builder and whether it is `candidate`.
    pub fn put_if_absent(
        &self,
        key: &str,
        candidate: Arc<FileBasedBuilder>,
    ) -> (Arc<FileBasedBuilder>, bool) {
        let map = self.map.load_full();
        match map.entry(key.to_string()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&candidate));
                (candidate, true)
            }
        }
    }

    /// Snapshot of the installed builders
    pub fn values(&self) -> Vec<Arc<FileBasedBuilder>> {
        self.map
            .load()
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Snapshot of `(key, builder)` pairs, sorted by key
    pub fn entries(&self) -> Vec<(String, Arc<FileBasedBuilder>)> {
        let mut entries: Vec<_> = self
            .map
            .load()
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Remove every builder; returns the removed builders
    pub fn clear(&self) -> Vec<Arc<FileBasedBuilder>> {
        let old = self.map.swap(Arc::new(DashMap::new()));
        old.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.map.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ManagedBuilders {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ManagedBuilders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedBuilders")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FileParameters;

    fn builder(name: &str) -> Arc<FileBasedBuilder> {
        FileBasedBuilder::new(FileParameters::new(name))
    }

    #[test]
    fn test_put_if_absent_keeps_first() {
        let cache = ManagedBuilders::new();
        let first = builder("a.toml");
        let second = builder("a.toml");

        let (installed, won) = cache.put_if_absent("a.toml", Arc::clone(&first));
        assert!(won);
        assert!(Arc::ptr_eq(&installed, &first));

        let (installed, won) = cache.put_if_absent("a.toml", second);
        assert!(!won);
        assert!(Arc::ptr_eq(&installed, &first));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_clear_returns_removed() {
        let cache = ManagedBuilders::new();
        cache.put_if_absent("a.toml", builder("a.toml"));
        cache.put_if_absent("b.toml", builder("b.toml"));

        let entries = cache.entries();
        assert_eq!(entries[0].0, "a.toml");
        assert_eq!(entries[1].0, "b.toml");

        let removed = cache.clear();
        assert_eq!(removed.len(), 2);
        assert!(cache.is_empty());
        assert!(cache.get("a.toml").is_none());
    }

    #[test]
    fn test_concurrent_put_if_absent() {
        let cache = Arc::new(ManagedBuilders::new());
        let barrier = Arc::new(std::sync::Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    cache.put_if_absent("shared.toml", builder("shared.toml"))
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|(_, won)| *won).count(), 1);
        let installed = cache.get("shared.toml").unwrap();
        assert!(results.iter().all(|(b, _)| Arc::ptr_eq(b, &installed)));
    }
}
