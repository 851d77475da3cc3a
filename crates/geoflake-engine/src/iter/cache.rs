//! Materialized feature caches
//!
//! [`MaterializedCache`] is owned by one iterator and grows as it yields.
//! [`MaterializedStore`] is shared by a data source and its iterators; an
//! unfiltered scan that runs to the end publishes its cache there, after
//! which the source is "fully loaded" and serves features without querying.

use geoflake_ir::Feature;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Debug, Default)]
pub struct MaterializedCache {
    features: Vec<Feature>,
    complete: bool,
}

impl MaterializedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, feature: Feature) {
        self.features.push(feature);
    }

    pub fn get(&self, position: usize) -> Option<&Feature> {
        self.features.get(position)
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Every row of the scan has been visited.
    pub fn mark_complete(&mut self) {
        self.complete = true;
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn reset(&mut self) {
        self.features.clear();
        self.complete = false;
    }

    /// The features, if the scan completed. Leaves the cache empty.
    pub fn take_complete(&mut self) -> Option<Vec<Feature>> {
        if !self.complete {
            return None;
        }
        self.complete = false;
        Some(std::mem::take(&mut self.features))
    }

    pub fn snapshot(&self) -> Vec<Feature> {
        self.features.clone()
    }
}

/// Fully loaded features of a data source.
#[derive(Debug, Default)]
pub struct MaterializedStore {
    features: RwLock<Option<Arc<Vec<Feature>>>>,
    generation: AtomicU64,
}

impl MaterializedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current generation; bumped whenever the store is invalidated.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn loaded(&self) -> Option<Arc<Vec<Feature>>> {
        self.features.read().ok().and_then(|guard| guard.clone())
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded().is_some()
    }

    /// Publish a full scan taken at `generation`. Stale scans are dropped.
    pub fn publish(&self, generation: u64, features: Vec<Feature>) -> bool {
        let Ok(mut guard) = self.features.write() else {
            return false;
        };
        if generation != self.generation() {
            return false;
        }
        *guard = Some(Arc::new(features));
        true
    }

    /// Replace the contents unconditionally.
    pub fn adopt(&self, features: Vec<Feature>) {
        if let Ok(mut guard) = self.features.write() {
            *guard = Some(Arc::new(features));
        }
    }

    pub fn invalidate(&self) {
        if let Ok(mut guard) = self.features.write() {
            self.generation.fetch_add(1, Ordering::SeqCst);
            *guard = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_completion() {
        let mut cache = MaterializedCache::new();
        cache.push(Feature::new(1));
        cache.push(Feature::new(2));
        assert_eq!(cache.take_complete(), None);
        cache.mark_complete();
        let features = cache.take_complete().unwrap();
        assert_eq!(features.len(), 2);
        assert!(cache.is_empty());
        assert!(!cache.is_complete());
    }

    #[test]
    fn test_store_rejects_stale_publish() {
        let store = MaterializedStore::new();
        let generation = store.generation();
        store.invalidate();
        assert!(!store.publish(generation, vec![Feature::new(1)]));
        assert!(!store.is_loaded());

        assert!(store.publish(store.generation(), vec![Feature::new(1)]));
        assert_eq!(store.loaded().unwrap().len(), 1);

        store.invalidate();
        assert!(!store.is_loaded());
    }
}
