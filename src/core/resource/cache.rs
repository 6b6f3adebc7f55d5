//! Lookup of child resources by relative path.
//!
//! The cache holds every resource added to it weakly, so lookups find a
//! resource as long as anyone else still uses it. The most recently added or
//! looked-up ones (up to the retain limit) are also held strongly in an LRU.

use super::Resource;
use crate::core::error::{CouchError, Result};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(1);

const DEFAULT_RETAIN_LIMIT: usize = 50;

struct CacheEntries {
    by_path: HashMap<String, Weak<Resource>>,
    retained: LruCache<String, Arc<Resource>>,
    adds_since_sweep: usize,
}

/// Maps relative paths to resources. A resource belongs to at most one cache.
pub struct ResourceCache {
    id: u64,
    entries: Mutex<CacheEntries>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::with_retain_limit(DEFAULT_RETAIN_LIMIT)
    }

    /// A cache that keeps at most `limit` resources alive on its own.
    /// A limit of zero is treated as one.
    pub fn with_retain_limit(limit: usize) -> Self {
        let limit = NonZeroUsize::new(limit).unwrap_or(NonZeroUsize::MIN);
        ResourceCache {
            id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
            entries: Mutex::new(CacheEntries {
                by_path: HashMap::new(),
                retained: LruCache::new(limit),
                adds_since_sweep: 0,
            }),
        }
    }

    /// Adds `resource` under its relative path.
    ///
    /// Fails if the resource is untitled or already belongs to a cache,
    /// including this one.
    /// A different resource previously stored under the same path is replaced.
    pub fn add_resource(&self, resource: &Arc<Resource>) -> Result<()> {
        let path = resource
            .relative_path()
            .ok_or_else(|| CouchError::Usage("cannot cache an untitled resource".into()))?;

        {
            let mut owner = resource.owning_cache.lock();
            match *owner {
                Some(id) if id == self.id => {
                    return Err(CouchError::Usage(format!("resource {} is already cached", path)))
                }
                Some(_) => {
                    return Err(CouchError::Usage(format!(
                        "resource {} already belongs to another cache",
                        path
                    )))
                }
                None => *owner = Some(self.id),
            }
        }

        let mut entries = self.entries.lock();
        if let Some(previous) = entries.by_path.get(&path).and_then(Weak::upgrade) {
            if !Arc::ptr_eq(&previous, resource) {
                *previous.owning_cache.lock() = None;
            }
        }
        entries.by_path.insert(path.clone(), Arc::downgrade(resource));
        if let Some((evicted_path, evicted)) = entries.retained.push(path.clone(), resource.clone()) {
            if evicted_path != path && Arc::strong_count(&evicted) == 1 {
                entries.by_path.remove(&evicted_path);
            }
        }
        // Entries evicted while still in use die later. Sweeping after every
        // len/2 additions keeps the map within a constant factor of the live set.
        entries.adds_since_sweep += 1;
        if entries.adds_since_sweep >= entries.retained.cap().get().max(entries.by_path.len() / 2) {
            entries.by_path.retain(|_, weak| weak.strong_count() > 0);
            entries.adds_since_sweep = 0;
        }
        Ok(())
    }

    /// The cached resource at `path`, if it is still alive.
    pub fn resource_with_relative_path(&self, path: &str) -> Option<Arc<Resource>> {
        let mut entries = self.entries.lock();
        let found = match entries.by_path.get(path).map(Weak::upgrade) {
            Some(Some(resource)) => resource,
            Some(None) => {
                entries.by_path.remove(path);
                return None;
            }
            None => return None,
        };
        entries.retained.put(path.to_string(), found.clone());
        Some(found)
    }

    /// Removes `resource`. Fails if it belongs to a different cache.
    pub fn forget_resource(&self, resource: &Arc<Resource>) -> Result<()> {
        {
            let mut owner = resource.owning_cache.lock();
            match *owner {
                Some(id) if id == self.id => *owner = None,
                Some(_) => {
                    return Err(CouchError::Usage(
                        "resource belongs to another cache".into(),
                    ))
                }
                None => return Ok(()),
            }
        }

        if let Some(path) = resource.relative_path() {
            let mut entries = self.entries.lock();
            let same = entries
                .by_path
                .get(&path)
                .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(resource)));
            if same {
                entries.by_path.remove(&path);
                entries.retained.pop(&path);
            }
        }
        Ok(())
    }

    /// Empties the cache, releasing every resource it owned.
    pub fn forget_all_resources(&self) {
        let mut entries = self.entries.lock();
        for resource in entries.by_path.values().filter_map(Weak::upgrade) {
            let mut owner = resource.owning_cache.lock();
            if *owner == Some(self.id) {
                *owner = None;
            }
        }
        entries.by_path.clear();
        entries.retained.clear();
    }

    /// Number of entries whose resource is still alive.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .by_path
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ResourceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResourceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.lock();
        f.debug_struct("ResourceCache")
            .field("id", &self.id)
            .field("entries", &entries.by_path.len())
            .field("retained", &entries.retained.len())
            .finish()
    }
}
