//! Template Cache - LRU cache of compiled programs
//!
//! **Purpose**: compile each distinct template text once
//!
//! Programs are shared as `Arc<CompiledProgram>`; locks are only held for the
//! map operation itself, never while compiling or assembling.

use crate::template::CompiledProgram;
use lru::LruCache;
use parking_lot::RwLock;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::trace;

/// Cache statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses
    pub misses: u64,
    /// Programs pushed out by newer ones
    pub evictions: u64,
    /// Current cache size
    pub size: usize,
    /// Maximum cache size
    pub capacity: usize,
}

impl CacheStats {
    /// Calculate hit rate
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Template text -> compiled program
pub struct TemplateCache {
    cache: RwLock<LruCache<String, Arc<CompiledProgram>>>,
    stats: RwLock<CacheStats>,
}

impl TemplateCache {
    /// Create a cache holding at most `capacity` programs (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: RwLock::new(LruCache::new(capacity)),
            stats: RwLock::new(CacheStats {
                capacity: capacity.get(),
                ..Default::default()
            }),
        }
    }

    /// Look up a compiled program by its raw template text
    pub fn get(&self, text: &str) -> Option<Arc<CompiledProgram>> {
        // LRU promotion needs the write lock
        let mut cache = self.cache.write();
        let found = cache.get(text).map(Arc::clone);
        drop(cache);

        let mut stats = self.stats.write();
        if found.is_some() {
            stats.hits += 1;
            trace!(len = text.len(), "template cache hit");
        } else {
            stats.misses += 1;
        }
        found
    }

    /// Insert a program; a concurrent duplicate simply replaces the older one
    pub fn put(&self, text: String, program: Arc<CompiledProgram>) {
        let mut cache = self.cache.write();
        let evicted = match cache.push(text, program) {
            Some((old_key, _)) => !cache.contains(&old_key),
            None => false,
        };
        let size = cache.len();
        drop(cache);

        let mut stats = self.stats.write();
        stats.size = size;
        if evicted {
            stats.evictions += 1;
            trace!(size, "template cache evicted least recently used program");
        }
    }

    /// Drop one template
    pub fn invalidate(&self, text: &str) -> bool {
        let mut cache = self.cache.write();
        let removed = cache.pop(text).is_some();
        let size = cache.len();
        drop(cache);

        self.stats.write().size = size;
        removed
    }

    /// Clear entire cache and reset counters
    pub fn clear(&self) {
        let mut cache = self.cache.write();
        cache.clear();
        let capacity = cache.cap().get();
        drop(cache);

        *self.stats.write() = CacheStats {
            capacity,
            ..Default::default()
        };
    }

    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        self.stats.read().clone()
    }
}

impl std::fmt::Debug for TemplateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateCache").field("stats", &self.stats()).finish()
    }
}
