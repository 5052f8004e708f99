use std::sync::Mutex;

use crate::byteview::ByteView;
use crate::lru::LruCache;

/// Provides a thread safe wrapper around an [LruCache](LruCache) storing byte views.
///
/// All access is serialized by a mutex. The critical sections are tiny (amortized constant
/// time) and never perform IO or invoke user code, so the lock is effectively uncontended.
///
/// Note that the underlying cache is created lazily: a group which never stores anything
/// doesn't allocate any storage either.
pub struct SharedCache {
    cache_bytes: usize,
    inner: Mutex<Option<LruCache<ByteView>>>,
}

impl SharedCache {
    /// Creates a new shared cache with the given byte budget.
    pub fn new(cache_bytes: usize) -> Self {
        SharedCache {
            cache_bytes,
            inner: Mutex::new(None),
        }
    }

    /// Stores the given value for the given key.
    ///
    /// The first write instantiates the underlying cache with the configured byte budget.
    pub fn add(&self, key: &str, value: ByteView) {
        let mut guard = self.inner.lock().unwrap();
        guard
            .get_or_insert_with(|| LruCache::new(self.cache_bytes))
            .add(key.to_owned(), value);
    }

    /// Performs a lookup for the given key.
    ///
    /// A lookup on a cache which was never written to returns **None** without allocating any
    /// storage.
    pub fn get(&self, key: &str) -> Option<ByteView> {
        let mut guard = self.inner.lock().unwrap();
        guard.as_mut().and_then(|lru| lru.get(key).cloned())
    }

    /// Returns the number of entries currently stored.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .as_ref()
            .map(LruCache::len)
            .unwrap_or(0)
    }

    /// Determines if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
