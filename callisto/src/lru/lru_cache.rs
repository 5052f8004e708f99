use linked_hash_map::LinkedHashMap;

/// Returns the allocated memory in bytes.
pub trait ByteSize {
    /// Returns the amount of allocated memory in bytes.
    ///
    /// Note that most probably this is an approximation and not the exact byte value. However,
    /// it should represent the "largest" part of an instance, e.g. for a string this would be
    /// the bytes allocated on the heap.
    fn allocated_size(&self) -> usize;
}

impl ByteSize for String {
    fn allocated_size(&self) -> usize {
        self.capacity()
    }
}

/// Invoked for each entry which is dropped from the cache due to its size constraint.
///
/// The listener runs while the lock guarding the cache is held. It must therefore neither block
/// nor call back into the cache it is installed on.
pub type EvictionListener<V> = Box<dyn FnMut(String, V) + Send>;

/// Provides a size constrained LRU cache.
///
/// A cache behaves just like a **Map** as long as there is no shortage in storage. However, if
/// the allocated memory grows beyond the configured budget, old (least recently used) entries
/// will be evicted - hence the name LRU cache. A budget of **0** disables the constraint
/// entirely, such a cache grows without bounds.
///
/// Each entry contributes the length of its key plus the allocated size of its value, as
/// determined when the entry is inserted. Keys are owned by the cache and never handed out
/// mutably, so this contribution stays accurate for the lifetime of the entry.
///
/// Note that [get](LruCache::get) refreshes the recency of the touched entry and therefore
/// requires a mutable reference as well.
///
/// # Examples
/// ```
/// # use callisto::lru::LruCache;
/// // Specifies a cache which can allocate up to 16 bytes of memory...
/// let mut lru = LruCache::new(16);
///
/// lru.add("Foo".to_owned(), "Bar".to_owned());
/// assert_eq!(lru.get("Foo").unwrap(), &"Bar".to_owned());
///
/// // this will still fit..
/// lru.add("Foo1".to_owned(), "Buzz".to_owned());
/// assert_eq!(lru.get("Foo").is_some(), true);
/// assert_eq!(lru.get("Foo1").is_some(), true);
///
/// // this will hit the memory constraint and throw the least recently used entry out...
/// lru.add("Foo2".to_owned(), "Bar".to_owned());
/// assert_eq!(lru.get("Foo").is_none(), true);
///```
pub struct LruCache<V: ByteSize> {
    max_bytes: usize,
    now_bytes: usize,
    map: LinkedHashMap<String, Entry<V>>,
    on_evict: Option<EvictionListener<V>>,
}

struct Entry<V: ByteSize> {
    mem_size: usize,
    value: V,
}

impl<V: ByteSize> LruCache<V> {
    /// Creates a new cache which can allocate up to **max_bytes** of memory.
    ///
    /// Passing **0** as budget yields an unbounded cache.
    pub fn new(max_bytes: usize) -> Self {
        LruCache {
            max_bytes,
            now_bytes: 0,
            map: LinkedHashMap::new(),
            on_evict: None,
        }
    }

    /// Creates a new cache which reports each evicted entry to the given listener.
    ///
    /// The listener is only invoked for entries dropped by the size constraint, it runs while
    /// the cache is being mutated and must not call back into it.
    pub fn with_eviction_listener(
        max_bytes: usize,
        listener: impl FnMut(String, V) + Send + 'static,
    ) -> Self {
        LruCache {
            max_bytes,
            now_bytes: 0,
            map: LinkedHashMap::new(),
            on_evict: Some(Box::new(listener)),
        }
    }

    /// Stores the given value for the given key.
    ///
    /// If a value is already present for the key, it is replaced and the entry is treated as
    /// the most recently used one. Once the allocated memory exceeds the configured budget, the
    /// least recently used entries are evicted until the cache fits its budget again. Note that
    /// an entry which on its own is larger than the whole budget is tolerated: the cache is
    /// simply emptied, including the entry itself.
    pub fn add(&mut self, key: String, value: V) {
        let mem_size = key.len() + value.allocated_size();
        let mut delta = mem_size as isize;

        // Re-inserting the entry (instead of updating it in place) moves it to the most
        // recently used end of the internal list.
        if let Some(stale_entry) = self.map.remove(&key) {
            delta -= stale_entry.mem_size as isize;
        }
        let _ = self.map.insert(key, Entry { mem_size, value });

        self.now_bytes = (self.now_bytes as isize + delta) as usize;

        while self.max_bytes != 0 && self.now_bytes > self.max_bytes {
            self.remove_oldest();
        }
    }

    /// Returns the value which has previously been stored for the given key or **None** if no
    /// value is present.
    ///
    /// A successful lookup marks the entry as the most recently used one.
    pub fn get(&mut self, key: &str) -> Option<&V> {
        match self.map.get_refresh(key) {
            Some(entry) => Some(&entry.value),
            None => None,
        }
    }

    /// Drops the least recently used entry.
    ///
    /// If an eviction listener is installed, it receives the removed key and value. Calling
    /// this on an empty cache is a no-op.
    pub fn remove_oldest(&mut self) {
        if let Some((key, entry)) = self.map.pop_front() {
            self.now_bytes -= entry.mem_size;
            if let Some(listener) = self.on_evict.as_mut() {
                listener(key, entry.value);
            }
        }
    }

    /// Returns the number of entries in the cache.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Determines if the cache is completely empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns the number of bytes currently allocated by the cached entries.
    pub fn allocated_bytes(&self) -> usize {
        self.now_bytes
    }

    /// Returns the maximal amount of memory to be (roughly) occupied by this cache.
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use crate::byteview::ByteView;
    use crate::lru::LruCache;

    #[test]
    fn accounting_tracks_the_live_entries() {
        let mut lru = LruCache::new(0);

        lru.add("Tom".to_owned(), ByteView::from("630"));
        lru.add("Jack".to_owned(), ByteView::from("589"));
        assert_eq!(lru.allocated_bytes(), 6 + 7);
        assert_eq!(lru.len(), 2);

        // Replacing a value only applies the size delta of the value itself...
        lru.add("Tom".to_owned(), ByteView::from("630630"));
        assert_eq!(lru.allocated_bytes(), 9 + 7);
        assert_eq!(lru.len(), 2);

        // A lookup changes recency but never the accounting...
        assert_eq!(lru.get("Jack").unwrap().to_string(), "589");
        assert_eq!(lru.allocated_bytes(), 9 + 7);
    }

    #[test]
    fn the_least_recently_touched_entry_is_evicted_first() {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let log = evicted.clone();
        let mut lru = LruCache::with_eviction_listener(8, move |key, _value: ByteView| {
            log.lock().unwrap().push(key);
        });

        lru.add("a".to_owned(), ByteView::from("1"));
        lru.add("b".to_owned(), ByteView::from("2"));
        lru.add("c".to_owned(), ByteView::from("3"));
        assert_eq!(lru.get("a").is_some(), true);
        lru.add("d".to_owned(), ByteView::from("4"));

        // The budget holds four 2-byte entries, the fifth add overflows and "b" is the least
        // recently touched key at that point ("a" was refreshed by the lookup above)...
        lru.add("e".to_owned(), ByteView::from("5"));

        assert_eq!(evicted.lock().unwrap().as_slice(), &["b".to_owned()]);
        assert_eq!(lru.len(), 4);
        assert_eq!(lru.allocated_bytes(), 8);
        for key in ["a", "c", "d", "e"] {
            assert_eq!(lru.get(key).is_some(), true, "{} should have survived", key);
        }
    }

    #[test]
    fn an_oversized_entry_clears_the_whole_cache() {
        let mut lru = LruCache::new(8);

        lru.add("a".to_owned(), ByteView::from("1"));
        lru.add("huge".to_owned(), ByteView::from("0123456789abcdef"));

        assert_eq!(lru.len(), 0);
        assert_eq!(lru.allocated_bytes(), 0);

        // The cache remains fully operational afterwards...
        lru.add("b".to_owned(), ByteView::from("2"));
        assert_eq!(lru.get("b").is_some(), true);
    }

    #[test]
    fn removing_the_oldest_entry_reports_it_to_the_listener() {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let log = evicted.clone();
        let mut lru = LruCache::with_eviction_listener(0, move |key, value: ByteView| {
            log.lock().unwrap().push((key, value.to_string()));
        });

        lru.remove_oldest();
        assert_eq!(evicted.lock().unwrap().len(), 0);

        lru.add("Tom".to_owned(), ByteView::from("630"));
        lru.add("Jack".to_owned(), ByteView::from("589"));
        lru.remove_oldest();

        assert_eq!(
            evicted.lock().unwrap().as_slice(),
            &[("Tom".to_owned(), "630".to_owned())]
        );
        assert_eq!(lru.len(), 1);
        assert_eq!(lru.allocated_bytes(), 7);
    }
}
