//! Provides a size constrained LRU Cache.
//!
//! An LRU cache drops the least recently used entry if it is about to grow beyond the given
//! byte budget. The [LruCache](LruCache) itself is a plain single threaded data structure which
//! can store all kinds of values for which the [ByteSize](ByteSize) trait is implemented.
//!
//! The [SharedCache](SharedCache) wraps such a cache in a mutex so that it can be accessed from
//! many concurrent tasks. This is the building block used by each cache group to store its
//! local entries.
mod lru_cache;
mod shared;

pub use lru_cache::ByteSize;
pub use lru_cache::LruCache;
pub use shared::SharedCache;
