//! Bounded LRU cache of block location metadata.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use crate::protocol::BlockKey;
use crate::store::BlockInfo;

/// Read-through cache of [`BlockInfo`] keyed by canonical block key.
///
/// Entries are evicted least-recently-used first once `capacity` is reached.
#[derive(Debug)]
pub struct BlockInfoCache {
    entries: Mutex<LruCache<BlockKey, BlockInfo>>,
}

impl BlockInfoCache {
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        // LruCache::new reserves the whole capacity up front
        let mut entries = LruCache::unbounded();
        entries.resize(capacity);
        Self {
            entries: Mutex::new(entries),
        }
    }

    pub fn get(&self, key: &BlockKey) -> Option<BlockInfo> {
        self.entries.lock().get(key).cloned()
    }

    pub fn insert(&self, key: BlockKey, info: BlockInfo) {
        self.entries.lock().put(key, info);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }
}
