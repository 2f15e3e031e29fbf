use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use arbor_core::types::TxHash;

/// LRU filter of recently finalized transaction hashes.
///
/// Peers keep gossiping transactions for a while after they finalize; this
/// cache lets the pool drop them without a storage lookup. Capacity is sized
/// in periods worth of traffic by the node (kRecentlyFinalized × committee
/// size), translated to an entry budget by the caller.
pub struct RecentlyFinalized {
    cache: Mutex<LruCache<TxHash, ()>>,
}

impl RecentlyFinalized {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("max(1) is non-zero");
        Self {
            cache: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn mark_finalized<I: IntoIterator<Item = TxHash>>(&self, hashes: I) {
        let mut cache = self.cache.lock();
        for h in hashes {
            cache.put(h, ());
        }
    }

    /// Checks membership without refreshing recency, so the window stays a
    /// finalization window rather than a gossip-activity window.
    pub fn contains(&self, hash: &TxHash) -> bool {
        self.cache.lock().peek(hash).is_some()
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(n: u8) -> TxHash {
        TxHash::from_bytes([n; 32])
    }

    #[test]
    fn remembers_finalized_hashes() {
        let cache = RecentlyFinalized::new(10);
        cache.mark_finalized([h(1), h(2)]);
        assert!(cache.contains(&h(1)));
        assert!(!cache.contains(&h(3)));
    }

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let cache = RecentlyFinalized::new(3);
        cache.mark_finalized([h(1), h(2), h(3), h(4)]);
        assert!(!cache.contains(&h(1)), "oldest entry evicted");
        assert!(cache.contains(&h(4)));
        assert_eq!(cache.len(), 3);
    }
}
