//! LRU cache of whole piece bodies keyed by piece index (§4.6), fixed byte
//! capacity — a thin wrapper over `lru::LruCache` (the teacher's own choice
//! for this concern, `bittorrent/src/fs/mod.rs`'s `read_cache`), since
//! `LruCache::pop_lru` already returns the true least-recently-used entry
//! in O(1). Eviction removes the oldest ~25% of entries by driving
//! `pop_lru` in a loop, fixing the `records * 0.25` bug named in §9 point
//! 3 — that isn't arithmetic on a count, it's a number of entries to drain.

use std::sync::Arc;
use lru::LruCache;

pub struct PieceCache {
    max_size: usize,
    current_size: usize,
    entries: LruCache<u32, Arc<Vec<u8>>>,
}

impl PieceCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            current_size: 0,
            entries: LruCache::unbounded(),
        }
    }

    pub fn contains(&self, index: u32) -> bool {
        self.entries.contains(&index)
    }

    pub fn add(&mut self, index: u32, data: Vec<u8>) {
        let size = data.len();
        if self.current_size + size >= self.max_size {
            self.evict_oldest_quarter();
        }
        self.current_size += size;
        self.entries.put(index, Arc::new(data));
    }

    /// Bumps `index` to most-recently-used, per `LruCache::get`'s own
    /// recency semantics.
    pub fn get(&mut self, index: u32) -> Option<Arc<Vec<u8>>> {
        self.entries.get(&index).cloned()
    }

    fn evict_oldest_quarter(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        let evict_count = ((self.entries.len() as f64) * 0.25).ceil() as usize;
        for _ in 0..evict_count.max(1) {
            let Some((_, data)) = self.entries.pop_lru() else { break };
            self.current_size -= data.len();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_get_returns_same_data() {
        let mut cache = PieceCache::new(1024);
        cache.add(0, vec![1, 2, 3]);
        assert_eq!(*cache.get(0).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn overflow_evicts_oldest_quarter_before_growing_unbounded() {
        let mut cache = PieceCache::new(40);
        for i in 0..10u32 {
            cache.add(i, vec![0u8; 4]);
        }
        assert!(cache.current_size < cache.max_size, "cache should have evicted to stay under capacity");
        assert!(cache.entries.len() < 10);
    }

    #[test]
    fn access_bumps_recency_so_it_survives_eviction() {
        let mut cache = PieceCache::new(20);
        cache.add(0, vec![0u8; 4]);
        cache.add(1, vec![0u8; 4]);
        cache.add(2, vec![0u8; 4]);
        // Touch piece 0 so it's the most recently accessed.
        cache.get(0);
        cache.add(3, vec![0u8; 4]);
        cache.add(4, vec![0u8; 4]);
        assert!(cache.contains(0), "recently accessed entry should survive eviction");
    }
}
