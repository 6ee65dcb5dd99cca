//! The [MemoryCache] is a byte-bounded LRU of decoded resources.
//!
//! Every entry leaving the cache, whatever the reason, is handed to the [EvictionListener] before the mutating call
//! returns.  The listener owns the cache's acquisition from that point on, which is what lets the engine release it
//! without a window where a resource is neither resident nor accounted for.
use std::sync::Arc;

use crate::*;

pub struct MemoryCache<R: Resource> {
    lru: CostBasedLru<str, Arc<R>>,
    /// The size before any multiplier was applied.
    initial_max_size: u64,
    listener: Option<Box<dyn EvictionListener<R>>>,
}

impl<R: Resource> MemoryCache<R> {
    pub fn new(max_size: u64) -> MemoryCache<R> {
        MemoryCache {
            lru: CostBasedLru::new(max_size),
            initial_max_size: max_size,
            listener: None,
        }
    }

    pub fn set_eviction_listener(&mut self, listener: Box<dyn EvictionListener<R>>) {
        self.listener = Some(listener);
    }

    pub fn current_size(&self) -> u64 {
        self.lru.current_cost()
    }

    pub fn max_size(&self) -> u64 {
        self.lru.max_cost()
    }

    pub fn len(&self) -> usize {
        self.lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lru.is_empty()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lru.contains_key(key.as_str())
    }

    /// Get a resource, making it the most recently used.
    pub fn get(&mut self, key: &CacheKey) -> Option<Arc<R>> {
        self.lru.get(key.as_str()).cloned()
    }

    /// Insert a resource, taking over one acquisition of it.
    ///
    /// If the key was already present the old resource is evicted and also returned.  A resource bigger than the whole
    /// cache is evicted straight away.
    pub fn put(&mut self, key: CacheKey, resource: Arc<R>) -> Option<Arc<R>> {
        let size = resource.byte_size();
        if size > self.lru.max_cost() {
            log::debug!("{} is too large for the memory cache ({} bytes)", key, size);
            self.notify(&key, resource);
            return None;
        }

        let old = self.lru.insert(key.shared(), resource, size);
        if let Some(ref o) = old {
            self.notify(&key, o.clone());
        }
        self.evict_over_budget();
        old
    }

    /// Remove a resource.  The listener is told, as with any other eviction.
    pub fn remove(&mut self, key: &CacheKey) -> Option<Arc<R>> {
        let old = self.lru.remove(key.as_str())?;
        self.notify(key, old.clone());
        Some(old)
    }

    pub fn clear_memory(&mut self) {
        self.evict_down_to(0);
    }

    /// Scale the configured size.  Shrinking evicts immediately.
    ///
    /// # Panics
    ///
    /// If the multiplier is negative or not finite.
    pub fn set_size_multiplier(&mut self, multiplier: f32) {
        assert!(
            multiplier.is_finite() && multiplier >= 0.0,
            "Size multiplier must be finite and non-negative, got {}",
            multiplier
        );
        let max = (self.initial_max_size as f64 * multiplier as f64).round() as u64;
        self.lru.set_max_cost(max);
        self.evict_over_budget();
    }

    /// Evict until no more than `size` bytes are resident, leaving the configured maximum alone.
    pub fn trim_to_size(&mut self, size: u64) {
        self.evict_down_to(size);
    }

    fn evict_over_budget(&mut self) {
        while let Some((key, resource)) = self.lru.pop_over_budget() {
            self.notify(&CacheKey::from(key), resource);
        }
    }

    fn evict_down_to(&mut self, size: u64) {
        while self.lru.current_cost() > size {
            let (key, resource) = match self.lru.pop_lru() {
                Some(x) => x,
                None => break,
            };
            self.notify(&CacheKey::from(key), resource);
        }
    }

    fn notify(&mut self, key: &CacheKey, resource: Arc<R>) {
        log::debug!("Evicting {} from the memory cache", key);
        if let Some(listener) = self.listener.as_mut() {
            listener.on_entry_evicted(key, resource);
        }
    }
}
