//! a [CostBasedLru] is an Lru list which tracks the cost of the items it holds, so that owners can decide when to
//! evict.
//!
//! This is implemented as a vec-backed doubly linked list plus an auxiliary hash-based index.  Unlike a plain LRU
//! cache, the list never evicts on its own: callers pull victims out with [CostBasedLru::pop_over_budget] or pick them
//! out of [CostBasedLru::iter_lru], because both the memory cache and the disk index need to observe every eviction.
//!
//! Keys are held behind `Arc` so that unsized keys like `str` can be used, and so that the index and the list can share
//! them.
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use ahash::RandomState;

struct OccupiedEntry<K: ?Sized, V> {
    key: Arc<K>,
    item: V,
    /// Towards the most recently used end.
    prev: Option<usize>,
    /// Towards the least recently used end.
    next: Option<usize>,
    cost: u64,
}

struct EmptyEntry {
    next_empty: Option<usize>,
}

enum CacheEntry<K: ?Sized, V> {
    /// This entry is empty, possibly with a pointer at the next empty entry.
    Empty(EmptyEntry),
    /// This entry is occupied, and doubley linked to the previous and next entry.
    Occupied(OccupiedEntry<K, V>),
}

impl<K: ?Sized, V> CacheEntry<K, V> {
    fn as_occupied_mut(&mut self) -> &mut OccupiedEntry<K, V> {
        match self {
            Self::Occupied(ref mut x) => x,
            _ => panic!("Entry should be occupied"),
        }
    }

    fn as_occupied(&self) -> &OccupiedEntry<K, V> {
        match self {
            Self::Occupied(ref x) => x,
            _ => panic!("Entry should be occupied"),
        }
    }

    fn as_empty_mut(&mut self) -> &mut EmptyEntry {
        match self {
            CacheEntry::Empty(ref mut x) => x,
            _ => panic!("Entry should be empty"),
        }
    }
}

pub struct CostBasedLru<K: ?Sized + Hash + Eq, V> {
    entries: Vec<CacheEntry<K, V>>,
    /// Points at the index of the key.
    index: HashMap<Arc<K>, usize, RandomState>,
    // Above what cost is the owner expected to evict?
    max_cost: u64,
    entries_head: Option<usize>,
    entries_tail: Option<usize>,
    empty_head: Option<usize>,
    /// Current cost of the items in the list.
    current_cost: u64,
}

impl<K: ?Sized + Hash + Eq, V> CostBasedLru<K, V> {
    pub fn new(max_cost: u64) -> CostBasedLru<K, V> {
        CostBasedLru {
            entries: Default::default(),
            index: Default::default(),
            max_cost,
            entries_head: None,
            entries_tail: None,
            empty_head: None,
            current_cost: 0,
        }
    }

    pub fn max_cost(&self) -> u64 {
        self.max_cost
    }

    /// Change the budget.  Nothing is evicted here; follow up with [CostBasedLru::pop_over_budget].
    pub fn set_max_cost(&mut self, max_cost: u64) {
        self.max_cost = max_cost;
    }

    pub fn current_cost(&self) -> u64 {
        self.current_cost
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Entirely unlink an occupied index from the list.
    /// Used as a precursor step to lots of things such as patching up the head.
    fn unlink_index(&mut self, index: usize) {
        // Easiest to handle the tail first.
        if Some(index) == self.entries_tail {
            self.entries_tail = self.entries[index].as_occupied().prev;
            if let Some(p) = self.entries_tail {
                self.entries[p].as_occupied_mut().next = None;
            }
        }

        if Some(index) == self.entries_head {
            // unlinking the head is special.
            self.entries_head = self.entries[index].as_occupied_mut().next;
            if let Some(n) = self.entries_head {
                self.entries[n].as_occupied_mut().prev = None;
            }

            return;
        }

        // Otherwise we just do a standard linked list unlink.
        let old_prev = self.entries[index]
            .as_occupied_mut()
            .prev
            .expect("Isn't the head");
        let old_next = self.entries[index].as_occupied_mut().next;
        self.entries[old_prev].as_occupied_mut().next = old_next;
        if let Some(n) = old_next {
            self.entries[n].as_occupied_mut().prev = Some(old_prev);
        }
    }

    /// Link an occupied but unlinked index in as the head.
    fn link_as_head(&mut self, index: usize) {
        let old_head = self.entries_head;
        {
            let e = self.entries[index].as_occupied_mut();
            e.prev = None;
            e.next = old_head;
        }
        if let Some(h) = old_head {
            self.entries[h].as_occupied_mut().prev = Some(index);
        }
        self.entries_head = Some(index);

        // If there's no tail this is the only entry.
        if self.entries_tail.is_none() {
            self.entries_tail = Some(index);
        }
    }

    /// Given the index of an occupied entry, make it the most recent item.
    fn make_most_recent(&mut self, index: usize) {
        if self.entries_head == Some(index) {
            return;
        }
        self.unlink_index(index);
        self.link_as_head(index);
    }

    /// Look an item up, making it the most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let ind = *self.index.get(key)?;
        self.make_most_recent(ind);
        Some(&self.entries[ind].as_occupied().item)
    }

    /// Like [CostBasedLru::get], but mutable.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let ind = *self.index.get(key)?;
        self.make_most_recent(ind);
        Some(&mut self.entries[ind].as_occupied_mut().item)
    }

    /// Look an item up without touching its recency.
    pub fn peek(&self, key: &K) -> Option<&V> {
        let ind = *self.index.get(key)?;
        Some(&self.entries[ind].as_occupied().item)
    }

    pub fn peek_mut(&mut self, key: &K) -> Option<&mut V> {
        let ind = *self.index.get(key)?;
        Some(&mut self.entries[ind].as_occupied_mut().item)
    }

    /// Move an item to the most recently used position.  Returns false if the key isn't present.
    pub fn touch(&mut self, key: &K) -> bool {
        match self.index.get(key) {
            Some(&ind) => {
                self.make_most_recent(ind);
                true
            }
            None => false,
        }
    }

    /// Replace the cost of an item in place, without touching its recency.
    pub fn set_cost(&mut self, key: &K, cost: u64) -> bool {
        let ind = match self.index.get(key) {
            Some(&i) => i,
            None => return false,
        };
        let entry = self.entries[ind].as_occupied_mut();
        self.current_cost = self.current_cost - entry.cost + cost;
        entry.cost = cost;
        true
    }

    /// Make a specific index of the map become empty.
    fn become_empty(&mut self, index: usize) -> (Arc<K>, V) {
        self.unlink_index(index);
        let mut old = CacheEntry::Empty(EmptyEntry {
            next_empty: self.empty_head,
        });
        std::mem::swap(&mut old, &mut self.entries[index]);
        self.empty_head = Some(index);
        match old {
            CacheEntry::Occupied(OccupiedEntry {
                key, item, cost, ..
            }) => {
                self.index.remove(&key);
                self.current_cost -= cost;
                (key, item)
            }
            _ => panic!("Should have been occupied"),
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.remove_entry(key).map(|(_, v)| v)
    }

    pub fn remove_entry(&mut self, key: &K) -> Option<(Arc<K>, V)> {
        let ind = *self.index.get(key)?;
        Some(self.become_empty(ind))
    }

    /// Find an available empty index, or make one if necessary.
    fn find_empty(&mut self) -> usize {
        if let Some(e) = self.empty_head {
            self.empty_head = self.entries[e].as_empty_mut().next_empty;
            return e;
        }

        self.entries
            .push(CacheEntry::Empty(EmptyEntry { next_empty: None }));
        self.entries.len() - 1
    }

    /// Add an entry as the most recently used item.  Return the old item if this key was already present.
    ///
    /// Nothing is evicted, even if this takes the list over budget.
    pub fn insert(&mut self, key: Arc<K>, value: V, cost: u64) -> Option<V> {
        let ret = self.remove(&*key);
        let ind = self.find_empty();

        self.entries[ind] = CacheEntry::Occupied(OccupiedEntry {
            key: key.clone(),
            item: value,
            prev: None,
            next: None,
            cost,
        });
        self.link_as_head(ind);
        self.index.insert(key, ind);
        self.current_cost += cost;
        ret
    }

    /// Remove the least recently used item, if any.
    pub fn pop_lru(&mut self) -> Option<(Arc<K>, V)> {
        let tail = self.entries_tail?;
        Some(self.become_empty(tail))
    }

    /// Remove the least recently used item, but only while the list is over its maximum cost.
    pub fn pop_over_budget(&mut self) -> Option<(Arc<K>, V)> {
        if self.current_cost <= self.max_cost {
            return None;
        }

        match self.entries_tail {
            Some(t) => Some(self.become_empty(t)),
            None => panic!("Not enough entries to explain cost"),
        }
    }

    /// Iterator visiting entries in most-recently-used order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        let mut ind = self.entries_head;
        std::iter::from_fn(move || {
            let next = ind?;
            let ret = self.entries[next].as_occupied();
            ind = ret.next;
            Some((&*ret.key, &ret.item))
        })
    }

    /// Iterator visiting entries in least-recently-used order, yielding the shared key so that callers can remove
    /// what they find.
    pub fn iter_lru(&self) -> impl Iterator<Item = (&Arc<K>, &V)> {
        let mut ind = self.entries_tail;
        std::iter::from_fn(move || {
            let next = ind?;
            let ret = self.entries[next].as_occupied();
            ind = ret.prev;
            Some((&ret.key, &ret.item))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use lru::LruCache;
    use proptest::prelude::*;

    /// Simple helper to build proptest strategies so that we can test the one-based base case against [LruCache].
    #[derive(Copy, Clone, Debug, Ord, Eq, PartialOrd, PartialEq)]
    enum CacheCommand {
        Put(u64, u64),
        Get(u64),
        Delete(u64),
    }

    fn cache_command_strat(
        max_key: std::ops::Range<u64>,
        max_value: std::ops::Range<u64>,
    ) -> prop::strategy::BoxedStrategy<CacheCommand> {
        proptest::prop_oneof![
            max_key.clone().prop_map(CacheCommand::Get),
            (max_key.clone(), max_value).prop_map(|(x, y)| CacheCommand::Put(x, y)),
            max_key.prop_map(CacheCommand::Delete),
        ]
        .boxed()
    }

    // When every item costs 1 and the owner evicts down to the budget after each insert, we get something exactly
    // equivalent to [LruCache].
    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            max_shrink_iters: 100000,
            ..Default::default()
        })]
        #[test]
        fn test_against_lru_cache_bounded(
            bound in 1..200u64,
            commands in prop::collection::vec(cache_command_strat(0..100, 0..10000), 0..2000)
        ) {
            let mut known_good = LruCache::<u64, u64>::new(bound as usize);
            let mut ours = CostBasedLru::<u64, u64>::new(bound);

            for c in commands {
                use CacheCommand::*;

                match c {
                    Get(k) => {
                        let left: Option<u64> = known_good.get(&k).cloned();
                        let right: Option<u64> = ours.get(&k).cloned();
                        prop_assert_eq!(left, right);
                    },
                    Put(k, v) => {
                        let replaced = ours.insert(Arc::new(k), v, 1);
                        while ours.pop_over_budget().is_some() {}
                        prop_assert_eq!(known_good.put(k, v), replaced);
                    },
                    Delete(k) => prop_assert_eq!(known_good.pop(&k), ours.remove(&k)),
                }

                let good_state = known_good.iter().map(|(k, v)| (*k, *v)).collect::<Vec<_>>();
                let our_state = ours.iter().map(|(k, v)| (*k, *v)).collect::<Vec<_>>();
                prop_assert_eq!(&good_state, &our_state);
                prop_assert_eq!(good_state.len() as u64, ours.current_cost());
            }
        }
    }

    #[test]
    fn test_eviction() {
        let mut cache = CostBasedLru::<u64, u64>::new(10);
        for i in 1..=5 {
            cache.insert(Arc::new(i), i, i);
        }

        let mut evicted = vec![];
        while let Some((k, _)) = cache.pop_over_budget() {
            evicted.push(*k);
        }
        assert_eq!(evicted, vec![1, 2, 3]);

        let state = cache
            .iter()
            .map(|x| (*x.0, *x.1))
            .collect::<Vec<(u64, u64)>>();
        assert_eq!(state, vec![(5, 5), (4, 4)]);
    }

    #[test]
    fn test_reads_refresh_recency() {
        let mut cache = CostBasedLru::<str, u32>::new(u64::MAX);
        cache.insert("a".into(), 1, 1);
        cache.insert("b".into(), 2, 1);
        cache.insert("c".into(), 3, 1);
        assert_eq!(cache.get("a"), Some(&1));

        let lru_order = cache.iter_lru().map(|(k, _)| k.to_string()).collect::<Vec<_>>();
        assert_eq!(lru_order, vec!["b", "c", "a"]);

        // Peeking leaves the order alone.
        assert_eq!(cache.peek("b"), Some(&2));
        assert_eq!(cache.pop_lru().map(|(k, v)| (k.to_string(), v)), Some(("b".to_string(), 2)));
    }

    #[test]
    fn test_set_cost() {
        let mut cache = CostBasedLru::<str, ()>::new(10);
        cache.insert("a".into(), (), 0);
        cache.insert("b".into(), (), 4);
        assert!(cache.set_cost("a", 9));
        assert_eq!(cache.current_cost(), 13);
        assert!(!cache.set_cost("missing", 1));

        // "a" is still the least recently used despite the cost update.
        let (k, _) = cache.pop_over_budget().expect("over budget");
        assert_eq!(&*k, "a");
        assert!(cache.pop_over_budget().is_none());
    }
}
