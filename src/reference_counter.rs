//! Reference counting for decoded resources.
//!
//! The memory cache holds one acquisition for as long as a resource is resident, and every caller holds one through an
//! [Acquired] handle.  When the count drops to zero the resource is recycled, under the same lock that guards the
//! counts, so a resource can't be re-acquired halfway through being recycled.
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;

use ahash::RandomState;
use parking_lot::Mutex;

use crate::*;

pub struct ReferenceCounter<R> {
    /// Keyed by the address of the resource.  Entries are removed when they reach zero.
    counts: Mutex<HashMap<usize, usize, RandomState>>,
    _resource: PhantomData<fn(R)>,
}

fn identity<R>(resource: &Arc<R>) -> usize {
    Arc::as_ptr(resource) as *const () as usize
}

impl<R: Resource> ReferenceCounter<R> {
    pub fn new() -> ReferenceCounter<R> {
        ReferenceCounter {
            counts: Mutex::new(Default::default()),
            _resource: PhantomData,
        }
    }

    pub fn acquire(&self, resource: &Arc<R>) {
        self.acquire_times(resource, 1);
    }

    pub fn acquire_times(&self, resource: &Arc<R>, times: usize) {
        if times == 0 {
            return;
        }
        *self.counts.lock().entry(identity(resource)).or_insert(0) += times;
    }

    /// Acquire only if something else still holds the resource.  Fails once the count has reached zero, since the
    /// resource is then recycled or about to be.
    pub fn try_acquire(&self, resource: &Arc<R>) -> bool {
        match self.counts.lock().get_mut(&identity(resource)) {
            Some(count) => {
                *count += 1;
                true
            }
            None => false,
        }
    }

    /// Release one acquisition, recycling the resource if that was the last.  Returns whether it was recycled.
    ///
    /// # Panics
    ///
    /// If the resource isn't currently acquired.  That is always a double release somewhere.
    pub fn release(&self, resource: &Arc<R>) -> bool {
        let id = identity(resource);
        let mut counts = self.counts.lock();
        let count = match counts.get_mut(&id) {
            Some(c) => c,
            None => panic!("Released a resource which was not acquired"),
        };

        *count -= 1;
        if *count > 0 {
            return false;
        }

        counts.remove(&id);
        resource.recycle();
        true
    }

    /// Wrap a resource in a handle, acquiring it once for the lifetime of the handle.
    pub fn handle(self: &Arc<Self>, resource: Arc<R>) -> Acquired<R> {
        self.acquire(&resource);
        Acquired {
            resource,
            counter: self.clone(),
        }
    }

    /// Like [ReferenceCounter::handle], but only if the resource is still live.
    pub fn try_handle(self: &Arc<Self>, resource: Arc<R>) -> Option<Acquired<R>> {
        if !self.try_acquire(&resource) {
            return None;
        }
        Some(Acquired {
            resource,
            counter: self.clone(),
        })
    }

    pub fn count(&self, resource: &Arc<R>) -> usize {
        self.counts
            .lock()
            .get(&identity(resource))
            .copied()
            .unwrap_or(0)
    }

    /// How many distinct resources are currently acquired.
    pub fn tracked(&self) -> usize {
        self.counts.lock().len()
    }
}

impl<R: Resource> Default for ReferenceCounter<R> {
    fn default() -> Self {
        ReferenceCounter::new()
    }
}

/// One acquisition of a resource, released on drop.
pub struct Acquired<R: Resource> {
    resource: Arc<R>,
    counter: Arc<ReferenceCounter<R>>,
}

impl<R: Resource> Acquired<R> {
    pub fn resource(&self) -> &Arc<R> {
        &self.resource
    }
}

impl<R: Resource> Deref for Acquired<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.resource
    }
}

impl<R: Resource> Clone for Acquired<R> {
    fn clone(&self) -> Self {
        self.counter.handle(self.resource.clone())
    }
}

impl<R: Resource> Drop for Acquired<R> {
    fn drop(&mut self) {
        self.counter.release(&self.resource);
    }
}

impl<R: Resource + fmt::Debug> fmt::Debug for Acquired<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Acquired").field(&*self.resource).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    use crate::test_support::TestResource;

    #[test]
    fn test_recycles_at_zero() {
        let counter = ReferenceCounter::new();
        let res = TestResource::new("a", 10);
        counter.acquire_times(&res, 2);
        assert!(!counter.release(&res));
        assert_eq!(res.recycle_count(), 0);
        assert!(counter.release(&res));
        assert_eq!(res.recycle_count(), 1);
        assert_eq!(counter.tracked(), 0);
    }

    #[test]
    #[should_panic(expected = "not acquired")]
    fn test_double_release_panics() {
        let counter = ReferenceCounter::new();
        let res = TestResource::new("a", 10);
        counter.acquire(&res);
        counter.release(&res);
        counter.release(&res);
    }

    #[test]
    fn test_try_acquire_fails_after_recycle() {
        let counter = ReferenceCounter::new();
        let res = TestResource::new("a", 10);
        assert!(!counter.try_acquire(&res));
        counter.acquire(&res);
        assert!(counter.try_acquire(&res));
        assert_eq!(counter.count(&res), 2);
        counter.release(&res);
        counter.release(&res);
        assert!(!counter.try_acquire(&res));
        assert_eq!(res.recycle_count(), 1);
    }

    #[test]
    fn test_handles() {
        let counter = Arc::new(ReferenceCounter::new());
        let res = TestResource::new("a", 10);
        let first = counter.handle(res.clone());
        let second = first.clone();
        assert_eq!(counter.count(&res), 2);
        assert_eq!(second.label(), "a");

        drop(first);
        assert_eq!(res.recycle_count(), 0);
        drop(second);
        assert_eq!(res.recycle_count(), 1);
        assert!(counter.try_handle(res).is_none());
    }

    proptest! {
        // `recycle` fires exactly when the running count returns to zero, and never while the memory cache's
        // acquisition is outstanding.
        #[test]
        fn test_recycle_iff_zero(
            cache_resident in any::<bool>(),
            ops in prop::collection::vec(prop_oneof![(1..4usize).prop_map(Some), Just(None)], 0..200)
        ) {
            let counter = ReferenceCounter::new();
            let res = TestResource::new("r", 1);
            if cache_resident {
                counter.acquire(&res);
            }

            let mut held = 0usize;
            let mut expected_recycles = 0;
            for op in ops {
                match op {
                    Some(n) => {
                        counter.acquire_times(&res, n);
                        held += n;
                    }
                    None if held > 0 => {
                        held -= 1;
                        let recycled = counter.release(&res);
                        let should = held == 0 && !cache_resident;
                        prop_assert_eq!(recycled, should);
                        if should {
                            expected_recycles += 1;
                        }
                    }
                    None => {}
                }
                prop_assert_eq!(res.recycle_count(), expected_recycles);
            }

            if cache_resident {
                // Leaving the cache is the final release.
                prop_assert_eq!(counter.release(&res), held == 0);
            }
        }
    }
}
