//! Bounded per-loop slot map
//!
//! Both the hybrid lock (wake-up signals) and the metrics recorder (async
//! guards) keep one primitive per event loop. Slots are created lazily under
//! a single registry mutex, so two tasks racing on the same loop always get
//! the same `Arc`. When the map grows past its capacity, idle slots (no
//! outstanding `Arc` outside the registry) are evicted least-recently-used
//! first. Owners can also evict a loop explicitly when it is torn down.

use crate::io::context::LoopId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Default number of loop slots kept before idle ones are swept
pub const DEFAULT_LOOP_CAPACITY: usize = 64;

struct Slot<T> {
    value: Arc<T>,
    last_used: u64,
}

struct Slots<T> {
    map: HashMap<LoopId, Slot<T>>,
    tick: u64,
}

pub struct LoopRegistry<T> {
    slots: Mutex<Slots<T>>,
    capacity: usize,
}

impl<T: Default> LoopRegistry<T> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_LOOP_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(Slots {
                map: HashMap::new(),
                tick: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    /// Get the slot for `id`, creating it on first use
    pub fn get_or_create(&self, id: LoopId) -> Arc<T> {
        let mut slots = self.lock();
        slots.tick += 1;
        let tick = slots.tick;

        if let Some(slot) = slots.map.get_mut(&id) {
            slot.last_used = tick;
            return Arc::clone(&slot.value);
        }

        let value = Arc::new(T::default());
        slots.map.insert(
            id,
            Slot {
                value: Arc::clone(&value),
                last_used: tick,
            },
        );
        if slots.map.len() > self.capacity {
            Self::sweep(&mut slots.map, self.capacity, id);
        }
        value
    }
}

impl<T> LoopRegistry<T> {
    fn lock(&self) -> std::sync::MutexGuard<'_, Slots<T>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Drops idle slots, oldest first, until the map fits. Slots still
    // referenced by a waiter are kept even if that leaves the map over
    // capacity; they become idle as soon as the waiter finishes.
    fn sweep(map: &mut HashMap<LoopId, Slot<T>>, capacity: usize, keep: LoopId) {
        let mut idle: Vec<(u64, LoopId)> = map
            .iter()
            .filter(|(id, slot)| **id != keep && Arc::strong_count(&slot.value) == 1)
            .map(|(id, slot)| (slot.last_used, *id))
            .collect();
        idle.sort_unstable_by_key(|(last_used, _)| *last_used);

        let excess = map.len().saturating_sub(capacity);
        for (_, id) in idle.into_iter().take(excess) {
            map.remove(&id);
        }
        tracing::trace!(slots = map.len(), "Swept idle loop slots");
    }

    /// Remove the slot for a loop that has been torn down
    pub fn evict(&self, id: LoopId) -> bool {
        self.lock().map.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every live slot
    pub fn for_each(&self, mut f: impl FnMut(&T)) {
        let values: Vec<Arc<T>> = self
            .lock()
            .map
            .values()
            .map(|slot| Arc::clone(&slot.value))
            .collect();
        for value in values {
            f(&value);
        }
    }

    pub fn clear(&self) {
        self.lock().map.clear();
    }
}

impl<T: Default> Default for LoopRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn loop_ids(n: usize) -> Vec<LoopId> {
        (0..n)
            .map(|_| thread::spawn(LoopId::current).join().unwrap())
            .collect()
    }

    #[test]
    fn test_same_loop_gets_same_slot() {
        let registry: LoopRegistry<AtomicUsize> = LoopRegistry::new();
        let id = LoopId::current();
        let a = registry.get_or_create(id);
        let b = registry.get_or_create(id);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_creation_is_single() {
        let registry: Arc<LoopRegistry<AtomicUsize>> = Arc::new(LoopRegistry::new());
        let id = LoopId::current();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    registry.get_or_create(id).fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get_or_create(id).load(Ordering::SeqCst), 16);
    }

    #[test]
    fn test_idle_slots_do_not_accumulate() {
        let registry: LoopRegistry<AtomicUsize> = LoopRegistry::with_capacity(4);
        for id in loop_ids(50) {
            let _slot = registry.get_or_create(id);
        }
        assert!(registry.len() <= 4, "registry grew to {}", registry.len());
    }

    #[test]
    fn test_busy_slots_survive_sweep() {
        let registry: LoopRegistry<AtomicUsize> = LoopRegistry::with_capacity(2);
        let ids = loop_ids(3);
        let held = registry.get_or_create(ids[0]);
        registry.get_or_create(ids[1]);
        registry.get_or_create(ids[2]);

        // ids[0] is still referenced, so the idle ids[1] was dropped instead
        let again = registry.get_or_create(ids[0]);
        assert!(Arc::ptr_eq(&held, &again));
    }

    #[test]
    fn test_explicit_evict() {
        let registry: LoopRegistry<AtomicUsize> = LoopRegistry::new();
        let id = LoopId::current();
        registry.get_or_create(id);
        assert!(registry.evict(id));
        assert!(!registry.evict(id));
        assert!(registry.is_empty());
    }
}
