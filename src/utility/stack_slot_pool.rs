//! Allocator for the per-thread windows in a stub's sysmsg area.

/// Hands out slot IDs in `[0, capacity)`.
///
/// Released IDs are reused before fresh ones, so the set of IDs in use stays
/// dense and the touched part of the sysmsg area stays small.
#[derive(Debug)]
pub struct StackSlotPool {
    capacity: u64,
    next_fresh: u64,
    released: Vec<u64>,
}

impl StackSlotPool {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            next_fresh: 0,
            released: Vec::new(),
        }
    }

    /// Returns `None` when all `capacity` slots are in use.
    pub fn get(&mut self) -> Option<u64> {
        if let Some(slot) = self.released.pop() {
            return Some(slot);
        }
        if self.next_fresh < self.capacity {
            let slot = self.next_fresh;
            self.next_fresh += 1;
            return Some(slot);
        }
        None
    }

    /// Panics if `slot` was never handed out or is released twice.
    pub fn put(&mut self, slot: u64) {
        assert!(slot < self.next_fresh, "slot {slot} was never allocated");
        assert!(
            !self.released.contains(&slot),
            "slot {slot} released twice"
        );
        self.released.push(slot);
    }

    pub fn in_use(&self) -> u64 {
        self.next_fresh - self.released.len() as u64
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rand::{Rng, SeedableRng};

    use super::*;

    #[test]
    fn test_exhaustion() {
        let mut pool = StackSlotPool::new(3);
        assert_eq!(pool.get(), Some(0));
        assert_eq!(pool.get(), Some(1));
        assert_eq!(pool.get(), Some(2));
        assert_eq!(pool.get(), None);
        pool.put(1);
        assert_eq!(pool.get(), Some(1));
        assert_eq!(pool.get(), None);
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn test_double_put() {
        let mut pool = StackSlotPool::new(2);
        let slot = pool.get().unwrap();
        pool.put(slot);
        pool.put(slot);
    }

    #[test]
    fn test_random_alloc_free_never_aliases() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let mut pool = StackSlotPool::new(32);
        let mut live = HashSet::new();
        for _ in 0..10_000 {
            if rng.gen_bool(0.55) {
                match pool.get() {
                    Some(slot) => {
                        assert!(slot < 32);
                        assert!(live.insert(slot), "slot {slot} handed out twice");
                    }
                    None => assert_eq!(live.len(), 32),
                }
            } else if let Some(&slot) = live.iter().next() {
                live.remove(&slot);
                pool.put(slot);
            }
            assert_eq!(pool.in_use(), live.len() as u64);
        }
    }
}
