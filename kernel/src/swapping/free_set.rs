use alloc::{vec, vec::Vec};

/// Keeps track of a set of slots, some of which can be free and some of which can be allocated.
///
/// Fast operations are:
///   - Find a free slot, and mark it as allocated
///   - Mark a (previously-allocated) slot as free.
///
/// A set bit in `bitmap` marks a free slot. `queue` lists the groups of 64
/// that still have a free slot. Uses roughly 1.1 bits per available slot.
#[derive(Debug, Clone)]
pub struct FreeSet {
    bitmap: Vec<u64>,
    queue: Vec<u32>,
    free_count: u32,
}

impl FreeSet {
    /// Create a new FreeSet with all slots allocated.
    pub fn new_all_allocated(count: u32) -> Self {
        let group_count = count.div_ceil(64) as usize;
        Self {
            bitmap: vec![0; group_count],
            queue: Vec::with_capacity(group_count),
            free_count: 0,
        }
    }

    /// Create a new FreeSet with all `count` slots free. Allocation starts at slot 0.
    pub fn new_all_free(count: u32) -> Self {
        let mut set = Self::new_all_allocated(count);
        for index in (0..count).rev() {
            set.free(index);
        }
        set
    }

    pub fn free_count(&self) -> u32 {
        self.free_count
    }

    pub fn is_free(&self, index: u32) -> bool {
        self.bitmap
            .get((index / 64) as usize)
            .is_some_and(|group| group & (1 << (index % 64)) != 0)
    }

    /// Allocate a slot.
    ///
    /// Returns `None` if no slots are available.
    ///
    /// This takes *O(1)* time.
    pub fn allocate(&mut self) -> Option<u32> {
        let group_index = self.queue.pop()?;
        let group = &mut self.bitmap[group_index as usize];
        debug_assert_ne!(*group, 0, "FreeSet consistency error");
        let index_in_group = group.trailing_zeros();
        *group &= !(1 << index_in_group);
        if *group != 0 {
            self.queue.push(group_index);
        }
        self.free_count -= 1;
        Some(group_index * 64 + index_in_group)
    }

    /// Free a slot.
    ///
    /// Panics if the slot is already free, since that means two owners
    /// believed they held it.
    ///
    /// This takes *O(1)* time.
    pub fn free(&mut self, index: u32) {
        let group_index = index / 64;
        let index_in_group = index % 64;
        let group = &mut self.bitmap[group_index as usize];
        assert!(
            (*group & (1 << index_in_group)) == 0,
            "FreeSet::free called on already free slot {index}"
        );
        let add = *group == 0;
        *group |= 1 << index_in_group;
        if add {
            self.queue.push(group_index);
        }
        self.free_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    #[test]
    fn allocates_in_order_from_fresh_set() {
        let mut set = FreeSet::new_all_free(130);
        assert_eq!(set.free_count(), 130);
        for expected in 0..130 {
            assert_eq!(set.allocate(), Some(expected));
        }
        assert_eq!(set.allocate(), None);
        assert_eq!(set.free_count(), 0);
    }

    #[test]
    fn freed_slots_come_back() {
        let mut set = FreeSet::new_all_free(3);
        let a = set.allocate().unwrap();
        let b = set.allocate().unwrap();
        set.free(a);
        assert!(set.is_free(a));
        assert!(!set.is_free(b));
        assert_eq!(set.allocate(), Some(a));
    }

    #[test]
    #[should_panic]
    fn double_free_panics() {
        let mut set = FreeSet::new_all_free(8);
        set.free(3);
    }

    #[test]
    fn random_churn_never_hands_out_a_slot_twice() {
        let mut rng = SmallRng::seed_from_u64(42);
        let mut set = FreeSet::new_all_free(200);
        let mut held = Vec::new();
        for _ in 0..2000 {
            if rng.gen_bool(0.55) {
                if let Some(slot) = set.allocate() {
                    assert!(!held.contains(&slot));
                    held.push(slot);
                }
            } else if !held.is_empty() {
                let slot = held.swap_remove(rng.gen_range(0..held.len()));
                set.free(slot);
            }
            assert_eq!(set.free_count() as usize + held.len(), 200);
        }
    }
}
