//! Hash table.
//!
//! A standard open-chaining hash set: an element's hash selects a bucket and
//! the bucket is searched linearly. Two elements are the same entry when
//! neither is less than the other.
//!
//! The table stores elements by value but is meant for small handles (a key
//! plus an index, say) whose backing storage the caller owns. Dropping the
//! table drops the handles, never what they refer to.
//!
//! The bucket count is kept at a power of two of at least 4, aiming for two
//! elements per bucket. It is recomputed after every insertion or removal.
//!
//! Mutating the table while walking it is ruled out: [`HashIndex::iter`] and
//! [`HashIndex::for_each`] borrow the table, and a detached [`Cursor`] is
//! refused with [`StaleCursor`] once the table has changed under it.

use alloc::{collections::TryReserveError, vec::Vec};
use core::{fmt, iter::Flatten, mem, slice};
use log::warn;

/// Computes the hash of an element, with auxiliary data.
pub type HashFn<E, A> = fn(&E, &A) -> u64;

/// Returns whether `a` orders before `b`, with auxiliary data.
pub type LessFn<E, A> = fn(&E, &E, &A) -> bool;

const MIN_BUCKETS: usize = 4;
/// Ideal elements per bucket.
const BEST_ELEMS_PER_BUCKET: usize = 2;

pub struct HashIndex<E, A = ()> {
    buckets: Vec<Vec<E>>,
    elem_cnt: usize,
    hash: HashFn<E, A>,
    less: LessFn<E, A>,
    aux: A,
    /// Bumped by every mutation; cursors remember the value they started at.
    generation: u64,
}

/// A detached position in a [`HashIndex`] walk.
#[derive(Debug, Clone)]
pub struct Cursor {
    generation: u64,
    bucket: usize,
    index: usize,
}

impl Cursor {
    /// Moves the cursor back to the first element.
    pub fn rewind(&mut self) {
        self.bucket = 0;
        self.index = 0;
    }
}

/// The table was modified after the cursor was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleCursor;

impl fmt::Display for StaleCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hash index modified during iteration")
    }
}

impl core::error::Error for StaleCursor {}

pub struct Iter<'a, E> {
    inner: Flatten<slice::Iter<'a, Vec<E>>>,
}

impl<'a, E> Iterator for Iter<'a, E> {
    type Item = &'a E;

    fn next(&mut self) -> Option<&'a E> {
        self.inner.next()
    }
}

impl<E, A> HashIndex<E, A> {
    /// Creates an empty table that hashes with `hash`, compares with `less`
    /// and hands `aux` to both.
    ///
    /// # Errors
    ///
    /// Fails if the initial bucket array cannot be allocated.
    pub fn try_new(hash: HashFn<E, A>, less: LessFn<E, A>, aux: A) -> Result<Self, TryReserveError> {
        let mut buckets = Vec::new();
        buckets.try_reserve_exact(MIN_BUCKETS)?;
        buckets.resize_with(MIN_BUCKETS, Vec::new);
        Ok(Self {
            buckets,
            elem_cnt: 0,
            hash,
            less,
            aux,
            generation: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.elem_cnt
    }

    pub fn is_empty(&self) -> bool {
        self.elem_cnt == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn aux(&self) -> &A {
        &self.aux
    }

    /// Inserts `new` unless an equal element is present, in which case the
    /// table is left alone and the present element is returned.
    pub fn insert(&mut self, new: E) -> Option<&E> {
        let bucket = self.bucket_of(&new);
        if let Some(pos) = self.position(bucket, &new) {
            return Some(&self.buckets[bucket][pos]);
        }

        self.buckets[bucket].push(new);
        self.elem_cnt += 1;
        self.mutated();
        None
    }

    /// Inserts `new`, evicting and returning an equal element if present.
    pub fn replace(&mut self, new: E) -> Option<E> {
        let bucket = self.bucket_of(&new);
        let old = self
            .position(bucket, &new)
            .map(|pos| self.buckets[bucket].swap_remove(pos));

        self.buckets[bucket].push(new);
        if old.is_none() {
            self.elem_cnt += 1;
        }
        self.mutated();
        old
    }

    /// Returns the element equal to `probe`.
    pub fn find(&self, probe: &E) -> Option<&E> {
        let bucket = self.bucket_of(probe);
        self.position(bucket, probe)
            .map(|pos| &self.buckets[bucket][pos])
    }

    /// Removes and returns the element equal to `probe`.
    pub fn delete(&mut self, probe: &E) -> Option<E> {
        let bucket = self.bucket_of(probe);
        let pos = self.position(bucket, probe)?;
        let found = self.buckets[bucket].swap_remove(pos);
        self.elem_cnt -= 1;
        self.mutated();
        Some(found)
    }

    /// Removes every element, handing each to `destructor`.
    pub fn clear(&mut self, mut destructor: impl FnMut(E)) {
        for bucket in &mut self.buckets {
            for elem in bucket.drain(..) {
                destructor(elem);
            }
        }
        self.elem_cnt = 0;
        self.mutated();
    }

    /// Consumes the table, handing each element to `destructor`.
    pub fn destroy(mut self, destructor: impl FnMut(E)) {
        self.clear(destructor);
    }

    /// Calls `action` on every element, in no particular order.
    pub fn for_each(&self, mut action: impl FnMut(&E)) {
        for elem in self.iter() {
            action(elem);
        }
    }

    pub fn iter(&self) -> Iter<'_, E> {
        Iter {
            inner: self.buckets.iter().flatten(),
        }
    }

    /// Starts a walk that does not hold a borrow between steps.
    pub fn cursor(&self) -> Cursor {
        Cursor {
            generation: self.generation,
            bucket: 0,
            index: 0,
        }
    }

    /// Returns the element under `cursor` and moves past it, or `None` at the
    /// end of the table.
    ///
    /// # Errors
    ///
    /// Returns [`StaleCursor`] if the table changed since `cursor` was made.
    pub fn advance(&self, cursor: &mut Cursor) -> Result<Option<&E>, StaleCursor> {
        if cursor.generation != self.generation {
            return Err(StaleCursor);
        }
        while let Some(bucket) = self.buckets.get(cursor.bucket) {
            if let Some(elem) = bucket.get(cursor.index) {
                cursor.index += 1;
                return Ok(Some(elem));
            }
            cursor.bucket += 1;
            cursor.index = 0;
        }
        Ok(None)
    }

    fn bucket_of(&self, elem: &E) -> usize {
        let mask = self.buckets.len() as u64 - 1;
        ((self.hash)(elem, &self.aux) & mask) as usize
    }

    fn position(&self, bucket: usize, probe: &E) -> Option<usize> {
        self.buckets[bucket].iter().position(|elem| {
            !(self.less)(elem, probe, &self.aux) && !(self.less)(probe, elem, &self.aux)
        })
    }

    fn mutated(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.rehash();
    }

    /// Changes the bucket count to suit the element count.
    ///
    /// Failing to allocate the new buckets only makes lookups slower, so it
    /// is not an error.
    fn rehash(&mut self) {
        let new_bucket_cnt = ideal_bucket_count(self.elem_cnt);
        if new_bucket_cnt == self.buckets.len() {
            return;
        }

        let mut new_buckets: Vec<Vec<E>> = Vec::new();
        if new_buckets.try_reserve_exact(new_bucket_cnt).is_err() {
            warn!(
                "hash index: cannot allocate {new_bucket_cnt} buckets, staying at {}",
                self.buckets.len()
            );
            return;
        }
        new_buckets.resize_with(new_bucket_cnt, Vec::new);

        let mask = new_bucket_cnt as u64 - 1;
        for bucket in mem::take(&mut self.buckets) {
            for elem in bucket {
                let idx = ((self.hash)(&elem, &self.aux) & mask) as usize;
                new_buckets[idx].push(elem);
            }
        }
        self.buckets = new_buckets;
    }
}

/// Largest power of two not above `elem_cnt / 2`, and at least 4.
fn ideal_bucket_count(elem_cnt: usize) -> usize {
    let target = (elem_cnt / BEST_ELEMS_PER_BUCKET).max(MIN_BUCKETS);
    1 << (usize::BITS - 1 - target.leading_zeros())
}

// Fowler-Noll-Vo hash constants, for 64-bit word sizes.
const FNV_64_PRIME: u64 = 0x0000_0100_0000_01B3;
const FNV_64_BASIS: u64 = 0xcbf2_9ce4_8422_2325;

/// Returns a hash of the bytes in `buf`.
pub fn hash_bytes(buf: &[u8]) -> u64 {
    buf.iter().fold(FNV_64_BASIS, |hash, &byte| {
        hash.wrapping_mul(FNV_64_PRIME) ^ u64::from(byte)
    })
}

/// Returns a hash of string `s`.
pub fn hash_string(s: &str) -> u64 {
    hash_bytes(s.as_bytes())
}

/// Returns a hash of integer `i`.
pub fn hash_int(i: i32) -> u64 {
    hash_bytes(&i.to_ne_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    fn int_hash(e: &i32, _: &()) -> u64 {
        hash_int(*e)
    }

    fn int_less(a: &i32, b: &i32, _: &()) -> bool {
        a < b
    }

    fn int_index() -> HashIndex<i32> {
        HashIndex::try_new(int_hash, int_less, ()).unwrap()
    }

    /// Checks the bucket invariants of `index`.
    fn check_shape(index: &HashIndex<i32>) {
        let buckets = index.bucket_count();
        assert!(buckets.is_power_of_two());
        assert!(buckets >= 4);
        assert!(index.len() <= 4 * buckets, "average chain longer than 4");
        assert_eq!(index.iter().count(), index.len());
    }

    #[test]
    fn ideal_counts() {
        assert_eq!(ideal_bucket_count(0), 4);
        assert_eq!(ideal_bucket_count(9), 4);
        assert_eq!(ideal_bucket_count(16), 8);
        assert_eq!(ideal_bucket_count(31), 8);
        assert_eq!(ideal_bucket_count(32), 16);
        assert_eq!(ideal_bucket_count(1000), 256);
    }

    #[test]
    fn insert_keeps_existing_match() {
        let mut index = int_index();
        assert_eq!(index.insert(7), None);
        assert_eq!(index.insert(7), Some(&7));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn replace_evicts_existing_match() {
        let mut index = int_index();
        assert_eq!(index.replace(3), None);
        assert_eq!(index.replace(3), Some(3));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn find_and_delete() {
        let mut index = int_index();
        for i in 0..100 {
            assert!(index.insert(i).is_none());
        }
        for i in 0..100 {
            assert_eq!(index.find(&i), Some(&i));
        }
        assert_eq!(index.find(&100), None);
        assert_eq!(index.delete(&42), Some(42));
        assert_eq!(index.delete(&42), None);
        assert_eq!(index.find(&42), None);
        assert_eq!(index.len(), 99);
    }

    #[test]
    fn random_sequence_keeps_exact_count() {
        let mut rng = SmallRng::seed_from_u64(0x5eed);
        let mut index = int_index();
        let mut live = std::collections::BTreeSet::new();

        for _ in 0..5000 {
            let value = rng.gen_range(0..600);
            if rng.gen_bool(0.6) {
                let fresh = live.insert(value);
                assert_eq!(index.insert(value).is_none(), fresh);
            } else {
                let present = live.remove(&value);
                assert_eq!(index.delete(&value).is_some(), present);
            }
            assert_eq!(index.len(), live.len());
            check_shape(&index);
        }

        for value in live.iter() {
            assert_eq!(index.delete(value), Some(*value));
            check_shape(&index);
        }
        assert!(index.is_empty());
        assert_eq!(index.bucket_count(), 4);
    }

    #[test]
    fn grows_and_shrinks() {
        let mut index = int_index();
        for i in 0..64 {
            index.insert(i);
        }
        assert_eq!(index.bucket_count(), 32);
        for i in 0..64 {
            index.delete(&i);
        }
        assert_eq!(index.bucket_count(), 4);
    }

    #[test]
    fn clear_hands_out_every_element() {
        let mut index = int_index();
        for i in 0..40 {
            index.insert(i);
        }
        let mut seen = Vec::new();
        index.clear(|e| seen.push(e));
        seen.sort_unstable();
        assert_eq!(seen, (0..40).collect::<Vec<_>>());
        assert!(index.is_empty());
        assert_eq!(index.bucket_count(), 4);
    }

    #[test]
    fn for_each_visits_all() {
        let mut index = int_index();
        for i in 0..25 {
            index.insert(i * 3);
        }
        let mut sum = 0;
        index.for_each(|e| sum += e);
        assert_eq!(sum, (0..25).map(|i| i * 3).sum::<i32>());
    }

    #[test]
    fn cursor_walks_and_rewinds() {
        let mut index = int_index();
        for i in 0..10 {
            index.insert(i);
        }

        let mut cursor = index.cursor();
        let mut first = Vec::new();
        while let Some(e) = index.advance(&mut cursor).unwrap() {
            first.push(*e);
        }
        assert_eq!(first.len(), 10);

        cursor.rewind();
        let mut second = Vec::new();
        while let Some(e) = index.advance(&mut cursor).unwrap() {
            second.push(*e);
        }
        assert_eq!(first, second);
    }

    #[test]
    fn cursor_goes_stale_on_mutation() {
        let mut index = int_index();
        index.insert(1);
        index.insert(2);

        let mut cursor = index.cursor();
        assert!(index.advance(&mut cursor).unwrap().is_some());
        index.insert(3);
        assert_eq!(index.advance(&mut cursor), Err(StaleCursor));

        // A rejected duplicate insert does not count as a mutation.
        let mut cursor = index.cursor();
        index.insert(3);
        assert!(index.advance(&mut cursor).is_ok());
    }

    #[test]
    fn fnv_hashes() {
        assert_eq!(hash_bytes(&[]), FNV_64_BASIS);
        assert_eq!(hash_string("a"), FNV_64_BASIS.wrapping_mul(FNV_64_PRIME) ^ 0x61);
        assert_eq!(hash_int(5), hash_bytes(&5i32.to_ne_bytes()));
        assert_ne!(hash_int(1), hash_int(2));
    }
}
