//! Whiteout hash set of one merge pass.
//!
//! Names are placed into a fixed number of buckets chosen at construction. The
//! set never resizes; a directory with far more names than expected only gets
//! deeper buckets.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::branch::BIndex;

/// Bucket count when nothing better is known.
pub const RDHASH_DEFAULT: usize = 32;

const MIN_BUCKETS: usize = 8;
const MAX_BUCKETS: usize = 1 << 16;
/// Average bucket depth aimed for when sizing from an expected count.
const TARGET_DEPTH: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhEntry {
    pub name: Vec<u8>,
    /// Branch the name was first seen on.
    pub bindex: BIndex,
    /// The first occurrence was a whiteout.
    pub whiteout: bool,
}

#[derive(Debug)]
pub struct WhiteoutSet {
    buckets: Vec<Vec<WhEntry>>,
    len: usize,
}

impl WhiteoutSet {
    /// A set sized for about `expected` names.
    pub fn new(expected: usize) -> Self {
        Self::with_buckets(nbuckets_for(expected))
    }

    pub fn with_buckets(nbuckets: usize) -> Self {
        let nbuckets = nbuckets.clamp(1, MAX_BUCKETS);
        WhiteoutSet {
            buckets: (0..nbuckets).map(|_| Vec::new()).collect(),
            len: 0,
        }
    }

    pub fn nbuckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert `name` unless present. Returns true if it was newly inserted.
    pub fn test_and_insert(&mut self, name: &[u8], bindex: BIndex, whiteout: bool) -> bool {
        let bucket = self.bucket(name);
        let entries = &mut self.buckets[bucket];
        if entries.iter().any(|e| e.name == name) {
            return false;
        }
        entries.push(WhEntry {
            name: name.to_vec(),
            bindex,
            whiteout,
        });
        self.len += 1;
        true
    }

    pub fn get(&self, name: &[u8]) -> Option<&WhEntry> {
        self.buckets[self.bucket(name)]
            .iter()
            .find(|e| e.name == name)
    }

    pub fn contains(&self, name: &[u8]) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WhEntry> {
        self.buckets.iter().flatten()
    }

    /// Deepest bucket, for diagnostics.
    pub fn max_depth(&self) -> usize {
        self.buckets.iter().map(Vec::len).max().unwrap_or(0)
    }

    fn bucket(&self, name: &[u8]) -> usize {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        (hasher.finish() % self.buckets.len() as u64) as usize
    }
}

/// Bucket count for `expected` names; zero falls back to [`RDHASH_DEFAULT`].
pub fn nbuckets_for(expected: usize) -> usize {
    if expected == 0 {
        return RDHASH_DEFAULT;
    }
    expected
        .div_ceil(TARGET_DEPTH)
        .next_power_of_two()
        .clamp(MIN_BUCKETS, MAX_BUCKETS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_insert_wins() {
        let mut set = WhiteoutSet::new(0);
        assert_eq!(set.nbuckets(), RDHASH_DEFAULT);
        assert!(set.test_and_insert(b"b", 0, true));
        assert!(!set.test_and_insert(b"b", 1, false));
        assert!(set.test_and_insert(b"a", 1, false));
        assert_eq!(set.len(), 2);

        let b = set.get(b"b").unwrap();
        assert_eq!(b.bindex, 0);
        assert!(b.whiteout);
        assert!(set.contains(b"a"));
        assert!(!set.contains(b"c"));
        assert_eq!(set.iter().count(), 2);
    }

    #[test]
    fn test_sizing() {
        assert_eq!(nbuckets_for(1), MIN_BUCKETS);
        assert_eq!(nbuckets_for(1000), 256);
        assert_eq!(nbuckets_for(usize::MAX / 2), MAX_BUCKETS);
        assert_eq!(WhiteoutSet::with_buckets(0).nbuckets(), 1);
    }

    #[test]
    fn test_single_bucket_still_dedups() {
        let mut set = WhiteoutSet::with_buckets(1);
        for i in 0..100u32 {
            assert!(set.test_and_insert(i.to_string().as_bytes(), 0, false));
        }
        for i in 0..100u32 {
            assert!(!set.test_and_insert(i.to_string().as_bytes(), 1, false));
        }
        assert_eq!(set.max_depth(), 100);
    }
}
