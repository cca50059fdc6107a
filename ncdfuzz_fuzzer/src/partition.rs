//! Input-behaviour partitions per execution path.
//!
//! In hashfuzz mode every input falls into one of up to 64 partitions. The
//! store remembers, per execution path, which partitions have produced an
//! input already, so the keep decision can favour behavioural variety even
//! without new coverage.

use ncdfuzz_core::{hash64, HashMap, HASH_SEED};

#[derive(Debug, Default, Clone, Copy)]
struct PartitionSet {
    found: u64,
    count: u8,
}

/// Partitions observed per path, keyed by the unclassified trace checksum.
#[derive(Debug, Default)]
pub struct PathPartitions {
    paths: HashMap<u64, PartitionSet>,
}

impl PathPartitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, cksum: u64) -> bool {
        self.paths.contains_key(&cksum)
    }

    /// Register `(cksum, partition)`. Returns how many partitions were known
    /// for the path beforehand, or `None` when the pair was already seen.
    pub fn check_if_new_partition(&mut self, cksum: u64, partition: u8) -> Option<u8> {
        let bit = 1u64 << partition;
        let set = self.paths.entry(cksum).or_default();
        if set.found & bit != 0 {
            return None;
        }
        let known = set.count;
        set.found |= bit;
        set.count += 1;
        log::debug!("new partition {:03} for path {:020}", partition, cksum);
        Some(known)
    }

    /// Dump the partition table through the log facade.
    pub fn dump(&self) {
        for (cksum, set) in self.paths.iter() {
            log::debug!(
                "path {:020}: {} partitions, mask {:#018x}",
                cksum,
                set.count,
                set.found
            );
        }
    }
}

/// Input-based partition classification.
pub fn hashfuzz_classify(input: &[u8], partitions: u8) -> u8 {
    (hash64(input, HASH_SEED) % u64::from(partitions)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_register_once_per_path() {
        let mut store = PathPartitions::new();
        assert!(!store.contains(42));
        assert_eq!(store.check_if_new_partition(42, 3), Some(0));
        assert!(store.contains(42));
        assert_eq!(store.check_if_new_partition(42, 3), None);
        assert_eq!(store.check_if_new_partition(42, 7), Some(1));
        assert_eq!(store.check_if_new_partition(42, 0), Some(2));
        // Another path starts from scratch.
        assert_eq!(store.check_if_new_partition(43, 3), Some(0));
    }

    #[test]
    fn classify_stays_in_range() {
        for partitions in [1u8, 2, 16, 64] {
            for input in [&b"a"[..], b"bc", b"defg", b""] {
                assert!(hashfuzz_classify(input, partitions) < partitions);
            }
        }
    }
}
