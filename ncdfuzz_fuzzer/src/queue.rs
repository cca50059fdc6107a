//! The queue-entry arena and the content-hash index over it.
//!
//! Entries are created once and live for the whole campaign; an eviction
//! reuses the storage slot instead of freeing it, so `EntryId`s stay
//! stable. Edge slots and hash buckets refer to entries by id only.

use anyhow::Context;
use ncdfuzz_core::HashMap;
use std::fs;
use std::path::PathBuf;

pub type EntryId = usize;

/// A kept test case with its measurements and flags.
#[derive(Debug, Clone, Default)]
pub struct QueueEntry {
    /// On-disk location of the test case.
    pub fname: PathBuf,
    /// Raw bytes; empty when the in-memory cache skipped this entry.
    pub testcase_buf: Vec<u8>,
    /// Input length in bytes.
    pub len: usize,
    /// Content hash of the input bytes.
    pub input_hash: u64,
    /// Checksum of the classified trace; 0 means stale.
    pub exec_cksum: u64,
    /// One bit per edge this entry covers, any bucket.
    pub trace_mini: Vec<u8>,
    /// Cached LZ4 length of the diversity atom; 0 means stale.
    pub compressed_len: u32,
    /// Reservoir slot owning this entry, if any.
    pub edge_slot: Option<usize>,
    /// Number of other queue entries with the same content hash.
    pub duplicates: u32,
    /// Deterministic stages already done.
    pub passed_det: bool,
    /// Input-behaviour partition assigned by hashfuzz.
    pub hashfuzz_class: u8,
    pub favored: bool,
    pub ncdm_favored: bool,
    pub was_fuzzed: bool,
    pub fuzz_level: u32,
    pub has_new_cov: bool,
    pub disabled: bool,
    // Calibration outputs.
    pub cal_failed: bool,
    pub exec_us: u64,
    pub bitmap_size: u32,
    pub handicap: u64,
}

/// Queue entries sharing one content hash.
#[derive(Debug)]
pub struct InputHashBucket {
    pub entries: Vec<EntryId>,
}

#[derive(Debug, Default)]
pub struct Queue {
    pub entries: Vec<QueueEntry>,
    input_hashes: HashMap<u64, InputHashBucket>,
    /// Per-edge best entry as ranked by the scheduler.
    pub top_rated: Vec<Option<EntryId>>,
    pub queued_favored: u64,
    pub queued_with_cov: u64,
}

impl Queue {
    pub fn new(map_size: usize) -> Self {
        Self {
            entries: Vec::new(),
            input_hashes: HashMap::new(),
            top_rated: vec![None; map_size],
            queued_favored: 0,
            queued_with_cov: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a fresh entry; the returned id stays valid for the campaign.
    pub fn add(
        &mut self,
        fname: PathBuf,
        len: usize,
        passed_det: bool,
        hashfuzz_class: u8,
        exec_cksum: u64,
    ) -> EntryId {
        let id = self.entries.len();
        self.entries.push(QueueEntry {
            fname,
            len,
            passed_det,
            hashfuzz_class,
            exec_cksum,
            ..QueueEntry::default()
        });
        id
    }

    pub fn hash_bucket(&self, hash: u64) -> Option<&InputHashBucket> {
        self.input_hashes.get(&hash)
    }

    /// Register `id` under `hash` and refresh every member's duplicate
    /// count to the new bucket size minus one.
    pub fn hash_insert(&mut self, hash: u64, id: EntryId) {
        let bucket = self
            .input_hashes
            .entry(hash)
            .or_insert_with(|| InputHashBucket {
                entries: Vec::with_capacity(8),
            });
        bucket.entries.push(id);
        let dups = (bucket.entries.len() - 1) as u32;
        for &member in bucket.entries.iter() {
            self.entries[member].duplicates = dups;
        }
    }

    /// Drop `id` from its bucket. Later members shift down, so insertion
    /// order is preserved; the remaining duplicate counts are refreshed.
    pub fn hash_remove(&mut self, hash: u64, id: EntryId) {
        let empty = {
            let bucket = match self.input_hashes.get_mut(&hash) {
                Some(bucket) => bucket,
                None => panic!("input-hash bucket missing for {:#018x}", hash),
            };
            let pos = match bucket.entries.iter().position(|&member| member == id) {
                Some(pos) => pos,
                None => panic!("entry {} not in input-hash bucket {:#018x}", id, hash),
            };
            bucket.entries.remove(pos);
            let dups = bucket.entries.len().saturating_sub(1) as u32;
            for &member in bucket.entries.iter() {
                self.entries[member].duplicates = dups;
            }
            bucket.entries.is_empty()
        };
        if empty {
            self.input_hashes.remove(&hash);
        }
    }

    /// Flip an entry's favored flag, keeping the campaign counter in step.
    pub fn set_favored(&mut self, id: EntryId, favored: bool) {
        let entry = &mut self.entries[id];
        if entry.favored == favored {
            return;
        }
        entry.favored = favored;
        if favored {
            self.queued_favored += 1;
        } else {
            self.queued_favored = self.queued_favored.saturating_sub(1);
        }
    }

    /// Ids of entries still eligible for fuzzing.
    pub fn live_indices(&self) -> Vec<EntryId> {
        (0..self.entries.len())
            .filter(|&id| !self.entries[id].disabled)
            .collect()
    }

    /// Bytes of `id`, re-read from disk when the cache skipped the entry.
    pub fn testcase_get(&mut self, id: EntryId) -> anyhow::Result<&[u8]> {
        if self.entries[id].testcase_buf.is_empty() && self.entries[id].len > 0 {
            let data = fs::read(&self.entries[id].fname).with_context(|| {
                format!(
                    "failed to read back test case {}",
                    self.entries[id].fname.display()
                )
            })?;
            self.entries[id].testcase_buf = data;
        }
        Ok(&self.entries[id].testcase_buf)
    }

    /// Check the hash index against the arena; used by tests and debug
    /// assertions. Every bucket member's duplicate count must equal the
    /// bucket size minus one, and ids must be unique per bucket.
    pub fn check_hash_index(&self) -> bool {
        for (hash, bucket) in self.input_hashes.iter() {
            if bucket.entries.is_empty() {
                return false;
            }
            let dups = (bucket.entries.len() - 1) as u32;
            for &member in bucket.entries.iter() {
                let entry = &self.entries[member];
                if entry.input_hash != *hash || entry.duplicates != dups {
                    return false;
                }
            }
            let mut seen = bucket.entries.clone();
            seen.sort_unstable();
            seen.dedup();
            if seen.len() != bucket.entries.len() {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_with_entries(n: usize) -> Queue {
        let mut queue = Queue::new(64);
        for i in 0..n {
            let id = queue.add(PathBuf::from(format!("id:{:06}", i)), 4, false, 0, 0);
            queue.entries[id].input_hash = 0xabc;
        }
        queue
    }

    #[test]
    fn insert_updates_every_duplicate_count() {
        let mut queue = queue_with_entries(3);
        queue.hash_insert(0xabc, 0);
        assert_eq!(queue.entries[0].duplicates, 0);
        queue.hash_insert(0xabc, 1);
        queue.hash_insert(0xabc, 2);
        for id in 0..3 {
            assert_eq!(queue.entries[id].duplicates, 2);
        }
        assert!(queue.check_hash_index());
    }

    #[test]
    fn remove_preserves_order_and_refreshes_counts() {
        let mut queue = queue_with_entries(3);
        for id in 0..3 {
            queue.hash_insert(0xabc, id);
        }
        queue.hash_remove(0xabc, 1);
        let bucket = queue.hash_bucket(0xabc).expect("bucket should remain");
        assert_eq!(bucket.entries, vec![0, 2]);
        assert_eq!(queue.entries[0].duplicates, 1);
        assert_eq!(queue.entries[2].duplicates, 1);
        assert!(queue.check_hash_index());
    }

    #[test]
    fn emptied_buckets_disappear() {
        let mut queue = queue_with_entries(1);
        queue.hash_insert(0xabc, 0);
        queue.hash_remove(0xabc, 0);
        assert!(queue.hash_bucket(0xabc).is_none());
    }

    #[test]
    fn favored_counter_follows_the_flag() {
        let mut queue = queue_with_entries(2);
        queue.set_favored(0, true);
        queue.set_favored(1, true);
        assert_eq!(queue.queued_favored, 2);
        // Re-marking does not double count.
        queue.set_favored(0, true);
        assert_eq!(queue.queued_favored, 2);
        queue.set_favored(0, false);
        assert_eq!(queue.queued_favored, 1);
        assert!(!queue.entries[0].favored);
        assert!(queue.entries[1].favored);
    }

    #[test]
    fn disabled_entries_drop_out_of_the_live_set() {
        let mut queue = queue_with_entries(3);
        queue.entries[1].disabled = true;
        assert_eq!(queue.live_indices(), vec![0, 2]);
    }

    #[test]
    #[should_panic(expected = "not in input-hash bucket")]
    fn removing_a_stranger_panics() {
        let mut queue = queue_with_entries(2);
        queue.hash_insert(0xabc, 0);
        queue.hash_remove(0xabc, 1);
    }
}
