//! Core algorithms and data structures of ncdfuzz

use ahash::{AHashMap, AHashSet};
use std::hash::BuildHasher;

pub mod bitmap;
pub mod diversity;
pub mod novelty;

pub type HashMap<K, V> = AHashMap<K, V>;
pub type HashSet<V> = AHashSet<V>;

/// Seed used for every content and trace checksum.
pub const HASH_SEED: u64 = 0xa5b3_5705;

/// 64-bit hash of a byte buffer with an explicit seed. The same buffer and
/// seed always produce the same value across runs.
pub fn hash64(data: &[u8], seed: u64) -> u64 {
    ahash::RandomState::with_seeds(
        seed,
        seed ^ 0x9e37_79b9_7f4a_7c15,
        seed.rotate_left(17),
        seed.rotate_left(31),
    )
    .hash_one(data)
}
