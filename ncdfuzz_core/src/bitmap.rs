//! Coverage-map primitives: hit-count classification, trace simplification
//! and the word-wise counting helpers used by the status and triage paths.
//!
//! A raw trace holds one hit-count byte per edge. Classification buckets the
//! counts into eight logarithmic classes so that small count jitter does not
//! register as new behaviour; simplification drops counts entirely and is
//! only applied when triaging crashes and hangs.

const fn build_class_lookup8() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0usize;
    while i < 256 {
        table[i] = match i {
            0 => 0,
            1 => 1,
            2 => 2,
            3 => 4,
            4..=7 => 8,
            8..=15 => 16,
            16..=31 => 32,
            32..=127 => 64,
            _ => 128,
        };
        i += 1;
    }
    table
}

const fn build_class_lookup16() -> [u16; 65536] {
    let lookup8 = build_class_lookup8();
    let mut table = [0u16; 65536];
    let mut hi = 0usize;
    while hi < 256 {
        let mut lo = 0usize;
        while lo < 256 {
            table[(hi << 8) + lo] = ((lookup8[hi] as u16) << 8) | lookup8[lo] as u16;
            lo += 1;
        }
        hi += 1;
    }
    table
}

const fn build_simplify_lookup() -> [u8; 256] {
    let mut table = [128u8; 256];
    table[0] = 1;
    table
}

/// Per-byte hit-count classes: {0, 1, 2, 4, 8, 16, 32, 64, 128}, each a
/// single set bit identifying the bucket for that edge.
pub static COUNT_CLASS_LOOKUP8: [u8; 256] = build_class_lookup8();

/// Two-byte variant of [`COUNT_CLASS_LOOKUP8`] for word-at-a-time work.
pub static COUNT_CLASS_LOOKUP16: [u16; 65536] = build_class_lookup16();

static SIMPLIFY_LOOKUP: [u8; 256] = build_simplify_lookup();

#[inline]
pub(crate) fn word_at(bytes: &[u8]) -> u64 {
    let mut w = [0u8; 8];
    w.copy_from_slice(bytes);
    u64::from_ne_bytes(w)
}

#[inline]
fn word32_at(bytes: &[u8]) -> u32 {
    let mut w = [0u8; 4];
    w.copy_from_slice(bytes);
    u32::from_ne_bytes(w)
}

/// Classify all eight hit counts of one trace word.
#[inline]
pub fn classify_word(word: u64) -> u64 {
    let bytes = word.to_ne_bytes();
    let mut out = [0u8; 8];
    let mut i = 0;
    while i < 8 {
        let half = u16::from_ne_bytes([bytes[i], bytes[i + 1]]);
        let class = COUNT_CLASS_LOOKUP16[half as usize].to_ne_bytes();
        out[i] = class[0];
        out[i + 1] = class[1];
        i += 2;
    }
    u64::from_ne_bytes(out)
}

/// Bucket all hit counts of `trace` in place. Runs after every execution,
/// so zero words are skipped without a store.
pub fn classify_counts(trace: &mut [u8]) {
    debug_assert_eq!(trace.len() % 8, 0);
    for chunk in trace.chunks_exact_mut(8) {
        let word = word_at(chunk);
        if word != 0 {
            chunk.copy_from_slice(&classify_word(word).to_ne_bytes());
        }
    }
}

/// Destructively drop hit-count information: a hit edge becomes 128, an
/// unhit edge becomes 1. Only used when gating crashes and timeouts.
pub fn simplify_trace(trace: &mut [u8]) {
    debug_assert_eq!(trace.len() % 8, 0);
    for chunk in trace.chunks_exact_mut(8) {
        if word_at(chunk) != 0 {
            for b in chunk.iter_mut() {
                *b = SIMPLIFY_LOOKUP[*b as usize];
            }
        } else {
            chunk.copy_from_slice(&[1u8; 8]);
        }
    }
}

/// Population count over the whole map. Called on the inverse cumulative
/// map, so the all-ones fast path dominates.
pub fn count_bits(map: &[u8]) -> u32 {
    debug_assert_eq!(map.len() % 4, 0);
    let mut ret = 0;
    for chunk in map.chunks_exact(4) {
        let v = word32_at(chunk);
        if v == 0xffff_ffff {
            ret += 32;
            continue;
        }
        ret += v.count_ones();
    }
    ret
}

/// Number of non-zero bytes in the map.
pub fn count_bytes(map: &[u8]) -> u32 {
    debug_assert_eq!(map.len() % 4, 0);
    let mut ret = 0;
    for chunk in map.chunks_exact(4) {
        if word32_at(chunk) == 0 {
            continue;
        }
        ret += chunk.iter().filter(|&&b| b != 0).count() as u32;
    }
    ret
}

/// Number of non-0xff bytes in the map, i.e. edges seen at least once when
/// called on a virgin map.
pub fn count_non_255_bytes(map: &[u8]) -> u32 {
    debug_assert_eq!(map.len() % 4, 0);
    let mut ret = 0;
    for chunk in map.chunks_exact(4) {
        if word32_at(chunk) == 0xffff_ffff {
            continue;
        }
        ret += chunk.iter().filter(|&&b| b != 0xff).count() as u32;
    }
    ret
}

/// Compact a trace to one bit per edge: bit `i` of `dst` is set iff byte
/// `i` of `src` is non-zero.
pub fn minimize_bits(dst: &mut [u8], src: &[u8]) {
    debug_assert!(dst.len() * 8 >= src.len());
    for (i, &b) in src.iter().enumerate() {
        if b != 0 {
            dst[i >> 3] |= 1 << (i & 7);
        }
    }
}

/// True if `trace` covers at least one edge that `covered` does not.
pub fn contains_new_cover(trace: &[u8], covered: &[u8]) -> bool {
    trace.iter().zip(covered).any(|(&t, &c)| t | c != c)
}

/// OR a minified trace into a cumulative one.
pub fn or_into(dst: &mut [u8], src: &[u8]) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d |= s;
    }
}

/// Edges set in a minified trace.
pub fn count_mini_bits(mini: &[u8]) -> u32 {
    mini.iter().map(|b| b.count_ones()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(0x1234_5678)
    }

    #[test]
    fn class_lookup_boundaries() {
        let cases = [
            (0u8, 0u8),
            (1, 1),
            (2, 2),
            (3, 4),
            (4, 8),
            (7, 8),
            (8, 16),
            (15, 16),
            (16, 32),
            (31, 32),
            (32, 64),
            (127, 64),
            (128, 128),
            (255, 128),
        ];
        for (raw, class) in cases {
            assert_eq!(COUNT_CLASS_LOOKUP8[raw as usize], class, "count {}", raw);
        }
    }

    #[test]
    fn classify_matches_byte_table() {
        let mut rng = rng();
        let mut trace = vec![0u8; 4096];
        rng.fill_bytes(&mut trace);
        let expected: Vec<u8> = trace
            .iter()
            .map(|&b| COUNT_CLASS_LOOKUP8[b as usize])
            .collect();
        classify_counts(&mut trace);
        assert_eq!(trace, expected);
    }

    #[test]
    fn classified_values_are_single_bits() {
        let mut trace: Vec<u8> = (0u16..256).map(|b| b as u8).collect();
        classify_counts(&mut trace);
        for &b in &trace[1..] {
            assert!(b.is_power_of_two());
        }
        assert_eq!(trace[0], 0);
    }

    #[test]
    fn simplify_marks_hits_only() {
        let mut rng = rng();
        let mut trace = vec![0u8; 512];
        rng.fill_bytes(&mut trace);
        let orig = trace.clone();
        simplify_trace(&mut trace);
        for (s, o) in trace.iter().zip(orig.iter()) {
            assert_eq!(*s, if *o != 0 { 128 } else { 1 });
        }
        // A second pass keeps every hit byte pinned at 128.
        let first = trace.clone();
        simplify_trace(&mut trace);
        for (s, f) in trace.iter().zip(first.iter()) {
            if *f == 128 {
                assert_eq!(*s, 128);
            }
        }
    }

    #[test]
    fn counts_match_naive_reference() {
        let mut rng = rng();
        for len in [64usize, 256, 4096] {
            let mut map = vec![0u8; len];
            rng.fill_bytes(&mut map);
            // Mix in full and empty words so both fast paths are exercised.
            map[0..8].fill(0xff);
            map[8..16].fill(0x00);

            let naive_bits: u32 = map.iter().map(|b| b.count_ones()).sum();
            let naive_bytes = map.iter().filter(|&&b| b != 0).count() as u32;
            let naive_non_255 = map.iter().filter(|&&b| b != 0xff).count() as u32;

            assert_eq!(count_bits(&map), naive_bits);
            assert_eq!(count_bytes(&map), naive_bytes);
            assert_eq!(count_non_255_bytes(&map), naive_non_255);
        }
    }

    #[test]
    fn minimize_sets_exactly_the_hit_bits() {
        let mut rng = rng();
        let mut src = vec![0u8; 256];
        rng.fill_bytes(&mut src);
        let mut dst = vec![0u8; 32];
        minimize_bits(&mut dst, &src);
        for (i, &b) in src.iter().enumerate() {
            let bit = dst[i >> 3] >> (i & 7) & 1;
            assert_eq!(bit == 1, b != 0, "edge {}", i);
        }
    }

    #[test]
    fn mini_trace_cover_ops() {
        let a = [0b0000_0011u8, 0];
        let b = [0b0000_0001u8, 0];
        assert!(contains_new_cover(&a, &b));
        assert!(!contains_new_cover(&b, &a));
        let mut acc = b;
        or_into(&mut acc, &a);
        assert_eq!(acc, a);
        assert_eq!(count_mini_bits(&a), 2);
    }
}
