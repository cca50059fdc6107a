//! The diversity kernel: Normalized Compression Distance over a set of
//! byte strings, plus a normalized Levenshtein distance for the two-entry
//! case.
//!
//! NCD uses LZ4 lengths as the complexity proxy. For a set E the score is
//! `(C(concat E) - min C(e)) / max C(E without one member)`, which grows as
//! members stop compressing against each other. The kernel owns a pair of
//! scratch buffers that only ever grow, so steady-state scoring does not
//! allocate.

use lz4_flex::block::{compress_into, get_maximum_output_size, CompressError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiversityError {
    #[error("lz4 compression failed: {0}")]
    Compress(#[from] CompressError),
}

/// Amortized scratch state for compression-based scoring.
#[derive(Debug, Default)]
pub struct DiversityKernel {
    high_water: usize,
    uncompressed: Vec<u8>,
    compressed: Vec<u8>,
}

impl DiversityKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grow the scratch buffers to hold `total` input bytes. Capacity is
    /// rounded up past the next power of two and never shrinks.
    fn reserve(&mut self, total: usize) {
        if self.high_water > total {
            return;
        }
        let mut bits = 0u32;
        let mut val = total.max(1);
        while val > 1 {
            bits += 1;
            val >>= 1;
        }
        self.high_water = 1usize << (bits + 2);
        self.uncompressed.resize(self.high_water, 0);
        self.compressed
            .resize(get_maximum_output_size(self.high_water), 0);
    }

    /// LZ4 length of a single atom, the per-entry complexity term.
    pub fn compressed_len(&mut self, atom: &[u8]) -> Result<u32, DiversityError> {
        self.reserve(atom.len());
        let n = compress_into(atom, &mut self.compressed)?;
        Ok(n as u32)
    }

    /// NCD of a set of `(atom, cached LZ4 length)` pairs. The concatenation
    /// order is the given order; an empty set scores 0.
    pub fn ncd(&mut self, items: &[(&[u8], u32)]) -> Result<f64, DiversityError> {
        if items.is_empty() {
            return Ok(0.0);
        }
        let total: usize = items.iter().map(|(atom, _)| atom.len()).sum();
        self.reserve(total);

        let min_len = items.iter().map(|&(_, len)| len).min().unwrap_or(0);

        let mut pos = 0;
        for (atom, _) in items {
            self.uncompressed[pos..pos + atom.len()].copy_from_slice(atom);
            pos += atom.len();
        }
        let full = compress_into(&self.uncompressed[..pos], &mut self.compressed)? as u32;

        let mut max_sub = 0u32;
        for left_out in 0..items.len() {
            let mut pos = 0;
            for (i, (atom, _)) in items.iter().enumerate() {
                if i == left_out {
                    continue;
                }
                self.uncompressed[pos..pos + atom.len()].copy_from_slice(atom);
                pos += atom.len();
            }
            let sub = compress_into(&self.uncompressed[..pos], &mut self.compressed)? as u32;
            max_sub = max_sub.max(sub);
        }

        if max_sub == 0 {
            return Ok(0.0);
        }
        Ok((f64::from(full) - f64::from(min_len)) / f64::from(max_sub))
    }
}

/// Edit distance between two byte strings, normalized by the longer length.
/// Identical or empty inputs score 0; the result is always within [0, 1].
pub fn normalized_levenshtein(a: &[u8], b: &[u8]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 0.0;
    }
    let (long, short) = if a.len() >= b.len() { (a, b) } else { (b, a) };

    let mut prev: Vec<u32> = (0..=short.len() as u32).collect();
    let mut cur = vec![0u32; short.len() + 1];
    for (i, &cl) in long.iter().enumerate() {
        cur[0] = i as u32 + 1;
        for (j, &cs) in short.iter().enumerate() {
            let cost = u32::from(cl != cs);
            cur[j + 1] = (cur[j] + 1).min(prev[j + 1] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    let edit = prev[short.len()];

    let dist = f64::from(edit) / long.len() as f64;
    assert!(
        (0.0..=1.0).contains(&dist),
        "impossible normalized distance {} (edit {} over {})",
        dist,
        edit,
        long.len()
    );
    dist
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    fn random_buf(rng: &mut SmallRng, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        rng.fill_bytes(&mut buf);
        buf
    }

    #[test]
    fn levenshtein_known_distances() {
        assert_eq!(normalized_levenshtein(b"AAAA", b"AAAB"), 0.25);
        assert_eq!(normalized_levenshtein(b"kitten", b"sitting"), 3.0 / 7.0);
        assert_eq!(normalized_levenshtein(b"AAAA", b"ZZZZ"), 1.0);
    }

    #[test]
    fn levenshtein_identity_symmetry_range() {
        let mut rng = SmallRng::seed_from_u64(11);
        for _ in 0..16 {
            let a_len = rng.gen_range(1..64);
            let a = random_buf(&mut rng, a_len);
            let b_len = rng.gen_range(1..64);
            let b = random_buf(&mut rng, b_len);
            assert_eq!(normalized_levenshtein(&a, &a), 0.0);
            let ab = normalized_levenshtein(&a, &b);
            let ba = normalized_levenshtein(&b, &a);
            assert_eq!(ab, ba);
            assert!((0.0..=1.0).contains(&ab));
        }
    }

    #[test]
    fn levenshtein_empty_inputs() {
        assert_eq!(normalized_levenshtein(b"", b"abc"), 0.0);
        assert_eq!(normalized_levenshtein(b"abc", b""), 0.0);
        assert_eq!(normalized_levenshtein(b"", b""), 0.0);
    }

    #[test]
    fn ncd_of_singleton_is_zero() {
        let mut kernel = DiversityKernel::new();
        let mut rng = SmallRng::seed_from_u64(12);
        let x = random_buf(&mut rng, 1024);
        let cx = kernel.compressed_len(&x).unwrap();
        assert_eq!(kernel.ncd(&[(&x, cx)]).unwrap(), 0.0);
        assert_eq!(kernel.ncd(&[]).unwrap(), 0.0);
    }

    #[test]
    fn ncd_duplicate_member_does_not_increase_score() {
        let mut kernel = DiversityKernel::new();
        let mut rng = SmallRng::seed_from_u64(13);
        let a = random_buf(&mut rng, 1024);
        let b = random_buf(&mut rng, 1024);
        let ca = kernel.compressed_len(&a).unwrap();
        let cb = kernel.compressed_len(&b).unwrap();

        let two = kernel.ncd(&[(&a, ca), (&b, cb)]).unwrap();
        let three = kernel.ncd(&[(&a, ca), (&b, cb), (&b, cb)]).unwrap();
        assert!(
            three <= two,
            "duplicate raised the score: {} -> {}",
            two,
            three
        );
    }

    #[test]
    fn ncd_rises_when_an_outlier_joins_a_uniform_set() {
        let mut kernel = DiversityKernel::new();
        let mut rng = SmallRng::seed_from_u64(14);
        let x = random_buf(&mut rng, 1024);
        let y = random_buf(&mut rng, 1024);
        let cx = kernel.compressed_len(&x).unwrap();
        let cy = kernel.compressed_len(&y).unwrap();

        let uniform = kernel
            .ncd(&[(&x, cx), (&x, cx), (&x, cx), (&x, cx)])
            .unwrap();
        let mixed = kernel
            .ncd(&[(&x, cx), (&x, cx), (&x, cx), (&y, cy)])
            .unwrap();
        assert!(
            mixed > uniform,
            "outlier did not raise the score: {} vs {}",
            uniform,
            mixed
        );
    }

    #[test]
    fn scratch_grows_across_calls() {
        let mut kernel = DiversityKernel::new();
        let mut rng = SmallRng::seed_from_u64(15);
        for len in [16usize, 4096, 64, 65536, 128] {
            let buf = random_buf(&mut rng, len);
            let c = kernel.compressed_len(&buf).unwrap();
            assert!(c > 0);
            let score = kernel.ncd(&[(&buf, c), (&buf, c)]).unwrap();
            assert!(score.is_finite());
        }
    }
}
