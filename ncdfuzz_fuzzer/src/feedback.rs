//! Virgin bitmaps and novelty bookkeeping per fault class.

use anyhow::Context;
use ncdfuzz_core::bitmap::minimize_bits;
use ncdfuzz_core::novelty::{has_new_bits, has_new_bits_unclassified, NewCoverage};
use std::fs;
use std::path::Path;

/// Inverse cumulative coverage, one map per destination: the normal queue,
/// timeouts and crashes each gate on their own history.
#[derive(Debug)]
pub struct Feedback {
    pub virgin_bits: Vec<u8>,
    pub virgin_tmout: Vec<u8>,
    pub virgin_crash: Vec<u8>,
    bitmap_changed: bool,
}

impl Feedback {
    pub fn new(map_size: usize) -> Self {
        Self {
            virgin_bits: vec![0xff; map_size],
            virgin_tmout: vec![0xff; map_size],
            virgin_crash: vec![0xff; map_size],
            bitmap_changed: false,
        }
    }

    /// Grade an unclassified trace against the cumulative map, classifying
    /// it in place when the fast pre-pass fires. Any novelty marks the
    /// on-disk bitmap dirty.
    pub fn check_trace(&mut self, trace: &mut [u8]) -> NewCoverage {
        let ret = has_new_bits_unclassified(trace, &mut self.virgin_bits);
        if ret.any() {
            self.bitmap_changed = true;
        }
        ret
    }

    /// Grade a simplified trace against the timeout map.
    pub fn check_tmout(&mut self, trace: &[u8]) -> NewCoverage {
        has_new_bits(trace, &mut self.virgin_tmout)
    }

    /// Grade a simplified trace against the crash map.
    pub fn check_crash(&mut self, trace: &[u8]) -> NewCoverage {
        has_new_bits(trace, &mut self.virgin_crash)
    }

    /// One bit per edge ever observed, derived from the cumulative map.
    pub fn all_discovered_mini(&self) -> Vec<u8> {
        let inverted: Vec<u8> = self.virgin_bits.iter().map(|&b| !b).collect();
        let mut mini = vec![0u8; self.virgin_bits.len() >> 3];
        minimize_bits(&mut mini, &inverted);
        mini
    }

    pub fn bitmap_changed(&self) -> bool {
        self.bitmap_changed
    }

    /// Persist the cumulative map to `<out>/fuzz_bitmap` if it changed
    /// since the last write. The file is replaced atomically.
    pub fn write_bitmap(&mut self, out_dir: &Path) -> anyhow::Result<()> {
        if !self.bitmap_changed {
            return Ok(());
        }
        self.bitmap_changed = false;
        let path = out_dir.join("fuzz_bitmap");
        let tmp = out_dir.join(".fuzz_bitmap.tmp");
        fs::write(&tmp, &self.virgin_bits)
            .with_context(|| format!("unable to write '{}'", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to move bitmap into '{}'", path.display()))?;
        Ok(())
    }
}
