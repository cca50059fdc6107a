use crate::exec::Fault;
use std::path::PathBuf;
use std::time::Duration;

/// Stop keeping hang artefacts past this many unique ones.
pub const KEEP_UNIQUE_HANG: u64 = 500;
/// Stop keeping crash artefacts past this many unique ones.
pub const KEEP_UNIQUE_CRASH: u64 = 10_000;
/// Longest file name we will produce.
pub const NAME_MAX: usize = 255;

/// Which byte string feeds the compression side of the diversity kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiversityAtom {
    /// Compress the raw test case.
    Testcase,
    /// Compress the minified trace, scoring path diversity instead.
    TraceMini,
}

/// Input-behaviour partitioning of the keep decision.
#[derive(Debug, Clone)]
pub struct HashfuzzConfig {
    /// Number of partitions; at most 64.
    pub partitions: u8,
    /// Classify by input content instead of target output.
    pub input_based: bool,
    /// Keep only the first input per partition, without per-path tracking.
    pub mimic: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Output directory; queue/, hangs/ and crashes/ are created below it.
    pub out_dir: PathBuf,
    /// Coverage map size in bytes. Must be a power of two.
    pub map_size: usize,
    /// Reservoir capacity per (edge, bucket) slot. A capacity of 2 selects
    /// the Levenshtein kernel instead of set NCD.
    pub entries_per_edge: usize,
    /// Diversity-driven reservoir vs. the legacy single queue.
    pub ncd_based_queue: bool,
    pub diversity_atom: DiversityAtom,
    pub hashfuzz: Option<HashfuzzConfig>,
    /// Timeout for normal executions.
    pub exec_tmout: Duration,
    /// More generous timeout used to confirm hangs.
    pub hang_tmout: Duration,
    /// Fault value treated as the no-fault outcome. Crash exploration
    /// campaigns set this to `Fault::Crash`.
    pub crash_mode: Fault,
    /// Keep every timeout and crash without virgin gating.
    pub non_instrumented_mode: bool,
    /// Per-testcase byte ceiling for the in-memory cache; 0 disables it.
    pub testcase_cache_size: usize,
    /// Command spawned whenever a crash artefact is written.
    pub infoexec: Option<String>,
    /// Recorded in crashes/README.txt.
    pub orig_cmdline: String,
    /// Memory limit in MB, recorded in crashes/README.txt.
    pub mem_limit: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("output"),
            map_size: 1 << 16,
            entries_per_edge: 32,
            ncd_based_queue: true,
            diversity_atom: DiversityAtom::Testcase,
            hashfuzz: None,
            exec_tmout: Duration::from_millis(1000),
            hang_tmout: Duration::from_millis(1000),
            crash_mode: Fault::None,
            non_instrumented_mode: false,
            testcase_cache_size: 50 << 20,
            infoexec: None,
            orig_cmdline: String::new(),
            mem_limit: 0,
        }
    }
}

impl Config {
    pub fn check(&self) -> anyhow::Result<()> {
        if !self.map_size.is_power_of_two() || self.map_size < 64 {
            anyhow::bail!(
                "map size must be a power of two of at least 64, got {}",
                self.map_size
            );
        }
        if !(2..=32).contains(&self.entries_per_edge) {
            anyhow::bail!(
                "entries per edge must be within 2..=32, got {}",
                self.entries_per_edge
            );
        }
        if let Some(hf) = self.hashfuzz.as_ref() {
            if hf.partitions == 0 || hf.partitions > 64 {
                anyhow::bail!("hashfuzz partitions must be within 1..=64");
            }
        }
        if self.hang_tmout < self.exec_tmout {
            anyhow::bail!("hang timeout below exec timeout");
        }
        Ok(())
    }

    /// The two-entry Levenshtein kernel replaces set NCD at capacity 2.
    #[inline]
    pub fn lev_mode(&self) -> bool {
        self.entries_per_edge == 2
    }

    /// Length of a minified trace in bytes.
    #[inline]
    pub fn mini_len(&self) -> usize {
        self.map_size >> 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().check().is_ok());
    }

    #[test]
    fn bad_values_are_rejected() {
        let mut config = Config {
            map_size: 100,
            ..Config::default()
        };
        assert!(config.check().is_err());
        config.map_size = 1 << 16;
        config.entries_per_edge = 1;
        assert!(config.check().is_err());
        config.entries_per_edge = 33;
        assert!(config.check().is_err());
        config.entries_per_edge = 2;
        config.hang_tmout = Duration::from_millis(10);
        assert!(config.check().is_err());
    }
}
