//! The per-execution decision pipeline: novelty grading, reservoir
//! filing, hashfuzz partitioning and crash/hang triage.

use crate::config::{Config, KEEP_UNIQUE_CRASH, KEEP_UNIQUE_HANG, NAME_MAX};
use crate::describe::StageInfo;
use crate::exec::{Calibrator, Fault, Scheduler, TargetExec};
use crate::feedback::Feedback;
use crate::partition::{hashfuzz_classify, PathPartitions};
use crate::queue::Queue;
use crate::reservoir::{write_new_file, Candidate, EdgeReservoir};
use crate::stats::Stats;
use anyhow::Context;
use ncdfuzz_core::bitmap::{classify_counts, simplify_trace};
use ncdfuzz_core::diversity::DiversityKernel;
use ncdfuzz_core::novelty::NewCoverage;
use ncdfuzz_core::{hash64, HASH_SEED};
use std::fs;
use std::process::Command;
use std::time::{Duration, Instant};

/// What one execution amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveVerdict {
    /// Nothing noteworthy; the input was dropped.
    Discarded,
    /// Kept in the queue.
    Queued,
    /// Confirmed hang, written to hangs/.
    Hang,
    /// Novel crash, written to crashes/.
    Crash,
}

/// Owner of the whole curation state. All methods run on the control
/// thread between executions.
pub struct CorpusManager {
    pub config: Config,
    pub queue: Queue,
    pub reservoir: EdgeReservoir,
    pub feedback: Feedback,
    pub kernel: DiversityKernel,
    pub partitions: PathPartitions,
    pub stats: Stats,
    /// Provenance of the input currently being executed.
    pub stage: StageInfo,
    /// Current queue cycle, advanced by the stage driver.
    pub queue_cycle: u64,
    /// Partitions seeded so far in hashfuzz mimic mode.
    pub(crate) discovered_partitions: u64,
    pub(crate) start_time: Instant,
    /// Run time carried over from a resumed session.
    pub prev_run_time: Duration,
}

impl CorpusManager {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        config.check().context("config error")?;
        for sub in ["queue", "hangs", "crashes"] {
            let dir = config.out_dir.join(sub);
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(Self {
            queue: Queue::new(config.map_size),
            reservoir: EdgeReservoir::new(config.map_size),
            feedback: Feedback::new(config.map_size),
            kernel: DiversityKernel::new(),
            partitions: PathPartitions::new(),
            stats: Stats::new(),
            stage: StageInfo::default(),
            queue_cycle: 1,
            discovered_partitions: 0,
            start_time: Instant::now(),
            prev_run_time: Duration::ZERO,
            config,
        })
    }

    pub(crate) fn run_time_ms(&self) -> u64 {
        (self.start_time.elapsed() + self.prev_run_time).as_millis() as u64
    }

    /// Persist the cumulative bitmap if it changed since the last write.
    pub fn write_bitmap(&mut self) -> anyhow::Result<()> {
        self.feedback.write_bitmap(&self.config.out_dir)
    }

    /// Decide what to do with the result of one execution: keep the input,
    /// file it as a hang or crash, or drop it. Called at most once per
    /// target run.
    pub fn save_if_interesting(
        &mut self,
        mem: &[u8],
        fault: Fault,
        exec: &mut dyn TargetExec,
        cal: &mut dyn Calibrator,
        sched: &mut dyn Scheduler,
    ) -> anyhow::Result<SaveVerdict> {
        if mem.is_empty() {
            return Ok(SaveVerdict::Discarded);
        }

        let total_execs = exec.total_execs();
        let output_class = exec.output_hash_class();
        let kill_signal = exec.last_kill_signal();

        let mut classified = false;
        let mut keeping = false;

        if fault == self.config.crash_mode {
            let trace = exec.trace_bits();
            let raw_cksum = hash64(trace, HASH_SEED);
            let new_bits = self.feedback.check_trace(trace);
            classified = new_bits.any();
            let mut interesting = new_bits.any();
            let mut new_partition = false;
            let hashfuzz_class = match self.config.hashfuzz.as_ref() {
                Some(hf) if hf.input_based => hashfuzz_classify(mem, hf.partitions),
                Some(_) => output_class,
                None => 0,
            };

            if self.config.ncd_based_queue {
                if new_bits.any() {
                    self.stats.discovering_q_entries += 1;
                }
                if !classified {
                    classify_counts(trace);
                    classified = true;
                }
                let mut cand = Candidate {
                    bytes: mem,
                    exec_cksum: raw_cksum,
                    input_hash: hash64(mem, HASH_SEED),
                    hashfuzz_class,
                    trace_mini: None,
                    compressed_len: 0,
                };
                self.save_to_edge_entries(trace, &mut cand, new_bits, total_execs, cal, sched)?;
            }

            if let Some(hf) = self.config.hashfuzz.clone() {
                if hf.mimic {
                    let bit = 1u64 << hashfuzz_class;
                    if self.discovered_partitions & bit == 0 {
                        log::info!("seeding first input for partition {}", hashfuzz_class);
                        self.discovered_partitions |= bit;
                        interesting = true;
                    }
                } else if interesting || self.partitions.contains(raw_cksum) {
                    // Register the pair even for already-interesting
                    // inputs, so the partition map stays complete.
                    if self
                        .partitions
                        .check_if_new_partition(raw_cksum, hashfuzz_class)
                        .is_some()
                    {
                        new_partition = true;
                        interesting = true;
                    }
                }
            }

            if !interesting {
                if self.config.crash_mode != Fault::None {
                    self.stats.total_crashes += 1;
                }
                return Ok(SaveVerdict::Discarded);
            }

            if !self.config.ncd_based_queue {
                let describe = self.stage.describe(
                    self.run_time_ms(),
                    new_bits,
                    new_partition,
                    NAME_MAX - "id:000000,".len(),
                );
                let fname = self
                    .config
                    .out_dir
                    .join("queue")
                    .join(format!("id:{:06},cksum:{:020},{}", self.queue.len(), raw_cksum, describe));
                write_new_file(&fname, mem)?;
                let id = self.queue.add(fname, mem.len(), false, hashfuzz_class, 0);
                if new_bits == NewCoverage::NewEdges {
                    self.queue.entries[id].has_new_cov = true;
                    self.queue.queued_with_cov += 1;
                }
                // Classification above changed the trace, so the stored
                // checksum must be taken now.
                self.queue.entries[id].exec_cksum = hash64(trace, HASH_SEED);
                let res = cal.calibrate(
                    &mut self.queue.entries[id],
                    mem,
                    self.queue_cycle.saturating_sub(1),
                );
                if res == Fault::Error {
                    anyhow::bail!("unable to execute target application");
                }
                if self.config.testcase_cache_size > 0 && mem.len() <= self.config.testcase_cache_size {
                    self.queue.entries[id].testcase_buf = mem.to_vec();
                }
            }
            keeping = true;
        }

        let mut treat_as_crash = fault == Fault::Crash;

        if fault == Fault::Tmout {
            self.stats.total_tmouts += 1;
            if self.stats.unique_hangs >= KEEP_UNIQUE_HANG {
                return Ok(Self::kept(keeping));
            }
            if !self.config.non_instrumented_mode {
                let trace = exec.trace_bits();
                if !classified {
                    classify_counts(trace);
                    classified = true;
                }
                simplify_trace(trace);
                if !self.feedback.check_tmout(trace).any() {
                    return Ok(Self::kept(keeping));
                }
            }
            self.stats.unique_tmouts += 1;

            // Make sure it is a genuine hang by re-running with the more
            // generous timeout. A rerun that crashes is kept as a crash.
            if self.config.exec_tmout < self.config.hang_tmout {
                let new_fault = exec.run(mem, self.config.hang_tmout);
                classify_counts(exec.trace_bits());
                if new_fault == Fault::Crash {
                    treat_as_crash = true;
                } else if new_fault != Fault::Tmout {
                    return Ok(Self::kept(keeping));
                }
            }

            if !treat_as_crash {
                let describe = self.stage.describe(
                    self.run_time_ms(),
                    NewCoverage::None,
                    false,
                    NAME_MAX - "id:000000,".len(),
                );
                let fname = self
                    .config
                    .out_dir
                    .join("hangs")
                    .join(format!("id:{:06},{}", self.stats.unique_hangs, describe));
                write_new_file(&fname, mem)?;
                self.stats.unique_hangs += 1;
                self.stats.last_hang_time = Some(Instant::now());
                return Ok(SaveVerdict::Hang);
            }
        }

        if treat_as_crash {
            self.stats.total_crashes += 1;
            if self.stats.unique_crashes >= KEEP_UNIQUE_CRASH {
                return Ok(Self::kept(keeping));
            }
            if !self.config.non_instrumented_mode {
                let trace = exec.trace_bits();
                if !classified {
                    classify_counts(trace);
                }
                simplify_trace(trace);
                if !self.feedback.check_crash(trace).any() {
                    return Ok(Self::kept(keeping));
                }
            }
            if self.stats.unique_crashes == 0 {
                self.write_crash_readme();
            }
            let describe = self.stage.describe(
                self.run_time_ms(),
                NewCoverage::None,
                false,
                NAME_MAX - "id:000000,sig:00,".len(),
            );
            let fname = self.config.out_dir.join("crashes").join(format!(
                "id:{:06},sig:{:02},{}",
                self.stats.unique_crashes, kill_signal, describe
            ));
            write_new_file(&fname, mem)?;
            self.stats.unique_crashes += 1;
            self.stats.last_crash_time = Some(Instant::now());
            self.stats.last_crash_execs = total_execs;
            if let Some(cmd) = self.config.infoexec.as_ref() {
                // Informational hook only; its failure is not ours.
                let _ = Command::new("sh").arg("-c").arg(cmd).status();
            }
            return Ok(SaveVerdict::Crash);
        }

        if fault == Fault::Error {
            anyhow::bail!("unable to execute target application");
        }

        Ok(Self::kept(keeping))
    }

    #[inline]
    fn kept(keeping: bool) -> SaveVerdict {
        if keeping {
            SaveVerdict::Queued
        } else {
            SaveVerdict::Discarded
        }
    }

    fn write_crash_readme(&self) {
        let path = self.config.out_dir.join("crashes").join("README.txt");
        let text = format!(
            "Command line used to find these crashes:\n\n{}\n\n\
             The test cases in this directory faulted under a memory limit of {} MB;\n\
             reproduce them under the same limit. File names encode the provenance of\n\
             each input: source entry, discovery time and mutation operator.\n",
            self.config.orig_cmdline, self.config.mem_limit
        );
        // Best effort only.
        let _ = fs::write(&path, text);
    }

    pub fn log_stats(&self) {
        self.stats.report(
            self.queue.len(),
            self.reservoir.discovered_entries,
            self.reservoir.pending_entries,
        );
    }

    /// Render the live queue indices and the per-path partition table
    /// through the log facade.
    pub fn dump_debug_info(&self) {
        log::debug!("queued paths (indices): {:?}", self.queue.live_indices());
        self.partitions.dump();
    }
}
