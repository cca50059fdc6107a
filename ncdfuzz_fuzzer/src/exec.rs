//! Contracts to the surrounding fuzzer. Target execution, calibration and
//! scheduling live outside the curation engine; these traits are the only
//! operations it relies on.

use crate::queue::{EntryId, Queue, QueueEntry};
use std::time::Duration;

/// Outcome of one target execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Target exited normally.
    None,
    /// Target hit the execution timeout.
    Tmout,
    /// Target died on a signal.
    Crash,
    /// The executor itself failed.
    Error,
}

/// Handle to the execution engine for the current campaign.
pub trait TargetExec {
    /// Shared coverage map of the most recent run.
    fn trace_bits(&mut self) -> &mut [u8];

    /// Total executions so far.
    fn total_execs(&self) -> u64;

    /// Re-run the target on `input` with the given timeout, refreshing the
    /// coverage map. Used to confirm hangs.
    fn run(&mut self, input: &[u8], timeout: Duration) -> Fault;

    /// Signal that killed the target in the last crashing run.
    fn last_kill_signal(&self) -> u8;

    /// Output-behaviour partition of the last run.
    fn output_hash_class(&self) -> u8 {
        0
    }
}

/// Timing and bitmap measurement of freshly queued entries.
pub trait Calibrator {
    /// Measure `entry` by re-running `buf`, filling `cal_failed`,
    /// `exec_us`, `exec_cksum`, `bitmap_size` and `handicap` on the entry.
    fn calibrate(&mut self, entry: &mut QueueEntry, buf: &[u8], queue_cycle: u64) -> Fault;
}

/// Scheduling hooks: entry weighting and the favored map.
pub trait Scheduler {
    /// Monotone comparable weight of an entry; lower is better.
    fn fav_factor(&mut self, entry: &QueueEntry) -> u64;

    /// Re-rank `id` into `top_rated` after queue membership changed.
    fn update_bitmap_score(&mut self, queue: &mut Queue, id: EntryId);
}

/// Calibration outputs, cached so sibling reservoir slots filled from one
/// execution measure the target only once.
#[derive(Debug, Clone, Copy)]
pub struct Calibration {
    pub cal_failed: bool,
    pub exec_us: u64,
    pub exec_cksum: u64,
    pub bitmap_size: u32,
    pub handicap: u64,
}

impl Calibration {
    pub(crate) fn of(entry: &QueueEntry) -> Self {
        Self {
            cal_failed: entry.cal_failed,
            exec_us: entry.exec_us,
            exec_cksum: entry.exec_cksum,
            bitmap_size: entry.bitmap_size,
            handicap: entry.handicap,
        }
    }

    pub(crate) fn apply(&self, entry: &mut QueueEntry) {
        entry.cal_failed = self.cal_failed;
        entry.exec_us = self.exec_us;
        entry.exec_cksum = self.exec_cksum;
        entry.bitmap_size = self.bitmap_size;
        entry.handicap = self.handicap;
    }
}
