//! Campaign counters. The engine is single-threaded between executions, so
//! plain fields suffice.

use std::time::Instant;

#[derive(Debug, Default)]
pub struct Stats {
    pub total_tmouts: u64,
    pub unique_tmouts: u64,
    pub unique_hangs: u64,
    pub total_crashes: u64,
    pub unique_crashes: u64,
    pub last_hang_time: Option<Instant>,
    pub last_crash_time: Option<Instant>,
    pub last_crash_execs: u64,
    /// Executions that surfaced novel coverage while the reservoir was on.
    pub discovering_q_entries: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, queued_paths: usize, discovered_edges: u64, pending_edges: u64) {
        log::info!(
            "queue: {}, edge slots: {} discovered / {} pending, tmouts: {}/{} (hangs: {}), crashes: {}/{}",
            queued_paths,
            discovered_edges,
            pending_edges,
            self.unique_tmouts,
            self.total_tmouts,
            self.unique_hangs,
            self.unique_crashes,
            self.total_crashes,
        );
    }
}
