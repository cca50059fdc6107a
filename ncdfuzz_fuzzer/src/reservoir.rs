//! The per-edge reservoir: which test cases survive for every
//! (edge, hit-bucket) pair, and who gets evicted once a slot is full.
//!
//! Eviction prefers shrinking duplicate clusters; failing that, a candidate
//! replaces the member whose removal maximizes the slot's diversity score,
//! and only if that strictly beats the cached score. Scoring is rate
//! limited per slot so hot edges do not spend the campaign compressing.

use crate::config::{Config, DiversityAtom, NAME_MAX};
use crate::exec::{Calibration, Calibrator, Scheduler};
use crate::manager::CorpusManager;
use crate::queue::{EntryId, Queue};
use anyhow::Context;
use ncdfuzz_core::bitmap::minimize_bits;
use ncdfuzz_core::diversity::{normalized_levenshtein, DiversityKernel};
use ncdfuzz_core::novelty::NewCoverage;
use std::fmt::Write as _;
use std::fs;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

/// Hit-count buckets per edge.
pub const EDGE_BUCKETS: usize = 8;

/// One (edge, hit-bucket) reservoir slot.
#[derive(Debug, Clone)]
pub struct EdgeEntry {
    pub edge_num: u32,
    pub bucket: u8,
    pub hit_count: u64,
    pub replacement_count: u64,
    /// Execution count when the slot saw its first hit.
    pub discovery_execs: u64,
    pub entries: Vec<EntryId>,
    /// Kernel score of the current entry list.
    pub diversity: f64,
}

#[derive(Debug)]
pub struct EdgeReservoir {
    pub(crate) slots: Vec<EdgeEntry>,
    pub pending_entries: u64,
    pub discovered_entries: u64,
}

impl EdgeReservoir {
    pub fn new(map_size: usize) -> Self {
        let mut slots = Vec::with_capacity(map_size * EDGE_BUCKETS);
        for edge in 0..map_size {
            for bucket in 0..EDGE_BUCKETS {
                slots.push(EdgeEntry {
                    edge_num: edge as u32,
                    bucket: bucket as u8,
                    hit_count: 0,
                    replacement_count: 0,
                    discovery_execs: 0,
                    entries: Vec::new(),
                    diversity: 0.0,
                });
            }
        }
        Self {
            slots,
            pending_entries: 0,
            discovered_entries: 0,
        }
    }

    #[inline]
    pub fn slot(&self, idx: usize) -> &EdgeEntry {
        &self.slots[idx]
    }

    #[inline]
    pub fn slots_of_edge(&self, edge: usize) -> &[EdgeEntry] {
        &self.slots[edge * EDGE_BUCKETS..(edge + 1) * EDGE_BUCKETS]
    }
}

/// A test case under consideration; not yet a queue entry.
#[derive(Debug)]
pub struct Candidate<'a> {
    pub bytes: &'a [u8],
    /// Checksum of the unclassified trace, embedded in new file names.
    pub exec_cksum: u64,
    pub input_hash: u64,
    /// Input-behaviour partition assigned by hashfuzz; 0 when disabled.
    pub hashfuzz_class: u8,
    /// Filled lazily from the current trace.
    pub trace_mini: Option<Vec<u8>>,
    /// Filled lazily; 0 means not computed yet.
    pub compressed_len: u32,
}

/// Slots get scored on every hit early on, then exponentially more rarely.
fn should_score_diversity(hit_count: u64) -> bool {
    hit_count <= 10
        || (hit_count <= 100 && hit_count % 10 == 0)
        || (hit_count <= 10_000 && hit_count % 100 == 0)
        || hit_count % 1000 == 0
}

pub(crate) fn atom_of<'q>(queue: &'q Queue, id: EntryId, atom: DiversityAtom) -> &'q [u8] {
    let entry = &queue.entries[id];
    match atom {
        DiversityAtom::Testcase => &entry.testcase_buf,
        DiversityAtom::TraceMini => &entry.trace_mini,
    }
}

/// Make sure `id` carries a fresh compressed length for its atom,
/// re-reading the test case from disk if the cache skipped it.
pub(crate) fn ensure_compressed_len(
    kernel: &mut DiversityKernel,
    queue: &mut Queue,
    id: EntryId,
    atom: DiversityAtom,
) -> anyhow::Result<()> {
    if queue.entries[id].compressed_len != 0 {
        return Ok(());
    }
    if atom == DiversityAtom::Testcase
        && queue.entries[id].testcase_buf.is_empty()
        && queue.entries[id].len > 0
    {
        log::warn!(
            "missing buffer for entry {}, re-reading {}",
            id,
            queue.entries[id].fname.display()
        );
        queue.testcase_get(id)?;
    }
    let len = kernel
        .compressed_len(atom_of(queue, id, atom))
        .context("lz4 failed while caching a compressed length")?;
    queue.entries[id].compressed_len = len;
    Ok(())
}

/// NCD over `ids` (minus the `skip` position) plus an optional extra atom.
/// Compressed lengths of all members must be filled beforehand.
pub(crate) fn ncd_of(
    kernel: &mut DiversityKernel,
    queue: &Queue,
    ids: &[EntryId],
    skip: Option<usize>,
    extra: Option<(&[u8], u32)>,
    atom: DiversityAtom,
) -> anyhow::Result<f64> {
    let mut items: Vec<(&[u8], u32)> = Vec::with_capacity(ids.len() + 1);
    for (i, &id) in ids.iter().enumerate() {
        if Some(i) == skip {
            continue;
        }
        items.push((atom_of(queue, id, atom), queue.entries[id].compressed_len));
    }
    if let Some(extra) = extra {
        items.push(extra);
    }
    kernel
        .ncd(&items)
        .context("lz4 failed during set diversity")
}

/// Recompute and cache the kernel score of a slot's current entry list.
fn refresh_slot_diversity(
    kernel: &mut DiversityKernel,
    queue: &mut Queue,
    slot: &mut EdgeEntry,
    lev_mode: bool,
    atom: DiversityAtom,
) -> anyhow::Result<()> {
    slot.diversity = if lev_mode {
        if slot.entries.len() < 2 {
            0.0
        } else {
            normalized_levenshtein(
                &queue.entries[slot.entries[0]].testcase_buf,
                &queue.entries[slot.entries[1]].testcase_buf,
            )
        }
    } else {
        for i in 0..slot.entries.len() {
            ensure_compressed_len(kernel, queue, slot.entries[i], atom)?;
        }
        ncd_of(kernel, queue, &slot.entries, None, None, atom)?
    };
    Ok(())
}

/// Fill the candidate's minified trace and compressed length if stale.
fn fill_candidate(
    kernel: &mut DiversityKernel,
    cand: &mut Candidate<'_>,
    trace: &[u8],
    mini_len: usize,
    atom: DiversityAtom,
) -> anyhow::Result<()> {
    let mini = match cand.trace_mini.take() {
        Some(mini) => mini,
        None => {
            let mut mini = vec![0u8; mini_len];
            minimize_bits(&mut mini, trace);
            mini
        }
    };
    if cand.compressed_len == 0 {
        let bytes: &[u8] = match atom {
            DiversityAtom::Testcase => cand.bytes,
            DiversityAtom::TraceMini => &mini,
        };
        cand.compressed_len = kernel
            .compressed_len(bytes)
            .context("lz4 failed on a fresh candidate")?;
    }
    cand.trace_mini = Some(mini);
    Ok(())
}

/// Index of the member whose replacement by the candidate maximizes the
/// slot's diversity, if that strictly beats the cached score.
fn find_eviction_candidate(
    kernel: &mut DiversityKernel,
    queue: &mut Queue,
    slot: &EdgeEntry,
    cand: &Candidate<'_>,
    lev_mode: bool,
    atom: DiversityAtom,
) -> anyhow::Result<Option<usize>> {
    let count = slot.entries.len();
    assert!(count <= 32, "reservoir slot above the 32-entry limit");

    let mut best = slot.diversity;
    let mut best_idx = None;

    if lev_mode {
        assert_eq!(count, 2, "the levenshtein kernel needs exactly two entries");
        for i in 0..2 {
            let other = &queue.entries[slot.entries[1 - i]];
            let dist = normalized_levenshtein(&other.testcase_buf, cand.bytes);
            if dist > best {
                best = dist;
                best_idx = Some(i);
            }
        }
    } else {
        for i in 0..count {
            ensure_compressed_len(kernel, queue, slot.entries[i], atom)?;
        }
        let extra: (&[u8], u32) = match atom {
            DiversityAtom::Testcase => (cand.bytes, cand.compressed_len),
            DiversityAtom::TraceMini => match cand.trace_mini.as_deref() {
                Some(mini) => (mini, cand.compressed_len),
                None => panic!("candidate offered for eviction without a trace"),
            },
        };
        for i in 0..count {
            let score = ncd_of(kernel, queue, &slot.entries, Some(i), Some(extra), atom)?;
            if score > best {
                best = score;
                best_idx = Some(i);
            }
        }
    }
    Ok(best_idx)
}

/// Overwrite the evictee with the candidate: hash index first, then the
/// in-memory buffers, then the on-disk file, which also gains an updated
/// timestamp in its name.
fn swap_in_candidate(
    queue: &mut Queue,
    cand: &Candidate<'_>,
    evictee: EntryId,
    run_time_ms: u64,
) -> anyhow::Result<()> {
    let old_hash = queue.entries[evictee].input_hash;
    queue.hash_remove(old_hash, evictee);
    queue.entries[evictee].input_hash = cand.input_hash;
    queue.hash_insert(cand.input_hash, evictee);

    let mini = match cand.trace_mini.as_ref() {
        Some(mini) => mini.clone(),
        None => panic!("candidate swapped in without a trace"),
    };
    {
        let entry = &mut queue.entries[evictee];
        entry.testcase_buf = cand.bytes.to_vec();
        entry.len = cand.bytes.len();
        entry.compressed_len = cand.compressed_len;
        entry.trace_mini = mini;
        entry.exec_cksum = 0;
        entry.hashfuzz_class = cand.hashfuzz_class;
    }

    let fname = queue.entries[evictee].fname.clone();
    fs::write(&fname, cand.bytes)
        .with_context(|| format!("unable to rewrite '{}'", fname.display()))?;
    let renamed = updated_filename(&fname, run_time_ms)?;
    fs::rename(&fname, &renamed).with_context(|| {
        format!(
            "failed to rename {} to {}",
            fname.display(),
            renamed.display()
        )
    })?;
    queue.entries[evictee].fname = renamed;
    Ok(())
}

/// Insert (or replace) an `,updated:<ms>` segment right before the `,op:`
/// suffix of a queue file name.
fn updated_filename(fname: &Path, run_time_ms: u64) -> anyhow::Result<PathBuf> {
    let name = fname
        .to_str()
        .with_context(|| format!("non-utf8 queue path {}", fname.display()))?;
    let op = name
        .find(",op:")
        .with_context(|| format!("no ,op: segment in '{}'", name))?;
    let prefix_end = name.find(",updated:").unwrap_or(op);

    let mut renamed = String::with_capacity(name.len() + 24);
    renamed.push_str(&name[..prefix_end]);
    let _ = write!(renamed, ",updated:{}", run_time_ms);
    renamed.push_str(&name[op..]);
    Ok(PathBuf::from(renamed))
}

fn queue_filename(
    out_dir: &Path,
    next_id: usize,
    slot: &EdgeEntry,
    cksum: u64,
    describe: &str,
) -> PathBuf {
    out_dir.join("queue").join(format!(
        "id:{:06},edge_num:{},edge_freq:{},cksum:{:06},entry:{},{}",
        next_id,
        slot.edge_num,
        slot.bucket,
        cksum,
        slot.entries.len(),
        describe
    ))
}

pub(crate) fn write_new_file(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("unable to create '{}'", path.display()))?;
    file.write_all(data)
        .with_context(|| format!("short write to '{}'", path.display()))?;
    Ok(())
}

/// When an evicted entry was favored, hand each of its edges to the best
/// remaining entry; if some edge has none, the flag is restored.
fn repair_favored(
    queue: &mut Queue,
    reservoir: &EdgeReservoir,
    sched: &mut dyn Scheduler,
    evictee: EntryId,
) {
    if !queue.entries[evictee].favored {
        return;
    }
    queue.set_favored(evictee, false);

    let owned_edges: Vec<usize> = queue
        .top_rated
        .iter()
        .enumerate()
        .filter(|&(_, &top)| top == Some(evictee))
        .map(|(edge, _)| edge)
        .collect();

    let mut restored = false;
    for edge in owned_edges {
        let mut best: Option<(u64, EntryId)> = None;
        for slot in reservoir.slots_of_edge(edge) {
            for &id in slot.entries.iter() {
                let score = sched.fav_factor(&queue.entries[id]);
                if best.map_or(true, |(s, _)| score < s) {
                    best = Some((score, id));
                }
            }
        }
        match best {
            Some((_, successor)) => {
                queue.top_rated[edge] = None;
                sched.update_bitmap_score(queue, successor);
                if !queue.entries[successor].was_fuzzed {
                    queue.entries[successor].fuzz_level = queue.entries[evictee].fuzz_level;
                    queue.entries[successor].was_fuzzed = queue.entries[evictee].was_fuzzed;
                }
            }
            // The slot that is being refilled right now may be the only
            // owner; keep the evictee favored in that case.
            None => restored = true,
        }
    }
    if restored {
        queue.set_favored(evictee, true);
    }
}

impl CorpusManager {
    /// File the candidate under every hit (edge, bucket) slot of the
    /// classified trace. Returns whether anything was inserted or swapped.
    pub fn save_to_edge_entries(
        &mut self,
        trace: &[u8],
        cand: &mut Candidate<'_>,
        new_bits: NewCoverage,
        total_execs: u64,
        cal: &mut dyn Calibrator,
        sched: &mut dyn Scheduler,
    ) -> anyhow::Result<bool> {
        let run_time_ms = self.run_time_ms();
        let describe = self
            .stage
            .describe(run_time_ms, NewCoverage::None, false, NAME_MAX - 35);
        let queue_cycle = self.queue_cycle.saturating_sub(1);
        let Self {
            config,
            queue,
            reservoir,
            kernel,
            ..
        } = self;
        let Config {
            entries_per_edge: k,
            diversity_atom: atom,
            ..
        } = *config;
        let lev_mode = config.lev_mode();
        let mini_len = config.mini_len();

        let mut calibration: Option<Calibration> = None;
        let mut is_duplicate = queue.hash_bucket(cand.input_hash).is_some();
        let mut inserted = false;

        for (word_idx, word) in trace.chunks_exact(8).enumerate() {
            if word.iter().all(|&b| b == 0) {
                continue;
            }
            for (byte_idx, &class) in word.iter().enumerate() {
                if class == 0 {
                    continue;
                }
                debug_assert!(
                    class.is_power_of_two(),
                    "trace must be classified before filing"
                );
                let reps = class.trailing_zeros() as usize;
                let edge = word_idx * 8 + byte_idx;
                let slot_idx = edge * EDGE_BUCKETS + reps;

                reservoir.slots[slot_idx].hit_count += 1;

                // One entry per content hash and slot.
                let in_slot = reservoir.slots[slot_idx]
                    .entries
                    .iter()
                    .any(|&id| queue.entries[id].input_hash == cand.input_hash);
                if in_slot {
                    continue;
                }

                if reservoir.slots[slot_idx].entries.len() < k {
                    if reservoir.slots[slot_idx].entries.is_empty() {
                        reservoir.slots[slot_idx].discovery_execs = total_execs;
                        reservoir.pending_entries += 1;
                        reservoir.discovered_entries += 1;
                    } else if is_duplicate {
                        // Already queued under another slot; one copy is
                        // enough once the edge itself is known.
                        continue;
                    }

                    fill_candidate(kernel, cand, trace, mini_len, atom)?;

                    let fname = queue_filename(
                        &config.out_dir,
                        queue.len(),
                        &reservoir.slots[slot_idx],
                        cand.exec_cksum,
                        &describe,
                    );
                    write_new_file(&fname, cand.bytes)?;
                    let id = queue.add(fname, cand.bytes.len(), false, cand.hashfuzz_class, 0);
                    {
                        let entry = &mut queue.entries[id];
                        entry.testcase_buf = cand.bytes.to_vec();
                        entry.input_hash = cand.input_hash;
                        entry.trace_mini = cand.trace_mini.clone().unwrap_or_default();
                        entry.compressed_len = cand.compressed_len;
                        entry.edge_slot = Some(slot_idx);
                        if new_bits == NewCoverage::NewEdges {
                            entry.has_new_cov = true;
                        }
                    }
                    if new_bits == NewCoverage::NewEdges {
                        queue.queued_with_cov += 1;
                    }
                    queue.hash_insert(cand.input_hash, id);
                    is_duplicate = true;
                    reservoir.slots[slot_idx].entries.push(id);
                    refresh_slot_diversity(
                        kernel,
                        queue,
                        &mut reservoir.slots[slot_idx],
                        lev_mode,
                        atom,
                    )?;

                    match calibration {
                        Some(cached) => cached.apply(&mut queue.entries[id]),
                        None => {
                            cal.calibrate(&mut queue.entries[id], cand.bytes, queue_cycle);
                            calibration = Some(Calibration::of(&queue.entries[id]));
                        }
                    }
                    inserted = true;
                    continue;
                }

                // Slot full. A candidate that already lives in the queue
                // never evicts anyone.
                if is_duplicate {
                    continue;
                }

                let mut evict_pos = reservoir.slots[slot_idx]
                    .entries
                    .iter()
                    .position(|&id| queue.entries[id].duplicates > 0);

                if evict_pos.is_none() {
                    if !should_score_diversity(reservoir.slots[slot_idx].hit_count) {
                        continue;
                    }
                    fill_candidate(kernel, cand, trace, mini_len, atom)?;
                    evict_pos = find_eviction_candidate(
                        kernel,
                        queue,
                        &reservoir.slots[slot_idx],
                        cand,
                        lev_mode,
                        atom,
                    )?;
                    if evict_pos.is_none() {
                        continue;
                    }
                }
                let evict_pos = match evict_pos {
                    Some(pos) => pos,
                    None => continue,
                };

                fill_candidate(kernel, cand, trace, mini_len, atom)?;
                let evictee = reservoir.slots[slot_idx].entries[evict_pos];
                swap_in_candidate(queue, cand, evictee, run_time_ms)?;
                is_duplicate = true;

                reservoir.slots[slot_idx].replacement_count += 1;
                refresh_slot_diversity(
                    kernel,
                    queue,
                    &mut reservoir.slots[slot_idx],
                    lev_mode,
                    atom,
                )?;

                repair_favored(queue, reservoir, sched, evictee);

                match calibration {
                    Some(cached) => cached.apply(&mut queue.entries[evictee]),
                    None => {
                        cal.calibrate(&mut queue.entries[evictee], cand.bytes, queue_cycle);
                        calibration = Some(Calibration::of(&queue.entries[evictee]));
                    }
                }
                inserted = true;
            }
        }
        Ok(inserted)
    }
}
