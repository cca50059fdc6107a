//! The diversity-maximizing cover: a near-minimum subset of the queue that
//! reaches every discovered edge, grown greedily so each addition keeps the
//! set's NCD as high as possible.

use crate::manager::CorpusManager;
use crate::queue::EntryId;
use crate::reservoir::{atom_of, ensure_compressed_len, ncd_of};
use ncdfuzz_core::bitmap::{contains_new_cover, count_mini_bits, count_non_255_bytes, or_into};

impl CorpusManager {
    /// Recompute the cover. The first member is the one with the smallest
    /// compressed length; every further member is the coverage-adding
    /// candidate that maximizes the NCD of the set so far.
    pub fn set_ncdm_favored(&mut self) -> anyhow::Result<()> {
        let Self {
            config,
            queue,
            feedback,
            kernel,
            ..
        } = self;
        let atom = config.diversity_atom;

        for entry in queue.entries.iter_mut() {
            entry.ncdm_favored = false;
        }

        let discovered_edges = count_non_255_bytes(&feedback.virgin_bits);
        let all_discovered = feedback.all_discovered_mini();
        let mut covered = vec![0u8; all_discovered.len()];
        let mut selected: Vec<EntryId> = Vec::new();
        let mut total_ncd = 0.0f64;

        while covered != all_discovered {
            let mut best: Option<EntryId> = None;
            let mut shortest = u32::MAX;
            let mut best_ncd = 0.0f64;
            let mut first_new: Option<EntryId> = None;

            for id in 0..queue.entries.len() {
                if !contains_new_cover(&queue.entries[id].trace_mini, &covered) {
                    continue;
                }
                if first_new.is_none() {
                    first_new = Some(id);
                }
                ensure_compressed_len(kernel, queue, id, atom)?;
                if selected.is_empty() {
                    let clen = queue.entries[id].compressed_len;
                    if clen < shortest {
                        shortest = clen;
                        best = Some(id);
                    }
                } else {
                    let extra = (atom_of(queue, id, atom), queue.entries[id].compressed_len);
                    let score = ncd_of(kernel, queue, &selected, None, Some(extra), atom)?;
                    if score > best_ncd {
                        best_ncd = score;
                        best = Some(id);
                    }
                }
            }

            let pick = match (best, first_new) {
                (Some(best), _) => best,
                // Every candidate scored zero; coverage still has to grow.
                (None, Some(first)) => first,
                (None, None) => panic!(
                    "no queue entry adds coverage: reached {} of {} edges ({} discovered)",
                    count_mini_bits(&covered),
                    count_mini_bits(&all_discovered),
                    discovered_edges
                ),
            };

            queue.entries[pick].ncdm_favored = true;
            or_into(&mut covered, &queue.entries[pick].trace_mini);
            selected.push(pick);
            total_ncd = best_ncd;
        }

        let favs: Vec<EntryId> = (0..queue.entries.len())
            .filter(|&id| queue.entries[id].favored)
            .collect();
        for &id in favs.iter() {
            ensure_compressed_len(kernel, queue, id, atom)?;
        }
        let favored_ncd = ncd_of(kernel, queue, &favs, None, None, atom)?;
        log::info!(
            "full-coverage subset of {} entries with ncd {:.5} (vs {} favored entries with ncd {:.5})",
            selected.len(),
            total_ncd,
            favs.len(),
            favored_ncd
        );
        log::debug!("ncdm cover: {:?}, favored: {:?}", selected, favs);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::exec::Fault;
    use crate::manager::test_support::{test_manager, StubCal, StubExec, StubSched};
    use rand::prelude::*;

    fn exec_with_edges(edges: &[usize]) -> StubExec {
        let mut trace = vec![0u8; 64];
        for &edge in edges {
            trace[edge] = 1;
        }
        StubExec {
            trace,
            total: 1,
            rerun_fault: Fault::Tmout,
            rerun_trace: None,
            signal: 0,
            out_class: 0,
        }
    }

    #[test]
    fn a_short_full_cover_entry_wins_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut manager = test_manager(dir.path(), 4);
        let mut cal = StubCal::default();
        let mut sched = StubSched::default();
        let mut rng = SmallRng::seed_from_u64(31);

        let mut long_a = vec![0u8; 1024];
        rng.fill_bytes(&mut long_a);
        let mut long_b = vec![0u8; 1024];
        rng.fill_bytes(&mut long_b);

        let mut exec = exec_with_edges(&[0]);
        manager
            .save_if_interesting(&long_a, Fault::None, &mut exec, &mut cal, &mut sched)
            .expect("save");
        let mut exec = exec_with_edges(&[1]);
        manager
            .save_if_interesting(&long_b, Fault::None, &mut exec, &mut cal, &mut sched)
            .expect("save");
        let mut exec = exec_with_edges(&[0, 1]);
        manager
            .save_if_interesting(b"AB", Fault::None, &mut exec, &mut cal, &mut sched)
            .expect("save");

        manager.set_ncdm_favored().expect("cover");

        let flags: Vec<bool> = manager
            .queue
            .entries
            .iter()
            .map(|entry| entry.ncdm_favored)
            .collect();
        // The tiny entry covers everything by itself and compresses
        // shortest, so it is the whole cover.
        assert_eq!(flags, vec![false, false, true]);
    }

    #[test]
    fn cover_terminates_once_all_edges_are_reached() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut manager = test_manager(dir.path(), 4);
        let mut cal = StubCal::default();
        let mut sched = StubSched::default();
        let mut rng = SmallRng::seed_from_u64(32);

        for edge in 0..3usize {
            let mut input = vec![0u8; 512];
            rng.fill_bytes(&mut input);
            let mut exec = exec_with_edges(&[edge]);
            manager
                .save_if_interesting(&input, Fault::None, &mut exec, &mut cal, &mut sched)
                .expect("save");
        }

        manager.set_ncdm_favored().expect("cover");
        assert!(manager
            .queue
            .entries
            .iter()
            .all(|entry| entry.ncdm_favored));
        // A second run converges to the same cover from a clean slate.
        manager.set_ncdm_favored().expect("cover again");
        assert!(manager
            .queue
            .entries
            .iter()
            .all(|entry| entry.ncdm_favored));
    }

    #[test]
    #[should_panic(expected = "no queue entry adds coverage")]
    fn uncoverable_edges_are_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut manager = test_manager(dir.path(), 4);
        // An edge is on record that no queue entry covers.
        manager.feedback.virgin_bits[5] = 0xfe;
        let _ = manager.set_ncdm_favored();
    }
}
