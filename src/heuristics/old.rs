//! Old-generation heuristics: mixed-collection candidates and
//! coalesce-and-fill bookkeeping.
//!
//! After an old mark completes, regions with enough garbage become
//! *collection candidates*, consumed a few at a time by subsequent young
//! cycles (mixed collections). Regions not worth compacting still need their
//! dead spans filled so the remembered-set scanner can parse them; those are
//! the *coalesce-and-fill candidates*.

use crate::heap::Heap;
use crate::heuristics::adaptive::region_live_bytes;

pub struct OldHeuristics {
    /// Region indices ordered by descending garbage, not yet collected.
    collection_candidates: Vec<usize>,
    /// Regions that must be made parseable before the next old mark.
    coalesce_fill_candidates: Vec<usize>,
}

impl OldHeuristics {
    pub fn new() -> OldHeuristics {
        OldHeuristics {
            collection_candidates: Vec::new(),
            coalesce_fill_candidates: Vec::new(),
        }
    }

    /// Partition old regions into collection candidates and fill candidates.
    /// Called once per completed old mark, under the heap lock.
    pub fn prepare_for_old_collections(&mut self, heap: &Heap) {
        let options = heap.options();
        let region_size = heap.region_size_bytes();
        let garbage_threshold = region_size / 100 * *options.garbage_threshold_percent;

        self.collection_candidates.clear();
        self.coalesce_fill_candidates.clear();

        let mut scored: Vec<(usize, usize)> = Vec::new();
        for idx in 0..heap.num_regions() {
            let region = heap.region(idx);
            if !region.is_old() || !region.is_regular() {
                continue;
            }
            let live = region_live_bytes(heap, region);
            let garbage = region.used().saturating_sub(live);
            if garbage >= garbage_threshold && !region.is_pinned() {
                scored.push((idx, garbage));
            } else if garbage > 0 {
                // Not worth compacting, but its dead spans must be filled
                // before the next old mark can parse it.
                region.set_coalesce_fill_done(false);
                self.coalesce_fill_candidates.push(idx);
            }
        }
        scored.sort_by(|a, b| b.1.cmp(&a.1));
        self.collection_candidates = scored.into_iter().map(|(idx, _)| idx).collect();
        info!(
            "Old mark complete: {} collection candidates, {} fill candidates",
            self.collection_candidates.len(),
            self.coalesce_fill_candidates.len()
        );
    }

    pub fn unprocessed_old_collection_candidates(&self) -> usize {
        self.collection_candidates.len()
    }

    pub fn has_coalesce_and_fill_candidates(&self) -> bool {
        !self.coalesce_fill_candidates.is_empty()
    }

    pub fn coalesce_and_fill_candidates(&self) -> Vec<usize> {
        self.coalesce_fill_candidates.clone()
    }

    /// Add old candidates to the collection set until the old evacuation
    /// budget is spent. Pinned candidates are skipped and retried later.
    /// Returns the live bytes reserved for old evacuation.
    pub fn prime_collection_set(&mut self, heap: &Heap) -> usize {
        let options = heap.options();
        let cset = heap.collection_set();
        let mut budget =
            (heap.reserves().old_evac_reserve() as f64 / *options.old_evac_waste) as usize;
        let mut taken = 0usize;
        let mut remaining = Vec::new();

        for &idx in &self.collection_candidates {
            let region = heap.region(idx);
            if region.is_pinned() {
                remaining.push(idx);
                continue;
            }
            let live = region_live_bytes(heap, region);
            if live <= budget {
                let garbage = region.used().saturating_sub(live);
                cset.add_region(region, live, garbage, false);
                budget -= live;
                taken += live;
            } else {
                remaining.push(idx);
            }
        }
        self.collection_candidates = remaining;
        taken
    }

    /// Are all remaining candidates pinned (so compaction must wait)?
    pub fn all_candidates_pinned(&self, heap: &Heap) -> bool {
        !self.collection_candidates.is_empty()
            && self
                .collection_candidates
                .iter()
                .all(|&idx| heap.region(idx).is_pinned())
    }

    /// Drop all candidate tracking. Global and full collections do this; the
    /// old generation returns to idle.
    pub fn abandon_collection_candidates(&mut self) {
        self.collection_candidates.clear();
        self.coalesce_fill_candidates.clear();
    }
}

impl Default for OldHeuristics {
    fn default() -> Self {
        Self::new()
    }
}
