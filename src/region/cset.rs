//! The collection set: regions chosen for evacuation this cycle.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::region::HeapRegion;

/// Membership map plus budget tallies. The membership bit per region is what
/// the load-reference barrier consults, so it is kept as a dense array of
/// atomics rather than behind a lock.
pub struct CollectionSet {
    map: Box<[AtomicBool]>,
    regions: Mutex<Vec<usize>>,
    /// Claim cursor for parallel evacuation workers.
    cursor: AtomicUsize,
    young_bytes_to_evacuate: AtomicUsize,
    old_bytes_to_evacuate: AtomicUsize,
    young_bytes_to_promote: AtomicUsize,
    garbage: AtomicUsize,
    has_old_regions: AtomicBool,
    /// Aged regions preselected for promotion, scoped to one cycle. Owned
    /// here so the selection outlives collection-set choice but nothing else.
    preselected: Mutex<Option<Vec<bool>>>,
}

impl CollectionSet {
    pub fn new(num_regions: usize) -> CollectionSet {
        CollectionSet {
            map: (0..num_regions).map(|_| AtomicBool::new(false)).collect(),
            regions: Mutex::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            young_bytes_to_evacuate: AtomicUsize::new(0),
            old_bytes_to_evacuate: AtomicUsize::new(0),
            young_bytes_to_promote: AtomicUsize::new(0),
            garbage: AtomicUsize::new(0),
            has_old_regions: AtomicBool::new(false),
            preselected: Mutex::new(None),
        }
    }

    pub fn clear(&self) {
        for bit in self.map.iter() {
            bit.store(false, Ordering::Relaxed);
        }
        self.regions.lock().unwrap().clear();
        self.cursor.store(0, Ordering::Relaxed);
        self.young_bytes_to_evacuate.store(0, Ordering::Relaxed);
        self.old_bytes_to_evacuate.store(0, Ordering::Relaxed);
        self.young_bytes_to_promote.store(0, Ordering::Relaxed);
        self.garbage.store(0, Ordering::Relaxed);
        self.has_old_regions.store(false, Ordering::Relaxed);
    }

    /// Add a region. `live_bytes` is the evacuation payload; `garbage` the
    /// reclaimable rest; `promote` marks a preselected aged young region.
    pub fn add_region(&self, region: &HeapRegion, live_bytes: usize, garbage: usize, promote: bool) {
        debug_assert!(!region.is_humongous(), "humongous regions never move");
        debug_assert!(!region.is_pinned(), "pinned regions never enter the cset");
        region.make_cset();
        self.map[region.index()].store(true, Ordering::Release);
        self.regions.lock().unwrap().push(region.index());
        self.garbage.fetch_add(garbage, Ordering::Relaxed);
        if region.is_old() {
            self.old_bytes_to_evacuate
                .fetch_add(live_bytes, Ordering::Relaxed);
            self.has_old_regions.store(true, Ordering::Relaxed);
        } else if promote {
            self.young_bytes_to_promote
                .fetch_add(live_bytes, Ordering::Relaxed);
        } else {
            self.young_bytes_to_evacuate
                .fetch_add(live_bytes, Ordering::Relaxed);
        }
    }

    pub fn is_in(&self, region_index: usize) -> bool {
        self.map[region_index].load(Ordering::Acquire)
    }

    /// Drop a region from the membership map once its evacuation finished and
    /// the region was trashed.
    pub fn remove(&self, region_index: usize) {
        self.map[region_index].store(false, Ordering::Release);
    }

    pub fn is_empty(&self) -> bool {
        self.regions.lock().unwrap().is_empty()
    }

    pub fn count(&self) -> usize {
        self.regions.lock().unwrap().len()
    }

    pub fn regions(&self) -> Vec<usize> {
        self.regions.lock().unwrap().clone()
    }

    /// Claim the next unevacuated cset region. Used by parallel workers.
    pub fn claim_next(&self) -> Option<usize> {
        let regions = self.regions.lock().unwrap();
        loop {
            let cur = self.cursor.load(Ordering::Relaxed);
            if cur >= regions.len() {
                return None;
            }
            if self
                .cursor
                .compare_exchange(cur, cur + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(regions[cur]);
            }
        }
    }

    pub fn reset_cursor(&self) {
        self.cursor.store(0, Ordering::Relaxed);
    }

    pub fn young_bytes_to_evacuate(&self) -> usize {
        self.young_bytes_to_evacuate.load(Ordering::Relaxed)
    }

    pub fn old_bytes_to_evacuate(&self) -> usize {
        self.old_bytes_to_evacuate.load(Ordering::Relaxed)
    }

    pub fn young_bytes_to_promote(&self) -> usize {
        self.young_bytes_to_promote.load(Ordering::Relaxed)
    }

    pub fn garbage(&self) -> usize {
        self.garbage.load(Ordering::Relaxed)
    }

    pub fn has_old_regions(&self) -> bool {
        self.has_old_regions.load(Ordering::Relaxed)
    }

    // preselected promotion candidates

    pub fn establish_preselected(&self, preselected: Vec<bool>) {
        let mut slot = self.preselected.lock().unwrap();
        debug_assert!(slot.is_none(), "preselected already established");
        *slot = Some(preselected);
    }

    pub fn is_preselected(&self, region_index: usize) -> bool {
        self.preselected
            .lock()
            .unwrap()
            .as_ref()
            .map_or(false, |p| p[region_index])
    }

    pub fn abandon_preselected(&self) {
        *self.preselected.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Affiliation;
    use crate::util::constants::MIN_REGION_BYTES;
    use crate::util::memory::BackingStore;

    fn regions(n: usize) -> (BackingStore, Vec<HeapRegion>) {
        let store = BackingStore::new(n * MIN_REGION_BYTES, MIN_REGION_BYTES);
        let regions = (0..n)
            .map(|i| {
                let r = HeapRegion::new(
                    i,
                    store.start() + i * MIN_REGION_BYTES,
                    MIN_REGION_BYTES,
                );
                r.make_regular_allocation(Affiliation::Young);
                r
            })
            .collect();
        (store, regions)
    }

    #[test]
    fn membership_and_tallies() {
        let (_store, rs) = regions(4);
        let cset = CollectionSet::new(4);
        cset.add_region(&rs[1], 1000, 5000, false);
        cset.add_region(&rs[3], 200, 800, true);
        assert!(cset.is_in(1));
        assert!(!cset.is_in(0));
        assert_eq!(cset.count(), 2);
        assert_eq!(cset.young_bytes_to_evacuate(), 1000);
        assert_eq!(cset.young_bytes_to_promote(), 200);
        assert_eq!(cset.garbage(), 5800);
        assert!(!cset.has_old_regions());
    }

    #[test]
    fn claim_is_exhaustive_and_unique() {
        let (_store, rs) = regions(3);
        let cset = CollectionSet::new(3);
        for r in &rs {
            cset.add_region(r, 100, 100, false);
        }
        let mut seen = vec![];
        while let Some(idx) = cset.claim_next() {
            seen.push(idx);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);
        assert!(cset.claim_next().is_none());
    }

    #[test]
    fn preselected_scope() {
        let cset = CollectionSet::new(2);
        cset.establish_preselected(vec![false, true]);
        assert!(cset.is_preselected(1));
        assert!(!cset.is_preselected(0));
        cset.abandon_preselected();
        assert!(!cset.is_preselected(1));
    }

    #[test]
    fn clear_resets_everything() {
        let (_store, rs) = regions(2);
        let cset = CollectionSet::new(2);
        cset.add_region(&rs[0], 10, 20, false);
        cset.clear();
        assert!(cset.is_empty());
        assert!(!cset.is_in(0));
        assert_eq!(cset.garbage(), 0);
    }
}
