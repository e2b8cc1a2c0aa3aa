//! The free set: which regions can serve which allocations.
//!
//! Regions available for allocation are partitioned into three sets: the
//! mutator partition (application allocations), the collector partition
//! (young evacuation), and the old-collector partition (old evacuation and
//! promotion). A region is in at most one partition; retired and in-use
//! regions are in none. The partition layout is rebuilt after every cycle's
//! evacuation decisions, honoring the evacuation and promotion reserves.
//!
//! The free-set mutex doubles as the heap lock: all region state and
//! generation accounting changes happen under it.

use std::sync::{Mutex, MutexGuard};

use crate::heap::Heap;
use crate::object;
use crate::region::{Affiliation, HeapRegion, RegionState};
use crate::util::address::Address;
use crate::util::constants::BYTES_IN_WORD;
use crate::util::conversions::display_bytes;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Partition {
    Mutator,
    Collector,
    OldCollector,
}

/// What an allocation request is for. Decides the partition, the affiliation,
/// and which reserve it draws from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocType {
    /// Mutator slow-path allocation.
    Shared,
    /// GC worker evacuation allocation (young).
    SharedGc,
    /// GC worker private evacuation buffer (young).
    Plab,
    /// GC worker promotion allocation (old).
    Promotion,
    /// Multi-region object.
    Humongous,
}

#[derive(Copy, Clone, Debug)]
pub struct AllocRequest {
    pub size_bytes: usize,
    pub alloc_type: AllocType,
    pub affiliation: Affiliation,
}

impl AllocRequest {
    pub fn shared(size_bytes: usize) -> AllocRequest {
        AllocRequest {
            size_bytes,
            alloc_type: AllocType::Shared,
            affiliation: Affiliation::Young,
        }
    }

    pub fn for_evacuation(size_bytes: usize, promotion: bool) -> AllocRequest {
        if promotion {
            AllocRequest {
                size_bytes,
                alloc_type: AllocType::Promotion,
                affiliation: Affiliation::Old,
            }
        } else {
            AllocRequest {
                size_bytes,
                alloc_type: AllocType::SharedGc,
                affiliation: Affiliation::Young,
            }
        }
    }

    pub fn humongous(size_bytes: usize) -> AllocRequest {
        AllocRequest {
            size_bytes,
            alloc_type: AllocType::Humongous,
            affiliation: Affiliation::Young,
        }
    }
}

struct Inner {
    membership: Vec<Option<Partition>>,
    free_bytes: [usize; 3],
    counts: [usize; 3],
}

impl Inner {
    fn idx(p: Partition) -> usize {
        match p {
            Partition::Mutator => 0,
            Partition::Collector => 1,
            Partition::OldCollector => 2,
        }
    }

    fn move_to(&mut self, region: &HeapRegion, to: Option<Partition>) {
        let i = region.index();
        if let Some(from) = self.membership[i] {
            self.free_bytes[Self::idx(from)] -= region.free();
            self.counts[Self::idx(from)] -= 1;
        }
        self.membership[i] = to;
        if let Some(to) = to {
            self.free_bytes[Self::idx(to)] += region.free();
            self.counts[Self::idx(to)] += 1;
        }
    }

    /// The allocation consumed `bytes` out of the region's partition.
    fn note_allocation(&mut self, region: &HeapRegion, bytes: usize) {
        if let Some(p) = self.membership[region.index()] {
            self.free_bytes[Self::idx(p)] -= bytes;
        }
    }
}

pub struct FreeSet {
    inner: Mutex<Inner>,
}

impl FreeSet {
    pub fn new(num_regions: usize) -> FreeSet {
        FreeSet {
            inner: Mutex::new(Inner {
                membership: vec![None; num_regions],
                free_bytes: [0; 3],
                counts: [0; 3],
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Bytes still allocatable in a partition.
    pub fn available_in(&self, partition: Partition) -> usize {
        self.lock().free_bytes[Inner::idx(partition)]
    }

    pub fn count_in(&self, partition: Partition) -> usize {
        self.lock().counts[Inner::idx(partition)]
    }

    /// Satisfy an allocation request. Returns the address of the new storage,
    /// or `None` when the affiliated generation's capacity, the partitions,
    /// or the reserves cannot cover it.
    pub fn allocate(&self, heap: &Heap, req: AllocRequest) -> Option<Address> {
        debug_assert!(req.size_bytes % BYTES_IN_WORD == 0);
        let mut inner = self.lock();

        // Generation capacity bounds every allocation, whatever partition it
        // comes from.
        let generation = heap.generation(match req.affiliation {
            Affiliation::Young => crate::generation::GenerationKind::Young,
            Affiliation::Old => crate::generation::GenerationKind::Old,
            Affiliation::Free => unreachable!("allocation without affiliation"),
        });
        if req.alloc_type == AllocType::Humongous {
            let region_bytes = heap.region_size_bytes();
            let needed = (req.size_bytes + region_bytes - 1) / region_bytes;
            if generation.available() < needed * region_bytes
                || generation.free_unaffiliated_regions(region_bytes) < needed
            {
                return None;
            }
            return self.allocate_contiguous(heap, &mut inner, req);
        }
        if generation.available() < req.size_bytes {
            return None;
        }

        // Promotions draw down the promotion reserve; fail them when the
        // reserve is exhausted so promotion pressure cannot starve old evac.
        if req.alloc_type == AllocType::Promotion
            && !heap.reserves().expend_promoted(req.size_bytes)
        {
            return None;
        }

        let result = match req.alloc_type {
            AllocType::Shared => self.allocate_single(heap, &mut inner, req, Partition::Mutator),
            // Old evacuation stays within the old-collector reserve; it is
            // already clamped to unfragmented old free space.
            AllocType::SharedGc | AllocType::Plab if req.affiliation == Affiliation::Old => {
                self.allocate_single(heap, &mut inner, req, Partition::OldCollector)
            }
            AllocType::SharedGc | AllocType::Plab => self
                .allocate_single(heap, &mut inner, req, Partition::Collector)
                // Evacuation may spill into empty mutator regions rather than
                // fail the cycle outright.
                .or_else(|| self.allocate_single(heap, &mut inner, req, Partition::Mutator)),
            AllocType::Promotion => {
                self.allocate_single(heap, &mut inner, req, Partition::OldCollector)
            }
            AllocType::Humongous => unreachable!(),
        };

        if result.is_none() && req.alloc_type == AllocType::Promotion {
            heap.reserves().unexpend_promoted(req.size_bytes);
        }
        result
    }

    fn allocate_single(
        &self,
        heap: &Heap,
        inner: &mut Inner,
        req: AllocRequest,
        partition: Partition,
    ) -> Option<Address> {
        for idx in 0..inner.membership.len() {
            if inner.membership[idx] != Some(partition) {
                continue;
            }
            let region = heap.region(idx);
            // A partition member is either empty (usable by any affiliation)
            // or already affiliated; skip mismatches.
            if region.is_affiliated() && region.affiliation() != req.affiliation {
                continue;
            }
            if region.free() < req.size_bytes {
                continue;
            }
            let newly_affiliated = !region.is_affiliated();
            if newly_affiliated {
                // Affiliating the region consumes one of the generation's
                // region slots.
                let generation = match req.affiliation {
                    Affiliation::Young => heap.young_generation(),
                    Affiliation::Old => heap.old_generation(),
                    Affiliation::Free => unreachable!(),
                };
                if generation.free_unaffiliated_regions(heap.region_size_bytes()) == 0 {
                    continue;
                }
            }
            if region.is_empty() || region.is_regular() {
                region.make_regular_allocation(req.affiliation);
            } else {
                continue;
            }
            let result = region.allocate(req.size_bytes).expect("free space checked");
            if newly_affiliated {
                heap.account_affiliation(region, req.affiliation);
            }
            heap.increase_used(req.affiliation, req.size_bytes);
            inner.note_allocation(region, req.size_bytes);
            // Too small to serve anything else: retire from the partition.
            if region.free() < object::MIN_OBJECT_WORDS * BYTES_IN_WORD {
                inner.move_to(region, None);
            }
            return Some(result);
        }
        None
    }

    /// Allocate a humongous object over whole contiguous regions from the
    /// mutator partition.
    fn allocate_contiguous(
        &self,
        heap: &Heap,
        inner: &mut Inner,
        req: AllocRequest,
    ) -> Option<Address> {
        let region_bytes = heap.region_size_bytes();
        let needed = (req.size_bytes + region_bytes - 1) / region_bytes;
        let num = inner.membership.len();

        let mut run_start = 0;
        let mut run_len = 0;
        for idx in 0..num {
            let usable = inner.membership[idx] == Some(Partition::Mutator)
                && heap.region(idx).is_empty();
            if usable {
                if run_len == 0 {
                    run_start = idx;
                }
                run_len += 1;
                if run_len == needed {
                    return Some(self.claim_contiguous(heap, inner, run_start, needed, req));
                }
            } else {
                run_len = 0;
            }
        }
        None
    }

    fn claim_contiguous(
        &self,
        heap: &Heap,
        inner: &mut Inner,
        start: usize,
        count: usize,
        req: AllocRequest,
    ) -> Address {
        let region_bytes = heap.region_size_bytes();
        let first = heap.region(start);
        first.make_humongous_start(req.affiliation);
        heap.account_affiliation(first, req.affiliation);
        for i in 1..count {
            let r = heap.region(start + i);
            r.make_humongous_cont(req.affiliation, start);
            heap.account_affiliation(r, req.affiliation);
        }
        // Tops are set so `used` reflects the object; the tail of the last
        // region is humongous waste.
        let total = count * region_bytes;
        let waste = total - req.size_bytes;
        for i in 0..count {
            let r = heap.region(start + i);
            inner.move_to(r, None);
            let covered = ((i + 1) * region_bytes).min(req.size_bytes);
            let in_this = covered.saturating_sub(i * region_bytes);
            r.set_top(r.bottom() + in_this);
        }
        first.record_object_start(first.bottom());
        heap.increase_used(req.affiliation, req.size_bytes);
        heap.increase_humongous_waste(req.affiliation, waste);
        first.bottom()
    }

    /// Count the collection-set and trash regions about to come back, per
    /// generation. Called under the heap lock right before [`rebuild`].
    pub fn prepare_to_rebuild(&self, heap: &Heap) -> (usize, usize) {
        let _inner = self.lock();
        let mut young = 0;
        let mut old = 0;
        for idx in 0..heap.num_regions() {
            let r = heap.region(idx);
            if r.is_cset() || r.is_trash() {
                match r.affiliation() {
                    Affiliation::Young => young += 1,
                    Affiliation::Old => old += 1,
                    Affiliation::Free => {}
                }
            }
        }
        (young, old)
    }

    /// Re-partition every region. `young_cset_regions`/`old_cset_regions`
    /// (from [`prepare_to_rebuild`]) describe memory that is coming back and
    /// may be counted toward the reserves.
    pub fn rebuild(&self, heap: &Heap, _young_cset_regions: usize, _old_cset_regions: usize) {
        let mut inner = self.lock();
        let num = heap.num_regions();

        for idx in 0..num {
            let region = heap.region(idx);
            if inner.membership[idx].is_some() {
                inner.move_to(region, None);
            }
        }

        // First pass: everything allocatable goes to the mutator partition.
        // Trash is counted too; it is recycled before anyone touches it.
        for idx in 0..num {
            let region = heap.region(idx);
            let usable = match region.state() {
                RegionState::Empty => true,
                RegionState::Regular => {
                    region.free() >= object::MIN_OBJECT_WORDS * BYTES_IN_WORD
                        && !region.is_old()
                }
                _ => false,
            };
            if usable {
                inner.move_to(region, Some(Partition::Mutator));
            }
        }

        // Second pass: peel off the reserves. Collector reserve comes from
        // empty mutator regions, highest index first, so mutator allocation
        // keeps filling from the bottom of the heap. The old-collector
        // reserve prefers regions already affiliated old (fragmented free
        // space), topping up with empty ones.
        let reserves = heap.reserves();
        let young_reserve = reserves.young_reserve_for_rebuild(heap);
        let old_reserve = reserves.old_reserve_for_rebuild(heap);

        let mut reserved = 0usize;
        for idx in (0..num).rev() {
            if reserved >= young_reserve {
                break;
            }
            let region = heap.region(idx);
            if inner.membership[idx] == Some(Partition::Mutator) && region.is_empty() {
                inner.move_to(region, Some(Partition::Collector));
                reserved += region.free();
            }
        }

        let mut old_reserved = 0usize;
        for idx in 0..num {
            if old_reserved >= old_reserve {
                break;
            }
            let region = heap.region(idx);
            if region.is_old()
                && region.is_regular()
                && region.free() >= object::MIN_OBJECT_WORDS * BYTES_IN_WORD
                && inner.membership[idx].is_none()
            {
                inner.move_to(region, Some(Partition::OldCollector));
                old_reserved += region.free();
            }
        }
        for idx in (0..num).rev() {
            if old_reserved >= old_reserve {
                break;
            }
            let region = heap.region(idx);
            if inner.membership[idx] == Some(Partition::Mutator) && region.is_empty() {
                inner.move_to(region, Some(Partition::OldCollector));
                old_reserved += region.free();
            }
        }
    }

    /// Zero and return all trash regions to circulation. The memory cost of
    /// recycling is paid here, in bulk, not at reclamation time. Returns the
    /// number of regions recycled.
    pub fn recycle_trash(&self, heap: &Heap) -> usize {
        let mut inner = self.lock();
        let mut recycled = 0;
        for idx in 0..heap.num_regions() {
            let region = heap.region(idx);
            if region.is_trash() {
                heap.recycle_region_under_lock(region);
                region.make_empty();
                inner.move_to(region, Some(Partition::Mutator));
                recycled += 1;
            }
        }
        recycled
    }

    /// Diagnostic line, printed by the control thread around cycles.
    pub fn log_status_under_lock(&self, heap: &Heap) {
        let inner = self.lock();
        info!(
            "Free: {} ({} regions), Evac reserve: {} ({} regions), Old reserve: {} ({} regions)",
            display_bytes(inner.free_bytes[0]),
            inner.counts[0],
            display_bytes(inner.free_bytes[1]),
            inner.counts[1],
            display_bytes(inner.free_bytes[2]),
            inner.counts[2],
        );
        let _ = heap;
    }

    pub fn assert_partitions_disjoint(&self, heap: &Heap) {
        let inner = self.lock();
        for idx in 0..heap.num_regions() {
            if let Some(p) = inner.membership[idx] {
                let r = heap.region(idx);
                assert!(
                    r.is_empty() || r.is_regular() || r.is_trash(),
                    "region {} in partition {:?} has state {:?}",
                    idx,
                    p,
                    r.state()
                );
            }
        }
    }
}
