//! The full collection engine: a compacting STW fallback.
//!
//! Four passes under one safepoint: mark the whole heap, compute compaction
//! addresses, adjust pointers, move objects. Each affiliation slides within
//! its own ordered region sequence, so no object ever moves to a higher
//! address and per-object memmove is safe. Pinned regions and live humongous
//! objects do not move. Afterwards every generation's state and accounting
//! is rebuilt from the regions.

use crate::gc::concurrent::{
    cancel_old_marking, process_weak_refs, resolve_all_roots, run_mark_task,
    update_region_references,
};
use crate::gc::GcCause;
use crate::generation::GenerationKind;
use crate::global_state::gc_state;
use crate::heap::Heap;
use crate::marking::mark_and_push;
use crate::object;
use crate::region::{Affiliation, HeapRegion, RegionState};
use crate::scheduler::VmOperation;
use crate::util::address::{Address, ObjectReference};
use crate::util::constants::{CARD_BYTES, LOG_CARD_BYTES};
use crate::util::phase_times::{GcPhase, GcPhaseScope};

pub struct FullGc<'h> {
    heap: &'h Heap,
}

impl<'h> FullGc<'h> {
    pub fn new(heap: &'h Heap) -> FullGc<'h> {
        FullGc { heap }
    }

    pub fn collect(&self, cause: GcCause) {
        info!("Full GC ({})", cause);
        self.heap.vm_thread().execute(self.heap, &FullGcOp { cause });
    }
}

struct FullGcOp {
    cause: GcCause,
}

impl VmOperation for FullGcOp {
    fn name(&self) -> &'static str {
        "full-gc"
    }

    fn doit(&self, heap: &Heap) {
        do_full_gc_at_safepoint(heap, self.cause);
    }
}

/// The full-GC body. Also called directly by the degenerated engine when it
/// upgrades, which is already at a safepoint.
pub(crate) fn do_full_gc_at_safepoint(heap: &Heap, cause: GcCause) {
    let _timing = GcPhaseScope::new(heap.phase_times(), GcPhase::FullGc);
    let _ = cause;
    let state = heap.global_state();

    prepare(heap);
    phase1_mark(heap);
    let plan = phase2_calculate_target_addresses(heap);
    phase3_adjust_pointers(heap);
    phase4_compact_objects(heap, &plan);
    rebuild_after_compaction(heap, &plan);

    state.notify_gc_progress();
    if *heap.options().verify_after_gc {
        crate::gc::verify::verify_at_safepoint(heap, "after full GC");
    }
}

/// Abandon whatever the interrupted cycles left behind: marking state, SATB
/// snapshot, the collection set, and any half-done forwarding.
fn prepare(heap: &Heap) {
    let state = heap.global_state();

    if state.is_concurrent_old_mark_in_progress() {
        cancel_old_marking(heap);
    }
    if state.is_concurrent_mark_in_progress() {
        heap.young_generation().cancel_marking(heap);
        heap.global_generation().cancel_marking(heap);
    }
    heap.satb_queue_set().set_active(false);
    heap.satb_queue_set().abandon_partial_marking();
    heap.old_heuristics().abandon_collection_candidates();
    heap.old_state().take_in_place_promotions();

    // Dissolve the collection set; its regions compact like any others.
    let cset = heap.collection_set();
    for index in cset.regions() {
        let region = heap.region(index);
        debug_assert!(
            region.state() != RegionState::PinnedCset,
            "pinned cset region across full GC"
        );
        if region.is_cset() {
            region.make_regular_bypass();
        }
        cset.remove(index);
    }
    cset.clear();

    // Heal any forwarding left by a failed evacuation, so marking sees a
    // consistent graph of unforwarded objects.
    if state.has_forwarded_objects() {
        for idx in 0..heap.num_regions() {
            let region = heap.region(idx);
            region.capture_update_watermark();
            update_region_references(heap, region);
        }
        resolve_all_roots(heap);
        state.set_state_bit(gc_state::HAS_FORWARDED, false);
    }
    state.set_state_bit(gc_state::EVACUATION, false);
    state.set_state_bit(gc_state::UPDATE_REFS, false);
    state.set_state_bit(gc_state::WEAK_ROOTS, false);
}

fn phase1_mark(heap: &Heap) {
    let global = heap.global_generation();
    global.prepare_gc(heap);
    global.ref_processor().enable_discovery();

    let queues = global.task_queues();
    for root in heap.global_roots().iter() {
        mark_and_push(heap, object::resolve(*root), GenerationKind::Global, None, queues);
    }
    for reference in heap.pending_references_snapshot() {
        mark_and_push(heap, reference, GenerationKind::Global, None, queues);
    }
    heap.mutators().handshake_all(|m| {
        for root in m.roots.lock().unwrap().iter() {
            mark_and_push(heap, object::resolve(*root), GenerationKind::Global, None, queues);
        }
    });
    run_mark_task(heap, GenerationKind::Global, false);

    global.ref_processor().disable_discovery();
    process_weak_refs(heap, GenerationKind::Global);

    // Weak handles: drop dead entries now, while the marks are authoritative.
    let ctx = heap.marking_context();
    heap.weak_handles().retain(|&obj| {
        let region_index = heap.region_index_of(obj.to_address());
        ctx.is_live(region_index, obj)
    });

    global.set_mark_complete();
}

/// Where compaction puts things: per-region new tops, plus which regions end
/// up empty.
struct CompactionPlan {
    new_tops: Vec<Address>,
}

/// A bump cursor over one affiliation's ordered region sequence.
struct TargetCursor<'h> {
    heap: &'h Heap,
    affiliation: Affiliation,
    region_index: usize,
    addr: Address,
}

impl<'h> TargetCursor<'h> {
    fn new(heap: &'h Heap, affiliation: Affiliation) -> TargetCursor<'h> {
        let mut cursor = TargetCursor {
            heap,
            affiliation,
            region_index: usize::MAX,
            addr: Address::ZERO,
        };
        cursor.advance_region(0);
        cursor
    }

    fn region_usable(&self, region: &HeapRegion) -> bool {
        region.affiliation() == self.affiliation
            && region.state() == RegionState::Regular
            && !region.is_pinned()
    }

    fn advance_region(&mut self, from: usize) {
        for idx in from..self.heap.num_regions() {
            let region = self.heap.region(idx);
            if self.region_usable(region) {
                self.region_index = idx;
                self.addr = region.bottom();
                return;
            }
        }
        self.region_index = self.heap.num_regions();
    }

    fn allocate(&mut self, size_bytes: usize, plan: &mut CompactionPlan) -> Address {
        loop {
            assert!(
                self.region_index < self.heap.num_regions(),
                "compaction ran out of target regions"
            );
            let region = self.heap.region(self.region_index);
            if self.addr + size_bytes <= region.end() {
                let result = self.addr;
                self.addr = self.addr + size_bytes;
                plan.new_tops[self.region_index] = self.addr;
                return result;
            }
            self.advance_region(self.region_index + 1);
        }
    }
}

fn phase2_calculate_target_addresses(heap: &Heap) -> CompactionPlan {
    let ctx = heap.marking_context();
    let mut plan = CompactionPlan {
        new_tops: (0..heap.num_regions())
            .map(|idx| heap.region(idx).bottom())
            .collect(),
    };

    // Dead humongous objects free their whole run before targets are picked.
    for idx in 0..heap.num_regions() {
        let region = heap.region(idx);
        if region.is_humongous_start() {
            let obj = ObjectReference::from_address(region.bottom());
            if !ctx.is_live(idx, obj) {
                heap.trash_humongous_object(idx);
            } else {
                plan.new_tops[idx] = region.top();
            }
        } else if region.is_humongous_cont() {
            plan.new_tops[idx] = region.top();
        } else if region.is_pinned() {
            plan.new_tops[idx] = region.top();
        }
    }

    for affiliation in [Affiliation::Old, Affiliation::Young] {
        let mut cursor = TargetCursor::new(heap, affiliation);
        for idx in 0..heap.num_regions() {
            let region = heap.region(idx);
            if !cursor.region_usable(region) || region.affiliation() != affiliation {
                continue;
            }
            ctx.marked_object_iterate(region, |obj| {
                let size = object::size_bytes(obj);
                let target = cursor.allocate(size, &mut plan);
                debug_assert!(target <= obj.to_address(), "compaction never moves right");
                match object::attempt_to_forward(obj) {
                    object::ForwardingAttempt::Winner => {
                        object::set_forwardee(obj, ObjectReference::from_address(target));
                    }
                    object::ForwardingAttempt::Lost => unreachable!("single-threaded forwarding"),
                }
            });
        }
    }
    plan
}

fn phase3_adjust_pointers(heap: &Heap) {
    let ctx = heap.marking_context();
    for idx in 0..heap.num_regions() {
        let region = heap.region(idx);
        if !region.is_active() || region.is_humongous_cont() {
            continue;
        }
        ctx.marked_object_iterate(region, |obj| {
            let slots = object::ref_slot_count(obj);
            for i in 0..slots {
                if let Some(target) = object::get_ref(obj, i) {
                    object::set_ref(obj, i, Some(object::resolve(target)));
                }
            }
        });
    }
    resolve_all_roots(heap);
    let resolved: Vec<ObjectReference> = heap
        .take_pending_references()
        .into_iter()
        .map(object::resolve)
        .collect();
    heap.publish_pending_references(resolved);
}

fn phase4_compact_objects(heap: &Heap, _plan: &CompactionPlan) {
    let ctx = heap.marking_context();

    // Walk sources ascending; every target is at or below its source, so a
    // per-object memmove cannot clobber an uncopied object.
    for idx in 0..heap.num_regions() {
        let region = heap.region(idx);
        if region.state() != RegionState::Regular || !region.is_affiliated() {
            continue;
        }
        region.reset_object_starts();
        ctx.marked_object_iterate(region, |obj| {
            if !object::is_forwarded(obj) {
                return; // pinned or in place
            }
            let target = object::spin_and_get_forwarded(obj);
            let size = object::size_bytes(obj);
            if target != obj {
                unsafe {
                    std::ptr::copy(
                        obj.to_address().to_ptr::<u8>(),
                        target.to_address().to_mut_ptr::<u8>(),
                        size,
                    );
                }
            }
            // Reset the copied (or in-place) status word.
            unsafe {
                target.to_address().store::<usize>(0);
            }
            let target_region = heap.region_of(target.to_address());
            target_region.record_object_start(target.to_address());
        });
    }
}

/// Rebuild regions, accounting, and collector state from the compacted heap.
fn rebuild_after_compaction(heap: &Heap, plan: &CompactionPlan) {
    let state = heap.global_state();
    let ctx = heap.marking_context();

    heap.young_generation().reset_accounting();
    heap.old_generation().reset_accounting();
    heap.global_generation().reset_accounting();

    for idx in 0..heap.num_regions() {
        let region = heap.region(idx);
        if region.state() == RegionState::Regular {
            let new_top = plan.new_tops[idx];
            region.set_top(new_top);
            region.reset_update_watermark();
            region.reset_live_data();
            region.set_coalesce_fill_done(true);
            ctx.capture_tams_at(idx, region.bottom());
            if new_top == region.bottom() {
                region.make_trash();
            }
        }
        // Every affiliated region, trash included, re-enters the books;
        // recycling the trash then balances the accounts.
        if region.is_affiliated() {
            let affiliation = region.affiliation();
            heap.gen_accounting_after_full_gc(region, affiliation, region.used());
            if region.is_humongous_start() {
                let obj = ObjectReference::from_address(region.bottom());
                let size = object::size_bytes(obj);
                let span = (size + heap.region_size_bytes() - 1) / heap.region_size_bytes();
                let waste = span * heap.region_size_bytes() - size;
                if waste > 0 {
                    heap.increase_humongous_waste(affiliation, waste);
                }
            }
        }
    }

    // The mark bitmap refers to pre-compaction addresses; invalidate it.
    heap.young_generation().set_mark_incomplete();
    heap.old_generation().set_mark_incomplete();
    heap.global_generation().set_mark_incomplete();

    // Old-to-young pointers moved; make the next remembered-set scan
    // conservative by dirtying every old card in the write table.
    for idx in 0..heap.num_regions() {
        let region = heap.region(idx);
        if region.is_old() && region.is_active() {
            let cards = heap.region_size_bytes() >> LOG_CARD_BYTES;
            let first = heap.card_table().card_index_of(region.bottom());
            let used_cards = (region.used() + CARD_BYTES - 1) >> LOG_CARD_BYTES;
            for card in 0..used_cards.min(cards) {
                heap.card_table().write_table().mark_dirty(first + card);
            }
        }
    }

    state.set_state_bit(gc_state::HAS_FORWARDED, false);

    heap.free_set().recycle_trash(heap);

    // Re-apportion capacity: young returns to its configured share, bounded
    // by what each generation actually occupies after compaction.
    let region_size = heap.region_size_bytes();
    let young_floor = heap.young_generation().affiliated_region_count() * region_size;
    let old_floor = heap.old_generation().affiliated_region_count() * region_size;
    let young_capacity = heap
        .options()
        .young_capacity(heap.capacity())
        .max(young_floor)
        .min(heap.capacity() - old_floor);
    heap.sizer().reset_apportionment(heap, young_capacity);

    let (young_cset, old_cset) = heap.free_set().prepare_to_rebuild(heap);
    heap.free_set().rebuild(heap, young_cset, old_cset);
    heap.reserves().set_valid(false);
}
