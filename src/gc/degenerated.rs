//! The degenerated collection engine.
//!
//! When a concurrent cycle is cancelled (usually by allocation failure), the
//! control thread schedules a degenerated cycle: a single STW operation that
//! picks up the concurrent cycle's invariants at the recorded degeneration
//! point and drives the remaining phases to completion without mutator
//! interference. If even the degenerated cycle cannot evacuate, it upgrades
//! to full GC on the spot.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::gc::concurrent::{
    choose_collection_set, finish_update_refs, maybe_complete_old_marking, process_weak_refs,
    promote_regions_in_place, prune_and_update_weak_roots, register_in_place_promotions,
    resolve_all_roots, run_mark_task, update_region_references, update_region_states,
    update_roots_evacuating,
};
use crate::gc::full::do_full_gc_at_safepoint;
use crate::gc::{DegenPoint, GcCause};
use crate::generation::GenerationKind;
use crate::global_state::gc_state;
use crate::heap::Heap;
use crate::marking::mark_and_push;
use crate::region::free_set::Partition;
use crate::scheduler::VmOperation;
use crate::util::conversions::display_bytes;
use crate::util::phase_times::{GcPhase, GcPhaseScope};

pub struct DegenOutcome {
    pub abbreviated: bool,
    pub progress: bool,
    pub upgraded_to_full: bool,
}

pub struct DegeneratedGc<'h> {
    heap: &'h Heap,
    generation: GenerationKind,
    point: DegenPoint,
    abbreviated: AtomicBool,
    progress: AtomicBool,
    upgraded: AtomicBool,
}

impl<'h> DegeneratedGc<'h> {
    pub fn new(heap: &'h Heap, generation: GenerationKind, point: DegenPoint) -> DegeneratedGc<'h> {
        DegeneratedGc {
            heap,
            generation,
            point,
            abbreviated: AtomicBool::new(false),
            progress: AtomicBool::new(false),
            upgraded: AtomicBool::new(false),
        }
    }

    pub fn collect(&self, cause: GcCause) -> DegenOutcome {
        info!("Degenerated GC from point: {} ({})", self.point, cause);
        self.heap.vm_thread().execute(self.heap, &DegenOp { gc: self });
        DegenOutcome {
            abbreviated: self.abbreviated.load(Ordering::Acquire),
            progress: self.progress.load(Ordering::Acquire),
            upgraded_to_full: self.upgraded.load(Ordering::Acquire),
        }
    }
}

struct DegenOp<'a, 'h> {
    gc: &'a DegeneratedGc<'h>,
}

impl VmOperation for DegenOp<'_, '_> {
    fn name(&self) -> &'static str {
        "degenerated-gc"
    }

    fn doit(&self, heap: &Heap) {
        let _timing = GcPhaseScope::new(heap.phase_times(), GcPhase::DegenStw);
        let gc = self.gc;
        let state = heap.global_state();
        let kind = gc.generation;

        // The cancellation that got us here is consumed; STW phases never
        // cancel (a sticky stop-the-vm cause survives).
        state.clear_cancelled();

        let free_before = heap.free_set().available_in(Partition::Mutator);

        // Phases before the degeneration point have already established
        // their invariants; resume from the recorded point.
        if gc.point == DegenPoint::OutsideCycle {
            degen_reset_and_init_mark(heap, kind);
        }

        if gc.point <= DegenPoint::Mark {
            degen_finish_mark(heap, kind);
        }

        if state.is_evacuation_in_progress() {
            update_roots_evacuating(heap);
            heap.collection_set().reset_cursor();
            degen_evacuate(heap);

            if state.cancelled_cause() == GcCause::AllocFailureEvac {
                // Could not even evacuate under STW with every free region
                // available: upgrade to full GC.
                info!("Degenerated GC upgrading to full GC");
                state.clear_cancelled();
                gc.upgraded.store(true, Ordering::Release);
                do_full_gc_at_safepoint(heap, GcCause::UpgradeToFull);
                gc.progress.store(true, Ordering::Release);
                return;
            }

            // Init update refs.
            for idx in 0..heap.num_regions() {
                let region = heap.region(idx);
                if region.is_active() && !region.is_cset() {
                    region.capture_update_watermark();
                }
            }
            state.set_state_bit(gc_state::EVACUATION, false);
            state.set_state_bit(gc_state::WEAK_ROOTS, false);
            state.set_state_bit(gc_state::UPDATE_REFS, true);
        }

        if state.is_update_refs_in_progress() {
            for idx in 0..heap.num_regions() {
                update_region_references(heap, heap.region(idx));
            }
            resolve_all_roots(heap);
            finish_update_refs(heap);
            heap.free_set().recycle_trash(heap);
        } else {
            // Nothing was (or needed to be) evacuated.
            promote_regions_in_place(heap);
            state.set_state_bit(gc_state::WEAK_ROOTS, false);
            heap.free_set().recycle_trash(heap);
            gc.abbreviated.store(true, Ordering::Release);
        }

        let free_after = heap.free_set().available_in(Partition::Mutator);
        if free_after > free_before {
            gc.progress.store(true, Ordering::Release);
            state.notify_gc_progress();
        } else {
            state.notify_gc_no_progress();
        }
        info!(
            "Degenerated GC done: {} free before, {} after",
            display_bytes(free_before),
            display_bytes(free_after)
        );

        if *heap.options().verify_after_gc {
            crate::gc::verify::verify_at_safepoint(heap, "after degenerated GC");
        }
    }
}

/// The cycle never started: do reset and init-mark work under the same
/// safepoint.
fn degen_reset_and_init_mark(heap: &Heap, kind: GenerationKind) {
    let state = heap.global_state();
    heap.generation(kind).prepare_gc(heap);
    heap.card_table().mark_read_table_as_clean();
    if kind == GenerationKind::Young {
        heap.card_table().swap_tables();
    }
    heap.generation(kind).ref_processor().enable_discovery();
    heap.satb_queue_set().set_active(true);
    state.set_state_bit(gc_state::MARKING, true);

    // Roots, STW. The remembered-set scan runs non-concurrently.
    if kind == GenerationKind::Young {
        heap.young_generation().scan_remembered_set(heap, false);
    }
    let queues = heap.generation(kind).task_queues();
    for root in heap.global_roots().iter() {
        mark_and_push(heap, *root, kind, None, queues);
    }
    for reference in heap.pending_references_snapshot() {
        mark_and_push(heap, reference, kind, None, queues);
    }
    heap.mutators().handshake_all(|m| {
        for root in m.roots.lock().unwrap().iter() {
            mark_and_push(heap, *root, kind, None, queues);
        }
    });
}

/// Finish marking and run the final-mark bookkeeping: region states,
/// collection-set choice, reference processing, free-set rebuild.
fn degen_finish_mark(heap: &Heap, kind: GenerationKind) {
    let state = heap.global_state();

    heap.mutators().handshake_all(|m| {
        heap.satb_queue_set().flush_buffer(&mut m.satb.lock().unwrap());
    });
    run_mark_task(heap, kind, false);

    let generation = heap.generation(kind);
    generation.ref_processor().disable_discovery();
    generation.set_mark_complete();
    state.set_state_bit(gc_state::MARKING, false);

    let (immediate_garbage, total_garbage) = update_region_states(heap, kind);
    register_in_place_promotions(heap, kind);
    maybe_complete_old_marking(heap);
    heap.satb_queue_set()
        .set_active(state.is_concurrent_old_mark_in_progress());

    let cset = heap.collection_set();
    cset.clear();
    let threshold = *heap.options().immediate_garbage_threshold_percent;
    if total_garbage == 0 || immediate_garbage * 100 < total_garbage * threshold {
        choose_collection_set(heap, kind);
    }
    if !cset.is_empty() {
        state.set_state_bit(gc_state::EVACUATION, true);
        state.set_state_bit(gc_state::HAS_FORWARDED, true);
    }
    state.set_state_bit(gc_state::WEAK_ROOTS, true);

    heap.reserves().set_valid(true);
    let (young_cset, old_cset) = heap.free_set().prepare_to_rebuild(heap);
    heap.free_set().rebuild(heap, young_cset, old_cset);
    heap.reserves().set_valid(false);
    cset.abandon_preselected();

    process_weak_refs(heap, kind);
    prune_and_update_weak_roots(heap, kind);
    heap.free_set().recycle_trash(heap);
}

/// STW evacuation over the whole collection set. STW phases never cancel;
/// a second allocation failure shows up as the `AllocFailureEvac` cause and
/// is handled by the upgrade path.
fn degen_evacuate(heap: &Heap) {
    let ctx = heap.marking_context();
    while let Some(index) = heap.collection_set().claim_next() {
        if heap.global_state().cancelled_cause() == GcCause::AllocFailureEvac {
            return;
        }
        let region = heap.region(index);
        ctx.marked_object_iterate(region, |obj| {
            heap.evacuate_object(obj);
        });
    }
}
