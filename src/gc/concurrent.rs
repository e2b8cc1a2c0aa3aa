//! The concurrent collection engine.
//!
//! One instance runs one cycle for one generation (young or global). The
//! pipeline interleaves concurrent phases with short STW operations:
//!
//! ```text
//! reset -> [init mark] -> scan rset -> mark roots -> mark
//!       -> [final mark] -> thread roots -> weak refs -> weak roots
//!       -> cleanup early -> strong roots -> evacuate
//!       -> [init update refs] -> update refs -> update thread roots
//!       -> [final update refs] -> cleanup complete -> reset after collect
//! ```
//!
//! Every concurrent phase polls the shared cancellation flag; on observing
//! it, `collect` records the degeneration point and returns false so the
//! control thread can schedule a degenerated STW finish. If final mark finds
//! nothing to evacuate, the cycle is "abbreviated": evacuation and reference
//! updating are skipped entirely.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use atomic::Atomic;

use crate::gc::{DegenPoint, GcCause};
use crate::generation::old::{transfer_pointers_from_satb, OldGenState};
use crate::generation::GenerationKind;
use crate::global_state::gc_state;
use crate::heap::Heap;
use crate::heuristics::adaptive::region_live_bytes;
use crate::marking::{self, mark_and_push};
use crate::object;
use crate::region::HeapRegion;
use crate::scheduler::{ParallelTask, VmOperation};
use crate::util::address::ObjectReference;
use crate::util::conversions::display_bytes;
use crate::util::phase_times::{GcPhase, GcPhaseScope};

pub struct ConcurrentGc<'h> {
    heap: &'h Heap,
    generation: GenerationKind,
    /// This cycle also bootstraps old marking (generational mode).
    bootstrap_old: bool,
    abbreviated: AtomicBool,
    degen_point: Atomic<DegenPoint>,
}

impl<'h> ConcurrentGc<'h> {
    pub fn new(heap: &'h Heap, generation: GenerationKind, bootstrap_old: bool) -> ConcurrentGc<'h> {
        debug_assert!(generation != GenerationKind::Old, "old never runs its own cycle");
        ConcurrentGc {
            heap,
            generation,
            bootstrap_old,
            abbreviated: AtomicBool::new(false),
            degen_point: Atomic::new(DegenPoint::OutsideCycle),
        }
    }

    pub fn abbreviated(&self) -> bool {
        self.abbreviated.load(Ordering::Acquire)
    }

    pub fn degen_point(&self) -> DegenPoint {
        self.degen_point.load(Ordering::Acquire)
    }

    fn check_cancellation_and_abort(&self, point: DegenPoint) -> bool {
        if self.heap.global_state().is_cancelled() {
            self.degen_point.store(point, Ordering::Release);
            return true;
        }
        false
    }

    pub fn collect(&self, cause: GcCause) -> bool {
        let heap = self.heap;
        heap.global_state().notify_gc_no_progress();

        // Reset for the upcoming mark.
        if !self.entry_reset() {
            // Coalesce-and-fill was preempted; resume on a later cycle.
            self.degen_point
                .store(DegenPoint::OutsideCycle, Ordering::Release);
            return false;
        }

        // Start the mark under STW.
        heap.vm_thread().execute(heap, &InitMarkOp { gc: self });

        // Concurrent remembered-set scanning (young only).
        if self.generation == GenerationKind::Young {
            self.entry_scan_remembered_set();
        }

        // Concurrent root marking.
        self.entry_mark_roots();
        if self.check_cancellation_and_abort(DegenPoint::Roots) {
            return false;
        }

        // Concurrent mark.
        if !self.entry_mark() {
            let cancelled = self.check_cancellation_and_abort(DegenPoint::Mark);
            debug_assert!(cancelled);
            return false;
        }

        // Complete marking under STW, and start evacuation.
        heap.vm_thread().execute(heap, &FinalMarkOp { gc: self });

        // If the GC was cancelled before final mark could finish, we are
        // still in the marking phase and resume the degenerated cycle there.
        if heap.global_state().is_concurrent_mark_in_progress() {
            let cancelled = self.check_cancellation_and_abort(DegenPoint::Mark);
            debug_assert!(cancelled, "GC must have been cancelled between concurrent and final mark");
            return false;
        }

        if heap.global_state().is_evacuation_in_progress() {
            self.entry_thread_roots();
        }

        // Weak reference and weak root processing, before any region gets
        // recycled: the processors need the marks in trashed regions.
        self.entry_weak_refs();
        self.entry_weak_roots();

        if heap.unload_classes() {
            self.entry_class_unloading();
        }

        // Final mark may have produced immediate garbage; reclaim it now.
        self.entry_cleanup_early();
        heap.free_set().log_status_under_lock(heap);

        if heap.global_state().is_evacuation_in_progress() {
            self.entry_strong_roots();

            if !self.entry_evacuate() {
                let cancelled = self.check_cancellation_and_abort(DegenPoint::Evac);
                debug_assert!(cancelled);
                return false;
            }

            heap.vm_thread().execute(heap, &InitUpdateRefsOp { gc: self });

            if !self.entry_update_refs() {
                let cancelled = self.check_cancellation_and_abort(DegenPoint::UpdateRefs);
                debug_assert!(cancelled);
                return false;
            }

            self.entry_update_thread_roots();
            if self.check_cancellation_and_abort(DegenPoint::UpdateRefs) {
                return false;
            }

            heap.vm_thread().execute(heap, &FinalUpdateRefsOp { gc: self });

            self.entry_cleanup_complete();
        } else {
            if !self.entry_final_roots() {
                return false;
            }
            self.abbreviated.store(true, Ordering::Release);
        }

        // Pre-clear bitmaps so the next cycle starts faster after a trigger.
        self.entry_reset_after_collect();

        let _ = cause;
        true
    }

    // concurrent entries

    /// Returns false if an old-generation coalesce-and-fill was preempted.
    fn entry_reset(&self) -> bool {
        let heap = self.heap;
        let _timing = GcPhaseScope::new(heap.phase_times(), GcPhase::ConcReset);

        if self.bootstrap_old && !self.prepare_old_for_bootstrap() {
            return false;
        }

        if self.bootstrap_old || self.generation == GenerationKind::Global {
            // Old and global marks coincide: reset the whole bitmap.
            heap.global_generation().prepare_gc(heap);
        } else {
            heap.generation(self.generation).prepare_gc(heap);
        }
        heap.card_table().mark_read_table_as_clean();
        true
    }

    /// Make old regions parseable (coalesce-and-fill), then reset the old
    /// bitmap. Resumable: preemption leaves per-region completion flags.
    fn prepare_old_for_bootstrap(&self) -> bool {
        let heap = self.heap;
        let old_state = heap.old_state();

        old_state.set_preparing_for_mark(true);
        old_state.transition_to(heap, OldGenState::Filling);

        let done = {
            let _timing = GcPhaseScope::new(heap.phase_times(), GcPhase::CoalesceAndFill);
            let candidates = heap.old_heuristics().coalesce_and_fill_candidates();
            let task = CoalesceAndFillTask {
                heap,
                regions: candidates,
                cursor: AtomicUsize::new(0),
                completed: AtomicBool::new(true),
            };
            heap.workers().run_task(&task, heap.workers().num_workers());
            task.completed.load(Ordering::Acquire)
        };

        if !done {
            debug!("Suspending coalesce-and-fill of old heap regions");
            return false;
        }
        old_state.set_preparing_for_mark(false);
        heap.old_heuristics().abandon_collection_candidates();
        old_state.transition_to(heap, OldGenState::Bootstrapping);
        true
    }

    fn entry_scan_remembered_set(&self) {
        let heap = self.heap;
        let _timing = GcPhaseScope::new(heap.phase_times(), GcPhase::ScanRememberedSet);
        heap.young_generation().scan_remembered_set(heap, true);
    }

    fn entry_mark_roots(&self) {
        let heap = self.heap;
        let _timing = GcPhaseScope::new(heap.phase_times(), GcPhase::ConcMarkRoots);
        let queues = heap.generation(self.generation).task_queues();

        for root in heap.global_roots().iter() {
            mark_and_push(heap, *root, self.generation, None, queues);
        }
        // Pending references are strong until the runtime consumes them.
        for reference in heap.pending_references_snapshot() {
            mark_and_push(heap, reference, self.generation, None, queues);
        }
        heap.mutators().handshake_all(|m| {
            for root in m.roots.lock().unwrap().iter() {
                mark_and_push(heap, *root, self.generation, None, queues);
            }
        });
    }

    fn entry_mark(&self) -> bool {
        let heap = self.heap;
        let _timing = GcPhaseScope::new(heap.phase_times(), GcPhase::ConcMark);
        if !run_mark_task(heap, self.generation, true) {
            return false;
        }
        // A young cycle advances old marking while it is at it.
        if self.generation == GenerationKind::Young
            && heap.global_state().is_concurrent_old_mark_in_progress()
        {
            return run_mark_task(heap, GenerationKind::Old, true);
        }
        true
    }

    fn entry_thread_roots(&self) {
        let heap = self.heap;
        let _timing = GcPhaseScope::new(heap.phase_times(), GcPhase::ConcThreadRoots);
        heap.mutators().handshake_all(|m| {
            let mut roots = m.roots.lock().unwrap();
            for slot in roots.iter_mut() {
                if heap.in_collection_set(*slot) {
                    *slot = heap.evacuate_object(*slot);
                }
            }
        });
    }

    fn entry_weak_refs(&self) {
        let heap = self.heap;
        let _timing = GcPhaseScope::new(heap.phase_times(), GcPhase::ConcWeakRefs);
        process_weak_refs(heap, self.generation);
    }

    fn entry_weak_roots(&self) {
        let heap = self.heap;
        let _timing = GcPhaseScope::new(heap.phase_times(), GcPhase::ConcWeakRoots);
        prune_and_update_weak_roots(heap, self.generation);
    }

    fn entry_class_unloading(&self) {
        // There is no class metadata in this runtime model; the phase exists
        // so explicit cycles keep the full pipeline shape.
        debug!("Concurrent class unloading (no-op)");
    }

    fn entry_cleanup_early(&self) {
        let heap = self.heap;
        let _timing = GcPhaseScope::new(heap.phase_times(), GcPhase::ConcCleanupEarly);
        if heap.free_set().recycle_trash(heap) > 0 {
            heap.global_state().notify_gc_progress();
        }
    }

    fn entry_strong_roots(&self) {
        let heap = self.heap;
        let _timing = GcPhaseScope::new(heap.phase_times(), GcPhase::ConcStrongRoots);
        let mut roots = heap.global_roots();
        for slot in roots.iter_mut() {
            if heap.in_collection_set(*slot) {
                *slot = heap.evacuate_object(*slot);
            }
        }
    }

    fn entry_evacuate(&self) -> bool {
        let heap = self.heap;
        let _timing = GcPhaseScope::new(heap.phase_times(), GcPhase::ConcEvac);
        heap.collection_set().reset_cursor();
        let task = EvacuationTask { heap, ok: AtomicBool::new(true) };
        heap.workers().run_task(&task, heap.workers().num_workers());
        task.ok.load(Ordering::Acquire) && !heap.global_state().is_cancelled()
    }

    fn entry_update_refs(&self) -> bool {
        let heap = self.heap;
        let _timing = GcPhaseScope::new(heap.phase_times(), GcPhase::ConcUpdateRefs);
        let task = UpdateRefsTask {
            heap,
            cursor: AtomicUsize::new(0),
            ok: AtomicBool::new(true),
        };
        heap.workers().run_task(&task, heap.workers().num_workers());
        task.ok.load(Ordering::Acquire)
    }

    fn entry_update_thread_roots(&self) {
        let heap = self.heap;
        let _timing = GcPhaseScope::new(heap.phase_times(), GcPhase::ConcUpdateThreadRoots);
        heap.mutators().handshake_all(|m| {
            let mut roots = m.roots.lock().unwrap();
            for slot in roots.iter_mut() {
                *slot = object::resolve(*slot);
            }
        });
    }

    fn entry_cleanup_complete(&self) {
        let heap = self.heap;
        let _timing = GcPhaseScope::new(heap.phase_times(), GcPhase::ConcCleanupComplete);
        if heap.free_set().recycle_trash(heap) > 0 {
            heap.global_state().notify_gc_progress();
        }
    }

    /// The abbreviated ending: nothing to evacuate. Completes in-place
    /// promotions and keeps old marking fed.
    fn entry_final_roots(&self) -> bool {
        let heap = self.heap;
        let _timing = GcPhaseScope::new(heap.phase_times(), GcPhase::FinalRoots);

        if heap.old_state().has_in_place_promotions() {
            self.entry_promote_in_place();
            if self.check_cancellation_and_abort(DegenPoint::Evac) {
                return false;
            }
        }

        heap.global_state().set_state_bit(gc_state::WEAK_ROOTS, false);

        if heap.global_state().is_concurrent_old_mark_in_progress() {
            // Overwriting dead weak roots may have logged pointers to
            // soon-to-be-trash regions; flush and filter them before old
            // marking resumes.
            heap.mutators().handshake_all(|m| {
                heap.satb_queue_set().flush_buffer(&mut m.satb.lock().unwrap());
            });
            transfer_pointers_from_satb(heap);
        }

        if *heap.options().verify_after_gc {
            heap.vm_thread().execute(heap, &VerifyFinalRootsOp);
        }
        true
    }

    /// Flip whole aged regions into the old generation without copying.
    fn entry_promote_in_place(&self) {
        let heap = self.heap;
        let _timing = GcPhaseScope::new(heap.phase_times(), GcPhase::PromoteInPlace);
        promote_regions_in_place(heap);
    }

    fn entry_reset_after_collect(&self) {
        let heap = self.heap;
        let _timing = GcPhaseScope::new(heap.phase_times(), GcPhase::ConcResetAfterCollect);
        let ctx = heap.marking_context();
        for idx in 0..heap.num_regions() {
            let region = heap.region(idx);
            if region.is_young() && region.is_active() {
                ctx.clear_bitmap(region);
            }
        }
    }
}

// STW operations

struct InitMarkOp<'a, 'h> {
    gc: &'a ConcurrentGc<'h>,
}

impl VmOperation for InitMarkOp<'_, '_> {
    fn name(&self) -> &'static str {
        "init-mark"
    }

    fn doit(&self, heap: &Heap) {
        let _timing = GcPhaseScope::new(heap.phase_times(), GcPhase::InitMark);
        let gc = self.gc;
        let state = heap.global_state();
        assert!(!state.is_concurrent_mark_in_progress(), "mark must not be in progress");

        if gc.generation == GenerationKind::Global {
            // A global cycle subsumes any old mark in flight and abandons
            // evacuation/fill candidates: it re-establishes old liveness
            // itself, and stale candidates must not outlive their marks.
            if state.is_concurrent_old_mark_in_progress() {
                cancel_old_marking(heap);
            } else if !heap.old_state().is_idle() {
                heap.old_state().set_preparing_for_mark(false);
                heap.old_heuristics().abandon_collection_candidates();
                heap.old_state().transition_to(heap, OldGenState::Idle);
            }
        }

        if gc.generation == GenerationKind::Young {
            // The cards dirtied since the last cycle become this cycle's
            // scan work; barriers start dirtying a clean table.
            heap.card_table().swap_tables();
        }

        if gc.bootstrap_old {
            heap.old_state().set_queues_installed(true);
            state.set_state_bit(gc_state::OLD_MARKING, true);
            heap.old_state().transition_to(heap, OldGenState::Marking);
            heap.old_generation().ref_processor().enable_discovery();
        }

        heap.generation(gc.generation).ref_processor().enable_discovery();
        heap.satb_queue_set().set_active(true);
        state.set_state_bit(gc_state::MARKING, true);

        if *heap.options().verify_before_gc {
            crate::gc::verify::verify_at_safepoint(heap, "before mark");
        }
    }
}

struct FinalMarkOp<'a, 'h> {
    gc: &'a ConcurrentGc<'h>,
}

impl VmOperation for FinalMarkOp<'_, '_> {
    fn name(&self) -> &'static str {
        "final-mark"
    }

    fn doit(&self, heap: &Heap) {
        let _timing = GcPhaseScope::new(heap.phase_times(), GcPhase::FinalMark);
        let gc = self.gc;
        let state = heap.global_state();

        if state.is_cancelled() {
            // Nothing happens on this safepoint; the cycle resumes in the
            // degenerated engine from the marking phase.
            return;
        }

        // Every mutator's partial SATB buffer must be visible to the final
        // drain.
        heap.mutators().handshake_all(|m| {
            heap.satb_queue_set().flush_buffer(&mut m.satb.lock().unwrap());
        });
        run_mark_task(heap, gc.generation, false);

        let generation = heap.generation(gc.generation);
        generation.ref_processor().disable_discovery();
        generation.set_mark_complete();
        state.set_state_bit(gc_state::MARKING, false);

        // Region states: immediate garbage becomes trash, survivors age.
        let (immediate_garbage, total_garbage) = update_region_states(heap, gc.generation);
        register_in_place_promotions(heap, gc.generation);

        maybe_complete_old_marking(heap);

        // SATB stays armed only while old marking still runs.
        heap.satb_queue_set()
            .set_active(state.is_concurrent_old_mark_in_progress());

        // Choose the collection set, unless immediate garbage alone clears
        // the bar (the abbreviated shortcut).
        let cset = heap.collection_set();
        cset.clear();
        let threshold = *heap.options().immediate_garbage_threshold_percent;
        if total_garbage == 0 || immediate_garbage * 100 < total_garbage * threshold {
            choose_collection_set(heap, gc.generation);
        } else {
            info!(
                "Immediate garbage ({}) dominates total garbage ({}); skipping evacuation",
                display_bytes(immediate_garbage),
                display_bytes(total_garbage)
            );
        }

        if !cset.is_empty() {
            state.set_state_bit(gc_state::EVACUATION, true);
            state.set_state_bit(gc_state::HAS_FORWARDED, true);
        }
        state.set_state_bit(gc_state::WEAK_ROOTS, true);

        // Free-set rebuild honors the just-established reserves.
        heap.reserves().set_valid(true);
        let (young_cset, old_cset) = heap.free_set().prepare_to_rebuild(heap);
        heap.free_set().rebuild(heap, young_cset, old_cset);
        heap.reserves().set_valid(false);
        cset.abandon_preselected();

        if immediate_garbage > 0 {
            state.notify_gc_progress();
        }
        if *heap.options().verify {
            crate::gc::verify::verify_at_safepoint(heap, "after final mark");
        }
    }
}

struct InitUpdateRefsOp<'a, 'h> {
    gc: &'a ConcurrentGc<'h>,
}

impl VmOperation for InitUpdateRefsOp<'_, '_> {
    fn name(&self) -> &'static str {
        "init-update-refs"
    }

    fn doit(&self, heap: &Heap) {
        let _timing = GcPhaseScope::new(heap.phase_times(), GcPhase::InitUpdateRefs);
        let _ = self.gc;
        let state = heap.global_state();
        for idx in 0..heap.num_regions() {
            let region = heap.region(idx);
            if region.is_active() && !region.is_cset() {
                region.capture_update_watermark();
            }
        }
        state.set_state_bit(gc_state::EVACUATION, false);
        state.set_state_bit(gc_state::WEAK_ROOTS, false);
        state.set_state_bit(gc_state::UPDATE_REFS, true);
        if *heap.options().verify {
            crate::gc::verify::verify_at_safepoint(heap, "before update refs");
        }
    }
}

struct FinalUpdateRefsOp<'a, 'h> {
    gc: &'a ConcurrentGc<'h>,
}

impl VmOperation for FinalUpdateRefsOp<'_, '_> {
    fn name(&self) -> &'static str {
        "final-update-refs"
    }

    fn doit(&self, heap: &Heap) {
        let _timing = GcPhaseScope::new(heap.phase_times(), GcPhase::FinalUpdateRefs);
        let _ = self.gc;
        finish_update_refs(heap);
    }
}

struct VerifyFinalRootsOp;

impl VmOperation for VerifyFinalRootsOp {
    fn name(&self) -> &'static str {
        "verify-final-roots"
    }

    fn doit(&self, heap: &Heap) {
        crate::gc::verify::verify_at_safepoint(heap, "final roots");
    }
}

/// Close out reference updating: retire the collection set, drop the
/// forwarding state, rebuild the free set, and let old marking continue.
/// Shared with the degenerated engine.
pub(crate) fn finish_update_refs(heap: &Heap) {
    let state = heap.global_state();
    let cset = heap.collection_set();

    for index in cset.regions() {
        let region = heap.region(index);
        if region.is_pinned() {
            // Cannot reclaim while pinned; it stays until a later cycle.
            continue;
        }
        if region.is_cset() {
            region.make_trash();
        }
        cset.remove(index);
    }

    heap.resolve_pending_references();

    state.set_state_bit(gc_state::UPDATE_REFS, false);
    state.set_state_bit(gc_state::HAS_FORWARDED, false);

    if state.is_concurrent_old_mark_in_progress() {
        heap.mutators().handshake_all(|m| {
            heap.satb_queue_set().flush_buffer(&mut m.satb.lock().unwrap());
        });
        transfer_pointers_from_satb(heap);
    }

    let (young_cset, old_cset) = heap.free_set().prepare_to_rebuild(heap);
    heap.free_set().rebuild(heap, young_cset, old_cset);

    if *heap.options().verify || *heap.options().verify_after_gc {
        crate::gc::verify::verify_at_safepoint(heap, "after update refs");
    }
}

/// Cancel an in-flight old mark (global cycle takeover or full GC).
pub(crate) fn cancel_old_marking(heap: &Heap) {
    heap.old_generation().cancel_marking(heap);
    heap.old_state().set_queues_installed(false);
    heap.old_state().set_preparing_for_mark(false);
    heap.old_heuristics().abandon_collection_candidates();
    heap.old_state().transition_to(heap, OldGenState::Idle);
}

/// Run the mark drain on the worker pool. Returns false on cancellation.
pub(crate) fn run_mark_task(heap: &Heap, kind: GenerationKind, cancellable: bool) -> bool {
    heap.generation(kind).task_queues().reset_idle();
    let task = MarkTask {
        heap,
        kind,
        cancellable,
        ok: AtomicBool::new(true),
    };
    let workers = heap.workers();
    workers.run_task(&task, workers.num_workers());
    task.ok.load(Ordering::Acquire)
}

struct MarkTask<'a> {
    heap: &'a Heap,
    kind: GenerationKind,
    cancellable: bool,
    ok: AtomicBool,
}

impl ParallelTask for MarkTask<'_> {
    fn name(&self) -> &'static str {
        "concurrent-mark"
    }

    fn work(&self, worker_id: usize, num_workers: usize) {
        if !marking::mark_loop(self.heap, self.kind, worker_id, num_workers, self.cancellable) {
            self.ok.store(false, Ordering::Release);
        }
    }
}

struct EvacuationTask<'a> {
    heap: &'a Heap,
    ok: AtomicBool,
}

impl ParallelTask for EvacuationTask<'_> {
    fn name(&self) -> &'static str {
        "concurrent-evacuation"
    }

    fn work(&self, _worker_id: usize, _num_workers: usize) {
        let heap = self.heap;
        let ctx = heap.marking_context();
        while let Some(index) = heap.collection_set().claim_next() {
            if heap.global_state().is_cancelled() {
                self.ok.store(false, Ordering::Release);
                return;
            }
            let region = heap.region(index);
            ctx.marked_object_iterate(region, |obj| {
                heap.evacuate_object(obj);
            });
        }
        if heap.global_state().is_cancelled() {
            self.ok.store(false, Ordering::Release);
        }
    }
}

struct UpdateRefsTask<'a> {
    heap: &'a Heap,
    cursor: AtomicUsize,
    ok: AtomicBool,
}

impl ParallelTask for UpdateRefsTask<'_> {
    fn name(&self) -> &'static str {
        "concurrent-update-refs"
    }

    fn work(&self, _worker_id: usize, _num_workers: usize) {
        let heap = self.heap;
        loop {
            if heap.global_state().is_cancelled() {
                self.ok.store(false, Ordering::Release);
                return;
            }
            let index = self.cursor.fetch_add(1, Ordering::Relaxed);
            if index >= heap.num_regions() {
                return;
            }
            update_region_references(heap, heap.region(index));
        }
    }
}

/// Rewrite every reference in `region` that still points into the collection
/// set. Iterating twice is a no-op: healed slots no longer point there.
pub(crate) fn update_region_references(heap: &Heap, region: &HeapRegion) {
    if !region.is_active() || region.is_cset() || region.is_humongous_cont() {
        return;
    }
    if region.is_humongous_start() {
        update_object_references(heap, ObjectReference::from_address(region.bottom()));
        return;
    }
    let limit = region.update_watermark();
    region.linear_walk(region.bottom(), limit, |obj| {
        if object::kind(obj) != object::ObjectKind::Filler {
            update_object_references(heap, obj);
        }
    });
}

fn update_object_references(heap: &Heap, obj: ObjectReference) {
    let in_old = heap.region_of(obj.to_address()).is_old();
    let slots = object::ref_slot_count(obj);
    for i in 0..slots {
        if let Some(target) = object::get_ref(obj, i) {
            let target = if heap.in_collection_set(target) && object::is_forwarded(target) {
                let resolved = object::resolve(target);
                object::set_ref(obj, i, Some(resolved));
                resolved
            } else {
                target
            };
            // Reconstruct the remembered set as we go: the walk sees every
            // old object, so surviving old-to-young pointers re-dirty their
            // cards in the write table.
            if in_old && heap.region_of(target.to_address()).is_young() {
                heap.card_table().mark_card_as_dirty(object::ref_slot(obj, i));
            }
        }
    }
}

/// Final-mark region pass: trash regions with no live data (immediate
/// garbage), bump the age of young survivors. Returns (immediate, total)
/// garbage byte counts.
pub(crate) fn update_region_states(heap: &Heap, kind: GenerationKind) -> (usize, usize) {
    let mut immediate_garbage = 0usize;
    let mut total_garbage = 0usize;
    for idx in 0..heap.num_regions() {
        let region = heap.region(idx);
        if !heap.generation(kind).contains_region(region) {
            continue;
        }
        match region.state() {
            crate::region::RegionState::Regular => {
                let live = region_live_bytes(heap, region);
                let garbage = region.used().saturating_sub(live);
                total_garbage += garbage;
                if live == 0 && region.used() > 0 {
                    region.make_trash();
                    immediate_garbage += garbage;
                } else if region.is_young() {
                    region.increment_age();
                }
            }
            crate::region::RegionState::HumongousStart => {
                let obj = ObjectReference::from_address(region.bottom());
                let ctx = heap.marking_context();
                if !ctx.is_live(idx, obj) {
                    let garbage = object::size_bytes(obj);
                    heap.trash_humongous_object(idx);
                    immediate_garbage += garbage;
                    total_garbage += garbage;
                }
            }
            _ => {}
        }
    }
    (immediate_garbage, total_garbage)
}

/// Record aged, dense young regions for in-place promotion at cycle end.
pub(crate) fn register_in_place_promotions(heap: &Heap, kind: GenerationKind) {
    if kind != GenerationKind::Young {
        return;
    }
    let options = heap.options();
    let tenuring = *options.tenuring_age;
    let live_percent = *options.in_place_promotion_live_percent;
    let region_size = heap.region_size_bytes();
    let mut regions = Vec::new();
    for idx in 0..heap.num_regions() {
        let region = heap.region(idx);
        if region.is_young()
            && region.is_regular()
            && region.age() >= tenuring
            && region_live_bytes(heap, region) * 100 >= region_size * live_percent
        {
            regions.push(idx);
        }
    }
    if !regions.is_empty() {
        heap.old_state().register_in_place_promotions(regions);
    }
}

/// Completion check for the interleaved old mark: once the old queues and
/// the SATB snapshot are drained, candidates are chosen and the old
/// generation moves on.
pub(crate) fn maybe_complete_old_marking(heap: &Heap) {
    let state = heap.global_state();
    if !state.is_concurrent_old_mark_in_progress() {
        return;
    }
    let old_queues = heap.old_generation().task_queues();
    if !old_queues.is_empty() || heap.satb_queue_set().completed_count() > 0 {
        return; // more young cycles will keep advancing the old mark
    }

    state.set_state_bit(gc_state::OLD_MARKING, false);
    heap.old_state().set_queues_installed(false);
    let old = heap.old_generation();
    old.ref_processor().disable_discovery();
    old.ref_processor().process_references(heap, GenerationKind::Old);
    run_mark_task(heap, GenerationKind::Old, false);
    old.set_mark_complete();
    heap.old_state()
        .set_used_at_last_mark(old.used_including_waste());

    let mut old_heuristics = heap.old_heuristics();
    old_heuristics.prepare_for_old_collections(heap);
    let has_candidates = old_heuristics.unprocessed_old_collection_candidates() > 0;
    let has_fill = old_heuristics.has_coalesce_and_fill_candidates();
    drop(old_heuristics);

    let old_state = heap.old_state();
    if has_candidates {
        old_state.transition_to(heap, OldGenState::WaitingForEvac);
    } else if has_fill {
        old_state.transition_to(heap, OldGenState::WaitingForFill);
    } else {
        old_state.transition_to(heap, OldGenState::Idle);
    }
}

/// Generational collection-set choice: compute budgets, preselect aged
/// regions, let the heuristic pick young regions, prime old candidates, then
/// settle the final reserves. Shared with the degenerated engine.
pub(crate) fn choose_collection_set(heap: &Heap, kind: GenerationKind) {
    let cset = heap.collection_set();
    let mut preselected = vec![false; heap.num_regions()];
    compute_evacuation_budgets(heap, kind, &mut preselected);
    cset.establish_preselected(preselected);

    heap.generation(kind).heuristics().choose_collection_set(heap);

    if heap.old_state().state() == OldGenState::WaitingForEvac {
        let taken = heap.old_heuristics().prime_collection_set(heap);
        if taken > 0 {
            debug!("Mixed collection: {} of old live data", display_bytes(taken));
        }
        let old_heuristics = heap.old_heuristics();
        if old_heuristics.unprocessed_old_collection_candidates() == 0 {
            drop(old_heuristics);
            heap.old_state().transition_to(heap, OldGenState::Idle);
        } else if old_heuristics.all_candidates_pinned(heap) {
            drop(old_heuristics);
            heap.old_state().transition_to(heap, OldGenState::WaitingForFill);
        }
    }

    if !cset.is_empty() {
        adjust_evacuation_budgets(heap);
    }
}

/// Pre-selection budget arithmetic. Evacuation is more critical than
/// promotion: if old cannot be evacuated, old memory cannot be reclaimed;
/// unpromoted objects merely wait in young.
fn compute_evacuation_budgets(heap: &Heap, kind: GenerationKind, preselected: &mut [bool]) {
    let options = heap.options();
    let region_size = heap.region_size_bytes();
    let young = heap.young_generation();
    let old = heap.old_generation();
    let reserves = heap.reserves();

    // Upper bound on memory evacuated out of young.
    let max_young_evac = young.max_capacity() / 100 * *options.evac_reserve_percent;
    let young_evac_reserve = max_young_evac.min(young.available());

    // Upper bound on memory evacuated from old and promoted to old:
    //   OldEvac = YoungEvac * ratio / (100 - ratio)
    let ratio = *options.old_evac_ratio_percent;
    let max_old_evac =
        (max_young_evac * ratio / (100 - ratio)).min(old.available());

    // With old candidates pending, devote the old budget to compaction and
    // do not promote; otherwise it all backs promotion.
    let has_old_candidates = heap.old_heuristics().unprocessed_old_collection_candidates() > 0;
    let (mut old_evac_reserve, mut old_promo_reserve) = if has_old_candidates {
        (max_old_evac, 0)
    } else {
        (0, max_old_evac)
    };

    // Old evacuation only into whole empty regions; fragments feed promotion.
    let old_free_unfragmented = old.free_unaffiliated_regions(region_size) * region_size;
    if old_evac_reserve > old_free_unfragmented {
        let delta = old_evac_reserve - old_free_unfragmented;
        old_evac_reserve -= delta;
        old_promo_reserve += delta;
    }

    let consumed = heap
        .generation(kind)
        .heuristics()
        .select_aged_regions(heap, old_promo_reserve, preselected);
    debug_assert!(consumed <= old_promo_reserve);
    if consumed < old_promo_reserve {
        old_evac_reserve = (old_evac_reserve + (old_promo_reserve - consumed)).min(old.available());
    }

    reserves.set_young_evac_reserve(young_evac_reserve);
    reserves.set_old_evac_reserve(old_evac_reserve.min(old.available()));
    reserves.set_promoted_reserve(consumed);
    reserves.reset_promoted_expended();
}

/// Post-selection: shrink the reserves to what the chosen set needs, hand
/// excess old regions back to young, and absorb the residue into the
/// promotion reserve for unanticipated promotions.
fn adjust_evacuation_budgets(heap: &Heap) {
    let options = heap.options();
    let region_size = heap.region_size_bytes();
    let cset = heap.collection_set();
    let old = heap.old_generation();
    let reserves = heap.reserves();

    let old_evacuated = cset.old_bytes_to_evacuate();
    let mut old_evacuated_committed = (*options.old_evac_waste * old_evacuated as f64) as usize;
    let old_evac_reserve = reserves.old_evac_reserve();
    if old_evacuated_committed > old_evac_reserve {
        // Round-off from enforcing the waste factor.
        debug_assert!(old_evacuated_committed <= (33 * old_evac_reserve) / 32);
        old_evacuated_committed = old_evac_reserve;
    } else {
        reserves.set_old_evac_reserve(old_evacuated_committed);
    }

    let young_advance_promoted = cset.young_bytes_to_promote();
    let promoted_reserve_used =
        (*options.promo_evac_waste * young_advance_promoted as f64) as usize;

    let young_evacuated = cset.young_bytes_to_evacuate();
    let young_reserve_used = (*options.evac_waste * young_evacuated as f64) as usize;
    debug_assert!(
        young_reserve_used <= heap.young_generation().available(),
        "cannot evacuate more than is available in young"
    );
    reserves.set_young_evac_reserve(young_reserve_used);

    // Excess old regions go back to young before evacuation starts, so
    // mutators keep an allocation runway.
    let old_available = old.available();
    let old_consumed = old_evacuated_committed + promoted_reserve_used;
    let mut excess_old = old_available.saturating_sub(old_consumed);
    let unaffiliated_old_regions = old.free_unaffiliated_regions(region_size);
    let unaffiliated_old = unaffiliated_old_regions * region_size;

    let regions_to_xfer = if excess_old > unaffiliated_old {
        unaffiliated_old_regions
    } else {
        (excess_old / region_size).min(unaffiliated_old_regions)
    };
    if regions_to_xfer > 0 {
        let ok = heap.sizer().transfer_to_young(heap, regions_to_xfer);
        if ok {
            excess_old = excess_old.saturating_sub(regions_to_xfer * region_size);
        }
        info!(
            "{} transferred {} excess regions to young before start of evacuation",
            if ok { "Successfully" } else { "Unsuccessfully" },
            regions_to_xfer
        );
    }

    // Unanticipated promotions are absorbed by whatever old memory is left.
    reserves.set_promoted_reserve(promoted_reserve_used + excess_old);
    reserves.reset_promoted_expended();
}

/// Process discovered references, then give FINAL referents their one extra
/// mark. Shared with the degenerated engine.
pub(crate) fn process_weak_refs(heap: &Heap, kind: GenerationKind) {
    heap.generation(kind)
        .ref_processor()
        .process_references(heap, kind);
    run_mark_task(heap, kind, false);
}

/// Drop dead weak handles; evacuate and update the live ones that sit in
/// the collection set. Handles outside the collected generation cannot be
/// judged by this cycle's marks and are kept.
pub(crate) fn prune_and_update_weak_roots(heap: &Heap, kind: GenerationKind) {
    let ctx = heap.marking_context();
    let mut handles = heap.weak_handles();
    handles.retain(|&obj| {
        let region_index = heap.region_index_of(obj.to_address());
        let judgeable = match kind {
            GenerationKind::Global => true,
            GenerationKind::Young => heap.region(region_index).is_young(),
            GenerationKind::Old => heap.region(region_index).is_old(),
        };
        !judgeable || ctx.is_live(region_index, obj)
    });
    for slot in handles.iter_mut() {
        if heap.in_collection_set(*slot) {
            *slot = heap.evacuate_object(*slot);
        }
    }
}

/// Evacuate-and-update every root that still points into the collection set:
/// mutator roots, global roots, and weak handles. Used by the degenerated
/// engine, where the concurrent root phases may not have run.
pub(crate) fn update_roots_evacuating(heap: &Heap) {
    heap.mutators().handshake_all(|m| {
        let mut roots = m.roots.lock().unwrap();
        for slot in roots.iter_mut() {
            if heap.in_collection_set(*slot) {
                *slot = heap.evacuate_object(*slot);
            }
        }
    });
    let mut roots = heap.global_roots();
    for slot in roots.iter_mut() {
        if heap.in_collection_set(*slot) {
            *slot = heap.evacuate_object(*slot);
        }
    }
    drop(roots);
    let mut handles = heap.weak_handles();
    for slot in handles.iter_mut() {
        if heap.in_collection_set(*slot) {
            *slot = heap.evacuate_object(*slot);
        }
    }
}

/// Rewrite every root through the forwarding pointers.
pub(crate) fn resolve_all_roots(heap: &Heap) {
    heap.mutators().handshake_all(|m| {
        let mut roots = m.roots.lock().unwrap();
        for slot in roots.iter_mut() {
            *slot = object::resolve(*slot);
        }
    });
    for slot in heap.global_roots().iter_mut() {
        *slot = object::resolve(*slot);
    }
    for slot in heap.weak_handles().iter_mut() {
        *slot = object::resolve(*slot);
    }
    heap.resolve_pending_references();
}

/// Flip whole aged regions into the old generation without copying. The
/// region's capacity moves with it; promotions that cannot get capacity stay
/// young and retry on a later cycle.
pub(crate) fn promote_regions_in_place(heap: &Heap) {
    for index in heap.old_state().take_in_place_promotions() {
        let region = heap.region(index);
        if !region.is_young() || !region.is_regular() {
            continue; // state moved under us; not promotable anymore
        }
        if !heap.sizer().transfer_to_old(heap, 1) {
            debug!("No capacity to promote region {} in place", index);
            continue;
        }
        let used = region.used();
        heap.decrease_used(crate::region::Affiliation::Young, used);
        heap.young_generation().decrement_affiliated_region_count();
        heap.global_generation().decrement_affiliated_region_count();
        region.set_affiliation(crate::region::Affiliation::Old);
        heap.increase_used(crate::region::Affiliation::Old, used);
        heap.account_affiliation(region, crate::region::Affiliation::Old);
        region.reset_age();
        region.set_coalesce_fill_done(true);
        // The region's objects may hold young pointers that no barrier ever
        // recorded against an old card.
        if used > 0 {
            heap.dirty_cards_for(region.bottom(), used);
        }
        info!(
            "Promoted region {} in place ({} live)",
            index,
            display_bytes(used)
        );
    }
}

struct CoalesceAndFillTask<'a> {
    heap: &'a Heap,
    regions: Vec<usize>,
    cursor: AtomicUsize,
    completed: AtomicBool,
}

impl ParallelTask for CoalesceAndFillTask<'_> {
    fn name(&self) -> &'static str {
        "coalesce-and-fill"
    }

    fn work(&self, _worker_id: usize, _num_workers: usize) {
        let heap = self.heap;
        loop {
            if heap.global_state().is_cancelled() {
                self.completed.store(false, Ordering::Release);
                return;
            }
            let claimed = self.cursor.fetch_add(1, Ordering::Relaxed);
            if claimed >= self.regions.len() {
                return;
            }
            coalesce_and_fill_region(heap, heap.region(self.regions[claimed]));
        }
    }
}

/// Overwrite the dead spans of an old region with filler objects so it stays
/// linearly parseable. Regions remember their completion, so a preempted
/// pass resumes where it left off.
fn coalesce_and_fill_region(heap: &Heap, region: &HeapRegion) {
    if region.is_parseable() || !region.is_regular() {
        return;
    }
    let ctx = heap.marking_context();
    let limit = ctx.tams(region.index()).min(region.top());

    // Walk marked objects and overwrite the gaps between them with fillers.
    // Dead spans are whole objects, so every gap fits a filler header.
    let fill_gap = |from: crate::util::address::Address, to: crate::util::address::Address| {
        if to > from {
            let words = (to - from) / crate::util::constants::BYTES_IN_WORD;
            object::initialize_filler(from, words);
            region.record_object_start(from);
        }
    };
    let mut last_end = region.bottom();
    ctx.marked_object_iterate(region, |obj| {
        let start = obj.to_address();
        if start >= limit {
            return;
        }
        fill_gap(last_end, start);
        last_end = object::end(obj);
    });
    fill_gap(last_end, limit);
    region.set_coalesce_fill_done(true);
}
