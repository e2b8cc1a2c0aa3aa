//! The heap: the single context object owning every collector subsystem.
//!
//! There are no global singletons; components receive `&Heap` and reach
//! their collaborators through it. The only process-global state is the log
//! backend.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::control::{ControlContext, ControlThread};
use crate::gc::GcCause;
use crate::generation::old::OldGenerationState;
use crate::generation::sizer::GenerationSizer;
use crate::generation::{Generation, GenerationKind};
use crate::global_state::GlobalState;
use crate::heuristics::old::OldHeuristics;
use crate::heuristics::new_heuristics;
use crate::marking::satb::SatbQueueSet;
use crate::marking::MarkingContext;
use crate::object;
use crate::policy::CollectorPolicy;
use crate::region::cset::CollectionSet;
use crate::region::free_set::{AllocRequest, FreeSet};
use crate::region::{Affiliation, HeapRegion};
use crate::rset::RememberedSet;
use crate::scheduler::{MutatorRegistry, VmThread, WorkerPool};
use crate::util::address::{Address, ObjectReference};
use crate::util::conversions::{display_bytes, raw_align_down};
use crate::util::memory::BackingStore;
use crate::util::options::Options;
use crate::util::phase_times::PhaseTimes;

/// Evacuation and promotion budgets for the cycle in flight.
pub struct EvacReserves {
    /// Reserves are authoritative only between collection-set selection and
    /// the free-set rebuild that consumes them.
    valid: AtomicBool,
    young_evac: AtomicUsize,
    old_evac: AtomicUsize,
    promoted: AtomicUsize,
    promoted_expended: AtomicUsize,
}

impl EvacReserves {
    fn new() -> EvacReserves {
        EvacReserves {
            valid: AtomicBool::new(false),
            young_evac: AtomicUsize::new(0),
            old_evac: AtomicUsize::new(0),
            promoted: AtomicUsize::new(0),
            promoted_expended: AtomicUsize::new(0),
        }
    }

    pub fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::Release);
    }

    pub fn young_evac_reserve(&self) -> usize {
        self.young_evac.load(Ordering::Acquire)
    }

    pub fn set_young_evac_reserve(&self, bytes: usize) {
        self.young_evac.store(bytes, Ordering::Release);
    }

    pub fn old_evac_reserve(&self) -> usize {
        self.old_evac.load(Ordering::Acquire)
    }

    pub fn set_old_evac_reserve(&self, bytes: usize) {
        self.old_evac.store(bytes, Ordering::Release);
    }

    pub fn promoted_reserve(&self) -> usize {
        self.promoted.load(Ordering::Acquire)
    }

    pub fn set_promoted_reserve(&self, bytes: usize) {
        self.promoted.store(bytes, Ordering::Release);
    }

    pub fn promoted_expended(&self) -> usize {
        self.promoted_expended.load(Ordering::Acquire)
    }

    pub fn reset_promoted_expended(&self) {
        self.promoted_expended.store(0, Ordering::Release);
    }

    /// Charge a promotion allocation against the reserve. In-flight
    /// expenditure never exceeds the reserve.
    pub fn expend_promoted(&self, bytes: usize) -> bool {
        let prev = self.promoted_expended.fetch_add(bytes, Ordering::AcqRel);
        if prev + bytes > self.promoted.load(Ordering::Acquire) {
            self.promoted_expended.fetch_sub(bytes, Ordering::AcqRel);
            return false;
        }
        true
    }

    pub fn unexpend_promoted(&self, bytes: usize) {
        self.promoted_expended.fetch_sub(bytes, Ordering::AcqRel);
    }

    /// Young reserve the free-set rebuild should honor.
    pub fn young_reserve_for_rebuild(&self, heap: &Heap) -> usize {
        if self.valid.load(Ordering::Acquire) {
            self.young_evac_reserve()
        } else {
            heap.generation(GenerationKind::Young).max_capacity() / 100
                * *heap.options().evac_reserve_percent
        }
    }

    /// Old reserve (evacuation + promotion) for the rebuild.
    pub fn old_reserve_for_rebuild(&self, heap: &Heap) -> usize {
        if self.valid.load(Ordering::Acquire) {
            self.old_evac_reserve() + self.promoted_reserve()
        } else {
            *heap.options().old_compaction_reserve * heap.region_size_bytes()
        }
    }
}

pub struct Heap {
    options: Options,
    storage: BackingStore,
    region_size_bytes: usize,
    regions: Box<[HeapRegion]>,
    free_set: FreeSet,
    collection_set: CollectionSet,
    marking: MarkingContext,
    card_table: RememberedSet,
    satb: SatbQueueSet,
    young: Generation,
    old: Generation,
    global: Generation,
    old_state: OldGenerationState,
    old_heuristics: Mutex<OldHeuristics>,
    sizer: GenerationSizer,
    policy: CollectorPolicy,
    state: GlobalState,
    reserves: EvacReserves,
    workers: WorkerPool,
    vm_thread: VmThread,
    mutators: MutatorRegistry,
    control: ControlContext,
    phase_times: PhaseTimes,
    soft_max_capacity: AtomicUsize,
    unload_classes: AtomicBool,
    /// Strong roots registered by the embedder (class statics analogue).
    global_roots: Mutex<Vec<ObjectReference>>,
    /// Weak handles: nulled when their referent dies.
    weak_handles: Mutex<Vec<ObjectReference>>,
    /// Processed references awaiting the runtime's reference handler.
    pending_references: Mutex<Vec<ObjectReference>>,
}

impl Heap {
    /// Build a heap and start its GC threads (workers, VM thread, control
    /// thread).
    pub fn new(options: Options) -> Arc<Heap> {
        crate::util::logger::try_init();

        let region_size = *options.region_size;
        let heap_size = raw_align_down(*options.heap_size, region_size).max(region_size * 2);
        let num_regions = heap_size / region_size;
        let storage = BackingStore::new(heap_size, region_size);
        let heap_start = storage.start();

        let regions: Box<[HeapRegion]> = (0..num_regions)
            .map(|i| HeapRegion::new(i, heap_start + i * region_size, region_size))
            .collect();

        let young_capacity = options.young_capacity(heap_size).min(heap_size - region_size);
        let old_capacity = heap_size - young_capacity;
        let max_workers = *options.threads;
        let selector = *options.heuristics;

        let heap = Arc::new(Heap {
            storage,
            region_size_bytes: region_size,
            free_set: FreeSet::new(num_regions),
            collection_set: CollectionSet::new(num_regions),
            marking: MarkingContext::new(heap_start, heap_size, num_regions),
            card_table: RememberedSet::new(heap_start, heap_size),
            satb: SatbQueueSet::new(),
            young: Generation::new(
                GenerationKind::Young,
                young_capacity,
                max_workers,
                new_heuristics(selector, GenerationKind::Young),
            ),
            old: Generation::new(
                GenerationKind::Old,
                old_capacity,
                max_workers,
                new_heuristics(selector, GenerationKind::Old),
            ),
            global: Generation::new(
                GenerationKind::Global,
                heap_size,
                max_workers,
                new_heuristics(selector, GenerationKind::Global),
            ),
            old_state: OldGenerationState::new(),
            old_heuristics: Mutex::new(OldHeuristics::new()),
            sizer: GenerationSizer::new(region_size, heap_size),
            policy: CollectorPolicy::new(),
            state: GlobalState::new(),
            reserves: EvacReserves::new(),
            workers: WorkerPool::new(max_workers),
            vm_thread: VmThread::spawn(),
            mutators: MutatorRegistry::new(),
            control: ControlContext::new(),
            phase_times: PhaseTimes::new(),
            soft_max_capacity: AtomicUsize::new(heap_size),
            unload_classes: AtomicBool::new(false),
            global_roots: Mutex::new(Vec::new()),
            weak_handles: Mutex::new(Vec::new()),
            pending_references: Mutex::new(Vec::new()),
            regions,
            options,
        });

        // Everything allocatable starts in the mutator partition, minus the
        // default reserves.
        heap.free_set.rebuild(&heap, 0, 0);
        heap.workers.start();
        ControlThread::spawn(heap.clone());
        info!(
            "Initialized heap: {} in {} regions of {} ({} young, {} old)",
            display_bytes(heap_size),
            num_regions,
            display_bytes(region_size),
            display_bytes(young_capacity),
            display_bytes(old_capacity),
        );
        heap
    }

    // geometry

    pub fn heap_start(&self) -> Address {
        self.storage.start()
    }

    pub fn capacity(&self) -> usize {
        self.storage.size()
    }

    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }

    pub fn region_size_bytes(&self) -> usize {
        self.region_size_bytes
    }

    pub fn region(&self, index: usize) -> &HeapRegion {
        &self.regions[index]
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.storage.contains(addr)
    }

    pub fn region_index_of(&self, addr: Address) -> usize {
        debug_assert!(self.contains(addr), "{} outside the heap", addr);
        (addr - self.storage.start()) / self.region_size_bytes
    }

    pub fn region_of(&self, addr: Address) -> &HeapRegion {
        self.region(self.region_index_of(addr))
    }

    // component accessors

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn global_state(&self) -> &GlobalState {
        &self.state
    }

    pub fn policy(&self) -> &CollectorPolicy {
        &self.policy
    }

    pub fn free_set(&self) -> &FreeSet {
        &self.free_set
    }

    pub fn collection_set(&self) -> &CollectionSet {
        &self.collection_set
    }

    pub fn marking_context(&self) -> &MarkingContext {
        &self.marking
    }

    pub fn card_table(&self) -> &RememberedSet {
        &self.card_table
    }

    pub fn satb_queue_set(&self) -> &SatbQueueSet {
        &self.satb
    }

    pub fn reserves(&self) -> &EvacReserves {
        &self.reserves
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    pub fn vm_thread(&self) -> &VmThread {
        &self.vm_thread
    }

    pub fn mutators(&self) -> &MutatorRegistry {
        &self.mutators
    }

    pub fn control(&self) -> &ControlContext {
        &self.control
    }

    pub fn phase_times(&self) -> &PhaseTimes {
        &self.phase_times
    }

    pub fn sizer(&self) -> &GenerationSizer {
        &self.sizer
    }

    pub fn generation(&self, kind: GenerationKind) -> &Generation {
        match kind {
            GenerationKind::Young => &self.young,
            GenerationKind::Old => &self.old,
            GenerationKind::Global => &self.global,
        }
    }

    pub fn young_generation(&self) -> &Generation {
        &self.young
    }

    pub fn old_generation(&self) -> &Generation {
        &self.old
    }

    pub fn global_generation(&self) -> &Generation {
        &self.global
    }

    pub fn old_state(&self) -> &OldGenerationState {
        &self.old_state
    }

    pub fn old_heuristics(&self) -> MutexGuard<'_, OldHeuristics> {
        self.old_heuristics.lock().unwrap()
    }

    pub fn set_unload_classes(&self, unload: bool) {
        self.unload_classes.store(unload, Ordering::Relaxed);
    }

    pub fn unload_classes(&self) -> bool {
        self.unload_classes.load(Ordering::Relaxed)
    }

    pub fn soft_max_capacity(&self) -> usize {
        self.soft_max_capacity.load(Ordering::Acquire)
    }

    // accounting; the generation for the affiliation and the global union
    // view move together

    fn gen_of(&self, affiliation: Affiliation) -> &Generation {
        match affiliation {
            Affiliation::Young => &self.young,
            Affiliation::Old => &self.old,
            Affiliation::Free => unreachable!("accounting against unaffiliated region"),
        }
    }

    pub fn increase_used(&self, affiliation: Affiliation, bytes: usize) {
        self.gen_of(affiliation).increase_used(bytes);
        self.global.increase_used(bytes);
        self.state.increase_allocated(bytes);
    }

    pub fn decrease_used(&self, affiliation: Affiliation, bytes: usize) {
        self.gen_of(affiliation).decrease_used(bytes);
        self.global.decrease_used(bytes);
    }

    pub fn increase_humongous_waste(&self, affiliation: Affiliation, bytes: usize) {
        self.gen_of(affiliation).increase_humongous_waste(bytes);
        self.global.increase_humongous_waste(bytes);
    }

    pub fn decrease_humongous_waste(&self, affiliation: Affiliation, bytes: usize) {
        self.gen_of(affiliation).decrease_humongous_waste(bytes);
        self.global.decrease_humongous_waste(bytes);
    }

    pub fn account_affiliation(&self, region: &HeapRegion, affiliation: Affiliation) {
        debug_assert!(region.affiliation() == affiliation);
        self.gen_of(affiliation).increment_affiliated_region_count();
        self.global.increment_affiliated_region_count();
    }

    /// Re-establish a region's accounting when rebuilding after a full GC.
    /// Trash regions are included so that recycling them balances out.
    pub(crate) fn gen_accounting_after_full_gc(
        &self,
        _region: &HeapRegion,
        affiliation: Affiliation,
        used: usize,
    ) {
        let generation = self.gen_of(affiliation);
        generation.increase_used(used);
        generation.increment_affiliated_region_count();
        self.global.increase_used(used);
        self.global.increment_affiliated_region_count();
    }

    /// Recycling support: undo a trash region's accounting and zero it.
    /// Called under the heap lock; the caller flips the region to empty.
    pub fn recycle_region_under_lock(&self, region: &HeapRegion) {
        let affiliation = region.affiliation();
        let used = region.used();
        if used > 0 {
            self.decrease_used(affiliation, used);
            self.storage.zero(region.bottom(), used);
        }
        self.gen_of(affiliation).decrement_affiliated_region_count();
        self.global.decrement_affiliated_region_count();
        // A fresh region's TAMS must not carry stale captures.
        self.marking.capture_tams_at(region.index(), region.bottom());
    }

    // allocation

    /// One allocation attempt against the free set. Callers that may stall
    /// for GC (mutators) wrap this in their own retry loop, parked, so the
    /// collector's safepoints are not held up by the stalled thread.
    pub fn allocate_memory(&self, req: AllocRequest) -> Option<Address> {
        self.free_set.allocate(self, req)
    }

    /// GC-internal allocation (evacuation, promotion). No stalling.
    pub fn allocate_for_gc(&self, req: AllocRequest) -> Option<Address> {
        self.free_set.allocate(self, req)
    }

    /// Evacuate one object out of the collection set. The copy is allocated
    /// and made first; exactly one claimant installs its copy, and losers
    /// turn theirs into filler. On allocation failure the object stays
    /// unforwarded and the cycle is cancelled for a degenerated finish,
    /// which re-runs evacuation with the remaining free regions.
    pub fn evacuate_object(&self, obj: ObjectReference) -> ObjectReference {
        if object::is_forwarded(obj) {
            return object::resolve(obj);
        }
        let region = self.region_of(obj.to_address());
        let size = object::size_bytes(obj);
        // Objects from aged regions promote as they are copied out.
        let promote = region.is_young() && region.age() >= *self.options.tenuring_age;
        let req = if region.is_old() {
            // Old compaction: stay in old, outside the promotion reserve.
            AllocRequest {
                size_bytes: size,
                alloc_type: crate::region::free_set::AllocType::SharedGc,
                affiliation: Affiliation::Old,
            }
        } else {
            AllocRequest::for_evacuation(size, promote)
        };
        // A promotion that cannot get reserve falls back to a young-to-young
        // copy; the object promotes on a later cycle instead.
        let dst = self.allocate_for_gc(req).or_else(|| {
            if promote {
                self.allocate_for_gc(AllocRequest::for_evacuation(size, false))
            } else {
                None
            }
        });
        match dst {
            Some(dst) => {
                let copy = object::copy_to(obj, dst);
                match object::try_install_forwardee(obj, copy) {
                    Ok(()) => {
                        if self.region_of(dst).is_old() {
                            self.dirty_cards_for(dst, size);
                        }
                        copy
                    }
                    Err(winner) => {
                        // Raced with another evacuator; keep the target
                        // region parseable and use the winning copy.
                        object::initialize_filler(dst, size >> crate::util::constants::LOG_BYTES_IN_WORD);
                        winner
                    }
                }
            }
            None => {
                self.cancel_gc(GcCause::AllocFailureEvac);
                obj
            }
        }
    }

    pub fn in_collection_set(&self, obj: ObjectReference) -> bool {
        self.collection_set.is_in(self.region_index_of(obj.to_address()))
    }

    /// Conservatively dirty the write-table cards covering `[start,
    /// start+len)`. Objects moved into (or within) old regions carry their
    /// potential old-to-young pointers to new cards, and no barrier runs for
    /// the copy.
    pub fn dirty_cards_for(&self, start: Address, len: usize) {
        let first = self.card_table.card_index_of(start);
        let last = self.card_table.card_index_of(start + len.saturating_sub(1));
        for card in first..=last {
            self.card_table.write_table().mark_dirty(card);
        }
    }

    // roots and references

    pub fn add_global_root(&self, obj: ObjectReference) {
        self.global_roots.lock().unwrap().push(obj);
    }

    pub fn clear_global_roots(&self) {
        self.global_roots.lock().unwrap().clear();
    }

    pub fn global_roots(&self) -> MutexGuard<'_, Vec<ObjectReference>> {
        self.global_roots.lock().unwrap()
    }

    pub fn add_weak_handle(&self, obj: ObjectReference) {
        self.weak_handles.lock().unwrap().push(obj);
    }

    pub fn weak_handles(&self) -> MutexGuard<'_, Vec<ObjectReference>> {
        self.weak_handles.lock().unwrap()
    }

    /// Snapshot of live weak handles, for the embedder.
    pub fn live_weak_handles(&self) -> Vec<ObjectReference> {
        self.weak_handles.lock().unwrap().clone()
    }

    pub fn publish_pending_references(&self, mut refs: Vec<ObjectReference>) {
        self.pending_references.lock().unwrap().append(&mut refs);
    }

    /// Drain the pending reference list (the runtime reference handler).
    pub fn take_pending_references(&self) -> Vec<ObjectReference> {
        std::mem::take(&mut *self.pending_references.lock().unwrap())
    }

    /// Non-draining view of the pending list; these stay strongly reachable
    /// until the runtime consumes them.
    pub fn pending_references_snapshot(&self) -> Vec<ObjectReference> {
        self.pending_references.lock().unwrap().clone()
    }

    /// Rewrite pending entries through the forwarding pointers after an
    /// evacuation moved some of them.
    pub fn resolve_pending_references(&self) {
        let mut pending = self.pending_references.lock().unwrap();
        for entry in pending.iter_mut() {
            *entry = object::resolve(*entry);
        }
    }

    /// Attach a new mutator thread to the heap.
    pub fn attach_mutator(self: &Arc<Self>) -> crate::mutator::Mutator {
        let shared = self.mutators.attach();
        crate::mutator::Mutator::new(self.clone(), shared)
    }

    // control operations

    /// Request an explicit collection. Blocks until a whole cycle has run,
    /// except for breakpoint requests which only nudge the controller.
    pub fn request_gc(self: &Arc<Self>, cause: GcCause) {
        self.control.request_gc(self, cause);
    }

    /// Signal cancellation of the current cycle and wake the controller.
    pub fn cancel_gc(&self, cause: GcCause) {
        if self.state.try_cancel_gc(cause) {
            debug!("Cancelling GC: {}", cause);
            self.control.notify_cancellation(self);
        }
    }

    pub fn notify_heap_changed(&self) {
        self.state.notify_heap_changed();
        self.control.wake();
    }

    pub fn notify_soft_max_changed(&self, bytes: usize) {
        let clamped = bytes.clamp(self.region_size_bytes, self.capacity());
        self.soft_max_capacity.store(clamped, Ordering::Release);
        self.control.note_soft_max_changed();
        self.control.wake();
    }

    /// Return free committed regions beyond the soft max to the OS.
    pub fn uncommit_surplus_regions(&self) {
        if !*self.options.uncommit {
            return;
        }
        let soft_max = self.soft_max_capacity();
        let mut committed: usize = self
            .regions
            .iter()
            .filter(|r| r.is_committed())
            .count()
            * self.region_size_bytes;
        let mut uncommitted = 0;
        for region in self.regions.iter() {
            if committed <= soft_max {
                break;
            }
            if region.is_empty() && region.is_committed() && !region.is_affiliated() {
                self.storage.uncommit(region.bottom(), self.region_size_bytes);
                region.set_committed(false);
                committed -= self.region_size_bytes;
                uncommitted += 1;
            }
        }
        if uncommitted > 0 {
            info!(
                "Uncommitted {} regions ({})",
                uncommitted,
                display_bytes(uncommitted * self.region_size_bytes)
            );
        }
    }

    /// Stop the collector: sticky cancel, then join the control, VM, and
    /// worker threads.
    pub fn shutdown(&self) {
        self.policy.record_shutdown();
        self.cancel_gc(GcCause::StopVm);
        self.control.stop_and_join();
        self.vm_thread.shutdown();
        self.workers.shutdown();
        info!("GC statistics:\n{}", self.policy.gc_stats());
        info!("GC phase times:\n{}", self.phase_times.report());
    }

    // diagnostics

    pub fn log_heap_status(&self, label: &str) {
        info!("{}:", label);
        for kind in [
            GenerationKind::Young,
            GenerationKind::Old,
            GenerationKind::Global,
        ] {
            let generation = self.generation(kind);
            info!(
                "  {:?}: {} capacity, {} used, {} humongous waste, {} regions",
                kind,
                display_bytes(generation.max_capacity()),
                display_bytes(generation.used()),
                display_bytes(generation.humongous_waste()),
                generation.affiliated_region_count(),
            );
        }
    }

    /// Refresh capacity/used snapshots after a cycle. The union view is
    /// recomputed defensively; generational accounting should already agree.
    pub fn update_capacity_and_used_at_gc(&self) {
        debug_assert!(
            self.global.used() == self.young.used() + self.old.used(),
            "global used ({}) must alias young ({}) + old ({})",
            self.global.used(),
            self.young.used(),
            self.old.used()
        );
        self.state.notify_heap_changed();
    }

    /// Reclaim a dead humongous object: trash its whole region run.
    pub fn trash_humongous_object(&self, start_region_index: usize) {
        let start = self.region(start_region_index);
        debug_assert!(start.is_humongous_start());
        let obj = ObjectReference::from_address(start.bottom());
        let size = object::size_bytes(obj);
        let span = (size + self.region_size_bytes - 1) / self.region_size_bytes;
        let affiliation = start.affiliation();
        let waste = span * self.region_size_bytes - size;
        for i in 0..span {
            self.region(start_region_index + i).make_trash();
        }
        if waste > 0 {
            self.decrease_humongous_waste(affiliation, waste);
        }
    }
}
