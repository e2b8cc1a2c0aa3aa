//! Generations: young, old, and the global union view.
//!
//! A generation owns the aggregate accounting for its regions, its mark
//! queues, its reference processor, and its heuristics. The generation type
//! set is closed, so it is a plain enum rather than a class hierarchy; the
//! old generation's extra state machine lives in [`old`].

pub mod old;
pub mod sizer;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::global_state::gc_state;
use crate::heap::Heap;
use crate::heuristics::Heuristics;
use crate::marking::MarkQueueSet;
use crate::reference_processor::ReferenceProcessor;
use crate::rset::scan::RememberedSetScan;

#[derive(Copy, Clone, Debug, PartialEq, Eq, bytemuck::NoUninit)]
#[repr(u8)]
pub enum GenerationKind {
    Young,
    Old,
    Global,
}

pub struct Generation {
    kind: GenerationKind,
    max_capacity: AtomicUsize,
    used: AtomicUsize,
    humongous_waste: AtomicUsize,
    affiliated_regions: AtomicUsize,
    is_marking_complete: AtomicBool,
    task_queues: MarkQueueSet,
    ref_processor: ReferenceProcessor,
    heuristics: Mutex<Box<dyn Heuristics>>,
    /// Wall time the control thread has spent collecting this generation.
    collection_thread_time: AtomicU64,
}

impl Generation {
    pub fn new(
        kind: GenerationKind,
        max_capacity: usize,
        max_workers: usize,
        heuristics: Box<dyn Heuristics>,
    ) -> Generation {
        Generation {
            kind,
            max_capacity: AtomicUsize::new(max_capacity),
            used: AtomicUsize::new(0),
            humongous_waste: AtomicUsize::new(0),
            affiliated_regions: AtomicUsize::new(0),
            is_marking_complete: AtomicBool::new(false),
            task_queues: MarkQueueSet::new(max_workers),
            ref_processor: ReferenceProcessor::new(max_workers),
            heuristics: Mutex::new(heuristics),
            collection_thread_time: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> GenerationKind {
        self.kind
    }

    pub fn is_young(&self) -> bool {
        self.kind == GenerationKind::Young
    }

    pub fn is_old(&self) -> bool {
        self.kind == GenerationKind::Old
    }

    pub fn is_global(&self) -> bool {
        self.kind == GenerationKind::Global
    }

    // accounting, maintained under the heap lock

    pub fn max_capacity(&self) -> usize {
        self.max_capacity.load(Ordering::Acquire)
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn humongous_waste(&self) -> usize {
        self.humongous_waste.load(Ordering::Acquire)
    }

    pub fn affiliated_region_count(&self) -> usize {
        self.affiliated_regions.load(Ordering::Acquire)
    }

    pub fn used_including_waste(&self) -> usize {
        self.used() + self.humongous_waste()
    }

    pub fn available(&self) -> usize {
        self.max_capacity()
            .saturating_sub(self.used_including_waste())
    }

    pub fn free_unaffiliated_regions(&self, region_size_bytes: usize) -> usize {
        (self.max_capacity() / region_size_bytes)
            .saturating_sub(self.affiliated_region_count())
    }

    pub fn increase_used(&self, bytes: usize) {
        self.used.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn decrease_used(&self, bytes: usize) {
        let prev = self.used.fetch_sub(bytes, Ordering::Relaxed);
        debug_assert!(prev >= bytes, "{:?} used underflow", self.kind);
    }

    pub fn increase_humongous_waste(&self, bytes: usize) {
        self.humongous_waste.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn decrease_humongous_waste(&self, bytes: usize) {
        let prev = self.humongous_waste.fetch_sub(bytes, Ordering::Relaxed);
        debug_assert!(prev >= bytes, "{:?} humongous waste underflow", self.kind);
    }

    pub fn increment_affiliated_region_count(&self) {
        self.affiliated_regions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_affiliated_region_count(&self) {
        let prev = self.affiliated_regions.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "{:?} affiliated count underflow", self.kind);
    }

    /// Grow capacity by a whole number of regions.
    pub fn increase_capacity(&self, bytes: usize, region_size_bytes: usize) {
        debug_assert!(bytes % region_size_bytes == 0);
        self.max_capacity.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Shrink capacity by a whole number of regions. The result must still
    /// cover every affiliated region.
    pub fn decrease_capacity(&self, bytes: usize, region_size_bytes: usize) {
        debug_assert!(bytes % region_size_bytes == 0);
        let new = self.max_capacity.fetch_sub(bytes, Ordering::Relaxed) - bytes;
        assert!(
            self.affiliated_region_count() * region_size_bytes <= new,
            "{:?} capacity below affiliated regions",
            self.kind
        );
    }

    pub fn set_capacity(&self, bytes: usize) {
        self.max_capacity.store(bytes, Ordering::Release);
    }

    pub fn reset_accounting(&self) {
        self.used.store(0, Ordering::Relaxed);
        self.humongous_waste.store(0, Ordering::Relaxed);
        self.affiliated_regions.store(0, Ordering::Relaxed);
    }

    // marking state

    pub fn is_mark_complete(&self) -> bool {
        self.is_marking_complete.load(Ordering::Acquire)
    }

    pub fn set_mark_complete(&self) {
        self.is_marking_complete.store(true, Ordering::Release);
    }

    pub fn set_mark_incomplete(&self) {
        self.is_marking_complete.store(false, Ordering::Release);
    }

    pub fn task_queues(&self) -> &MarkQueueSet {
        &self.task_queues
    }

    pub fn ref_processor(&self) -> &ReferenceProcessor {
        &self.ref_processor
    }

    pub fn heuristics(&self) -> MutexGuard<'_, Box<dyn Heuristics>> {
        self.heuristics.lock().unwrap()
    }

    pub fn add_collection_time(&self, nanos: u64) {
        self.collection_thread_time
            .fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn collection_thread_time(&self) -> u64 {
        self.collection_thread_time.load(Ordering::Relaxed)
    }

    /// Does this generation claim the region, for iteration purposes?
    pub fn contains_region(&self, region: &crate::region::HeapRegion) -> bool {
        match self.kind {
            GenerationKind::Young => region.is_young(),
            GenerationKind::Old => region.is_old(),
            GenerationKind::Global => region.is_affiliated(),
        }
    }

    /// Prepare for marking: invalidate the previous mark, capture TAMS for
    /// every affiliated region, and clear live data and mark bits.
    pub fn prepare_gc(&self, heap: &Heap) {
        self.set_mark_incomplete();
        let ctx = heap.marking_context();
        for idx in 0..heap.num_regions() {
            let region = heap.region(idx);
            if !self.contains_region(region) {
                continue;
            }
            ctx.capture_tams(region);
            ctx.clear_bitmap(region);
            region.reset_live_data();
        }
    }

    /// Tear down an in-flight mark: drop queued tasks and discovery, and
    /// lower the marking-in-progress state bit.
    pub fn cancel_marking(&self, heap: &Heap) {
        if self.kind == GenerationKind::Old
            && heap.global_state().is_concurrent_old_mark_in_progress()
        {
            info!("Abandon SATB buffers");
            heap.satb_queue_set().abandon_partial_marking();
        }
        self.task_queues.clear();
        self.ref_processor.abandon_partial_discovery();
        let bit = match self.kind {
            GenerationKind::Old => gc_state::OLD_MARKING,
            _ => gc_state::MARKING,
        };
        heap.global_state().set_state_bit(bit, false);
        self.set_mark_incomplete();
    }

    /// Scan the remembered set, feeding old-to-young pointers into the young
    /// mark queues. Young only. Returns false on cancellation.
    pub fn scan_remembered_set(&self, heap: &Heap, concurrent: bool) -> bool {
        assert!(self.is_young(), "only young scans the remembered set");
        let scan = RememberedSetScan::new(heap);
        let task = RsetScanTask {
            heap,
            scan: &scan,
            cancellable: concurrent,
            ok: AtomicBool::new(true),
        };
        let workers = heap.workers();
        workers.run_task(&task, workers.num_workers());
        if *heap.options().card_stats {
            let stats = scan.stats();
            info!(
                "Card scan: {} chunks, {} dirty cards, {} objects, {} refs pushed",
                stats.chunks_claimed,
                stats.dirty_cards_scanned,
                stats.objects_scanned,
                stats.refs_pushed
            );
        }
        task.ok.load(Ordering::Acquire)
    }
}

struct RsetScanTask<'a> {
    heap: &'a Heap,
    scan: &'a RememberedSetScan,
    cancellable: bool,
    ok: AtomicBool,
}

impl crate::scheduler::ParallelTask for RsetScanTask<'_> {
    fn name(&self) -> &'static str {
        "remembered-set-scan"
    }

    fn work(&self, _worker_id: usize, _num_workers: usize) {
        if !self.scan.work(self.heap, self.cancellable) {
            self.ok.store(false, Ordering::Release);
        }
    }
}
