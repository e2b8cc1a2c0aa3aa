//! Concurrent marking: the marking context (bitmap + TAMS) and the
//! work-stealing mark engine.
//!
//! Task queues are per-worker Chase-Lev deques with a shared injector.
//! Workers drain their own deque, then the injector, then steal from each
//! other. Between strides they poll the shared cancellation flag and pick up
//! completed SATB buffers.

pub mod bitmap;
pub mod satb;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crossbeam::deque::{Injector, Steal, Stealer, Worker};

use crate::generation::GenerationKind;
use crate::heap::Heap;
use crate::object::{self, ObjectKind};
use crate::util::address::{Address, ObjectReference};
use crate::util::constants::MARK_POLL_STRIDE;

use self::bitmap::{MarkBitmap, TamsTable};

/// The marking context: one bitmap shared by all generations, plus the
/// per-region TAMS snapshots.
pub struct MarkingContext {
    bitmap: MarkBitmap,
    tams: TamsTable,
}

impl MarkingContext {
    pub fn new(heap_start: Address, heap_bytes: usize, num_regions: usize) -> MarkingContext {
        MarkingContext {
            bitmap: MarkBitmap::new(heap_start, heap_bytes),
            tams: TamsTable::new(num_regions),
        }
    }

    pub fn mark(&self, obj: ObjectReference) -> bool {
        self.bitmap.mark(obj)
    }

    pub fn is_marked(&self, obj: ObjectReference) -> bool {
        self.bitmap.is_marked(obj)
    }

    pub fn tams(&self, region_index: usize) -> Address {
        self.tams.get(region_index)
    }

    pub fn capture_tams(&self, region: &crate::region::HeapRegion) {
        self.tams.capture(region.index(), region.top());
    }

    /// Pin a region's TAMS to a specific address. Used when recycling, so a
    /// fresh region never carries a stale capture.
    pub fn capture_tams_at(&self, region_index: usize, at: Address) {
        self.tams.capture(region_index, at);
    }

    pub fn clear_bitmap(&self, region: &crate::region::HeapRegion) {
        self.bitmap.clear_range(region.bottom(), region.end());
    }

    /// Is the object live in the current cycle: marked, or allocated above
    /// TAMS (implicitly live, never visited)?
    pub fn is_live(&self, region_index: usize, obj: ObjectReference) -> bool {
        obj.to_address() >= self.tams.get(region_index) || self.bitmap.is_marked(obj)
    }

    /// Visit all live objects of a region: marked objects up to TAMS via the
    /// bitmap, then everything above TAMS linearly.
    pub fn marked_object_iterate<F: FnMut(ObjectReference)>(
        &self,
        region: &crate::region::HeapRegion,
        mut f: F,
    ) {
        let tams = self.tams.get(region.index());
        let limit = tams.min(region.top());
        self.bitmap.iterate_marked(region.bottom(), limit, &mut f);
        if region.top() > tams {
            region.linear_walk(tams, region.top(), |obj| {
                if object::kind(obj) != ObjectKind::Filler {
                    f(obj)
                }
            });
        }
    }
}

/// A set of mark queues: one deque per worker plus an overflow injector.
pub struct MarkQueueSet {
    injector: Injector<ObjectReference>,
    stealers: Vec<Stealer<ObjectReference>>,
    locals: Vec<Mutex<Option<Worker<ObjectReference>>>>,
    /// Workers currently finding nothing to do; drives termination.
    idle: AtomicUsize,
}

impl MarkQueueSet {
    pub fn new(num_workers: usize) -> MarkQueueSet {
        let mut stealers = Vec::with_capacity(num_workers);
        let mut locals = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let worker = Worker::new_lifo();
            stealers.push(worker.stealer());
            locals.push(Mutex::new(Some(worker)));
        }
        MarkQueueSet {
            injector: Injector::new(),
            stealers,
            locals,
            idle: AtomicUsize::new(0),
        }
    }

    /// Push a root (or externally discovered) task.
    pub fn push(&self, obj: ObjectReference) {
        self.injector.push(obj);
    }

    pub fn is_empty(&self) -> bool {
        self.injector.is_empty() && self.stealers.iter().all(|s| s.is_empty())
    }

    /// Drop every queued task. Used when marking is cancelled outright.
    pub fn clear(&self) {
        loop {
            match self.injector.steal() {
                Steal::Success(_) | Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
        for local in &self.locals {
            let guard = local.lock().unwrap();
            if let Some(w) = guard.as_ref() {
                while w.pop().is_some() {}
            }
        }
        self.idle.store(0, Ordering::Relaxed);
    }

    pub fn reset_idle(&self) {
        self.idle.store(0, Ordering::Relaxed);
    }

    fn take_local(&self, worker_id: usize) -> Worker<ObjectReference> {
        self.locals[worker_id]
            .lock()
            .unwrap()
            .take()
            .expect("mark queue already taken")
    }

    fn put_local(&self, worker_id: usize, worker: Worker<ObjectReference>) {
        *self.locals[worker_id].lock().unwrap() = Some(worker);
    }

    fn find_task(&self, worker_id: usize, local: &Worker<ObjectReference>) -> Option<ObjectReference> {
        if let Some(task) = local.pop() {
            return Some(task);
        }
        loop {
            match self.injector.steal_batch_and_pop(local) {
                Steal::Success(task) => return Some(task),
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
        for (i, stealer) in self.stealers.iter().enumerate() {
            if i == worker_id {
                continue;
            }
            loop {
                match stealer.steal() {
                    Steal::Success(task) => return Some(task),
                    Steal::Retry => continue,
                    Steal::Empty => break,
                }
            }
        }
        None
    }
}

/// Try to mark `obj` for the cycle collecting `kind`, pushing it for tracing
/// when this caller wins the mark race.
///
/// During a young cycle with old marking in progress, references into old
/// regions are marked into the old generation's queues instead of being
/// dropped, which is how young cycles advance old marking.
pub fn mark_and_push(
    heap: &Heap,
    obj: ObjectReference,
    kind: GenerationKind,
    local: Option<&Worker<ObjectReference>>,
    queues: &MarkQueueSet,
) {
    let region_index = heap.region_index_of(obj.to_address());
    let region = heap.region(region_index);
    let ctx = heap.marking_context();

    let traced = match kind {
        GenerationKind::Global => true,
        GenerationKind::Young => region.is_young(),
        GenerationKind::Old => region.is_old(),
    };

    if !traced {
        // Old target seen by a young cycle: feed the old marking effort.
        if kind == GenerationKind::Young
            && region.is_old()
            && heap.global_state().is_concurrent_old_mark_in_progress()
        {
            if obj.to_address() < ctx.tams(region_index) && ctx.mark(obj) {
                region.increase_live_data(object::size_bytes(obj));
                heap.old_generation().task_queues().push(obj);
            }
        }
        // And the mirror image: an old drain (typically consuming SATB
        // buffers) must not swallow entries the young mark still needs.
        if kind == GenerationKind::Old
            && region.is_young()
            && heap.global_state().is_concurrent_mark_in_progress()
        {
            if obj.to_address() < ctx.tams(region_index) && ctx.mark(obj) {
                region.increase_live_data(object::size_bytes(obj));
                heap.young_generation().task_queues().push(obj);
            }
        }
        return;
    }

    if obj.to_address() >= ctx.tams(region_index) {
        return; // allocated during the cycle: implicitly live
    }
    if ctx.mark(obj) {
        region.increase_live_data(object::size_bytes(obj));
        match local {
            Some(local) => local.push(obj),
            None => queues.push(obj),
        }
    }
}

/// Trace one object's strong reference slots. Reference objects go through
/// discovery; their `discovered`/`next` slots are never traced.
fn trace_object(
    heap: &Heap,
    obj: ObjectReference,
    kind: GenerationKind,
    worker_id: usize,
    local: &Worker<ObjectReference>,
    queues: &MarkQueueSet,
) {
    let obj_kind = object::kind(obj);
    debug_assert!(obj_kind != ObjectKind::Filler, "fillers are never queued");

    let mut first_strong = 0;
    if obj_kind.is_reference() {
        first_strong = object::REFERENCE_STRONG_SLOTS;
        let discovered = heap
            .generation(kind)
            .ref_processor()
            .discover_reference(heap, obj, obj_kind, kind, worker_id);
        if !discovered {
            // Not discovered: the referent is treated as a strong edge.
            if let Some(referent) = object::get_ref(obj, object::REFERENT_SLOT) {
                mark_and_push(heap, referent, kind, Some(local), queues);
            }
        }
    }

    let slots = object::ref_slot_count(obj);
    for i in first_strong..slots {
        if let Some(target) = object::get_ref(obj, i) {
            mark_and_push(heap, target, kind, Some(local), queues);
        }
    }
}

/// Drain the mark queues for generation `kind`. Returns false if the loop
/// observed cancellation (cancellable mode only); queued work is left in
/// place for a degenerated finish.
pub fn mark_loop(
    heap: &Heap,
    kind: GenerationKind,
    worker_id: usize,
    active_workers: usize,
    cancellable: bool,
) -> bool {
    let queues = heap.generation(kind).task_queues();
    let local = queues.take_local(worker_id);
    let result = mark_loop_inner(heap, kind, worker_id, active_workers, cancellable, queues, &local);
    queues.put_local(worker_id, local);
    result
}

fn mark_loop_inner(
    heap: &Heap,
    kind: GenerationKind,
    worker_id: usize,
    active_workers: usize,
    cancellable: bool,
    queues: &MarkQueueSet,
    local: &Worker<ObjectReference>,
) -> bool {
    let satb = heap.satb_queue_set();
    let mut is_idle = false;
    loop {
        if cancellable && heap.global_state().is_cancelled() {
            if is_idle {
                queues.idle.fetch_sub(1, Ordering::AcqRel);
            }
            return false;
        }

        let mut worked = false;
        for _ in 0..MARK_POLL_STRIDE {
            match queues.find_task(worker_id, local) {
                Some(obj) => {
                    worked = true;
                    trace_object(heap, obj, kind, worker_id, local, queues);
                }
                None => break,
            }
        }

        if worked {
            if is_idle {
                queues.idle.fetch_sub(1, Ordering::AcqRel);
                is_idle = false;
            }
            continue;
        }

        // Nothing queued: try a completed SATB buffer before going idle.
        if satb.is_active() {
            if let Some(buffer) = satb.pop_completed() {
                if is_idle {
                    queues.idle.fetch_sub(1, Ordering::AcqRel);
                    is_idle = false;
                }
                for value in buffer {
                    mark_and_push(heap, value, kind, Some(local), queues);
                }
                continue;
            }
        }

        if !is_idle {
            queues.idle.fetch_add(1, Ordering::AcqRel);
            is_idle = true;
        }

        let satb_pending = satb.is_active() && satb.completed_count() > 0;
        if queues.idle.load(Ordering::Acquire) >= active_workers
            && queues.is_empty()
            && !satb_pending
        {
            return true;
        }
        std::thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::address::Address;

    fn obj(raw: usize) -> ObjectReference {
        ObjectReference::from_address(unsafe { Address::from_usize(raw) })
    }

    #[test]
    fn queue_push_steal() {
        let queues = MarkQueueSet::new(2);
        queues.push(obj(8));
        queues.push(obj(16));
        assert!(!queues.is_empty());
        let local = queues.take_local(0);
        let mut seen = vec![];
        while let Some(t) = queues.find_task(0, &local) {
            seen.push(t.as_usize());
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![8, 16]);
        assert!(queues.is_empty());
        queues.put_local(0, local);
    }

    #[test]
    fn clear_discards_tasks() {
        let queues = MarkQueueSet::new(1);
        queues.push(obj(8));
        let local = queues.take_local(0);
        local.push(obj(16));
        queues.put_local(0, local);
        queues.clear();
        assert!(queues.is_empty());
    }
}
