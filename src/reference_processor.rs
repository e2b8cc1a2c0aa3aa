//! Discovery and processing of soft/weak/final/phantom references.
//!
//! Discovery happens during marking: when a marker traces a reference object
//! whose referent is not known strongly live, the reference is linked into
//! the discovering worker's list (threaded through the reference's
//! `discovered` slot) and the referent is not traced. After final mark, a
//! processing pass walks the lists and either drops each reference (referent
//! turned out live) or keeps it: clearing the referent for soft/weak/phantom,
//! or scheduling the referent for one extra mark for final references. Kept
//! references become inactive, are never re-discovered, and are spliced onto
//! the heap's pending list for the runtime to consume.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::generation::GenerationKind;
use crate::heap::Heap;
use crate::marking;
use crate::object::{self, ObjectKind};
use crate::util::address::ObjectReference;

pub struct ReferenceProcessor {
    /// Discovery is enabled between init mark and final mark.
    allow_discovery: AtomicBool,
    /// Soft reference policy: true means treat softs like weaks this cycle.
    /// Without a clock there is no LRU middle ground; softs are strong until
    /// the policy bit says otherwise.
    clear_all_soft: AtomicBool,
    /// Per-worker discovered list heads.
    discovered: Vec<Mutex<Option<ObjectReference>>>,
}

impl ReferenceProcessor {
    pub fn new(max_workers: usize) -> ReferenceProcessor {
        ReferenceProcessor {
            allow_discovery: AtomicBool::new(false),
            clear_all_soft: AtomicBool::new(false),
            discovered: (0..max_workers).map(|_| Mutex::new(None)).collect(),
        }
    }

    pub fn enable_discovery(&self) {
        self.allow_discovery.store(true, Ordering::Release);
    }

    pub fn disable_discovery(&self) {
        self.allow_discovery.store(false, Ordering::Release);
    }

    pub fn set_soft_reference_policy(&self, clear_all: bool) {
        self.clear_all_soft.store(clear_all, Ordering::Release);
    }

    /// Called by a marker tracing `reference`. Returns true if the reference
    /// was (or already is) discovered, in which case the marker must not
    /// trace the referent as a strong edge.
    ///
    /// FINAL references mark their referent right here: the referent must
    /// stay alive exactly once more so the finalizer can run, and the mark
    /// has to land before final mark settles region liveness.
    pub fn discover_reference(
        &self,
        heap: &Heap,
        reference: ObjectReference,
        kind: ObjectKind,
        gen_kind: GenerationKind,
        worker_id: usize,
    ) -> bool {
        debug_assert!(kind.is_reference());
        if !self.allow_discovery.load(Ordering::Acquire) {
            return false;
        }
        if object::is_inactive(reference) {
            // Already processed in some earlier cycle; the referent slot is
            // no longer special.
            return false;
        }
        let referent = match object::get_ref(reference, object::REFERENT_SLOT) {
            Some(r) => r,
            None => return false,
        };
        // A mark can only judge liveness inside its own generation; a
        // referent outside it stays a strong edge for this cycle.
        let referent_region = heap.region_of(referent.to_address());
        let judgeable = match gen_kind {
            GenerationKind::Global => true,
            GenerationKind::Young => referent_region.is_young(),
            GenerationKind::Old => referent_region.is_old(),
        };
        if !judgeable {
            return false;
        }
        if self.is_strongly_live(heap, referent) {
            return false;
        }
        if kind == ObjectKind::Soft && !self.clear_all_soft.load(Ordering::Acquire) {
            // Softly live: keep treating the referent as a strong edge.
            return false;
        }

        // Try to claim the reference by installing a non-null discovered
        // link. The tail of a list links to the reference itself, so null
        // always means "not discovered".
        let mut head = self.discovered[worker_id].lock().unwrap();
        let link = head.unwrap_or(reference);
        let slot = object::ref_slot(reference, object::DISCOVERED_SLOT);
        let claimed = unsafe { slot.as_atomic() }
            .compare_exchange(0, link.as_usize(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if claimed {
            *head = Some(reference);
            if kind == ObjectKind::Final && !object::is_finalized(reference) {
                marking::mark_and_push(
                    heap,
                    referent,
                    gen_kind,
                    None,
                    heap.generation(gen_kind).task_queues(),
                );
            }
        }
        // Claimed or raced: either way it is on somebody's list.
        true
    }

    fn is_strongly_live(&self, heap: &Heap, referent: ObjectReference) -> bool {
        let region_index = heap.region_index_of(referent.to_address());
        heap.marking_context().is_live(region_index, referent)
    }

    /// Process all discovered references after final mark. Final referents
    /// that have not been finalized yet are given their one extra mark by
    /// pushing them onto `kind`'s queues; the caller drains the queues
    /// afterwards. Survivors are spliced onto the heap pending list under the
    /// heap lock.
    pub fn process_references(&self, heap: &Heap, kind: GenerationKind) {
        let mut pending = Vec::new();
        for head in &self.discovered {
            let mut cursor = head.lock().unwrap().take();
            while let Some(reference) = cursor {
                // Root processing may already have evacuated the reference;
                // all bookkeeping goes to the live copy.
                let reference = object::resolve(reference);
                cursor = self.unlink(reference);
                self.process_one(heap, kind, reference, &mut pending);
            }
        }
        if !pending.is_empty() {
            heap.publish_pending_references(pending);
        }
    }

    /// Follow and clear the discovered link. Self-link means end of list.
    fn unlink(&self, reference: ObjectReference) -> Option<ObjectReference> {
        let next = object::get_ref(reference, object::DISCOVERED_SLOT);
        object::set_ref(reference, object::DISCOVERED_SLOT, None);
        match next {
            Some(n) if object::resolve(n) == reference => None,
            other => other,
        }
    }

    fn process_one(
        &self,
        heap: &Heap,
        _kind: GenerationKind,
        reference: ObjectReference,
        pending: &mut Vec<ObjectReference>,
    ) {
        let referent = match object::get_ref(reference, object::REFERENT_SLOT) {
            Some(r) => r,
            None => return, // cleared by the application meanwhile
        };
        match object::kind(reference) {
            ObjectKind::Final => {
                // The referent got its one extra mark at discovery; the
                // reference itself retires now.
                object::set_finalized(reference);
            }
            ObjectKind::Soft | ObjectKind::Weak | ObjectKind::Phantom => {
                if self.is_strongly_live(heap, referent) {
                    // Drop: the reference stays active and may be
                    // re-discovered.
                    return;
                }
                object::set_ref(reference, object::REFERENT_SLOT, None);
            }
            k => unreachable!("non-reference object {:?} on discovered list", k),
        }
        object::make_inactive(reference);
        // Self-looped next marks the reference as enqueued.
        object::set_ref(reference, object::NEXT_SLOT, Some(reference));
        pending.push(reference);
    }

    /// Drop all partial discovery. Called on cancellation: the lists unlink
    /// and every reference reverts to undiscovered.
    pub fn abandon_partial_discovery(&self) {
        for head in &self.discovered {
            let mut cursor = head.lock().unwrap().take();
            while let Some(reference) = cursor {
                cursor = self.unlink(reference);
            }
        }
    }

    /// Number of references currently on discovered lists. Diagnostic.
    pub fn discovered_count(&self) -> usize {
        let mut count = 0;
        for head in &self.discovered {
            let guard = head.lock().unwrap();
            let mut cursor = *guard;
            while let Some(reference) = cursor {
                count += 1;
                let next = object::get_ref(reference, object::DISCOVERED_SLOT);
                cursor = match next {
                    Some(n) if n == reference => None,
                    other => other,
                };
            }
        }
        count
    }
}
