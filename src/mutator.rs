//! The mutator handle: how application threads allocate and access the heap.
//!
//! Every heap access goes through the barriers; allocation and the barrier
//! slow paths are the mutator's safepoint poll points. A mutator that will
//! not touch the heap for a while parks itself, which lets safepoints
//! proceed without it.

use std::sync::Arc;

use crate::barriers;
use crate::heap::Heap;
use crate::object::{self, ObjectKind};
use crate::region::free_set::AllocRequest;
use crate::scheduler::MutatorShared;
use crate::util::address::ObjectReference;
use crate::util::constants::BYTES_IN_WORD;

pub struct Mutator {
    heap: Arc<Heap>,
    shared: Arc<MutatorShared>,
}

impl Mutator {
    pub(crate) fn new(heap: Arc<Heap>, shared: Arc<MutatorShared>) -> Mutator {
        Mutator { heap, shared }
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    fn poll(&self) {
        self.heap.mutators().poll_safepoint(&self.shared);
    }

    /// Allocate an object with `ref_slots` reference slots and
    /// `payload_words` words of raw payload. Reference kinds get their three
    /// bookkeeping slots on top. Returns `None` when the heap is exhausted
    /// even after collection.
    pub fn alloc(
        &self,
        ref_slots: usize,
        payload_words: usize,
        kind: ObjectKind,
    ) -> Option<ObjectReference> {
        debug_assert!(kind != ObjectKind::Filler, "fillers are GC-internal");
        self.poll();
        let slots = if kind.is_reference() {
            ref_slots + object::REFERENCE_STRONG_SLOTS
        } else {
            ref_slots
        };
        let size_words = object::HEADER_WORDS + slots + payload_words;
        let size_bytes = size_words * BYTES_IN_WORD;

        let req = if size_bytes >= self.heap.region_size_bytes() {
            AllocRequest::humongous(size_bytes)
        } else {
            AllocRequest::shared(size_bytes)
        };
        let addr = self.allocate_or_stall(req)?;
        Some(object::initialize(addr, size_words, slots, kind))
    }

    /// The allocation retry loop: on failure, cancel the concurrent cycle
    /// and stall (parked, so safepoints can proceed) until the collector has
    /// run. Gives up once the collector stops making progress.
    fn allocate_or_stall(&self, req: AllocRequest) -> Option<crate::util::address::Address> {
        const MAX_ATTEMPTS: usize = 3;
        for attempt in 0..MAX_ATTEMPTS {
            if let Some(addr) = self.heap.allocate_memory(req) {
                return Some(addr);
            }
            if self.heap.policy().is_at_shutdown() {
                return None;
            }
            debug!(
                "Allocation of {} bytes failed (attempt {}); stalling for GC",
                req.size_bytes, attempt
            );
            self.park();
            self.heap.control().handle_alloc_failure(&self.heap);
            self.unpark();
            if !self.heap.global_state().progress_last_gc() {
                break;
            }
        }
        self.heap.allocate_memory(req)
    }

    /// Store `value` into reference slot `slot` of `obj`, through the write
    /// barriers.
    pub fn store_ref(&self, obj: ObjectReference, slot: usize, value: Option<ObjectReference>) {
        self.poll();
        // Writes go to the to-space copy.
        let obj = barriers::load_reference_barrier(&self.heap, obj);
        let value = value.map(|v| barriers::load_reference_barrier(&self.heap, v));
        barriers::pre_write_barrier(&self.heap, &self.shared, obj, slot);
        object::set_ref(obj, slot, value);
        barriers::post_write_barrier(&self.heap, obj, slot);
    }

    /// Load reference slot `slot` of `obj`, through the load barrier. Heals
    /// the slot when the value had been forwarded.
    pub fn load_ref(&self, obj: ObjectReference, slot: usize) -> Option<ObjectReference> {
        self.poll();
        let obj = barriers::load_reference_barrier(&self.heap, obj);
        let value = object::get_ref(obj, slot)?;
        let resolved = barriers::load_reference_barrier(&self.heap, value);
        barriers::heal_load_site(object::ref_slot(obj, slot), value, resolved);
        Some(resolved)
    }

    /// Raw payload access for tests and embedders. The payload is not
    /// scanned by the collector.
    pub fn payload_addr(&self, obj: ObjectReference) -> crate::util::address::Address {
        object::payload(barriers::load_reference_barrier(&self.heap, obj))
    }

    // roots

    /// Register `obj` as a root of this mutator (a stand-in for a stack
    /// slot). The returned index identifies it for updates.
    pub fn add_root(&self, obj: ObjectReference) -> usize {
        let mut roots = self.shared.roots.lock().unwrap();
        roots.push(obj);
        roots.len() - 1
    }

    /// Re-read a root; the collector may have moved the object.
    pub fn get_root(&self, index: usize) -> ObjectReference {
        self.shared.roots.lock().unwrap()[index]
    }

    pub fn set_root(&self, index: usize, obj: ObjectReference) {
        self.shared.roots.lock().unwrap()[index] = obj;
    }

    pub fn clear_roots(&self) {
        self.shared.roots.lock().unwrap().clear();
    }

    // pinning

    /// Pin the region holding `obj`; it will not be moved or reclaimed.
    pub fn pin_object(&self, obj: ObjectReference) {
        self.heap.region_of(obj.to_address()).make_pinned();
    }

    pub fn unpin_object(&self, obj: ObjectReference) {
        self.heap.region_of(obj.to_address()).make_unpinned();
    }

    // scheduling

    /// Request an explicit collection and wait for it. The mutator parks
    /// for the wait so the collection's safepoints can proceed.
    pub fn request_gc(&self, cause: crate::gc::GcCause) {
        self.park();
        self.heap.request_gc(cause);
        self.unpark();
    }

    /// Stop touching the heap until [`unpark`]. Parked mutators do not hold
    /// up safepoints.
    pub fn park(&self) {
        self.heap.mutators().park(&self.shared);
    }

    pub fn unpark(&self) {
        self.heap.mutators().unpark(&self.shared);
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        // Hand any logged SATB entries to the collector before going away.
        {
            let mut buffer = self.shared.satb.lock().unwrap();
            self.heap.satb_queue_set().flush_buffer(&mut buffer);
        }
        self.heap.mutators().detach(&self.shared);
    }
}
