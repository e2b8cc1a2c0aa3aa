//! Snapshot-at-the-beginning queues.
//!
//! While marking is in progress, the pre-write barrier logs the previous
//! value of every overwritten reference field into the storing thread's SATB
//! buffer. Full buffers are handed to the global completed list, which
//! marking workers drain. The snapshot invariant: any reference removed from
//! the heap during marking is either already marked or sits in one of these
//! buffers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::util::address::ObjectReference;
use crate::util::constants::SATB_BUFFER_CAPACITY;

/// A mutator-local buffer of overwritten references.
pub struct SatbBuffer {
    entries: Vec<ObjectReference>,
}

impl SatbBuffer {
    pub fn new() -> SatbBuffer {
        SatbBuffer {
            entries: Vec::with_capacity(SATB_BUFFER_CAPACITY),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SatbBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// The global queue set. One per heap.
pub struct SatbQueueSet {
    /// Barriers consult this before touching their buffer. Flipped at
    /// init-mark/final-mark safepoints; stays set across young cycles while
    /// old marking is in progress.
    active: AtomicBool,
    completed: Mutex<Vec<Vec<ObjectReference>>>,
}

impl SatbQueueSet {
    pub fn new() -> SatbQueueSet {
        SatbQueueSet {
            active: AtomicBool::new(false),
            completed: Mutex::new(Vec::new()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Barrier slow path: append to the mutator's buffer, handing the buffer
    /// off when it fills.
    pub fn enqueue(&self, buffer: &mut SatbBuffer, value: ObjectReference) {
        buffer.entries.push(value);
        if buffer.entries.len() >= SATB_BUFFER_CAPACITY {
            self.hand_off(buffer);
        }
    }

    /// Push a partially filled buffer to the completed list. Used at final
    /// mark, when every mutator's buffer must be visible to the markers.
    pub fn flush_buffer(&self, buffer: &mut SatbBuffer) {
        if !buffer.entries.is_empty() {
            self.hand_off(buffer);
        }
    }

    fn hand_off(&self, buffer: &mut SatbBuffer) {
        let full = std::mem::replace(
            &mut buffer.entries,
            Vec::with_capacity(SATB_BUFFER_CAPACITY),
        );
        self.completed.lock().unwrap().push(full);
    }

    /// Take one completed buffer, if any.
    pub fn pop_completed(&self) -> Option<Vec<ObjectReference>> {
        self.completed.lock().unwrap().pop()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.lock().unwrap().len()
    }

    /// Drop all completed buffers. Called when marking is cancelled; the
    /// snapshot is void anyway because the cycle will restart from scratch.
    pub fn abandon_partial_marking(&self) {
        self.completed.lock().unwrap().clear();
    }

    /// Keep only entries satisfying `keep`, rewriting the completed list.
    /// At a young final mark with old marking in progress, this filters out
    /// everything not pointing into active old regions before the buffers
    /// are transferred to the old mark queues.
    pub fn filter<F: Fn(ObjectReference) -> bool>(&self, keep: F) {
        let mut completed = self.completed.lock().unwrap();
        for buf in completed.iter_mut() {
            buf.retain(|&obj| keep(obj));
        }
        completed.retain(|buf| !buf.is_empty());
    }
}

impl Default for SatbQueueSet {
    fn default() -> Self {
        Self::new()
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
    fn enqueue_hands_off_full_buffers() {
        let set = SatbQueueSet::new();
        let mut buf = SatbBuffer::new();
        for i in 0..SATB_BUFFER_CAPACITY {
            set.enqueue(&mut buf, obj(8 * (i + 1)));
        }
        assert!(buf.is_empty());
        assert_eq!(set.completed_count(), 1);
        assert_eq!(set.pop_completed().unwrap().len(), SATB_BUFFER_CAPACITY);
    }

    #[test]
    fn flush_partial() {
        let set = SatbQueueSet::new();
        let mut buf = SatbBuffer::new();
        set.enqueue(&mut buf, obj(8));
        assert_eq!(set.completed_count(), 0);
        set.flush_buffer(&mut buf);
        assert_eq!(set.completed_count(), 1);
        set.flush_buffer(&mut buf); // empty buffer: no-op
        assert_eq!(set.completed_count(), 1);
    }

    #[test]
    fn filter_drops_non_matching() {
        let set = SatbQueueSet::new();
        let mut buf = SatbBuffer::new();
        set.enqueue(&mut buf, obj(8));
        set.enqueue(&mut buf, obj(16));
        set.enqueue(&mut buf, obj(24));
        set.flush_buffer(&mut buf);
        set.filter(|o| o.as_usize() == 16);
        let kept = set.pop_completed().unwrap();
        assert_eq!(kept, vec![obj(16)]);
    }

    #[test]
    fn abandon_clears() {
        let set = SatbQueueSet::new();
        let mut buf = SatbBuffer::new();
        set.enqueue(&mut buf, obj(8));
        set.flush_buffer(&mut buf);
        set.abandon_partial_marking();
        assert_eq!(set.completed_count(), 0);
    }
}
