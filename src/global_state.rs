//! Global states for one heap instance: the gc-state bits that mutator
//! barriers key off, the shared cause-tagged cancellation flag, and a few
//! cross-cycle counters.
//!
//! These used to be fields scattered across the heap and the engines. They
//! are grouped here so components that only need the states do not need a
//! reference to anything else.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::time::Instant;

use atomic::Atomic;
use atomic_refcell::AtomicRefCell;

use crate::gc::GcCause;

/// Bits published to all mutators. Barriers read these on their fast paths.
pub mod gc_state {
    /// Some objects have forwarding pointers installed.
    pub const HAS_FORWARDED: u8 = 0b00_0001;
    /// Young or global concurrent marking is in progress.
    pub const MARKING: u8 = 0b00_0010;
    /// Old concurrent marking is in progress (generational only).
    pub const OLD_MARKING: u8 = 0b00_0100;
    /// Concurrent evacuation is in progress.
    pub const EVACUATION: u8 = 0b00_1000;
    /// Concurrent reference updating is in progress.
    pub const UPDATE_REFS: u8 = 0b01_0000;
    /// Concurrent weak root processing is in progress.
    pub const WEAK_ROOTS: u8 = 0b10_0000;
}

pub struct GlobalState {
    /// The published gc-state bits. Writes happen at safepoints (or under a
    /// handshake); the release fence at the end of each STW operation makes
    /// them visible to all mutators before they resume.
    state_bits: AtomicU8,
    /// The shared cancellation flag, tagged with its cause. `NoGc` means not
    /// cancelled. Set by workers (evac failure), mutators (alloc failure),
    /// or the shutdown path; cleared only by the control thread.
    cancelled: Atomic<GcCause>,
    /// Internal GC id. Bumped by the control thread before each cycle;
    /// explicit-GC waiters block until it passes the value they observed.
    gc_id: AtomicUsize,
    /// Bytes allocated since the current/last cycle started.
    bytes_allocated_since_gc_start: AtomicUsize,
    /// Set by any allocation or free-set change; the control thread resets
    /// its back-off sleep when it sees this.
    heap_changed: AtomicBool,
    /// Did the last cycle reclaim anything?
    progress_last_gc: AtomicBool,
    /// When did the current GC start? Written by the control thread only.
    gc_start_time: AtomicRefCell<Option<Instant>>,
    total_collections: AtomicUsize,
    total_full_collections: AtomicUsize,
}

impl GlobalState {
    pub fn new() -> Self {
        GlobalState {
            state_bits: AtomicU8::new(0),
            cancelled: Atomic::new(GcCause::NoGc),
            gc_id: AtomicUsize::new(0),
            bytes_allocated_since_gc_start: AtomicUsize::new(0),
            heap_changed: AtomicBool::new(false),
            progress_last_gc: AtomicBool::new(true),
            gc_start_time: AtomicRefCell::new(None),
            total_collections: AtomicUsize::new(0),
            total_full_collections: AtomicUsize::new(0),
        }
    }

    // gc-state bits

    pub fn set_state_bit(&self, mask: u8, value: bool) {
        if value {
            self.state_bits.fetch_or(mask, Ordering::SeqCst);
        } else {
            self.state_bits.fetch_and(!mask, Ordering::SeqCst);
        }
    }

    pub fn test_state_bit(&self, mask: u8) -> bool {
        self.state_bits.load(Ordering::Acquire) & mask != 0
    }

    pub fn is_concurrent_mark_in_progress(&self) -> bool {
        self.test_state_bit(gc_state::MARKING)
    }

    pub fn is_concurrent_old_mark_in_progress(&self) -> bool {
        self.test_state_bit(gc_state::OLD_MARKING)
    }

    pub fn is_evacuation_in_progress(&self) -> bool {
        self.test_state_bit(gc_state::EVACUATION)
    }

    pub fn is_update_refs_in_progress(&self) -> bool {
        self.test_state_bit(gc_state::UPDATE_REFS)
    }

    pub fn has_forwarded_objects(&self) -> bool {
        self.test_state_bit(gc_state::HAS_FORWARDED)
    }

    pub fn is_concurrent_weak_root_in_progress(&self) -> bool {
        self.test_state_bit(gc_state::WEAK_ROOTS)
    }

    // cancellation

    /// Try to cancel the current cycle. Returns true if this call installed
    /// the cause (i.e. the GC was not already cancelled).
    pub fn try_cancel_gc(&self, cause: GcCause) -> bool {
        debug_assert!(cause != GcCause::NoGc);
        self.cancelled
            .compare_exchange(GcCause::NoGc, cause, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) != GcCause::NoGc
    }

    pub fn cancelled_cause(&self) -> GcCause {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Clear the cancellation flag. Only the control thread does this,
    /// between cycles. Shutdown is sticky: `StopVm` is never cleared.
    pub fn clear_cancelled(&self) {
        let _ = self.cancelled.compare_exchange(
            GcCause::AllocFailure,
            GcCause::NoGc,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let _ = self.cancelled.compare_exchange(
            GcCause::AllocFailureEvac,
            GcCause::NoGc,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    // counters

    pub fn gc_id(&self) -> usize {
        self.gc_id.load(Ordering::Acquire)
    }

    pub fn update_gc_id(&self) -> usize {
        self.gc_id.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn increase_allocated(&self, bytes: usize) {
        self.bytes_allocated_since_gc_start
            .fetch_add(bytes, Ordering::Relaxed);
        self.heap_changed.store(true, Ordering::Relaxed);
    }

    pub fn bytes_allocated_since_gc_start(&self) -> usize {
        self.bytes_allocated_since_gc_start.load(Ordering::Relaxed)
    }

    pub fn reset_bytes_allocated_since_gc_start(&self) {
        self.bytes_allocated_since_gc_start
            .store(0, Ordering::Relaxed);
    }

    /// Consume the heap-changed flag.
    pub fn has_changed(&self) -> bool {
        self.heap_changed.swap(false, Ordering::Relaxed)
    }

    pub fn notify_heap_changed(&self) {
        self.heap_changed.store(true, Ordering::Relaxed);
    }

    pub fn notify_gc_progress(&self) {
        self.progress_last_gc.store(true, Ordering::Relaxed);
    }

    pub fn notify_gc_no_progress(&self) {
        self.progress_last_gc.store(false, Ordering::Relaxed);
    }

    pub fn progress_last_gc(&self) -> bool {
        self.progress_last_gc.load(Ordering::Relaxed)
    }

    pub fn set_gc_start_time(&self) {
        *self.gc_start_time.borrow_mut() = Some(Instant::now());
    }

    pub fn elapsed_since_gc_start(&self) -> Option<std::time::Duration> {
        self.gc_start_time.borrow().map(|t| t.elapsed())
    }

    pub fn increment_total_collections(&self, full: bool) {
        self.total_collections.fetch_add(1, Ordering::Relaxed);
        if full {
            self.total_full_collections.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn total_collections(&self) -> usize {
        self.total_collections.load(Ordering::Relaxed)
    }

    pub fn total_full_collections(&self) -> usize {
        self.total_full_collections.load(Ordering::Relaxed)
    }
}

impl Default for GlobalState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_bits() {
        let state = GlobalState::new();
        assert!(!state.is_concurrent_mark_in_progress());
        state.set_state_bit(gc_state::MARKING, true);
        state.set_state_bit(gc_state::OLD_MARKING, true);
        assert!(state.is_concurrent_mark_in_progress());
        assert!(state.is_concurrent_old_mark_in_progress());
        state.set_state_bit(gc_state::MARKING, false);
        assert!(!state.is_concurrent_mark_in_progress());
        assert!(state.is_concurrent_old_mark_in_progress());
    }

    #[test]
    fn cancellation_is_first_wins() {
        let state = GlobalState::new();
        assert!(state.try_cancel_gc(GcCause::AllocFailure));
        assert!(!state.try_cancel_gc(GcCause::SystemGc));
        assert_eq!(state.cancelled_cause(), GcCause::AllocFailure);
        state.clear_cancelled();
        assert!(!state.is_cancelled());
    }

    #[test]
    fn stop_vm_is_sticky() {
        let state = GlobalState::new();
        assert!(state.try_cancel_gc(GcCause::StopVm));
        state.clear_cancelled();
        assert_eq!(state.cancelled_cause(), GcCause::StopVm);
    }

    #[test]
    fn gc_id_advances() {
        let state = GlobalState::new();
        assert_eq!(state.gc_id(), 0);
        assert_eq!(state.update_gc_id(), 1);
        assert_eq!(state.gc_id(), 1);
    }
}
