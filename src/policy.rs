//! Cycle outcome accounting and the degeneration-upgrade decision.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use enum_map::EnumMap;

use crate::gc::DegenPoint;
use crate::heap::Heap;

/// Counts successes and failures per cycle kind, and decides when repeated
/// futile degenerated cycles should upgrade to full GC.
///
/// Two streaks are tracked: `consecutive_degenerated_gcs` counts every
/// degenerated cycle since the last successful concurrent or full one, while
/// the no-progress streak counts only degenerated cycles that reclaimed
/// nothing. The upgrade decision keys off the no-progress streak.
pub struct CollectorPolicy {
    success_concurrent_gcs: AtomicUsize,
    abbreviated_concurrent_gcs: AtomicUsize,
    success_degenerated_gcs: AtomicUsize,
    abbreviated_degenerated_gcs: AtomicUsize,
    success_full_gcs: AtomicUsize,
    consecutive_degenerated_gcs: AtomicUsize,
    consecutive_no_progress_degenerated: AtomicUsize,
    alloc_failure_degenerated: AtomicUsize,
    alloc_failure_full: AtomicUsize,
    degenerated_upgrade_to_full: AtomicUsize,
    explicit_concurrent: AtomicUsize,
    explicit_full: AtomicUsize,
    implicit_concurrent: AtomicUsize,
    degen_points: EnumMap<DegenPoint, AtomicUsize>,
    in_shutdown: AtomicBool,
}

impl CollectorPolicy {
    pub fn new() -> CollectorPolicy {
        CollectorPolicy {
            success_concurrent_gcs: AtomicUsize::new(0),
            abbreviated_concurrent_gcs: AtomicUsize::new(0),
            success_degenerated_gcs: AtomicUsize::new(0),
            abbreviated_degenerated_gcs: AtomicUsize::new(0),
            success_full_gcs: AtomicUsize::new(0),
            consecutive_degenerated_gcs: AtomicUsize::new(0),
            consecutive_no_progress_degenerated: AtomicUsize::new(0),
            alloc_failure_degenerated: AtomicUsize::new(0),
            alloc_failure_full: AtomicUsize::new(0),
            degenerated_upgrade_to_full: AtomicUsize::new(0),
            explicit_concurrent: AtomicUsize::new(0),
            explicit_full: AtomicUsize::new(0),
            implicit_concurrent: AtomicUsize::new(0),
            degen_points: EnumMap::default(),
            in_shutdown: AtomicBool::new(false),
        }
    }

    /// A concurrent cycle completed. `progress` is false when it reclaimed
    /// nothing, which leaves the degeneration streaks untouched.
    pub fn record_success_concurrent(&self, abbreviated: bool, progress: bool) {
        self.success_concurrent_gcs.fetch_add(1, Ordering::Relaxed);
        if abbreviated {
            self.abbreviated_concurrent_gcs
                .fetch_add(1, Ordering::Relaxed);
        }
        if progress {
            self.consecutive_degenerated_gcs.store(0, Ordering::Relaxed);
            self.consecutive_no_progress_degenerated
                .store(0, Ordering::Relaxed);
        }
    }

    /// A degenerated cycle completed.
    pub fn record_degenerated(&self, abbreviated: bool, alloc_failure: bool, progress: bool) {
        self.success_degenerated_gcs.fetch_add(1, Ordering::Relaxed);
        if abbreviated {
            self.abbreviated_degenerated_gcs
                .fetch_add(1, Ordering::Relaxed);
        }
        if alloc_failure {
            self.alloc_failure_degenerated
                .fetch_add(1, Ordering::Relaxed);
        }
        self.consecutive_degenerated_gcs
            .fetch_add(1, Ordering::Relaxed);
        if progress {
            self.consecutive_no_progress_degenerated
                .store(0, Ordering::Relaxed);
        } else {
            self.consecutive_no_progress_degenerated
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_success_full(&self) {
        self.success_full_gcs.fetch_add(1, Ordering::Relaxed);
        self.consecutive_degenerated_gcs.store(0, Ordering::Relaxed);
        self.consecutive_no_progress_degenerated
            .store(0, Ordering::Relaxed);
    }

    pub fn record_alloc_failure_to_degenerated(&self, point: DegenPoint) {
        self.degen_points[point].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_alloc_failure_to_full(&self) {
        self.alloc_failure_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_degenerated_upgrade_to_full(&self) {
        self.degenerated_upgrade_to_full
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_explicit_to_concurrent(&self) {
        self.explicit_concurrent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_explicit_to_full(&self) {
        self.explicit_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_implicit_to_concurrent(&self) {
        self.implicit_concurrent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_shutdown(&self) {
        self.in_shutdown.store(true, Ordering::Release);
    }

    pub fn is_at_shutdown(&self) -> bool {
        self.in_shutdown.load(Ordering::Acquire)
    }

    pub fn consecutive_degenerated_gc_count(&self) -> usize {
        self.consecutive_degenerated_gcs.load(Ordering::Relaxed)
    }

    /// Should the next allocation-failure collection run full instead of
    /// degenerated? True once the no-progress streak reaches the configured
    /// threshold.
    pub fn should_upgrade_degenerated_gc(&self, heap: &Heap) -> bool {
        self.consecutive_no_progress_degenerated.load(Ordering::Relaxed)
            >= *heap.options().full_gc_threshold
    }

    /// Like [`should_upgrade_degenerated_gc`], against an explicit threshold.
    /// Usable without a heap in unit tests.
    pub fn should_upgrade_with_threshold(&self, threshold: usize) -> bool {
        self.consecutive_no_progress_degenerated.load(Ordering::Relaxed) >= threshold
    }

    pub fn full_gc_count(&self) -> usize {
        self.success_full_gcs.load(Ordering::Relaxed)
            + self.degenerated_upgrade_to_full.load(Ordering::Relaxed)
    }

    pub fn alloc_failure_degenerated_count(&self) -> usize {
        self.alloc_failure_degenerated.load(Ordering::Relaxed)
    }

    pub fn alloc_failure_full_count(&self) -> usize {
        self.alloc_failure_full.load(Ordering::Relaxed)
    }

    pub fn success_concurrent_count(&self) -> usize {
        self.success_concurrent_gcs.load(Ordering::Relaxed)
    }

    pub fn abbreviated_concurrent_count(&self) -> usize {
        self.abbreviated_concurrent_gcs.load(Ordering::Relaxed)
    }

    pub fn success_degenerated_count(&self) -> usize {
        self.success_degenerated_gcs.load(Ordering::Relaxed)
    }

    pub fn degen_point_count(&self, point: DegenPoint) -> usize {
        self.degen_points[point].load(Ordering::Relaxed)
    }

    /// Multi-line summary printed at shutdown.
    pub fn gc_stats(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "{:>6} successful concurrent GCs ({} abbreviated)\n",
            self.success_concurrent_gcs.load(Ordering::Relaxed),
            self.abbreviated_concurrent_gcs.load(Ordering::Relaxed),
        ));
        out.push_str(&format!(
            "{:>6} degenerated GCs ({} abbreviated, {} caused by allocation failure, {} upgraded to full)\n",
            self.success_degenerated_gcs.load(Ordering::Relaxed),
            self.abbreviated_degenerated_gcs.load(Ordering::Relaxed),
            self.alloc_failure_degenerated.load(Ordering::Relaxed),
            self.degenerated_upgrade_to_full.load(Ordering::Relaxed),
        ));
        for (point, count) in self.degen_points.iter() {
            let n = count.load(Ordering::Relaxed);
            if n > 0 {
                out.push_str(&format!("{:>10} at {}\n", n, point));
            }
        }
        out.push_str(&format!(
            "{:>6} full GCs ({} caused by allocation failure, {} explicit)\n",
            self.success_full_gcs.load(Ordering::Relaxed),
            self.alloc_failure_full.load(Ordering::Relaxed),
            self.explicit_full.load(Ordering::Relaxed),
        ));
        out
    }
}

impl Default for CollectorPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: usize = 2;

    #[test]
    fn track_degen_cycles_sanity() {
        let policy = CollectorPolicy::new();
        assert_eq!(policy.consecutive_degenerated_gc_count(), 0);
        assert!(!policy.should_upgrade_with_threshold(THRESHOLD));
    }

    #[test]
    fn track_degen_cycles_no_upgrade() {
        let policy = CollectorPolicy::new();
        policy.record_degenerated(true, true, true);
        policy.record_degenerated(true, true, true);
        assert_eq!(policy.consecutive_degenerated_gc_count(), 2);
        assert!(!policy.should_upgrade_with_threshold(THRESHOLD));
    }

    #[test]
    fn track_degen_cycles_upgrade() {
        let policy = CollectorPolicy::new();
        policy.record_degenerated(true, true, false);
        policy.record_degenerated(true, true, false);
        assert_eq!(policy.consecutive_degenerated_gc_count(), 2);
        assert!(policy.should_upgrade_with_threshold(THRESHOLD));
    }

    #[test]
    fn track_degen_cycles_reset_progress() {
        let policy = CollectorPolicy::new();
        policy.record_degenerated(true, true, false);
        policy.record_degenerated(true, true, true);
        assert_eq!(policy.consecutive_degenerated_gc_count(), 2);
        assert!(!policy.should_upgrade_with_threshold(THRESHOLD));
    }

    #[test]
    fn track_degen_cycles_full_reset() {
        let policy = CollectorPolicy::new();
        policy.record_degenerated(true, true, false);
        policy.record_success_full();
        assert_eq!(policy.consecutive_degenerated_gc_count(), 0);
        assert!(!policy.should_upgrade_with_threshold(THRESHOLD));
    }

    #[test]
    fn track_degen_cycles_reset() {
        let policy = CollectorPolicy::new();
        policy.record_degenerated(true, true, false);
        policy.record_success_concurrent(true, true);
        assert_eq!(policy.consecutive_degenerated_gc_count(), 0);
        assert!(!policy.should_upgrade_with_threshold(THRESHOLD));
    }

    #[test]
    fn full_gc_count_includes_upgrades() {
        let policy = CollectorPolicy::new();
        policy.record_success_full();
        policy.record_degenerated_upgrade_to_full();
        assert_eq!(policy.full_gc_count(), 2);
    }
}
