//! Per-phase wall-time accounting, accumulated across cycles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use enum_map::{Enum, EnumMap};

/// Every timed phase of the collector. Concurrent phases and their STW
/// counterparts are tracked separately so pause time is visible on its own.
#[derive(Enum, Copy, Clone, Debug, PartialEq, Eq)]
pub enum GcPhase {
    ConcReset,
    InitMark,
    ScanRememberedSet,
    ConcMarkRoots,
    ConcMark,
    FinalMark,
    ConcThreadRoots,
    ConcWeakRefs,
    ConcWeakRoots,
    ConcCleanupEarly,
    ConcStrongRoots,
    ConcEvac,
    PromoteInPlace,
    InitUpdateRefs,
    ConcUpdateRefs,
    ConcUpdateThreadRoots,
    FinalUpdateRefs,
    ConcCleanupComplete,
    ConcResetAfterCollect,
    FinalRoots,
    CoalesceAndFill,
    DegenStw,
    FullGc,
}

/// Accumulated phase times for one heap instance.
pub struct PhaseTimes {
    nanos: EnumMap<GcPhase, AtomicU64>,
    invocations: EnumMap<GcPhase, AtomicU64>,
}

impl PhaseTimes {
    pub fn new() -> Self {
        PhaseTimes {
            nanos: EnumMap::default(),
            invocations: EnumMap::default(),
        }
    }

    pub fn record(&self, phase: GcPhase, nanos: u64) {
        self.nanos[phase].fetch_add(nanos, Ordering::Relaxed);
        self.invocations[phase].fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_nanos(&self, phase: GcPhase) -> u64 {
        self.nanos[phase].load(Ordering::Relaxed)
    }

    pub fn invocations(&self, phase: GcPhase) -> u64 {
        self.invocations[phase].load(Ordering::Relaxed)
    }

    /// Multi-line report of all phases that ran at least once.
    pub fn report(&self) -> String {
        let mut out = String::new();
        for (phase, nanos) in self.nanos.iter() {
            let n = self.invocations[phase].load(Ordering::Relaxed);
            if n == 0 {
                continue;
            }
            let total = nanos.load(Ordering::Relaxed);
            out.push_str(&format!(
                "  {:<24} {:>6} invocations, total {:>8.3} ms, avg {:>8.3} ms\n",
                format!("{:?}", phase),
                n,
                total as f64 / 1_000_000.0,
                total as f64 / n as f64 / 1_000_000.0,
            ));
        }
        out
    }
}

impl Default for PhaseTimes {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII scope that records the elapsed time of one phase.
pub struct GcPhaseScope<'a> {
    times: &'a PhaseTimes,
    phase: GcPhase,
    start: Instant,
}

impl<'a> GcPhaseScope<'a> {
    pub fn new(times: &'a PhaseTimes, phase: GcPhase) -> Self {
        GcPhaseScope {
            times,
            phase,
            start: Instant::now(),
        }
    }
}

impl Drop for GcPhaseScope<'_> {
    fn drop(&mut self) {
        self.times
            .record(self.phase, self.start.elapsed().as_nanos() as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_reports() {
        let times = PhaseTimes::new();
        times.record(GcPhase::ConcMark, 1_000_000);
        times.record(GcPhase::ConcMark, 3_000_000);
        assert_eq!(times.invocations(GcPhase::ConcMark), 2);
        assert_eq!(times.total_nanos(GcPhase::ConcMark), 4_000_000);
        assert!(times.report().contains("ConcMark"));
        assert!(!times.report().contains("FullGc"));
    }

    #[test]
    fn scope_records_on_drop() {
        let times = PhaseTimes::new();
        {
            let _scope = GcPhaseScope::new(&times, GcPhase::FinalMark);
        }
        assert_eq!(times.invocations(GcPhase::FinalMark), 1);
    }
}
