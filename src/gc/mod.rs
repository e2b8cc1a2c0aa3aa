//! Collection engines and their shared vocabulary.
//!
//! Three engines implement collections: the concurrent engine
//! ([`concurrent::ConcurrentGc`]), the degenerated engine
//! ([`degenerated::DegeneratedGc`]) that resumes a cancelled concurrent cycle
//! under STW, and the full compacting engine ([`full::FullGc`]).

pub mod concurrent;
pub mod degenerated;
pub mod full;
pub mod verify;

use bytemuck::NoUninit;
use enum_map::Enum;
use strum_macros::Display;

/// Why a collection (or a cancellation) was requested. The display forms are
/// the exact strings used in trigger and cancellation log lines.
#[derive(Copy, Clone, Debug, PartialEq, Eq, NoUninit, Display)]
#[repr(u8)]
pub enum GcCause {
    /// Sentinel: no cancellation / no cause recorded.
    #[strum(serialize = "no_gc")]
    NoGc,
    /// A mutator failed to allocate.
    #[strum(serialize = "allocation_failure")]
    AllocFailure,
    /// A GC worker failed to allocate while evacuating.
    #[strum(serialize = "alloc_failure_evac")]
    AllocFailureEvac,
    /// The heuristic decided to start a cycle.
    #[strum(serialize = "concurrent_gc")]
    ConcurrentGc,
    /// The runtime is shutting down.
    #[strum(serialize = "stop_vm")]
    StopVm,
    /// Test hook: start a cycle and report breakpoints without blocking.
    #[strum(serialize = "wb_breakpoint")]
    WbBreakpoint,
    /// Explicit user request (`System.gc()` analogue).
    #[strum(serialize = "system_gc")]
    SystemGc,
    /// The policy upgraded a failing degenerated cycle.
    #[strum(serialize = "upgrade_to_full_gc")]
    UpgradeToFull,
}

impl GcCause {
    /// Allocation failures are the causes the control thread must service
    /// ahead of everything else.
    pub fn is_allocation_failure(self) -> bool {
        matches!(self, GcCause::AllocFailure | GcCause::AllocFailureEvac)
    }

    /// Explicit requests block the requester until a whole cycle completes.
    pub fn is_explicit(self) -> bool {
        matches!(self, GcCause::SystemGc)
    }

    /// Should a request with this cause run a full STW collection outright?
    pub fn should_run_full_gc(self) -> bool {
        matches!(self, GcCause::UpgradeToFull)
    }
}

/// Where a concurrent cycle was when it observed cancellation. The
/// degenerated engine resumes from here.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, NoUninit, Enum, Display)]
#[repr(u8)]
pub enum DegenPoint {
    /// Cancelled before the cycle started (or between cycles).
    #[strum(serialize = "outside_cycle")]
    OutsideCycle,
    /// Cancelled during concurrent root scanning.
    #[strum(serialize = "roots")]
    Roots,
    /// Cancelled during concurrent marking.
    #[strum(serialize = "mark")]
    Mark,
    /// Cancelled during concurrent evacuation.
    #[strum(serialize = "evac")]
    Evac,
    /// Cancelled during concurrent reference updating.
    #[strum(serialize = "update_refs")]
    UpdateRefs,
}

/// The mode the control thread selected for one iteration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GcMode {
    ConcurrentNormal,
    StwDegenerated,
    StwFull,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cause_text_forms() {
        assert_eq!(GcCause::AllocFailure.to_string(), "allocation_failure");
        assert_eq!(GcCause::ConcurrentGc.to_string(), "concurrent_gc");
        assert_eq!(GcCause::WbBreakpoint.to_string(), "wb_breakpoint");
        assert_eq!(GcCause::UpgradeToFull.to_string(), "upgrade_to_full_gc");
    }

    #[test]
    fn cause_classification() {
        assert!(GcCause::AllocFailure.is_allocation_failure());
        assert!(GcCause::AllocFailureEvac.is_allocation_failure());
        assert!(!GcCause::SystemGc.is_allocation_failure());
        assert!(GcCause::SystemGc.is_explicit());
        assert!(!GcCause::WbBreakpoint.is_explicit());
    }

    #[test]
    fn degen_points_are_ordered() {
        assert!(DegenPoint::OutsideCycle < DegenPoint::Roots);
        assert!(DegenPoint::Mark < DegenPoint::Evac);
        assert!(DegenPoint::Evac < DegenPoint::UpdateRefs);
    }
}
