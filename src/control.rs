//! The control thread: the long-running scheduler that decides which
//! collection to run, runs it, and services waiters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use atomic::Atomic;

use crate::gc::concurrent::ConcurrentGc;
use crate::gc::degenerated::DegeneratedGc;
use crate::gc::full::FullGc;
use crate::gc::{DegenPoint, GcCause, GcMode};
use crate::generation::GenerationKind;
use crate::heap::Heap;

/// Control-thread state reachable from mutators and the public API: request
/// flags, waiter monitors, and the saved degeneration point.
pub struct ControlContext {
    /// Wakeup monitor for the control loop itself.
    monitor: Mutex<bool>,
    cv: Condvar,
    gc_requested: AtomicBool,
    requested_cause: Atomic<GcCause>,
    degen_point: Atomic<DegenPoint>,
    /// Which generation the last concurrent cycle collected; a degenerated
    /// finish resumes the same generation's state.
    degen_generation: Atomic<GenerationKind>,
    gc_waiters: Mutex<()>,
    gc_waiters_cv: Condvar,
    alloc_waiters: Mutex<()>,
    alloc_waiters_cv: Condvar,
    should_terminate: AtomicBool,
    soft_max_changed: AtomicBool,
    /// Cycles fully completed; explicit-GC waiters block on this advancing.
    cycles_completed: std::sync::atomic::AtomicUsize,
    /// Breakpoint-caused cycles acknowledged. A breakpoint requester does
    /// not block; it watches this counter instead.
    breakpoint_events: std::sync::atomic::AtomicUsize,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ControlContext {
    pub fn new() -> ControlContext {
        ControlContext {
            monitor: Mutex::new(false),
            cv: Condvar::new(),
            gc_requested: AtomicBool::new(false),
            requested_cause: Atomic::new(GcCause::NoGc),
            degen_point: Atomic::new(DegenPoint::OutsideCycle),
            degen_generation: Atomic::new(GenerationKind::Young),
            gc_waiters: Mutex::new(()),
            gc_waiters_cv: Condvar::new(),
            alloc_waiters: Mutex::new(()),
            alloc_waiters_cv: Condvar::new(),
            should_terminate: AtomicBool::new(false),
            soft_max_changed: AtomicBool::new(false),
            cycles_completed: std::sync::atomic::AtomicUsize::new(0),
            breakpoint_events: std::sync::atomic::AtomicUsize::new(0),
            handle: Mutex::new(None),
        }
    }

    /// Wake the control loop early.
    pub fn wake(&self) {
        let mut pending = self.monitor.lock().unwrap();
        *pending = true;
        self.cv.notify_all();
    }

    fn notify_control(&self, cause: GcCause) {
        // The read side does not take the monitor; publish the cause before
        // the flag so it observes a consistent pair.
        self.requested_cause.store(cause, Ordering::Release);
        self.gc_requested.store(true, Ordering::Release);
        self.wake();
    }

    pub fn notify_cancellation(&self, _heap: &Heap) {
        self.wake();
    }

    pub fn note_soft_max_changed(&self) {
        self.soft_max_changed.store(true, Ordering::Release);
    }

    fn take_soft_max_changed(&self) -> bool {
        self.soft_max_changed.swap(false, Ordering::AcqRel)
    }

    pub fn should_terminate(&self) -> bool {
        self.should_terminate.load(Ordering::Acquire)
    }

    pub fn saved_degen_point(&self) -> DegenPoint {
        self.degen_point.load(Ordering::Acquire)
    }

    pub fn breakpoint_events(&self) -> usize {
        self.breakpoint_events.load(Ordering::Acquire)
    }

    /// Explicit GC entry point. Blocks until at least one whole cycle has
    /// completed after the request, except breakpoint requests, which notify
    /// the controller and return; the requester observes breakpoint events
    /// inside the cycle instead.
    pub fn request_gc(&self, heap: &Heap, cause: GcCause) {
        debug_assert!(cause.is_explicit() || cause == GcCause::WbBreakpoint);
        if self.should_terminate() {
            info!("Control thread is terminating, no more GCs");
            return;
        }
        if cause == GcCause::WbBreakpoint {
            self.notify_control(cause);
            return;
        }

        // Make sure at least one complete GC cycle happens before unblocking,
        // so late requests still get the cleanup they came for.
        let mut guard = self.gc_waiters.lock().unwrap();
        let required = self.cycles_completed.load(Ordering::Acquire) + 1;
        while self.cycles_completed.load(Ordering::Acquire) < required
            && !self.should_terminate()
        {
            self.notify_control(cause);
            let (g, _) = self
                .gc_waiters_cv
                .wait_timeout(guard, Duration::from_millis(10))
                .unwrap();
            guard = g;
        }
    }

    /// Mutator side of an allocation failure: cancel the concurrent cycle
    /// and stall until the collector has resolved the failure.
    pub fn handle_alloc_failure(&self, heap: &Heap) {
        if heap.global_state().try_cancel_gc(GcCause::AllocFailure) {
            info!(
                "Failed to allocate; cancelling GC ({})",
                GcCause::AllocFailure
            );
        }
        self.wake();
        let mut guard = self.alloc_waiters.lock().unwrap();
        while heap.global_state().cancelled_cause().is_allocation_failure()
            && !self.should_terminate()
        {
            let (g, _) = self
                .alloc_waiters_cv
                .wait_timeout(guard, Duration::from_millis(10))
                .unwrap();
            guard = g;
        }
    }

    fn notify_gc_waiters(&self) {
        self.gc_requested.store(false, Ordering::Release);
        let _guard = self.gc_waiters.lock().unwrap();
        self.gc_waiters_cv.notify_all();
    }

    fn notify_alloc_failure_waiters(&self) {
        let _guard = self.alloc_waiters.lock().unwrap();
        self.alloc_waiters_cv.notify_all();
    }

    pub fn stop_and_join(&self) {
        self.should_terminate.store(true, Ordering::Release);
        self.wake();
        self.notify_gc_waiters();
        self.notify_alloc_failure_waiters();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Default for ControlContext {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ControlThread;

impl ControlThread {
    pub fn spawn(heap: Arc<Heap>) {
        let handle = {
            let heap = heap.clone();
            std::thread::Builder::new()
                .name("veldt-control".to_string())
                .spawn(move || run_service(&heap))
                .expect("failed to spawn control thread")
        };
        *heap.control().handle.lock().unwrap() = Some(handle);
    }
}

fn run_service(heap: &Heap) {
    let ctx = heap.control();
    let state = heap.global_state();
    let options = heap.options();
    let default_cause = GcCause::ConcurrentGc;

    let mut sleep_ms = *options.control_interval_min_ms;
    let mut last_sleep_adjust = Instant::now();

    while !ctx.should_terminate() {
        let cancelled_cause = state.cancelled_cause();
        if cancelled_cause == GcCause::StopVm {
            // Shutdown arrived mid-cycle: finish reference updating under
            // STW so no partial forwarding stays reachable, then exit.
            if state.has_forwarded_objects() || state.is_update_refs_in_progress() {
                let point = ctx.degen_point.swap(DegenPoint::OutsideCycle, Ordering::AcqRel);
                let generation = ctx.degen_generation.load(Ordering::Acquire);
                DegeneratedGc::new(heap, generation, point).collect(cancelled_cause);
            }
            break;
        }

        // Figure out if we have pending requests.
        let alloc_failure_pending = cancelled_cause.is_allocation_failure();
        let is_gc_requested = ctx.gc_requested.load(Ordering::Acquire);
        let requested_cause = ctx.requested_cause.load(Ordering::Acquire);

        // Choose which GC mode to run in. The block below selects a single
        // mode; allocation failure takes precedence over explicit requests,
        // which take precedence over heuristic triggers.
        let mut mode: Option<GcMode> = None;
        let mut cause = GcCause::NoGc;
        let mut degen_point = DegenPoint::OutsideCycle;
        let mut generation = GenerationKind::Young;
        let mut bootstrap_old = false;

        if alloc_failure_pending {
            cause = cancelled_cause;
            // Consume the degen point, and seed it with the default value.
            degen_point = ctx.degen_point.swap(DegenPoint::OutsideCycle, Ordering::AcqRel);

            heap.young_generation()
                .heuristics()
                .record_allocation_failure_gc();
            if *options.degenerated_gc
                && heap
                    .young_generation()
                    .heuristics()
                    .should_degenerate_cycle(heap)
            {
                heap.policy().record_alloc_failure_to_degenerated(degen_point);
                mode = Some(GcMode::StwDegenerated);
            } else {
                heap.policy().record_alloc_failure_to_full();
                mode = Some(GcMode::StwFull);
            }
        } else if is_gc_requested {
            cause = requested_cause;
            info!("Trigger: GC request ({})", cause);
            heap.young_generation().heuristics().record_requested_gc();

            if cause.should_run_full_gc() {
                heap.policy().record_explicit_to_full();
                mode = Some(GcMode::StwFull);
            } else {
                heap.policy().record_explicit_to_concurrent();
                mode = Some(GcMode::ConcurrentNormal);
                // Explicit cycles collect the whole heap and unload classes.
                generation = GenerationKind::Global;
                heap.set_unload_classes(true);
            }
        } else {
            // Potential normal cycle: ask the heuristic if it wants to act.
            if heap.young_generation().heuristics().should_start_gc(heap) {
                heap.policy().record_implicit_to_concurrent();
                mode = Some(GcMode::ConcurrentNormal);
                cause = default_cause;
            }
            if should_bootstrap_old_marking(heap) {
                if mode.is_none() {
                    heap.policy().record_implicit_to_concurrent();
                    mode = Some(GcMode::ConcurrentNormal);
                    cause = default_cause;
                }
                bootstrap_old = true;
            }
            heap.set_unload_classes(false);
        }

        // Blow all soft references on this cycle if handling a failure or an
        // explicit request, or if asked to do so unconditionally.
        let clear_soft = alloc_failure_pending || is_gc_requested || *options.always_clear_soft_refs;
        for kind in [GenerationKind::Young, GenerationKind::Old, GenerationKind::Global] {
            heap.generation(kind)
                .ref_processor()
                .set_soft_reference_policy(clear_soft);
        }

        if let Some(mode) = mode {
            debug_assert!(cause != GcCause::NoGc);
            let cycle_start = Instant::now();

            // GC is starting, bump the internal ID.
            let gc_id = state.update_gc_id();
            heap.young_generation().heuristics().cancel_trigger_request();
            state.reset_bytes_allocated_since_gc_start();
            state.set_gc_start_time();

            heap.free_set().log_status_under_lock(heap);
            heap.log_heap_status("Before GC");
            info!("GC({}) starting: {:?}, cause: {}", gc_id, mode, cause);

            match mode {
                GcMode::ConcurrentNormal => {
                    service_concurrent_normal_cycle(heap, generation, cause, bootstrap_old)
                }
                GcMode::StwDegenerated => {
                    service_stw_degenerated_cycle(heap, cause, degen_point)
                }
                GcMode::StwFull => service_stw_full_cycle(heap, cause),
            }

            ctx.cycles_completed.fetch_add(1, Ordering::AcqRel);
            if cause == GcCause::WbBreakpoint {
                ctx.breakpoint_events.fetch_add(1, Ordering::AcqRel);
            }
            // If this was the requested GC cycle, notify waiters about it.
            if is_gc_requested {
                ctx.notify_gc_waiters();
            }
            // If this cycle completed without being cancelled, the failure
            // (if any) has been resolved.
            if !state.is_cancelled() {
                ctx.notify_alloc_failure_waiters();
            }

            heap.free_set().log_status_under_lock(heap);
            heap.update_capacity_and_used_at_gc();
            heap.generation(generation)
                .add_collection_time(cycle_start.elapsed().as_nanos() as u64);

            // Retract the forceful part of the soft-ref policy.
            if !*options.always_clear_soft_refs {
                for kind in [GenerationKind::Young, GenerationKind::Old, GenerationKind::Global] {
                    heap.generation(kind)
                        .ref_processor()
                        .set_soft_reference_policy(false);
                }
            }
        }

        // A new soft-max target or an explicit GC both try to uncommit.
        if *options.uncommit && (ctx.take_soft_max_changed() || is_gc_requested) {
            heap.uncommit_surplus_regions();
        }

        // Wait before the next action. Exit the wait early when allocation
        // happened; back off exponentially while idle.
        if state.has_changed() {
            sleep_ms = *options.control_interval_min_ms;
        } else if last_sleep_adjust.elapsed().as_millis() as u64
            > *options.control_interval_adjust_period_ms
        {
            sleep_ms = (*options.control_interval_max_ms).min(sleep_ms.max(1) * 2);
            last_sleep_adjust = Instant::now();
        }

        let mut pending = ctx.monitor.lock().unwrap();
        if !*pending {
            let (guard, _) = ctx
                .cv
                .wait_timeout(pending, Duration::from_millis(sleep_ms))
                .unwrap();
            pending = guard;
        }
        *pending = false;
    }

    debug!("Control thread exiting");
    ctx.notify_gc_waiters();
    ctx.notify_alloc_failure_waiters();
}

/// Old marking begins when old occupancy has grown enough and the old
/// generation is ready to accept a new mark.
fn should_bootstrap_old_marking(heap: &Heap) -> bool {
    use crate::generation::old::OldGenState;
    let old = heap.old_generation();
    let threshold =
        (old.max_capacity() as f64 * *heap.options().min_old_gen_growth_percent / 100.0) as usize;
    let growth = old
        .used_including_waste()
        .saturating_sub(heap.old_state().used_at_last_mark());
    if growth < threshold.max(1) {
        return false;
    }
    matches!(
        heap.old_state().state(),
        OldGenState::Idle | OldGenState::WaitingForFill | OldGenState::Filling
    )
}

fn check_cancellation_or_degen(heap: &Heap, point: DegenPoint) -> bool {
    if !heap.global_state().is_cancelled() {
        return false;
    }
    let cause = heap.global_state().cancelled_cause();
    if cause == GcCause::StopVm || cause.is_allocation_failure() {
        // Remember where we were; the degenerated finish (or the shutdown
        // finisher) resumes from there.
        heap.control().degen_point.store(point, Ordering::Release);
        return true;
    }
    panic!("Unexpected reason for cancellation: {}", cause);
}

fn service_concurrent_normal_cycle(
    heap: &Heap,
    generation: GenerationKind,
    cause: GcCause,
    bootstrap_old: bool,
) {
    // A normal cycle goes through all concurrent phases. If an allocation
    // failure happens during any of them, the cycle degrades to degenerated
    // GC, which finishes from the recorded point under STW. A second failure
    // during the degenerated cycle upgrades to full GC. There is also a
    // shortcut: when all reclaimable memory is immediate garbage, the cycle
    // is abbreviated after final mark.
    if check_cancellation_or_degen(heap, DegenPoint::OutsideCycle) {
        info!("Cancelled");
        return;
    }
    heap.global_state().increment_total_collections(false);
    heap.generation(generation).heuristics().record_cycle_start();
    heap.control()
        .degen_generation
        .store(generation, Ordering::Release);

    let gc = ConcurrentGc::new(heap, generation, bootstrap_old);
    if gc.collect(cause) {
        // Cycle complete: no failed allocations and no degeneration.
        let progress = heap.global_state().progress_last_gc();
        heap.generation(generation)
            .heuristics()
            .record_success_concurrent(gc.abbreviated());
        heap.policy()
            .record_success_concurrent(gc.abbreviated(), progress);
        heap.log_heap_status("At end of GC");
    } else {
        assert!(heap.global_state().is_cancelled(), "must have been cancelled");
        check_cancellation_or_degen(heap, gc.degen_point());
        heap.log_heap_status("At end of cancelled GC");
    }
}

fn service_stw_degenerated_cycle(heap: &Heap, cause: GcCause, point: DegenPoint) {
    heap.global_state().increment_total_collections(false);
    let generation = heap.control().degen_generation.load(Ordering::Acquire);
    let gc = DegeneratedGc::new(heap, generation, point);
    let outcome = gc.collect(cause);
    if outcome.upgraded_to_full {
        heap.policy().record_degenerated_upgrade_to_full();
        heap.policy().record_success_full();
    } else {
        heap.policy().record_degenerated(
            outcome.abbreviated,
            cause.is_allocation_failure(),
            outcome.progress,
        );
    }
    heap.log_heap_status("At end of degenerated GC");
}

fn service_stw_full_cycle(heap: &Heap, cause: GcCause) {
    heap.global_state().increment_total_collections(true);
    let gc = FullGc::new(heap);
    gc.collect(cause);
    heap.policy().record_success_full();
    heap.log_heap_status("At end of full GC");
}
