//! Safepoints and the mutator registry.
//!
//! Mutators attach to the registry and cooperate through two mechanisms:
//! they poll the safepoint barrier at allocation and barrier slow paths, and
//! they park while idle (a parked mutator counts as stopped). A VM operation
//! arms the barrier, waits for every running mutator to stop, runs, and
//! disarms. Per-thread handshakes operate on one mutator's shared state at a
//! time without stopping the world.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::marking::satb::SatbBuffer;
use crate::util::address::ObjectReference;

/// State a mutator shares with the collector.
pub struct MutatorShared {
    pub id: usize,
    /// Parked mutators do not touch the heap and need no stopping.
    parked: AtomicBool,
    /// The thread-local SATB buffer. Locked by the owner on the barrier slow
    /// path and by handshakes that flush it.
    pub satb: Mutex<SatbBuffer>,
    /// Explicit root set (stand-in for stack scanning, which is out of
    /// scope). Handshakes and root-mark phases read it.
    pub roots: Mutex<Vec<ObjectReference>>,
}

impl MutatorShared {
    fn new(id: usize) -> MutatorShared {
        MutatorShared {
            id,
            parked: AtomicBool::new(false),
            satb: Mutex::new(SatbBuffer::new()),
            roots: Mutex::new(Vec::new()),
        }
    }

    pub fn is_parked(&self) -> bool {
        self.parked.load(Ordering::Acquire)
    }
}

struct SafepointSync {
    armed: bool,
    /// Running mutators currently blocked in the barrier.
    stopped: usize,
}

pub struct MutatorRegistry {
    mutators: Mutex<Vec<Arc<MutatorShared>>>,
    sync: Mutex<SafepointSync>,
    cv_resume: Condvar,
    cv_stopped: Condvar,
    next_id: AtomicUsize,
}

impl MutatorRegistry {
    pub fn new() -> MutatorRegistry {
        MutatorRegistry {
            mutators: Mutex::new(Vec::new()),
            sync: Mutex::new(SafepointSync {
                armed: false,
                stopped: 0,
            }),
            cv_resume: Condvar::new(),
            cv_stopped: Condvar::new(),
            next_id: AtomicUsize::new(0),
        }
    }

    pub fn attach(&self) -> Arc<MutatorShared> {
        let shared = Arc::new(MutatorShared::new(
            self.next_id.fetch_add(1, Ordering::Relaxed),
        ));
        self.mutators.lock().unwrap().push(shared.clone());
        shared
    }

    pub fn detach(&self, shared: &Arc<MutatorShared>) {
        let mut mutators = self.mutators.lock().unwrap();
        mutators.retain(|m| m.id != shared.id);
        // A safepoint may be waiting on this mutator's count.
        self.cv_stopped.notify_all();
    }

    pub fn mutator_count(&self) -> usize {
        self.mutators.lock().unwrap().len()
    }

    /// Mutator-side: block while a safepoint is in progress. Called from
    /// allocation and barrier slow paths.
    pub fn poll_safepoint(&self, shared: &MutatorShared) {
        let mut sync = self.sync.lock().unwrap();
        if !sync.armed {
            return;
        }
        sync.stopped += 1;
        self.cv_stopped.notify_all();
        while sync.armed {
            sync = self.cv_resume.wait(sync).unwrap();
        }
        sync.stopped -= 1;
        let _ = shared;
    }

    /// Mutator-side: stop touching the heap until [`unpark`]. Parked
    /// mutators are ignored by safepoints.
    pub fn park(&self, shared: &MutatorShared) {
        let _sync = self.sync.lock().unwrap();
        shared.parked.store(true, Ordering::Release);
        self.cv_stopped.notify_all();
    }

    /// Mutator-side: resume touching the heap. Blocks while a safepoint is
    /// in progress.
    pub fn unpark(&self, shared: &MutatorShared) {
        let mut sync = self.sync.lock().unwrap();
        while sync.armed {
            sync = self.cv_resume.wait(sync).unwrap();
        }
        shared.parked.store(false, Ordering::Release);
    }

    /// Collector-side: arm the barrier and wait until every non-parked
    /// mutator is blocked in [`poll_safepoint`].
    pub fn begin_safepoint(&self) {
        let mut sync = self.sync.lock().unwrap();
        debug_assert!(!sync.armed, "safepoints do not nest");
        sync.armed = true;
        loop {
            let running = {
                let mutators = self.mutators.lock().unwrap();
                mutators.iter().filter(|m| !m.is_parked()).count()
            };
            if sync.stopped >= running {
                break;
            }
            sync = self.cv_stopped.wait(sync).unwrap();
        }
    }

    /// Collector-side: disarm and release the mutators.
    pub fn end_safepoint(&self) {
        let mut sync = self.sync.lock().unwrap();
        debug_assert!(sync.armed);
        sync.armed = false;
        self.cv_resume.notify_all();
    }

    /// Run `f` against every attached mutator's shared state, one at a time.
    /// This is the handshake analogue: each mutator's own accesses to the
    /// touched state go through the same locks, so no global stop is needed.
    pub fn handshake_all<F: FnMut(&MutatorShared)>(&self, mut f: F) {
        let mutators: Vec<Arc<MutatorShared>> = self.mutators.lock().unwrap().clone();
        for m in mutators {
            f(&m);
        }
    }
}

impl Default for MutatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn parked_mutators_do_not_block_safepoints() {
        let registry = MutatorRegistry::new();
        let m = registry.attach();
        registry.park(&m);
        // Would hang if the parked mutator counted as running.
        registry.begin_safepoint();
        registry.end_safepoint();
        registry.unpark(&m);
        registry.detach(&m);
    }

    #[test]
    fn running_mutator_blocks_until_it_polls() {
        let registry = Arc::new(MutatorRegistry::new());
        let m = registry.attach();

        let r2 = registry.clone();
        let m2 = m.clone();
        let poller = std::thread::spawn(move || {
            // Simulate mutator work followed by a poll.
            std::thread::sleep(Duration::from_millis(20));
            r2.poll_safepoint(&m2);
        });

        registry.begin_safepoint();
        registry.end_safepoint();
        poller.join().unwrap();
        registry.detach(&m);
    }

    #[test]
    fn handshake_visits_all() {
        let registry = MutatorRegistry::new();
        let a = registry.attach();
        let b = registry.attach();
        let mut seen = 0;
        registry.handshake_all(|_| seen += 1);
        assert_eq!(seen, 2);
        registry.detach(&a);
        registry.detach(&b);
    }
}
