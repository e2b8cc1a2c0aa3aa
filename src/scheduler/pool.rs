//! A long-lived pool of GC worker threads.
//!
//! Engines hand the pool a [`ParallelTask`]; every participating worker runs
//! `work(worker_id, num_workers)` against it, and `run_task` returns when the
//! last worker finishes. Tasks carve up their own work (claim cursors, work
//! stealing); the pool only provides the threads and the barrier.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// A unit of parallel GC work.
pub trait ParallelTask: Sync {
    fn name(&self) -> &'static str;
    fn work(&self, worker_id: usize, num_workers: usize);
}

/// Type-erased pointer to the task of the current epoch. `run_task` blocks
/// until every worker is done with it, so the borrow cannot outlive the task.
#[derive(Copy, Clone)]
struct TaskPtr(*const dyn ParallelTask);
unsafe impl Send for TaskPtr {}
unsafe impl Sync for TaskPtr {}

struct PoolState {
    epoch: u64,
    task: Option<TaskPtr>,
    /// How many workers participate in the current epoch.
    participants: usize,
    /// Workers that have not yet finished the current epoch.
    unfinished: usize,
    terminate: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    cv_start: Condvar,
    cv_done: Condvar,
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    /// Serializes run_task callers (control thread vs. VM thread).
    run_lock: Mutex<()>,
    num_workers: usize,
    started: AtomicBool,
}

impl WorkerPool {
    pub fn new(num_workers: usize) -> WorkerPool {
        assert!(num_workers > 0);
        WorkerPool {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    epoch: 0,
                    task: None,
                    participants: 0,
                    unfinished: 0,
                    terminate: false,
                }),
                cv_start: Condvar::new(),
                cv_done: Condvar::new(),
            }),
            handles: Mutex::new(Vec::new()),
            run_lock: Mutex::new(()),
            num_workers,
            started: AtomicBool::new(false),
        }
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Spawn the worker threads. Called once, after the heap is fully built.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut handles = self.handles.lock().unwrap();
        for id in 0..self.num_workers {
            let shared = self.shared.clone();
            handles.push(
                std::thread::Builder::new()
                    .name(format!("veldt-worker-{}", id))
                    .spawn(move || worker_loop(id, shared))
                    .expect("failed to spawn GC worker"),
            );
        }
    }

    /// Run `task` on up to `active_workers` workers and wait for completion.
    pub fn run_task(&self, task: &dyn ParallelTask, active_workers: usize) {
        debug_assert!(self.started.load(Ordering::Acquire), "pool not started");
        let participants = active_workers.clamp(1, self.num_workers);
        let _run = self.run_lock.lock().unwrap();
        let mut state = self.shared.state.lock().unwrap();
        debug_assert!(state.task.is_none());
        // SAFETY: `run_task` blocks until every worker has finished with
        // `task` below, so the erased lifetime cannot outlive the borrow.
        let task: &'static dyn ParallelTask = unsafe { std::mem::transmute(task) };
        state.task = Some(TaskPtr(task as *const dyn ParallelTask));
        state.participants = participants;
        state.unfinished = participants;
        state.epoch += 1;
        self.shared.cv_start.notify_all();
        while state.unfinished > 0 {
            state = self.shared.cv_done.wait(state).unwrap();
        }
        state.task = None;
    }

    /// Stop and join all workers.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.terminate = true;
            self.shared.cv_start.notify_all();
        }
        for handle in self.handles.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(id: usize, shared: Arc<PoolShared>) {
    let mut seen_epoch = 0u64;
    loop {
        let (task, participants) = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if state.terminate {
                    return;
                }
                if state.epoch != seen_epoch {
                    seen_epoch = state.epoch;
                    if id < state.participants {
                        break (state.task.expect("epoch without task"), state.participants);
                    }
                    // Not participating in this epoch; keep waiting.
                }
                state = shared.cv_start.wait(state).unwrap();
            }
        };

        // Run outside the lock.
        unsafe { (*task.0).work(id, participants) };

        let mut state = shared.state.lock().unwrap();
        state.unfinished -= 1;
        if state.unfinished == 0 {
            shared.cv_done.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountTask {
        counter: AtomicUsize,
    }

    impl ParallelTask for CountTask {
        fn name(&self) -> &'static str {
            "count"
        }
        fn work(&self, _worker_id: usize, _num_workers: usize) {
            self.counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn all_workers_participate() {
        let pool = WorkerPool::new(4);
        pool.start();
        let task = CountTask {
            counter: AtomicUsize::new(0),
        };
        pool.run_task(&task, 4);
        assert_eq!(task.counter.load(Ordering::SeqCst), 4);
        pool.shutdown();
    }

    #[test]
    fn active_workers_limits_participation() {
        let pool = WorkerPool::new(4);
        pool.start();
        let task = CountTask {
            counter: AtomicUsize::new(0),
        };
        pool.run_task(&task, 2);
        assert_eq!(task.counter.load(Ordering::SeqCst), 2);
        // The pool is reusable after a partial run.
        pool.run_task(&task, 4);
        assert_eq!(task.counter.load(Ordering::SeqCst), 6);
        pool.shutdown();
    }
}
