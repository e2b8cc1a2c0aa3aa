//! The VM-operation thread.
//!
//! STW phases are expressed as [`VmOperation`]s sent over a bounded channel
//! to a dedicated actor thread. The actor brings all mutators to a
//! safepoint, runs the operation, and releases them. `execute` blocks the
//! caller until the operation has run, so operations can borrow from the
//! caller's stack.

use crossbeam::channel::{bounded, Receiver, Sender};
use std::sync::Mutex;
use std::thread::JoinHandle;

use crate::heap::Heap;

/// A stop-the-world operation.
pub trait VmOperation: Sync {
    fn name(&self) -> &'static str;
    fn doit(&self, heap: &Heap);
}

struct OpPtr(*const dyn VmOperation);
unsafe impl Send for OpPtr {}
struct HeapPtr(*const Heap);
unsafe impl Send for HeapPtr {}

enum Message {
    Execute {
        op: OpPtr,
        heap: HeapPtr,
        done: Sender<()>,
    },
    Terminate,
}

pub struct VmThread {
    sender: Sender<Message>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl VmThread {
    pub fn spawn() -> VmThread {
        let (sender, receiver) = bounded::<Message>(1);
        let handle = std::thread::Builder::new()
            .name("veldt-vmthread".to_string())
            .spawn(move || vm_thread_loop(receiver))
            .expect("failed to spawn VM thread");
        VmThread {
            sender,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Run `op` under a safepoint and wait for it to finish.
    pub fn execute(&self, heap: &Heap, op: &dyn VmOperation) {
        let (done_tx, done_rx) = bounded::<()>(1);
        // SAFETY: `execute` blocks on `done_rx.recv()` below until the VM
        // thread has finished with `op` and `heap`, so the erased lifetimes
        // cannot outlive these borrows.
        let op: &'static dyn VmOperation = unsafe { std::mem::transmute(op) };
        let heap: &'static Heap = unsafe { std::mem::transmute(heap) };
        self.sender
            .send(Message::Execute {
                op: OpPtr(op as *const dyn VmOperation),
                heap: HeapPtr(heap as *const Heap),
                done: done_tx,
            })
            .expect("VM thread is gone");
        done_rx.recv().expect("VM thread died mid-operation");
    }

    pub fn shutdown(&self) {
        let _ = self.sender.send(Message::Terminate);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn vm_thread_loop(receiver: Receiver<Message>) {
    while let Ok(message) = receiver.recv() {
        match message {
            Message::Execute { op, heap, done } => {
                // `execute` blocks until we signal `done`, so both pointers
                // are alive for the duration.
                let op = unsafe { &*op.0 };
                let heap = unsafe { &*heap.0 };
                trace!("VM operation: {}", op.name());
                heap.mutators().begin_safepoint();
                op.doit(heap);
                heap.mutators().end_safepoint();
                let _ = done.send(());
            }
            Message::Terminate => break,
        }
    }
}
