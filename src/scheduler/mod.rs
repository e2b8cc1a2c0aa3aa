//! GC threads: the parallel worker pool, the safepoint machinery, and the
//! VM-operation thread.

pub mod pool;
pub mod safepoint;
pub mod vm_thread;

pub use pool::{ParallelTask, WorkerPool};
pub use safepoint::{MutatorRegistry, MutatorShared};
pub use vm_thread::{VmOperation, VmThread};
