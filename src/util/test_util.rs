//! Utilities for tests.

use std::sync::Mutex;
use std::time::Duration;

lazy_static! {
    /// Tests that construct a whole heap (threads, mmap) run serially so they
    /// do not fight over memory and CPU. Take this in every such test.
    pub static ref SERIAL_TEST: Mutex<()> = Mutex::new(());
}

/// Run a test body serially, tolerating a poisoned mutex from an earlier
/// panicking test.
pub fn with_serial_lock<F: FnOnce()>(f: F) {
    let _guard = SERIAL_TEST.lock().unwrap_or_else(|e| e.into_inner());
    f();
}

/// Spin until `cond` holds or the timeout elapses. Returns whether it held.
pub fn wait_until<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}
