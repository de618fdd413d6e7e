//! Run-control flag shared by every client task.
//!
//! The flag is the only cancellation primitive. Echo loops check it at the
//! top of each round and exit cleanly once it is cleared; a task blocked in
//! a read only observes it after that read completes or fails. Cleanup of
//! the connection is left to the controller that owns the run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cloneable handle to the run-control flag.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    active: Arc<AtomicBool>,
}

impl RunControl {
    /// Create a handle with the flag cleared.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether client tasks should keep sending.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Allow client tasks to send.
    pub fn activate(&self) {
        self.active.store(true, Ordering::Release);
    }

    /// Ask every client task to stop after its current round.
    ///
    /// Returns `true` if this call cleared the flag.
    pub fn cancel(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }
}

/// Latch that records an external stop request (Ctrl-C).
///
/// Controllers re-activate the run flag between phases, so an operator
/// interrupt must be remembered separately to stop the sweep for good.
#[derive(Debug, Clone, Default)]
pub struct StopLatch {
    stopped: Arc<AtomicBool>,
}

impl StopLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}
