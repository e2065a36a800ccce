//! Cooperative cancellation shared between the interrupt source and the
//! generation loop.
//!
//! Three atomics are the only state shared across threads. The interrupt
//! source writes them without locks; the loop polls them at its checkpoints.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// What an interrupt did, so the caller can react (e.g. exit with 130).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    /// A turn was generating; it stops at the next checkpoint.
    StopGeneration,
    /// Idle interrupt; the session should wind down.
    Interrupted,
    /// Second idle interrupt in a row: terminate the process now.
    Terminate,
}

#[derive(Debug, Default)]
pub struct CancellationContext {
    generating: AtomicBool,
    cancel_requested: AtomicBool,
    // set while `cancel_requested` came from `request_cancel`, not a signal
    caller_cancel: AtomicBool,
}

impl CancellationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the start of a turn.
    pub fn begin_generation(&self) {
        self.generating.store(true, Ordering::SeqCst);
    }

    pub fn end_generation(&self) {
        self.generating.store(false, Ordering::SeqCst);
    }

    pub fn is_generating(&self) -> bool {
        self.generating.load(Ordering::SeqCst)
    }

    pub fn is_interrupted(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// Checkpoint test used before evaluating a turn and by the generation loop.
    pub fn should_stop(&self) -> bool {
        !self.is_generating() || self.is_interrupted()
    }

    /// Request cancellation of whatever is running.
    pub fn request_cancel(&self) {
        self.caller_cancel.store(true, Ordering::SeqCst);
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    /// Drop a pending `request_cancel`. An interrupt from the signal
    /// listener is left in place.
    pub fn clear_requested_cancel(&self) {
        if self.caller_cancel.swap(false, Ordering::SeqCst) {
            self.cancel_requested.store(false, Ordering::SeqCst);
        }
    }

    /// Clear a previous idle interrupt.
    pub fn clear_interrupt(&self) {
        self.caller_cancel.store(false, Ordering::SeqCst);
        self.cancel_requested.store(false, Ordering::SeqCst);
    }

    /// Interrupt handler logic, safe to call from a signal listener.
    pub fn on_interrupt(&self) -> InterruptAction {
        if self
            .generating
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return InterruptAction::StopGeneration;
        }
        let from_caller = self.caller_cancel.swap(false, Ordering::SeqCst);
        if self.cancel_requested.swap(true, Ordering::SeqCst) && !from_caller {
            InterruptAction::Terminate
        } else {
            InterruptAction::Interrupted
        }
    }
}

lazy_static::lazy_static! {
    static ref PROCESS_CONTEXT: Mutex<Option<Arc<CancellationContext>>> = Mutex::new(None);
}

/// Install the process-wide context, returning the existing one if present.
pub fn install() -> Arc<CancellationContext> {
    let mut guard = PROCESS_CONTEXT
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    guard
        .get_or_insert_with(|| Arc::new(CancellationContext::new()))
        .clone()
}

/// The installed process-wide context, if any.
pub fn global() -> Option<Arc<CancellationContext>> {
    PROCESS_CONTEXT
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clone()
}

/// Remove the process-wide context. Existing `Arc`s stay valid.
pub fn teardown() {
    let mut guard = PROCESS_CONTEXT
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    *guard = None;
}
