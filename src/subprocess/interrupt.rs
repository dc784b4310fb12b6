//! Delivery of asynchronous interrupts to whatever is running a context.

use std::sync::{Arc, Mutex};

use nix::sys::signal::Signal;

/// Signal used to kick a stub thread out of guest code.
pub const SIGNAL_INTERRUPT: Signal = Signal::SIGCHLD;

/// Something that can be interrupted, e.g. a stub thread executing guest code.
pub trait InterruptReceiver: Send + Sync {
    fn notify_interrupt(&self);
}

#[derive(Default)]
struct ForwarderState {
    dst: Option<Arc<dyn InterruptReceiver>>,
    pending: bool,
}

/// Forwards interrupts to the currently armed receiver, or remembers them
/// until the next [`InterruptForwarder::enable`] if none is armed.
#[derive(Default)]
pub struct InterruptForwarder {
    state: Mutex<ForwarderState>,
}

impl InterruptForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms `receiver`. Returns false, consuming the pending interrupt, if an
    /// interrupt arrived while nothing was armed; `receiver` is not armed in
    /// that case.
    pub fn enable(&self, receiver: Arc<dyn InterruptReceiver>) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.pending {
            state.pending = false;
            return false;
        }
        state.dst = Some(receiver);
        true
    }

    pub fn disable(&self) {
        self.state.lock().unwrap().dst = None;
    }

    pub fn notify_interrupt(&self) {
        let mut state = self.state.lock().unwrap();
        match &state.dst {
            Some(dst) => dst.notify_interrupt(),
            None => state.pending = true,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state.lock().unwrap().pending
    }
}

impl std::fmt::Debug for InterruptForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("InterruptForwarder")
            .field("armed", &state.dst.is_some())
            .field("pending", &state.pending)
            .finish()
    }
}
