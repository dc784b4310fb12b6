//! The unit of guest execution, as seen by the supervisor.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use sysmsg::PtraceRegs;

use super::interrupt::InterruptForwarder;
use super::sysmsg_thread::SysmsgThread;
use super::{Subprocess, SubprocessId};
use crate::arch;

pub type ContextId = u64;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LastFault {
    pub subprocess: SubprocessId,
    pub addr: u64,
}

/// The part of a context other threads may touch: the fault cache, which
/// `unmap` invalidates from whichever thread unmaps, and the interrupt
/// forwarder.
#[derive(Debug)]
pub struct ContextShared {
    id: ContextId,
    last_fault: Mutex<Option<LastFault>>,
    interrupt: InterruptForwarder,
}

impl ContextShared {
    fn new(id: ContextId) -> Self {
        Self {
            id,
            last_fault: Mutex::new(None),
            interrupt: InterruptForwarder::new(),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn last_fault(&self) -> Option<LastFault> {
        *self.last_fault.lock().unwrap()
    }

    pub fn interrupt(&self) -> &InterruptForwarder {
        &self.interrupt
    }

    /// Records a fault at `addr` in `subprocess`. Returns true if it's the
    /// same fault as the last one recorded.
    pub(crate) fn record_fault(&self, subprocess: SubprocessId, addr: u64) -> bool {
        let fault = LastFault { subprocess, addr };
        let mut last = self.last_fault.lock().unwrap();
        let repeat = *last == Some(fault);
        *last = Some(fault);
        repeat
    }

    /// Forgets the cached fault if it's in `range` of `subprocess`. Returns
    /// whether it did.
    pub(crate) fn forget_fault_in(&self, subprocess: SubprocessId, range: &Range<u64>) -> bool {
        let mut last = self.last_fault.lock().unwrap();
        match *last {
            Some(f) if f.subprocess == subprocess && range.contains(&f.addr) => {
                *last = None;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn forget_fault_of(&self, subprocess: SubprocessId) {
        let mut last = self.last_fault.lock().unwrap();
        if matches!(*last, Some(f) if f.subprocess == subprocess) {
            *last = None;
        }
    }
}

/// Guest state exchanged with the stub on every switch.
pub struct GuestState {
    pub regs: PtraceRegs,
    pub fp_state: Box<[u8]>,
    pub signal_info: libc::siginfo_t,
}

impl GuestState {
    pub fn new(regs: PtraceRegs) -> Self {
        Self {
            regs,
            fp_state: vec![0; arch::FP_STATE_LEN].into_boxed_slice(),
            signal_info: arch::signal_info(0),
        }
    }
}

/// A guest execution context.
///
/// A context is bound to at most one [`Subprocess`] at a time, and lazily to
/// one stub thread of it. Switching it into a different subprocess rebinds
/// it, dropping the old stub thread and the fault cache.
pub struct Context {
    shared: Arc<ContextShared>,
    subprocess: Option<Arc<Subprocess>>,
    pub(crate) sysmsg_thread: Option<SysmsgThread>,
    pub state: GuestState,
}

impl Context {
    pub fn new(regs: PtraceRegs) -> Self {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            shared: Arc::new(ContextShared::new(id)),
            subprocess: None,
            sysmsg_thread: None,
            state: GuestState::new(regs),
        }
    }

    pub fn id(&self) -> ContextId {
        self.shared.id
    }

    pub fn shared(&self) -> &Arc<ContextShared> {
        &self.shared
    }

    pub fn subprocess(&self) -> Option<&Arc<Subprocess>> {
        self.subprocess.as_ref()
    }

    /// Tid of the bound stub thread, if there is one.
    pub fn stub_tid(&self) -> Option<i32> {
        self.sysmsg_thread.as_ref().map(|t| t.tid())
    }

    /// Binds the context to `subprocess`, unbinding it from any other first.
    pub fn bind(&mut self, subprocess: &Arc<Subprocess>) {
        if let Some(current) = &self.subprocess {
            if Arc::ptr_eq(current, subprocess) {
                return;
            }
        }
        self.unbind();
        subprocess.register_context(&self.shared);
        self.subprocess = Some(subprocess.clone());
    }

    /// Drops the stub thread and the binding to the current subprocess.
    pub fn unbind(&mut self) {
        if let Some(thread) = self.sysmsg_thread.take() {
            thread.destroy();
        }
        if let Some(subprocess) = self.subprocess.take() {
            self.shared.forget_fault_of(subprocess.id());
            subprocess.unregister_context(self.shared.id);
        }
    }

    /// Records a fault at `addr` in the bound subprocess. Returns true if the
    /// same address faulted last time too, e.g. because a read mapping was
    /// installed for what is really a write.
    pub fn note_fault(&self, addr: u64) -> bool {
        match &self.subprocess {
            Some(subprocess) => subprocess.note_fault(&self.shared, addr),
            None => false,
        }
    }

    pub fn last_fault(&self) -> Option<LastFault> {
        self.shared.last_fault()
    }

    /// Interrupts the context: the stub thread running it gets a signal, or
    /// the next switch returns immediately.
    pub fn interrupt(&self) {
        self.shared.interrupt.notify_interrupt();
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.unbind();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_fault_repeat() {
        let shared = ContextShared::new(1);
        assert!(!shared.record_fault(1, 0x1000));
        assert!(shared.record_fault(1, 0x1000));
        // Same address, different subprocess.
        assert!(!shared.record_fault(2, 0x1000));
        assert!(!shared.record_fault(2, 0x2000));
        assert_eq!(
            shared.last_fault(),
            Some(LastFault {
                subprocess: 2,
                addr: 0x2000
            })
        );
    }

    #[test]
    fn test_forget_fault_in() {
        let shared = ContextShared::new(1);
        shared.record_fault(3, 0x5000);

        assert!(!shared.forget_fault_in(4, &(0x0..0x10000)));
        assert!(!shared.forget_fault_in(3, &(0x5001..0x10000)));
        assert!(!shared.forget_fault_in(3, &(0x4000..0x5000)));
        assert!(shared.last_fault().is_some());

        assert!(shared.forget_fault_in(3, &(0x5000..0x5001)));
        assert_eq!(shared.last_fault(), None);
    }

    #[test]
    fn test_forget_fault_of() {
        let shared = ContextShared::new(1);
        shared.record_fault(3, 0x5000);
        shared.forget_fault_of(4);
        assert!(shared.last_fault().is_some());
        shared.forget_fault_of(3);
        assert_eq!(shared.last_fault(), None);
    }

    #[test]
    fn test_unbound_context() {
        let ctx = Context::new(unsafe { core::mem::zeroed() });
        assert!(ctx.subprocess().is_none());
        assert!(!ctx.note_fault(0x1000));
        assert_eq!(ctx.last_fault(), None);
        assert_eq!(ctx.state.fp_state.len(), arch::FP_STATE_LEN);
        // No receiver armed: the interrupt is kept for the next switch.
        ctx.interrupt();
        assert!(ctx.shared().interrupt().is_pending());
        assert_ne!(ctx.id(), Context::new(unsafe { core::mem::zeroed() }).id());
    }
}
