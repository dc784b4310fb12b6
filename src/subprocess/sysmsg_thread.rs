//! Stub threads running guest code under the syscall filter, and the
//! supervisor side of the message protocol that drives them.
//!
//! Each stub thread owns a stack slot, i.e. a window of the stub's sysmsg
//! area. The shared stack of that window is backed by memory-file pages
//! that are mapped into the supervisor as well, which is how the supervisor
//! reaches the [`Message`] at the top of it.
//!
//! Once initialized, a stub thread publishes [`ThreadState::None`] and parks
//! until the supervisor dispatches it. From then on every switch is
//! `Dispatched` (supervisor hands over registers), `None` (guest running),
//! `Done` (guest trapped and the stub handed the message back).

use std::ops::Range;
use std::ptr::NonNull;
use std::sync::Arc;

use log::{debug, warn};
use nix::sys::signal::Signal;
use rustix::mm::{MapFlags, ProtFlags};
use sysmsg::{EventType, Message, ThreadState};

use super::context::GuestState;
use super::interrupt::{InterruptForwarder, InterruptReceiver, SIGNAL_INTERRUPT};
use super::thread::{tgkill, Thread, WaitOutcome};
use super::{AppExit, Subprocess};
use crate::arch;
use crate::error::{Error, FatalError, Result};

/// Signals whose handler is the stub's entry point into the protocol.
const STUB_SIGNALS: [i32; 7] = [
    libc::SIGSEGV,
    libc::SIGBUS,
    libc::SIGFPE,
    libc::SIGTRAP,
    libc::SIGILL,
    libc::SIGSYS,
    SIGNAL_INTERRUPT as i32,
];

const SA_RESTORER: u64 = 0x0400_0000;

/// `struct sigaction` as the kernel takes it in `rt_sigaction(2)`.
#[repr(C)]
#[derive(Copy, Clone)]
struct KernelSigaction {
    handler: u64,
    flags: u64,
    restorer: u64,
    mask: u64,
}

/// Offsets at the bottom of the shared stack where syscall arguments are
/// staged while the stub has it mapped read-only.
const ALTSTACK_ARG_OFFSET: u64 = 0;
const SIGACTION_ARG_OFFSET: u64 = 64;

static_assertions::const_assert!(
    core::mem::size_of::<libc::stack_t>() as u64 <= SIGACTION_ARG_OFFSET
);

/// Forwards interrupts to one stub thread: raises the interrupt flag of its
/// message, then signals it.
struct StubInterrupter {
    tgid: i32,
    tid: i32,
    msg: NonNull<Message>,
}

// SAFETY: only the atomic interrupt word of the message is touched, and the
// interrupter is disarmed before the message is unmapped.
unsafe impl Send for StubInterrupter {}
unsafe impl Sync for StubInterrupter {}

impl InterruptReceiver for StubInterrupter {
    fn notify_interrupt(&self) {
        // SAFETY: see above.
        unsafe { self.msg.as_ref() }.set_interrupt();
        if let Err(e) = tgkill(self.tgid, self.tid, SIGNAL_INTERRUPT) {
            debug!("Couldn't interrupt stub thread {}: {e}", self.tid);
        }
    }
}

pub struct SysmsgThread {
    thread: Thread,
    subprocess: Arc<Subprocess>,
    /// Range of the memory file backing the shared stack.
    stack_range: Range<u64>,
    /// Supervisor mapping of the shared stack.
    sentry_stack: NonNull<u8>,
    msg: NonNull<Message>,
    /// Location of the fp state saved by the stub's signal handler, relative
    /// to the message. Zero when there is none.
    fpu_state_offset: i64,
    interrupter: Arc<StubInterrupter>,
}

// SAFETY: the pointers refer to the supervisor mapping owned by this value.
unsafe impl Send for SysmsgThread {}

impl SysmsgThread {
    /// Takes ownership of `thread` and of the shared stack at `sentry_stack`,
    /// backed by `stack_range` of the subprocess' memory file.
    pub(crate) fn from_parts(
        thread: Thread,
        subprocess: Arc<Subprocess>,
        stack_range: Range<u64>,
        sentry_stack: NonNull<u8>,
    ) -> Self {
        let msg_addr = sysmsg::stack_addr_to_msg(sentry_stack.as_ptr() as u64);
        // SAFETY: non-null since it's above `sentry_stack`.
        let msg = unsafe { NonNull::new_unchecked(msg_addr as *mut Message) };
        let interrupter = Arc::new(StubInterrupter {
            tgid: thread.tgid(),
            tid: thread.tid(),
            msg,
        });
        Self {
            thread,
            subprocess,
            stack_range,
            sentry_stack,
            msg,
            fpu_state_offset: 0,
            interrupter,
        }
    }

    /// Creates a stub thread in `subprocess`, installs the filter, and waits
    /// for it to come up. `guest_regs` are the registers it starts with.
    pub(crate) fn start(
        subprocess: &Arc<Subprocess>,
        guest_regs: &sysmsg::PtraceRegs,
    ) -> Result<SysmsgThread> {
        let thread = subprocess.new_thread_inner()?;

        // Skip the SIGSTOP queued by the control-plane worker.
        thread.cont()?;
        let sig = thread.wait(WaitOutcome::Stopped)?;
        if sig != libc::SIGSTOP {
            return Err(thread.dump_and_fatal(format!(
                "error waiting for new clone: expected SIGSTOP, got {sig}"
            )));
        }

        // TODO: allocation failure should fail the guest's clone instead.
        let memory_file = subprocess.memory_file();
        let stack_range = memory_file
            .allocate(sysmsg::PER_THREAD_SHARED_STACK_SIZE)
            .map_err(FatalError::StackAllocation)?;
        let sentry_stack = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                sysmsg::PER_THREAD_SHARED_STACK_SIZE as usize,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                memory_file.fd(),
                stack_range.start,
            )
        };
        let sentry_stack = match sentry_stack {
            Ok(p) => p,
            Err(errno) => {
                memory_file.dec_ref(stack_range);
                return Err(FatalError::Host { op: "mmap", errno }.into());
            }
        };
        // SAFETY: mmap doesn't return null on success.
        let sentry_stack = unsafe { NonNull::new_unchecked(sentry_stack.cast::<u8>()) };

        let mut sys = SysmsgThread::from_parts(thread, subprocess.clone(), stack_range, sentry_stack);
        let Some(slot) = sys.thread.stack_slot() else {
            return Err(Error::StackSlotsExhausted);
        };
        let layout = subprocess.layout();
        let per_thread = layout.per_thread_mem_addr(slot);
        let stub_stack = per_thread + sysmsg::PER_THREAD_SHARED_STACK_OFFSET;

        // The handler setup syscalls take in-memory arguments. Other stub
        // threads mustn't be able to change them underneath, so the stack is
        // read-only for the stub while they're staged there.
        sys.map_stack(stub_stack, true)?;
        sys.install_signal_handlers(stub_stack)?;
        sys.map_stack(stub_stack, false)?;
        sys.map_private_stack(
            per_thread + sysmsg::PER_THREAD_PRIVATE_STACK_OFFSET,
            sysmsg::PER_THREAD_PRIVATE_STACK_SIZE,
        )?;

        // SAFETY: the message lies within our private mapping, and the stub
        // doesn't run yet.
        unsafe { Message::init_at(sys.msg.as_ptr()) };
        {
            let body = unsafe { sys.msg().body_mut() };
            body.self_addr = sysmsg::stack_addr_to_msg(stub_stack);
            body.syshandler = layout.syshandler_addr;
            body.syshandler_stack = sysmsg::stack_addr_to_syshandler_stack(per_thread);
        }

        sys.must_syscall(
            "prctl(PR_SET_NO_NEW_PRIVS)",
            libc::SYS_prctl,
            &[libc::PR_SET_NO_NEW_PRIVS as u64, 1, 0],
        )?;
        sys.must_syscall(
            "seccomp",
            libc::SYS_seccomp,
            &[
                libc::SECCOMP_SET_MODE_FILTER as u64,
                0,
                layout.seccomp_program_addr,
            ],
        )?;

        // Prepare to start the stub.
        let mut regs = *guest_regs;
        arch::reset_sysemu_regs(&mut regs, sys.thread.init_regs());
        sys.thread
            .set_regs(&regs)
            .map_err(|errno| FatalError::Ptrace {
                tid: sys.thread.tid(),
                op: "setregs",
                errno,
            })?;
        // A fake fault gets the stub into its handler; SIGCONT gets it past
        // the pending stop.
        for sig in [Signal::SIGSEGV, Signal::SIGCONT] {
            sys.thread
                .tgkill(sig)
                .map_err(|errno| FatalError::Host { op: "tgkill", errno })?;
        }
        sys.thread.detach_and_resume()?;

        let spin = subprocess.dispatch_spin();
        sys.msg()
            .wait_state(ThreadState::None, spin)
            .map_err(FatalError::from)?;
        let body = unsafe { sys.msg().body() };
        if body.err != 0 {
            return Err(FatalError::StubError {
                tid: sys.thread.tid(),
                err: body.err,
                line: body.line,
            }
            .into());
        }
        sys.fpu_state_offset = body.fpu_state_offset(arch::FP_STATE_LEN)?;
        sys.thread
            .debug(format_args!("stub thread up in slot {slot}"));
        Ok(sys)
    }

    pub fn tid(&self) -> i32 {
        self.thread.tid()
    }

    pub fn subprocess(&self) -> &Arc<Subprocess> {
        &self.subprocess
    }

    pub fn fpu_state_offset(&self) -> i64 {
        self.fpu_state_offset
    }

    pub(crate) fn msg(&self) -> &Message {
        // SAFETY: the message stays mapped for as long as we exist.
        unsafe { self.msg.as_ref() }
    }

    /// Releases the supervisor-side resources of the thread. The stub thread
    /// stays parked in the stub.
    pub fn destroy(self) {
        self.thread
            .debug(format_args!("destroying stub thread"));
    }

    fn must_syscall(&mut self, name: &'static str, sysno: i64, args: &[u64]) -> Result<u64> {
        let tid = self.thread.tid();
        self.thread
            .syscall_ignore_interrupt(sysno, args)
            .map_err(|e| match e {
                Error::Syscall(errno) => FatalError::InjectedSyscall {
                    tid,
                    name,
                    errno,
                }
                .into(),
                e => e,
            })
    }

    fn map_stack(&mut self, addr: u64, read_only: bool) -> Result<()> {
        let prot = if read_only {
            libc::PROT_READ
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };
        let fd = {
            use std::os::fd::AsRawFd;
            self.subprocess.memory_file().fd().as_raw_fd()
        };
        self.must_syscall(
            "mmap(shared stack)",
            libc::SYS_mmap,
            &[
                addr,
                sysmsg::PER_THREAD_SHARED_STACK_SIZE,
                prot as u64,
                (libc::MAP_SHARED | libc::MAP_FIXED) as u64,
                fd as u64,
                self.stack_range.start,
            ],
        )?;
        Ok(())
    }

    fn map_private_stack(&mut self, addr: u64, len: u64) -> Result<()> {
        self.must_syscall(
            "mmap(private stack)",
            libc::SYS_mmap,
            &[
                addr,
                len,
                (libc::PROT_READ | libc::PROT_WRITE) as u64,
                (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED) as u64,
                -1i64 as u64,
                0,
            ],
        )?;
        Ok(())
    }

    /// Points the stub's signal handlers at the stub entry point, running on
    /// the shared stack.
    fn install_signal_handlers(&mut self, stub_stack: u64) -> Result<()> {
        let layout = self.subprocess.layout();
        let altstack = libc::stack_t {
            ss_sp: stub_stack as *mut libc::c_void,
            ss_flags: 0,
            ss_size: sysmsg::MSG_OFFSET_FROM_SHARED_STACK as usize,
        };
        let action = KernelSigaction {
            handler: layout.sighandler_addr,
            flags: (libc::SA_SIGINFO | libc::SA_ONSTACK) as u64 | SA_RESTORER,
            restorer: layout.restorer_addr,
            mask: !0,
        };
        // SAFETY: both offsets are within the shared stack, which we map
        // read-write, and the stub only has it mapped read-only.
        unsafe {
            let base = self.sentry_stack.as_ptr();
            base.add(ALTSTACK_ARG_OFFSET as usize)
                .cast::<libc::stack_t>()
                .write_unaligned(altstack);
            base.add(SIGACTION_ARG_OFFSET as usize)
                .cast::<KernelSigaction>()
                .write_unaligned(action);
        }

        self.must_syscall(
            "sigaltstack",
            libc::SYS_sigaltstack,
            &[stub_stack + ALTSTACK_ARG_OFFSET, 0],
        )?;
        for sig in STUB_SIGNALS {
            self.must_syscall(
                "rt_sigaction",
                libc::SYS_rt_sigaction,
                &[
                    sig as u64,
                    stub_stack + SIGACTION_ARG_OFFSET,
                    0,
                    core::mem::size_of::<u64>() as u64,
                ],
            )?;
        }
        Ok(())
    }

    fn fp_state_ptr(&self) -> Option<*mut u8> {
        if self.fpu_state_offset == 0 {
            return None;
        }
        // SAFETY: the offset was validated to lie within the shared stack.
        Some(unsafe { self.msg.as_ptr().cast::<u8>().offset(self.fpu_state_offset as isize) })
    }

    fn restore_fp_state(&self, fp_state: &[u8]) {
        if let Some(dst) = self.fp_state_ptr() {
            let len = fp_state.len().min(arch::FP_STATE_LEN);
            // SAFETY: see `fp_state_ptr`; we own the message.
            unsafe { std::ptr::copy_nonoverlapping(fp_state.as_ptr(), dst, len) };
        }
    }

    fn retrieve_fp_state(&self, fp_state: &mut [u8]) {
        if let Some(src) = self.fp_state_ptr() {
            let len = fp_state.len().min(arch::FP_STATE_LEN);
            // SAFETY: see `fp_state_ptr`; we own the message.
            unsafe { std::ptr::copy_nonoverlapping(src, fp_state.as_mut_ptr(), len) };
        }
    }

    /// One round trip into the guest and back.
    pub(crate) fn switch_to_app(
        &mut self,
        state: &mut GuestState,
        interrupt: &InterruptForwarder,
        spin: u32,
    ) -> Result<AppExit> {
        arch::reset_sysemu_regs(&mut state.regs, self.thread.init_regs());
        self.restore_fp_state(&state.fp_state);

        // Make sure future interrupts signal this stub thread. The flag is
        // cleared first so none raised from here on is lost.
        self.msg().clear_interrupt();
        if !interrupt.enable(self.interrupter.clone()) {
            // Pending interrupt; simulate.
            state.signal_info = arch::signal_info(SIGNAL_INTERRUPT as i32);
            return Ok(AppExit::Signal);
        }
        let res = self.run_and_classify(state, spin);
        interrupt.disable();
        res
    }

    fn run_and_classify(&mut self, state: &mut GuestState, spin: u32) -> Result<AppExit> {
        let tid = self.thread.tid();
        let msg = self.msg();

        // SAFETY: the stub handed us the message (state Done, or None while
        // parked after start-up).
        unsafe { msg.body_mut() }.regs = state.regs;
        msg.enable_sentry_fast_path();
        msg.set_state(ThreadState::Dispatched);
        msg.wait_state(ThreadState::Done, spin)
            .map_err(FatalError::from)?;
        msg.disable_sentry_fast_path();

        // SAFETY: state is Done; the message is ours again.
        let body = *unsafe { msg.body() };
        let event = body.event_type();
        let err = body.err;
        let line = body.line;
        let regs = body.regs;
        let siginfo = body.siginfo;

        self.fpu_state_offset = if event == Ok(EventType::SyscallTrap) {
            0
        } else {
            body.fpu_state_offset(arch::FP_STATE_LEN)?
        };

        if err != 0 {
            return Err(FatalError::StubError { tid, err, line }.into());
        }

        state.regs = regs;
        self.retrieve_fp_state(&mut state.fp_state);
        state.signal_info = siginfo;

        let (event, patchable) = match event {
            Ok(EventType::SyscallCanBePatched) => (EventType::Syscall, true),
            Ok(event) => (event, false),
            Err(raw) => return Err(FatalError::UnknownEventType { tid, raw }.into()),
        };
        match event {
            EventType::Syscall | EventType::SyscallTrap => {
                // A syscall the guest can't actually make is delivered as the
                // fault it really is.
                if arch::maybe_patch_signal_info(&state.regs, &mut state.signal_info) {
                    return Ok(AppExit::Signal);
                }
                arch::update_syscall_regs(&mut state.regs);
                Ok(AppExit::Syscall { patchable })
            }
            EventType::Fault => Ok(AppExit::Signal),
            // The dispatcher never reports interrupts to us.
            EventType::Interrupt | EventType::SyscallCanBePatched => Err(FatalError::UnknownEventType {
                tid,
                raw: event.into(),
            }
            .into()),
        }
    }
}

impl Drop for SysmsgThread {
    fn drop(&mut self) {
        let res = unsafe {
            rustix::mm::munmap(
                self.sentry_stack.as_ptr().cast(),
                sysmsg::PER_THREAD_SHARED_STACK_SIZE as usize,
            )
        };
        if let Err(e) = res {
            warn!("Couldn't unmap stub stack at {:p}: {e}", self.sentry_stack);
        }
        self.subprocess
            .memory_file()
            .dec_ref(self.stack_range.clone());
        if let Some(slot) = self.thread.stack_slot() {
            self.subprocess.put_stack_slot(slot);
        }
    }
}
