//! A single traced thread of a stub process.

use std::fmt;

use log::{debug, warn};
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use rustix::io::Errno;
use sysmsg::PtraceRegs;

use crate::arch;
use crate::error::{Error, FatalError, Result};
use crate::utility::syscall::retry_on_restart;

/// `clone(2)` flags for an additional thread in a stub process.
const CLONE_THREAD_FLAGS: u64 = (libc::CLONE_FILES
    | libc::CLONE_FS
    | libc::CLONE_SIGHAND
    | libc::CLONE_THREAD
    | libc::CLONE_PTRACE
    | libc::CLONE_VM) as u64;

/// `clone(2)` flags for a new stub process. The exit signal makes the new
/// process' death kill its parent stub.
const CLONE_STUB_FLAGS: u64 = (libc::CLONE_FILES | libc::CLONE_PTRACE | libc::SIGKILL) as u64;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The thread is expected to enter a ptrace stop.
    Stopped,
    /// The thread is expected to be gone.
    Killed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TraceState {
    Created,
    Attached,
    /// Running an injected syscall. Back to `Attached` once it returns.
    ExecutingSyscall,
    Detached,
    Destroyed,
}

/// What a `wait4` status means for a given [`WaitOutcome`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum WaitStatusKind {
    /// A stop with no signal; wait again.
    Spurious,
    /// The value `wait` reports. For `SIGTRAP` stops the ptrace event is
    /// encoded in bits 8..16, as in the raw status.
    Done(i32),
    /// `PTRACE_EVENT_EXIT`: the tracee is on its way out.
    ExitEvent,
    Unexpected,
}

fn classify_wait_status(outcome: WaitOutcome, status: i32) -> WaitStatusKind {
    match outcome {
        WaitOutcome::Stopped => {
            if !libc::WIFSTOPPED(status) {
                return WaitStatusKind::Unexpected;
            }
            let stop_sig = libc::WSTOPSIG(status);
            if stop_sig == 0 {
                return WaitStatusKind::Spurious;
            }
            if stop_sig == libc::SIGTRAP {
                let cause = (status >> 16) & 0xff;
                if cause == libc::PTRACE_EVENT_EXIT {
                    return WaitStatusKind::ExitEvent;
                }
                return WaitStatusKind::Done(stop_sig | (cause << 8));
            }
            WaitStatusKind::Done(stop_sig)
        }
        WaitOutcome::Killed => {
            if libc::WIFEXITED(status) {
                WaitStatusKind::Done(libc::WEXITSTATUS(status))
            } else if libc::WIFSIGNALED(status) {
                WaitStatusKind::Done(-1)
            } else {
                WaitStatusKind::Unexpected
            }
        }
    }
}

fn from_nix(e: nix::errno::Errno) -> Errno {
    Errno::from_raw_os_error(e as i32)
}

fn round_up_to_page(addr: u64) -> Option<u64> {
    let page = sysmsg::PAGE_SIZE;
    Some(addr.checked_add(page - 1)? & !(page - 1))
}

/// Sends `sig` to thread `tid` of `tgid`.
pub fn tgkill(tgid: i32, tid: i32, sig: Signal) -> std::result::Result<(), Errno> {
    let res = unsafe {
        libc::syscall(
            libc::SYS_tgkill,
            tgid as libc::c_long,
            tid as libc::c_long,
            sig as libc::c_long,
        )
    };
    if res < 0 {
        return Err(Errno::from_raw_os_error(nix::errno::Errno::last() as i32));
    }
    Ok(())
}

/// A traced thread.
///
/// Ptrace requests are only honoured when made by the tracer, i.e. the OS
/// thread that attached. A `Thread` is therefore only ever driven from the
/// thread that called [`Thread::attach`], until it calls [`Thread::detach`].
pub struct Thread {
    tgid: i32,
    tid: i32,
    /// Registers of the stub at its syscall instruction. Syscalls are
    /// injected by starting from a copy of these.
    init_regs: PtraceRegs,
    stack_slot: Option<u64>,
    state: TraceState,
}

impl Thread {
    pub fn new(tgid: i32, tid: i32) -> Self {
        Self {
            tgid,
            tid,
            // SAFETY: all-zero is a valid register block.
            init_regs: unsafe { core::mem::zeroed() },
            stack_slot: None,
            state: TraceState::Created,
        }
    }

    pub fn tgid(&self) -> i32 {
        self.tgid
    }

    pub fn tid(&self) -> i32 {
        self.tid
    }

    pub fn state(&self) -> TraceState {
        self.state
    }

    pub fn init_regs(&self) -> &PtraceRegs {
        &self.init_regs
    }

    pub fn set_init_regs(&mut self, regs: PtraceRegs) {
        self.init_regs = regs;
    }

    pub fn stack_slot(&self) -> Option<u64> {
        self.stack_slot
    }

    pub fn set_stack_slot(&mut self, slot: Option<u64>) {
        self.stack_slot = slot;
    }

    fn pid(&self) -> Pid {
        Pid::from_raw(self.tid)
    }

    pub fn debug(&self, args: fmt::Arguments) {
        debug!("{:8}:{}", self.tid, args);
    }

    fn ptrace_error(&self, op: &'static str, errno: nix::errno::Errno) -> Error {
        FatalError::Ptrace {
            tid: self.tid,
            op,
            errno: from_nix(errno),
        }
        .into()
    }

    fn wrong_state(&self, op: &'static str) -> Error {
        FatalError::WrongTraceState {
            tid: self.tid,
            op,
            state: self.state,
        }
        .into()
    }

    /// Attaches to the thread and sets the trace options.
    pub fn attach(&mut self) -> Result<()> {
        if self.state == TraceState::Destroyed {
            return Err(self.wrong_state("attach"));
        }
        ptrace::attach(self.pid()).map_err(|e| self.ptrace_error("attach", e))?;

        // PTRACE_ATTACH sends SIGSTOP, and wakes the tracee if it was already
        // stopped from a previous detach or from the SIGSTOP queued by
        // CLONE_PTRACE, so we always expect a signal-delivery-stop with SIGSTOP.
        let sig = self.wait(WaitOutcome::Stopped)?;
        if sig != libc::SIGSTOP {
            return Err(self.dump_and_fatal(format!("wait failed: expected SIGSTOP, got {sig}")));
        }
        self.init()?;
        self.state = TraceState::Attached;
        Ok(())
    }

    /// Sets the trace options: syscall stops are distinguishable from real
    /// `SIGTRAP`s, exits are reported, and the tracee dies with the tracer.
    pub fn init(&self) -> Result<()> {
        ptrace::setoptions(
            self.pid(),
            ptrace::Options::PTRACE_O_TRACESYSGOOD
                | ptrace::Options::PTRACE_O_TRACEEXIT
                | ptrace::Options::PTRACE_O_EXITKILL,
        )
        .map_err(|e| self.ptrace_error("setoptions", e))
    }

    /// Detaches, leaving the thread in group-stop.
    pub fn detach(&mut self) -> Result<()> {
        ptrace::detach(self.pid(), Some(Signal::SIGSTOP))
            .map_err(|e| self.ptrace_error("detach", e))?;
        self.state = TraceState::Detached;
        Ok(())
    }

    /// Detaches and lets the thread run.
    pub fn detach_and_resume(&mut self) -> Result<()> {
        ptrace::detach(self.pid(), None::<Signal>).map_err(|e| self.ptrace_error("detach", e))?;
        self.state = TraceState::Detached;
        Ok(())
    }

    /// Resumes the thread from a ptrace stop, suppressing the stop signal.
    pub fn cont(&self) -> Result<()> {
        ptrace::cont(self.pid(), None::<Signal>).map_err(|e| self.ptrace_error("cont", e))
    }

    pub fn tgkill(&self, sig: Signal) -> std::result::Result<(), Errno> {
        tgkill(self.tgid, self.tid, sig)
    }

    /// Waits for the thread to reach `outcome` and returns the stop signal
    /// (with the ptrace event in bits 8..16 for `SIGTRAP`), or the exit code.
    pub fn wait(&self, outcome: WaitOutcome) -> Result<i32> {
        loop {
            let mut status = 0;
            let r = unsafe {
                libc::wait4(
                    self.tid,
                    &mut status,
                    libc::__WALL | libc::WUNTRACED,
                    std::ptr::null_mut(),
                )
            };
            if r < 0 {
                match nix::errno::Errno::last() {
                    // Wait was interrupted; wait again.
                    nix::errno::Errno::EINTR | nix::errno::Errno::EAGAIN => continue,
                    e => {
                        return Err(FatalError::Wait {
                            tid: self.tid,
                            errno: from_nix(e),
                        }
                        .into())
                    }
                }
            }
            if r != self.tid {
                return Err(
                    self.dump_and_fatal(format!("ptrace wait returned {r}, expected {}", self.tid))
                );
            }
            match classify_wait_status(outcome, status) {
                WaitStatusKind::Spurious => continue,
                WaitStatusKind::Done(v) => return Ok(v),
                WaitStatusKind::ExitEvent => return Err(self.unexpected_stub_exit()),
                WaitStatusKind::Unexpected => {
                    warn!(
                        "{}: ptrace status unexpected while waiting for {outcome:?}\n{}",
                        self.tid,
                        self.regs_dump()
                    );
                    return Err(FatalError::UnexpectedStop {
                        tid: self.tid,
                        status,
                    }
                    .into());
                }
            }
        }
    }

    /// Called when the thread reports `PTRACE_EVENT_EXIT`.
    ///
    /// A `SIGKILL` can only come from a user or the OOM killer; the supervisor
    /// goes down with its stub without treating it as a bug. Anything else is
    /// an internal error.
    fn unexpected_stub_exit(&self) -> Error {
        let msg = ptrace::getevent(self.pid());
        let status = msg.map(|m| m as i32).unwrap_or(0);
        if msg.is_ok() && libc::WIFSIGNALED(status) && libc::WTERMSIG(status) == libc::SIGKILL {
            warn!(
                "The ptrace stub process {} has been killed by SIGKILL.",
                self.tgid
            );
            let pid = std::process::id() as i32;
            tgkill(pid, pid, Signal::SIGKILL).ok();
        }
        FatalError::StubExited {
            tid: self.tid,
            status,
        }
        .into()
    }

    pub fn get_regs(&self) -> std::result::Result<PtraceRegs, Errno> {
        // SAFETY: all-zero is a valid register block.
        let mut regs: PtraceRegs = unsafe { core::mem::zeroed() };
        self.regset(libc::PTRACE_GETREGSET, &mut regs)?;
        Ok(regs)
    }

    pub fn set_regs(&self, regs: &PtraceRegs) -> std::result::Result<(), Errno> {
        let mut regs = *regs;
        self.regset(libc::PTRACE_SETREGSET, &mut regs)
    }

    fn regset(
        &self,
        request: libc::c_uint,
        regs: &mut PtraceRegs,
    ) -> std::result::Result<(), Errno> {
        let mut iov = libc::iovec {
            iov_base: (regs as *mut PtraceRegs).cast(),
            iov_len: core::mem::size_of::<PtraceRegs>(),
        };
        let res = unsafe {
            libc::ptrace(
                request,
                self.tid,
                libc::NT_PRSTATUS as libc::c_long,
                &mut iov as *mut libc::iovec,
            )
        };
        if res < 0 {
            return Err(Errno::from_raw_os_error(nix::errno::Errno::last() as i32));
        }
        Ok(())
    }

    /// Executes one syscall cycle in the thread: writes `regs`, runs until
    /// the trap instruction following the stub's syscall instruction, and
    /// reads the registers back into `regs`.
    ///
    /// This is for syscalls the supervisor injects (`mmap`, `munmap`, ...),
    /// not for guest syscalls.
    pub fn syscall(&mut self, regs: &mut PtraceRegs) -> Result<u64> {
        if self.state != TraceState::Attached {
            return Err(self.wrong_state("syscall"));
        }
        self.set_regs(regs).map_err(|errno| FatalError::Ptrace {
            tid: self.tid,
            op: "setregs",
            errno,
        })?;

        // Left as is on error; the thread is stuck somewhere in the syscall.
        self.state = TraceState::ExecutingSyscall;
        loop {
            self.cont()?;
            let sig = self.wait(WaitOutcome::Stopped)?;
            if sig == libc::SIGTRAP {
                break;
            }
            if sig != libc::SIGSTOP && sig != libc::SIGCHLD {
                warn!(
                    "The thread {}:{} has been interrupted by {}",
                    self.tgid, self.tid, sig
                );
            }
        }

        *regs = self.get_regs().map_err(|errno| FatalError::Ptrace {
            tid: self.tid,
            op: "getregs",
            errno,
        })?;
        self.state = TraceState::Attached;
        arch::syscall_return_value(regs).map_err(Error::Syscall)
    }

    /// Injects `sysno(args)`, restarting it as long as the kernel asks for a
    /// restart.
    pub fn syscall_ignore_interrupt(&mut self, sysno: i64, args: &[u64]) -> Result<u64> {
        let regs = arch::syscall_regs(&self.init_regs, sysno, args)?;
        retry_on_restart(|| {
            let mut regs = regs;
            self.syscall(&mut regs)
        })
    }

    /// Clones a new thread in the same stub process. The new thread starts
    /// with `SIGSTOP` pending and this thread's tracer as its tracer.
    pub fn clone_thread(&mut self) -> Result<Thread> {
        // The stack pointer is just made up, but something sensible keeps
        // the kernel from complaining.
        let sp = round_up_to_page(arch::stack_pointer(&self.init_regs))
            .ok_or(Error::Syscall(Errno::INVAL))?;
        let tid = self.syscall_ignore_interrupt(libc::SYS_clone, &[CLONE_THREAD_FLAGS, sp, 0, 0, 0])?;
        Ok(Thread::new(self.tgid, tid as i32))
    }

    /// Forks a new stub process from this one. The child is returned
    /// detached, in group-stop, with its initial registers captured.
    pub fn create_stub(&mut self) -> Result<Thread> {
        let pid = self.syscall_ignore_interrupt(libc::SYS_clone, &[CLONE_STUB_FLAGS, 0, 0, 0, 0])?;
        let mut child = Thread::new(pid as i32, pid as i32);

        // CLONE_PTRACE: the child is already ours and stops before running.
        let sig = child.wait(WaitOutcome::Stopped)?;
        if sig != libc::SIGSTOP {
            return Err(child.dump_and_fatal(format!(
                "wait failed: expected SIGSTOP from new stub, got {sig}"
            )));
        }
        child.init()?;
        child.state = TraceState::Attached;
        child.grab_init_regs()?;
        child.detach()?;
        child.debug(format_args!("new stub process {}", child.tgid));
        Ok(child)
    }

    /// Captures the registers the thread is stopped with as its initial
    /// registers: the instruction pointer is moved back onto the syscall
    /// instruction the stub is parked after, and the stack pointer cleared.
    pub fn grab_init_regs(&mut self) -> Result<()> {
        let mut regs = self.get_regs().map_err(|errno| FatalError::Ptrace {
            tid: self.tid,
            op: "getregs",
            errno,
        })?;
        let ip = arch::ip(&regs) - arch::SYSCALL_INSTRUCTION_LEN;
        arch::set_ip(&mut regs, ip);
        arch::set_stack_pointer(&mut regs, 0);
        self.init_regs = regs;
        Ok(())
    }

    /// Kills and reaps the thread.
    ///
    /// Only meant for threads created by hand; the death of a stub thread
    /// normally takes the whole stub with it.
    pub fn destroy(&mut self) -> Result<()> {
        if self.state == TraceState::Attached {
            self.detach()?;
        }
        self.tgkill(Signal::SIGKILL)
            .map_err(|errno| FatalError::Host { op: "tgkill", errno })?;
        self.wait(WaitOutcome::Killed)?;
        self.state = TraceState::Destroyed;
        Ok(())
    }

    /// Builds a fatal error for `reason`, with a register dump if the
    /// registers can still be read.
    pub fn dump_and_fatal(&self, reason: String) -> Error {
        FatalError::WithRegisters {
            tid: self.tid,
            reason,
            regs: self.regs_dump(),
        }
        .into()
    }

    fn regs_dump(&self) -> String {
        match self.get_regs() {
            Ok(regs) => arch::dump_regs(&regs),
            Err(e) => {
                warn!("unable to get registers: {e}");
                String::new()
            }
        }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("tgid", &self.tgid)
            .field("tid", &self.tid)
            .field("stack_slot", &self.stack_slot)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
