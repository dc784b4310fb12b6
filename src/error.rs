//! Errors are split in two: [`FatalError`]s mean the supervisor can no longer
//! vouch for the state of a tracee or of the shared message, and must never be
//! recovered from; everything else in [`Error`] is an ordinary failure the
//! caller can handle.

use rustix::io::Errno;

use crate::subprocess::thread::TraceState;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("fatal: {0}")]
    Fatal(#[from] FatalError),
    /// An injected syscall failed. The errno is the one the tracee saw.
    #[error("injected syscall failed: {0}")]
    Syscall(Errno),
    #[error("a syscall takes at most 6 arguments, got {0}")]
    TooManySyscallArgs(usize),
    #[error("no free stack slots")]
    StackSlotsExhausted,
    #[error(transparent)]
    BadFpuStateOffset(#[from] sysmsg::FpuStateOffsetError),
    #[error("subprocess pool has been drained")]
    PoolDrained,
    #[error("no source subprocess to fork stubs from")]
    NoSourceSubprocess,
    #[error("{0} is not supported by this address space")]
    Unsupported(&'static str),
}

impl Error {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("ptrace {op} on thread {tid} failed: {errno}")]
    Ptrace {
        tid: i32,
        op: &'static str,
        errno: Errno,
    },
    #[error("wait on thread {tid} failed: {errno}")]
    Wait { tid: i32, errno: Errno },
    #[error("unexpected stop of thread {tid}: status {status:#x}")]
    UnexpectedStop { tid: i32, status: i32 },
    #[error("{op} on thread {tid} in state {state:?}")]
    WrongTraceState {
        tid: i32,
        op: &'static str,
        state: TraceState,
    },
    #[error("stub thread {tid} exited unexpectedly: status {status:#x}")]
    StubExited { tid: i32, status: i32 },
    #[error("unknown message type {raw} from stub thread {tid}")]
    UnknownEventType { tid: i32, raw: u32 },
    #[error("stub thread {tid} failed: err {err} line {line}")]
    StubError { tid: i32, err: i32, line: i32 },
    #[error(transparent)]
    InvalidThreadState(#[from] sysmsg::InvalidThreadState),
    #[error("injected {name} into thread {tid} failed: {errno}")]
    InjectedSyscall {
        tid: i32,
        name: &'static str,
        errno: Errno,
    },
    #[error("unable to unmap {addr:#x} + {len:#x}: {errno}")]
    UnmapFailed { addr: u64, len: u64, errno: Errno },
    #[error("addr {addr:#x} + length {len:#x} overflows")]
    RangeOverflow { addr: u64, len: u64 },
    #[error("unable to allocate stub stack memory: {0}")]
    StackAllocation(Errno),
    #[error("{op} failed on the supervisor side: {errno}")]
    Host { op: &'static str, errno: Errno },
    #[error("control-plane worker of subprocess {0} is gone")]
    ControlPlaneGone(u64),
    #[error("thread {tid}: {reason}\n{regs}")]
    WithRegisters {
        tid: i32,
        reason: String,
        regs: String,
    },
}

/// The single exit for fatal errors: log, flush, abort.
pub fn abort_on_fatal(err: FatalError) -> ! {
    log::error!("{err}");
    crate::core::logger::flush();
    std::process::abort()
}

/// Routes a fatal error to [`abort_on_fatal`] and passes everything else
/// through. Public entry points call this on their way out.
pub fn escalate<T>(res: Result<T>) -> Result<T> {
    match res {
        Err(Error::Fatal(e)) => abort_on_fatal(e),
        res => res,
    }
}

#[cfg(test)]
mod tests {
    use nix::sys::signal::Signal;
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult};

    use super::*;

    #[test]
    fn test_recoverable_errors_pass_through() {
        let res: Result<()> = escalate(Err(Error::Syscall(Errno::NOMEM)));
        assert!(matches!(res, Err(Error::Syscall(Errno::NOMEM))));
        assert!(!Error::StackSlotsExhausted.is_fatal());
        assert!(escalate(Ok(3)).is_ok());
    }

    #[test]
    fn test_fatal_error_aborts() {
        let child = match unsafe { fork() }.unwrap() {
            ForkResult::Parent { child } => child,
            ForkResult::Child => {
                let _: Result<()> = escalate(Err(FatalError::UnknownEventType {
                    tid: 1,
                    raw: 99,
                }
                .into()));
                unsafe { libc::_exit(0) }
            }
        };
        assert!(matches!(
            waitpid(child, None).unwrap(),
            WaitStatus::Signaled(pid, Signal::SIGABRT, _) if pid == child
        ));
    }

    #[test]
    fn test_messages() {
        let err: Error = FatalError::StubError {
            tid: 12,
            err: -14,
            line: 300,
        }
        .into();
        assert!(err.is_fatal());
        assert_eq!(
            err.to_string(),
            "fatal: stub thread 12 failed: err -14 line 300"
        );
    }
}
