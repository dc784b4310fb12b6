//! Per-architecture register conventions needed to inject syscalls into a
//! tracee and to interpret the registers a stub hands back.

use sysmsg::PtraceRegs;

use crate::error::{Error, Result};

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "x86_64")]
mod x86_64;

#[cfg(target_arch = "aarch64")]
pub use aarch64::*;
#[cfg(target_arch = "x86_64")]
pub use x86_64::*;

/// Arguments to an injected syscall. Unused trailing arguments are zero.
pub type SyscallArgs = [u64; 6];

/// Builds `args` into a syscall argument array, padding with zeros.
pub fn syscall_args(args: &[u64]) -> Result<SyscallArgs> {
    let mut out = SyscallArgs::default();
    out.get_mut(..args.len())
        .ok_or(Error::TooManySyscallArgs(args.len()))?
        .copy_from_slice(args);
    Ok(out)
}

/// A copy of `init` set up to execute syscall `sysno` with `args` at the
/// syscall instruction `init` points at.
pub fn syscall_regs(init: &PtraceRegs, sysno: i64, args: &[u64]) -> Result<PtraceRegs> {
    let mut regs = *init;
    set_syscall(&mut regs, sysno as u64, &syscall_args(args)?);
    Ok(regs)
}

/// `si_code` of a fault on an address with no mapping.
pub const SEGV_MAPERR: i32 = 1;

/// View of the fault fields of a `siginfo_t`, which libc only exposes
/// read-only.
#[repr(C)]
struct SigfaultInfo {
    signo: i32,
    errno: i32,
    code: i32,
    _pad: i32,
    addr: u64,
}

static_assertions::const_assert!(
    core::mem::size_of::<SigfaultInfo>() <= core::mem::size_of::<libc::siginfo_t>()
);
static_assertions::const_assert!(
    core::mem::align_of::<SigfaultInfo>() <= core::mem::align_of::<libc::siginfo_t>()
);

/// Rewrites `info` into a `SIGSEGV` fault at `addr`.
pub fn set_segv(info: &mut libc::siginfo_t, addr: u64, code: i32) {
    // SAFETY: SigfaultInfo matches the layout of the signo/errno/code header
    // and of the `sigfault` member of the union, and fits within siginfo_t.
    let fault = unsafe { &mut *(info as *mut libc::siginfo_t).cast::<SigfaultInfo>() };
    fault.signo = libc::SIGSEGV;
    fault.errno = 0;
    fault.code = code;
    fault.addr = addr;
}

/// A zeroed `siginfo_t` carrying only `signo`.
pub fn signal_info(signo: i32) -> libc::siginfo_t {
    // SAFETY: all-zero is a valid siginfo_t.
    let mut info: libc::siginfo_t = unsafe { core::mem::zeroed() };
    info.si_signo = signo;
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_segv() {
        let mut info = signal_info(libc::SIGSYS);
        set_segv(&mut info, 0xdead_b000, SEGV_MAPERR);
        assert_eq!(info.si_signo, libc::SIGSEGV);
        assert_eq!(info.si_code, SEGV_MAPERR);
        assert_eq!(unsafe { info.si_addr() } as u64, 0xdead_b000);
    }

    #[test]
    fn test_syscall_regs_roundtrip() {
        // SAFETY: all-zero is a valid register block.
        let init: PtraceRegs = unsafe { core::mem::zeroed() };
        let regs = syscall_regs(&init, libc::SYS_munmap, &[0x1000, 0x2000]).unwrap();
        assert_eq!(syscall_number(&regs), libc::SYS_munmap as u64);
        assert_eq!(syscall_arg(&regs, 0), 0x1000);
        assert_eq!(syscall_arg(&regs, 1), 0x2000);
        assert_eq!(syscall_arg(&regs, 5), 0);
    }

    #[test]
    fn test_return_value_is_read_back() {
        let init: PtraceRegs = unsafe { core::mem::zeroed() };
        let mut regs = syscall_regs(&init, libc::SYS_mmap, &[]).unwrap();
        set_return_value(&mut regs, -(libc::EINVAL as i64) as u64);
        assert_eq!(
            syscall_return_value(&regs),
            Err(rustix::io::Errno::INVAL)
        );
    }

    #[test]
    fn test_too_many_syscall_args() {
        assert_eq!(syscall_args(&[1, 2, 3, 4, 5, 6]).unwrap(), [1, 2, 3, 4, 5, 6]);
        let init: PtraceRegs = unsafe { core::mem::zeroed() };
        assert!(matches!(
            syscall_regs(&init, libc::SYS_mmap, &[0; 7]),
            Err(Error::TooManySyscallArgs(7))
        ));
    }
}
