use rustix::io::Errno;
use sysmsg::PtraceRegs;

use super::SyscallArgs;
use crate::utility::syscall::raw_return_value_to_result;

/// Length of the `syscall` instruction.
pub const SYSCALL_INSTRUCTION_LEN: u64 = 2;

/// Bytes of fp state the stub's handler saves (legacy fxsave area).
pub const FP_STATE_LEN: usize = 512;

const VSYSCALL_PAGE: u64 = 0xffff_ffff_ff60_0000;

pub fn set_syscall(regs: &mut PtraceRegs, sysno: u64, args: &SyscallArgs) {
    regs.rax = sysno;
    regs.orig_rax = sysno;
    regs.rdi = args[0];
    regs.rsi = args[1];
    regs.rdx = args[2];
    regs.r10 = args[3];
    regs.r8 = args[4];
    regs.r9 = args[5];
}

pub fn syscall_number(regs: &PtraceRegs) -> u64 {
    regs.orig_rax
}

pub fn syscall_arg(regs: &PtraceRegs, i: usize) -> u64 {
    match i {
        0 => regs.rdi,
        1 => regs.rsi,
        2 => regs.rdx,
        3 => regs.r10,
        4 => regs.r8,
        5 => regs.r9,
        _ => panic!("syscall argument {i} out of range"),
    }
}

pub fn syscall_return_value(regs: &PtraceRegs) -> Result<u64, Errno> {
    raw_return_value_to_result(regs.rax)
}

pub fn set_return_value(regs: &mut PtraceRegs, val: u64) {
    regs.rax = val;
}

pub fn ip(regs: &PtraceRegs) -> u64 {
    regs.rip
}

pub fn set_ip(regs: &mut PtraceRegs, ip: u64) {
    regs.rip = ip;
}

pub fn stack_pointer(regs: &PtraceRegs) -> u64 {
    regs.rsp
}

pub fn set_stack_pointer(regs: &mut PtraceRegs, sp: u64) {
    regs.rsp = sp;
}

/// Segment registers of a guest must match the stub's; the guest has no say
/// in them.
pub fn reset_sysemu_regs(regs: &mut PtraceRegs, init: &PtraceRegs) {
    regs.cs = init.cs;
    regs.ss = init.ss;
    regs.ds = init.ds;
    regs.es = init.es;
    regs.fs = init.fs;
    regs.gs = init.gs;
}

/// After a syscall trap the kernel has clobbered `rax`; the syscall number
/// survives in `orig_rax`.
pub fn update_syscall_regs(regs: &mut PtraceRegs) {
    regs.rax = regs.orig_rax;
}

/// A syscall issued from the vsyscall page is not a real syscall; it has to
/// be reported as a fault at that address so it can be emulated.
pub fn maybe_patch_signal_info(regs: &PtraceRegs, info: &mut libc::siginfo_t) -> bool {
    if regs.rip & !(sysmsg::PAGE_SIZE - 1) != VSYSCALL_PAGE {
        return false;
    }
    super::set_segv(info, regs.rip, super::SEGV_MAPERR);
    true
}

pub fn dump_regs(regs: &PtraceRegs) -> String {
    let named = [
        ("rax", regs.rax),
        ("rbx", regs.rbx),
        ("rcx", regs.rcx),
        ("rdx", regs.rdx),
        ("rsi", regs.rsi),
        ("rdi", regs.rdi),
        ("orig_rax", regs.orig_rax),
        ("rbp", regs.rbp),
        ("rsp", regs.rsp),
        ("r8", regs.r8),
        ("r9", regs.r9),
        ("r10", regs.r10),
        ("r11", regs.r11),
        ("r12", regs.r12),
        ("r13", regs.r13),
        ("r14", regs.r14),
        ("r15", regs.r15),
        ("rip", regs.rip),
        ("eflags", regs.eflags),
        ("cs", regs.cs),
        ("ss", regs.ss),
        ("fs_base", regs.fs_base),
        ("gs_base", regs.gs_base),
    ];
    let mut out = String::from("Registers:\n");
    for (name, val) in named {
        out.push_str(&format!("\t{name:<8} = {val:016x}\n"));
    }
    out
}
