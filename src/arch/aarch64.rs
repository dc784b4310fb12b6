use rustix::io::Errno;
use sysmsg::PtraceRegs;

use super::SyscallArgs;
use crate::utility::syscall::raw_return_value_to_result;

/// Length of the `svc #0` instruction.
pub const SYSCALL_INSTRUCTION_LEN: u64 = 4;

/// Bytes of fp state the stub's handler saves (`fpsimd_context`).
pub const FP_STATE_LEN: usize = 528;

pub fn set_syscall(regs: &mut PtraceRegs, sysno: u64, args: &SyscallArgs) {
    regs.regs[8] = sysno;
    regs.regs[..6].copy_from_slice(args);
}

pub fn syscall_number(regs: &PtraceRegs) -> u64 {
    regs.regs[8]
}

pub fn syscall_arg(regs: &PtraceRegs, i: usize) -> u64 {
    assert!(i < 6, "syscall argument {i} out of range");
    regs.regs[i]
}

pub fn syscall_return_value(regs: &PtraceRegs) -> Result<u64, Errno> {
    raw_return_value_to_result(regs.regs[0])
}

pub fn set_return_value(regs: &mut PtraceRegs, val: u64) {
    regs.regs[0] = val;
}

pub fn ip(regs: &PtraceRegs) -> u64 {
    regs.pc
}

pub fn set_ip(regs: &mut PtraceRegs, ip: u64) {
    regs.pc = ip;
}

pub fn stack_pointer(regs: &PtraceRegs) -> u64 {
    regs.sp
}

pub fn set_stack_pointer(regs: &mut PtraceRegs, sp: u64) {
    regs.sp = sp;
}

pub fn reset_sysemu_regs(_regs: &mut PtraceRegs, _init: &PtraceRegs) {}

pub fn update_syscall_regs(_regs: &mut PtraceRegs) {}

pub fn maybe_patch_signal_info(_regs: &PtraceRegs, _info: &mut libc::siginfo_t) -> bool {
    false
}

pub fn dump_regs(regs: &PtraceRegs) -> String {
    let mut out = String::from("Registers:\n");
    for (i, val) in regs.regs.iter().enumerate() {
        out.push_str(&format!("\tx{i:<7} = {val:016x}\n"));
    }
    out.push_str(&format!("\tsp       = {:016x}\n", regs.sp));
    out.push_str(&format!("\tpc       = {:016x}\n", regs.pc));
    out.push_str(&format!("\tpstate   = {:016x}\n", regs.pstate));
    out
}
