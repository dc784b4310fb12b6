//! Interfaces between the supervisor and the rest of the sandbox: the memory
//! it allocates stub stacks from, the files guest memory is mapped from, the
//! syscall patch table, and the address-space operations it offers in return.

use std::ops::Range;
use std::os::fd::BorrowedFd;
use std::sync::{Condvar, Mutex};

use bitflags::bitflags;
use rustix::io::Errno;

use crate::error::{Error, Result};

/// A file whose ranges can be mapped into a stub.
pub trait MappableFile: Send + Sync {
    fn fd(&self) -> BorrowedFd<'_>;
}

/// Page allocator backing the memory shared between supervisor and stubs.
pub trait MemoryFile: MappableFile {
    /// Allocates `len` bytes, returning the file range.
    fn allocate(&self, len: u64) -> std::result::Result<Range<u64>, Errno>;

    /// Drops the reference taken by [`MemoryFile::allocate`].
    fn dec_ref(&self, range: Range<u64>);
}

/// The syscall patch table of a subprocess. Forking an address space must not
/// observe a half-applied patch, so the table is locked across a fork.
pub trait PatchTable: Send + Sync {
    fn pre_fork(&self);
    fn post_fork(&self);
}

/// A [`PatchTable`] that applies no patches and only provides the fork lock.
#[derive(Debug, Default)]
pub struct ForkLock {
    forking: Mutex<bool>,
    cond: Condvar,
}

impl ForkLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self) -> bool {
        *self.forking.lock().unwrap()
    }
}

impl PatchTable for ForkLock {
    fn pre_fork(&self) {
        let mut forking = self.forking.lock().unwrap();
        while *forking {
            forking = self.cond.wait(forking).unwrap();
        }
        *forking = true;
    }

    fn post_fork(&self) {
        let mut forking = self.forking.lock().unwrap();
        assert!(*forking, "post_fork without pre_fork");
        *forking = false;
        self.cond.notify_one();
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct AccessType: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl AccessType {
    pub fn prot(&self) -> i32 {
        let mut prot = libc::PROT_NONE;
        if self.contains(AccessType::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(AccessType::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(AccessType::EXECUTE) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

/// Where the stub lives in every stub address space.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StubLayout {
    /// The stub occupies `[stub_start, stub_end)`, including the sysmsg area.
    pub stub_start: u64,
    pub stub_end: u64,
    /// Base of the per-thread windows (see [`sysmsg::per_thread_mem_addr`]).
    pub sysmsg_base: u64,
    /// Address of the stub's signal handler.
    pub sighandler_addr: u64,
    /// Address of the `rt_sigreturn` trampoline used as `sa_restorer`.
    pub restorer_addr: u64,
    /// Address of the handler that takes control once a message is
    /// dispatched.
    pub syshandler_addr: u64,
    /// Address of the `sock_fprog` describing the precompiled filter.
    pub seccomp_program_addr: u64,
    pub max_user_address: u64,
}

impl StubLayout {
    /// Ranges of the address space that don't belong to the stub.
    pub fn guest_ranges(&self) -> impl Iterator<Item = Range<u64>> {
        let low = 0..self.stub_start;
        let high = self.stub_end..self.max_user_address;
        [low, high].into_iter().filter(|r| !r.is_empty())
    }

    pub fn per_thread_mem_addr(&self, slot: u64) -> u64 {
        sysmsg::per_thread_mem_addr(self.sysmsg_base, slot)
    }
}

/// The address-space mutation contract offered to the sandbox kernel.
pub trait AddressSpace {
    /// Maps `range` of `file` at `addr`, shared and fixed.
    fn map_file(
        &self,
        addr: u64,
        file: &dyn MappableFile,
        range: Range<u64>,
        access: AccessType,
        precommit: bool,
    ) -> Result<()>;

    fn unmap(&self, addr: u64, len: u64) -> Result<()>;

    fn pre_fork(&self);

    fn post_fork(&self);

    /// Gives up the address space. It may be reused once idle.
    fn release(&self);
}

/// Direct access to the memory of an address space. Every method fails with
/// [`Error::Unsupported`] unless an implementation opts in.
pub trait AddressSpaceIo {
    fn copy_out(&self, _addr: u64, _src: &[u8]) -> Result<usize> {
        Err(Error::Unsupported("copy_out"))
    }

    fn copy_in(&self, _addr: u64, _dst: &mut [u8]) -> Result<usize> {
        Err(Error::Unsupported("copy_in"))
    }

    fn zero_out(&self, _addr: u64, _len: u64) -> Result<u64> {
        Err(Error::Unsupported("zero_out"))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_prot() {
        assert_eq!(AccessType::empty().prot(), libc::PROT_NONE);
        assert_eq!(
            (AccessType::READ | AccessType::WRITE).prot(),
            libc::PROT_READ | libc::PROT_WRITE
        );
        assert_eq!(
            AccessType::all().prot(),
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC
        );
    }

    fn layout(stub_start: u64, stub_end: u64, max: u64) -> StubLayout {
        StubLayout {
            stub_start,
            stub_end,
            sysmsg_base: stub_start,
            sighandler_addr: 0,
            restorer_addr: 0,
            syshandler_addr: 0,
            seccomp_program_addr: 0,
            max_user_address: max,
        }
    }

    #[test]
    fn test_guest_ranges() {
        let ranges: Vec<_> = layout(0x7000, 0x9000, 0x10000).guest_ranges().collect();
        assert_eq!(ranges, vec![0..0x7000, 0x9000..0x10000]);

        // Stub at the very top of the address space.
        let ranges: Vec<_> = layout(0x7000, 0x10000, 0x10000).guest_ranges().collect();
        assert_eq!(ranges, vec![0..0x7000]);
    }

    #[test]
    fn test_fork_lock_excludes() {
        let lock = Arc::new(ForkLock::new());
        lock.pre_fork();
        assert!(lock.is_held());

        let waiter = {
            let lock = lock.clone();
            std::thread::spawn(move || {
                lock.pre_fork();
                lock.post_fork();
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(lock.is_held());
        lock.post_fork();
        waiter.join().unwrap();
        assert!(!lock.is_held());
    }

    struct NoIo;
    impl AddressSpaceIo for NoIo {}

    #[test]
    fn test_io_unsupported() {
        let mut buf = [0u8; 4];
        assert!(matches!(NoIo.copy_in(0, &mut buf), Err(Error::Unsupported("copy_in"))));
        assert!(matches!(NoIo.copy_out(0, &buf), Err(Error::Unsupported("copy_out"))));
        assert!(matches!(NoIo.zero_out(0, 4), Err(Error::Unsupported("zero_out"))));
    }
}
