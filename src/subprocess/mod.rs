//! Stub processes, each hosting one guest address space.
//!
//! A [`Subprocess`] owns a traced stub process, its control-plane
//! [`syscall_thread::SyscallThread`], the stack slots of its stub threads and
//! the set of [`Context`]s bound to it. Subprocesses are never torn down while
//! in service; once released and idle they return to the
//! [`pool::SubprocessPool`] for reuse.

use std::collections::HashMap;
use std::ops::Range;
use std::os::fd::AsRawFd;
use std::sync::{Arc, Mutex, Weak};

use log::{debug, warn};

use crate::error::{escalate, Error, FatalError, Result};
use crate::platform::{
    AccessType, AddressSpace, AddressSpaceIo, MappableFile, MemoryFile, PatchTable, StubLayout,
};
use crate::utility::stack_slot_pool::StackSlotPool;

use context::{Context, ContextId, ContextShared};
use pool::{PoolParams, SubprocessPool};
use syscall_thread::SyscallThread;
use sysmsg_thread::SysmsgThread;
use thread::Thread;

pub mod context;
pub mod interrupt;
pub mod pool;
pub mod syscall_thread;
pub mod sysmsg_thread;
pub mod thread;

pub type SubprocessId = u64;

/// How the guest left a [`Subprocess::switch_to_app`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AppExit {
    /// The guest made a syscall. If `patchable`, its syscall instruction may
    /// be rewritten into a direct call.
    Syscall { patchable: bool },
    /// The guest got a signal; the signal info is in the context.
    Signal,
}

struct SubprocessInner {
    released: bool,
    /// Contexts bound to this subprocess.
    contexts: HashMap<ContextId, Arc<ContextShared>>,
    stack_slots: StackSlotPool,
}

pub struct Subprocess {
    id: SubprocessId,
    pool: Weak<SubprocessPool>,
    inner: Mutex<SubprocessInner>,
    syscall_thread: SyscallThread,
    patch_table: Box<dyn PatchTable>,
    memory_file: Arc<dyn MemoryFile>,
    layout: StubLayout,
    dispatch_spin: u32,
}

impl Subprocess {
    /// Takes over the stub process whose first thread is `thread`, which
    /// must be detached. It becomes the control-plane thread.
    pub(crate) fn new(
        id: SubprocessId,
        thread: Thread,
        pool: Weak<SubprocessPool>,
        params: &PoolParams,
    ) -> Arc<Self> {
        let syscall_thread = SyscallThread::spawn(thread, id, params.config.control_plane_cpu);
        Arc::new(Self {
            id,
            pool,
            inner: Mutex::new(SubprocessInner {
                released: false,
                contexts: HashMap::new(),
                stack_slots: StackSlotPool::new(params.config.max_guest_threads.into()),
            }),
            syscall_thread,
            patch_table: (params.patch_table)(),
            memory_file: params.memory_file.clone(),
            layout: params.layout,
            dispatch_spin: params.config.dispatch_spin_iterations,
        })
    }

    pub fn id(&self) -> SubprocessId {
        self.id
    }

    pub fn stub_pid(&self) -> i32 {
        self.syscall_thread.tgid()
    }

    pub fn layout(&self) -> &StubLayout {
        &self.layout
    }

    pub fn memory_file(&self) -> &Arc<dyn MemoryFile> {
        &self.memory_file
    }

    pub(crate) fn dispatch_spin(&self) -> u32 {
        self.dispatch_spin
    }

    pub fn is_released(&self) -> bool {
        self.inner.lock().unwrap().released
    }

    pub fn active_contexts(&self) -> usize {
        self.inner.lock().unwrap().contexts.len()
    }

    pub fn stack_slots_in_use(&self) -> u64 {
        self.inner.lock().unwrap().stack_slots.in_use()
    }

    /// Injects `sysno(args)` through the control-plane thread.
    pub fn syscall(&self, sysno: i64, args: &[u64]) -> Result<u64> {
        escalate(self.syscall_thread.syscall(sysno, args))
    }

    /// Removes every mapping outside the stub, so a reused subprocess never
    /// exposes memory of a previous guest.
    pub(crate) fn unmap_guest_memory(&self) -> Result<()> {
        for range in self.layout.guest_ranges() {
            self.unmap_range(range.start, range.end - range.start)?;
        }
        Ok(())
    }

    /// A new thread in the stub, attached to the calling thread and holding
    /// a stack slot. The caller becomes its tracer, so it must keep driving
    /// it from the same OS thread.
    pub fn new_thread(&self) -> Result<Thread> {
        escalate(self.new_thread_inner())
    }

    pub(crate) fn new_thread_inner(&self) -> Result<Thread> {
        let slot = self.take_stack_slot().ok_or(Error::StackSlotsExhausted)?;
        let mut thread = match self.syscall_thread.request_thread() {
            Ok(thread) => thread,
            Err(e) => {
                self.put_stack_slot(slot);
                return Err(e);
            }
        };
        thread.set_stack_slot(Some(slot));
        if let Err(e) = thread.attach() {
            self.put_stack_slot(slot);
            return Err(e);
        }
        Ok(thread)
    }

    /// Forks a new stub process from this one.
    pub fn request_stub(&self) -> Result<Thread> {
        escalate(self.syscall_thread.request_stub())
    }

    pub(crate) fn take_stack_slot(&self) -> Option<u64> {
        self.inner.lock().unwrap().stack_slots.get()
    }

    pub(crate) fn put_stack_slot(&self, slot: u64) {
        self.inner.lock().unwrap().stack_slots.put(slot);
    }

    /// Clears the cached fault of every bound context whose address is in
    /// `range`.
    pub(crate) fn forget_faults_in(&self, range: &Range<u64>) {
        let inner = self.inner.lock().unwrap();
        for shared in inner.contexts.values() {
            if shared.forget_fault_in(self.id, range) {
                debug!(
                    "Forgot fault of context {} in {:#x}..{:#x}",
                    shared.id(),
                    range.start,
                    range.end
                );
            }
        }
    }

    fn unmap_range(&self, addr: u64, len: u64) -> Result<()> {
        let end = addr
            .checked_add(len)
            .ok_or(FatalError::RangeOverflow { addr, len })?;
        // A fault cached in the range would look like a repeat once something
        // else is mapped there.
        self.forget_faults_in(&(addr..end));
        match self.syscall_thread.syscall(libc::SYS_munmap, &[addr, len]) {
            Ok(_) => Ok(()),
            Err(Error::Syscall(errno)) => Err(FatalError::UnmapFailed { addr, len, errno }.into()),
            Err(e) => Err(e),
        }
    }

    fn map_file_range(
        &self,
        addr: u64,
        file: &dyn MappableFile,
        range: Range<u64>,
        access: AccessType,
        precommit: bool,
    ) -> Result<()> {
        let mut flags = libc::MAP_SHARED | libc::MAP_FIXED;
        if precommit {
            flags |= libc::MAP_POPULATE;
        }
        self.syscall_thread.syscall(
            libc::SYS_mmap,
            &[
                addr,
                range.end - range.start,
                access.prot() as u64,
                flags as u64,
                file.fd().as_raw_fd() as u64,
                range.start,
            ],
        )?;
        Ok(())
    }

    /// The stub thread for `slot`'s context: the existing one if it belongs
    /// to this subprocess, otherwise a new one, started with `regs`.
    fn get_sysmsg_thread<'a>(
        self: &Arc<Self>,
        slot: &'a mut Option<SysmsgThread>,
        regs: &sysmsg::PtraceRegs,
    ) -> Result<&'a mut SysmsgThread> {
        let thread = match slot.take() {
            Some(thread) if Arc::ptr_eq(thread.subprocess(), self) => thread,
            stale => {
                if let Some(thread) = stale {
                    thread.destroy();
                }
                SysmsgThread::start(self, regs)?
            }
        };
        Ok(slot.insert(thread))
    }

    /// Runs `ctx` in this subprocess until it makes a syscall or gets a
    /// signal.
    ///
    /// Blocks for as long as the guest runs; [`Context::interrupt`] from
    /// another thread gets it out.
    pub fn switch_to_app(self: &Arc<Self>, ctx: &mut Context) -> Result<AppExit> {
        escalate(self.switch_to_app_inner(ctx))
    }

    fn switch_to_app_inner(self: &Arc<Self>, ctx: &mut Context) -> Result<AppExit> {
        ctx.bind(self);
        let shared = ctx.shared().clone();
        let thread = self.get_sysmsg_thread(&mut ctx.sysmsg_thread, &ctx.state.regs)?;
        thread.switch_to_app(&mut ctx.state, shared.interrupt(), self.dispatch_spin)
    }

    pub(crate) fn register_context(&self, shared: &Arc<ContextShared>) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(!inner.released, "binding to released subprocess {}", self.id);
        inner.contexts.insert(shared.id(), shared.clone());
    }

    /// Removes a bound context. The last context leaving a released
    /// subprocess hands it back to the pool.
    pub(crate) fn unregister_context(&self, id: ContextId) {
        let reclaim = {
            let mut inner = self.inner.lock().unwrap();
            inner.contexts.remove(&id);
            inner.released && inner.contexts.is_empty()
        };
        if reclaim {
            if let Some(pool) = self.pool.upgrade() {
                pool.release(self);
            }
        }
    }

    pub(crate) fn note_fault(&self, shared: &ContextShared, addr: u64) -> bool {
        // Serialized with `forget_faults_in`.
        let _inner = self.inner.lock().unwrap();
        shared.record_fault(self.id, addr)
    }

    /// Marks the subprocess released. Returns whether it's also idle.
    pub(crate) fn mark_released(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.released = true;
        inner.contexts.is_empty()
    }

    pub(crate) fn mark_in_use(&self) {
        self.inner.lock().unwrap().released = false;
    }

    fn release_inner(&self) -> Result<()> {
        self.unmap_guest_memory()?;
        match self.pool.upgrade() {
            Some(pool) => pool.release(self),
            None => {
                self.mark_released();
            }
        }
        Ok(())
    }

    pub(crate) fn kill_stub(&self) {
        self.syscall_thread.kill_stub();
    }
}

impl AddressSpace for Subprocess {
    fn map_file(
        &self,
        addr: u64,
        file: &dyn MappableFile,
        range: Range<u64>,
        access: AccessType,
        precommit: bool,
    ) -> Result<()> {
        escalate(self.map_file_range(addr, file, range, access, precommit))
    }

    fn unmap(&self, addr: u64, len: u64) -> Result<()> {
        escalate(self.unmap_range(addr, len))
    }

    fn pre_fork(&self) {
        self.patch_table.pre_fork();
    }

    fn post_fork(&self) {
        self.patch_table.post_fork();
    }

    fn release(&self) {
        if let Err(e) = escalate(self.release_inner()) {
            warn!("Couldn't release subprocess {}: {e}", self.id);
        }
    }
}

impl AddressSpaceIo for Subprocess {}

impl std::fmt::Debug for Subprocess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("Subprocess")
            .field("id", &self.id)
            .field("stub_pid", &self.stub_pid())
            .field("released", &inner.released)
            .field("contexts", &inner.contexts.len())
            .finish_non_exhaustive()
    }
}
