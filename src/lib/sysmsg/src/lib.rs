//! The shared-memory message used to hand control back and forth between the
//! supervisor and a stub thread running under a seccomp filter.
//!
//! Each stub thread owns one per-thread window of memory inside the stub's
//! sysmsg area (indexed by its stack slot). The first part of the window is a
//! stack that is *shared* with the supervisor; the [`Message`] sits in the last
//! page of that shared stack. The rest of the window is a private stack used
//! by the stub's signal handler.
//!
//! ```text
//! per_thread_mem_addr(slot)
//! |<------------- shared stack ------------->|<-- private stack -->|
//! |   signal frames (fp state) ...  | Message |                    |
//! ```
//!
//! The two sides never write the message concurrently. Ownership of everything
//! except the atomic words is decided by [`Message::state`]:
//!
//! * [`ThreadState::Done`]: the stub has yielded; the supervisor owns the
//!   message.
//! * [`ThreadState::Dispatched`]: the supervisor has published registers; the
//!   stub owns the message until it resumes the guest.
//! * [`ThreadState::None`]: the guest is runnable or running.
//!
//! A round-trip is therefore `Done -> Dispatched -> None -> Done`.

// https://github.com/rust-lang/rfcs/blob/master/text/2585-unsafe-block-in-unsafe-fn.md
#![deny(unsafe_op_in_unsafe_fn)]

pub mod sync;

use core::cell::UnsafeCell;
use core::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};
#[cfg(not(loom))]
use static_assertions::{const_assert, const_assert_eq};

use crate::sync::{AtomicU32, Ordering};

/// Register block as read and written by `PTRACE_{GET,SET}REGSET(NT_PRSTATUS)`.
pub type PtraceRegs = libc::user_regs_struct;

pub const PAGE_SIZE: u64 = 4096;

pub const PER_THREAD_SHARED_STACK_OFFSET: u64 = 0;
pub const PER_THREAD_SHARED_STACK_SIZE: u64 = 16 * PAGE_SIZE;
pub const PER_THREAD_PRIVATE_STACK_OFFSET: u64 =
    PER_THREAD_SHARED_STACK_OFFSET + PER_THREAD_SHARED_STACK_SIZE;
pub const PER_THREAD_PRIVATE_STACK_SIZE: u64 = 4 * PAGE_SIZE;
/// Size of the window reserved for each stack slot.
pub const PER_THREAD_MEM_SIZE: u64 = PER_THREAD_PRIVATE_STACK_OFFSET + PER_THREAD_PRIVATE_STACK_SIZE;

/// The message occupies the last page of the shared stack.
pub const MSG_OFFSET_FROM_SHARED_STACK: u64 = PER_THREAD_SHARED_STACK_SIZE - PAGE_SIZE;

/// Syscall number the stub dispatcher issues to force a controlled re-trap.
/// Guaranteed to be rejected by the filter and to match no real syscall.
pub const SENTINEL_SYSCALL_NUMBER: u64 = 0x7fff_ffff;

/// Start of the window for `slot`, given the base of the stub's sysmsg area.
pub fn per_thread_mem_addr(sysmsg_base: u64, slot: u64) -> u64 {
    sysmsg_base + slot * PER_THREAD_MEM_SIZE
}

/// Address of the message inside a shared stack starting at `stack_addr`.
pub fn stack_addr_to_msg(stack_addr: u64) -> u64 {
    stack_addr + MSG_OFFSET_FROM_SHARED_STACK
}

/// Initial stack pointer of the stub's handler, i.e. the top of the private
/// stack of the window starting at `per_thread_mem_addr`.
pub fn stack_addr_to_syshandler_stack(per_thread_mem_addr: u64) -> u64 {
    per_thread_mem_addr + PER_THREAD_PRIVATE_STACK_OFFSET + PER_THREAD_PRIVATE_STACK_SIZE
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum ThreadState {
    None = 0,
    Done = 1,
    Dispatched = 2,
}

/// Why the stub yielded.
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum EventType {
    /// A syscall rejected by the filter.
    Syscall = 1,
    /// A syscall re-issued by the stub dispatcher with the sentinel number.
    SyscallTrap = 2,
    /// A syscall whose instruction may be rewritten into a direct call.
    SyscallCanBePatched = 3,
    /// A memory or other synchronous fault; also used for signals.
    Fault = 4,
    /// Set by the dispatcher when it observes [`Message::interrupt_pending`]
    /// before re-triggering a trap. Never reported to the supervisor.
    Interrupt = 5,
}

/// The state word held a value outside [`ThreadState`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct InvalidThreadState(pub u32);

impl fmt::Display for InvalidThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid sysmsg thread state {:#x}", self.0)
    }
}

impl std::error::Error for InvalidThreadState {}

/// The reported fp state location does not lie inside the shared stack.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FpuStateOffsetError {
    pub offset: i64,
    pub len: usize,
}

impl fmt::Display for FpuStateOffsetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fp state at message{:+#x} (len {:#x}) is outside the shared stack",
            self.offset, self.len
        )
    }
}

impl std::error::Error for FpuStateOffsetError {}

/// Payload of a [`Message`]. Only the side that currently owns the message
/// (see the crate documentation) may read or write it.
#[derive(Copy, Clone)]
#[repr(C)]
pub struct MessageBody {
    /// Address of the message as seen by the stub.
    pub self_addr: u64,
    /// Entry point of the stub's handler.
    pub syshandler: u64,
    /// Initial stack pointer of the stub's handler.
    pub syshandler_stack: u64,
    /// Return address saved by the dispatcher.
    pub app_stack: u64,
    /// Raw [`EventType`].
    pub event_type: u32,
    pub signo: i32,
    /// Non-zero if the stub hit an internal error.
    pub err: i32,
    /// Stub source line of `err`.
    pub line: i32,
    /// Byte offset, relative to the message, of the fp state saved by the
    /// stub's handler.
    pub fpstate: i64,
    pub tls: u64,
    pub regs: PtraceRegs,
    pub siginfo: libc::siginfo_t,
}

impl MessageBody {
    pub fn zeroed() -> Self {
        // SAFETY: every field is a plain integer or a struct of plain integers.
        unsafe { core::mem::zeroed() }
    }

    pub fn event_type(&self) -> Result<EventType, u32> {
        EventType::try_from(self.event_type).map_err(|e| e.number)
    }

    pub fn set_event_type(&mut self, event_type: EventType) {
        self.event_type = event_type.into();
    }

    /// Validates the fp state location reported by the stub.
    ///
    /// The fp state is saved in a signal frame on the shared stack, so it must
    /// lie entirely below the message and above the bottom of the stack.
    pub fn fpu_state_offset(&self, len: usize) -> Result<i64, FpuStateOffsetError> {
        let offset = self.fpstate;
        let err = FpuStateOffsetError { offset, len };
        let Ok(len_i64) = i64::try_from(len) else {
            return Err(err);
        };
        let lowest = -(MSG_OFFSET_FROM_SHARED_STACK as i64);
        if offset < lowest || offset.checked_add(len_i64).map_or(true, |end| end > 0) {
            return Err(err);
        }
        Ok(offset)
    }
}

impl fmt::Debug for MessageBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBody")
            .field("self_addr", &format_args!("{:#x}", self.self_addr))
            .field("syshandler", &format_args!("{:#x}", self.syshandler))
            .field("syshandler_stack", &format_args!("{:#x}", self.syshandler_stack))
            .field("event_type", &self.event_type)
            .field("signo", &self.signo)
            .field("err", &self.err)
            .field("line", &self.line)
            .field("fpstate", &self.fpstate)
            .finish_non_exhaustive()
    }
}

/// See the crate documentation.
#[repr(C, align(64))]
pub struct Message {
    state: AtomicU32,
    interrupt: AtomicU32,
    fast_path: AtomicU32,
    _pad: u32,
    body: UnsafeCell<MessageBody>,
}

// SAFETY: access to `body` is serialized by the state machine on `state`.
unsafe impl Sync for Message {}
unsafe impl Send for Message {}

#[cfg(not(loom))]
const_assert!(core::mem::size_of::<Message>() as u64 <= PAGE_SIZE);
#[cfg(not(loom))]
const_assert_eq!(core::mem::offset_of!(Message, state), 0);
#[cfg(not(loom))]
const_assert_eq!(core::mem::offset_of!(Message, interrupt), 4);
#[cfg(not(loom))]
const_assert_eq!(core::mem::offset_of!(Message, fast_path), 8);
#[cfg(not(loom))]
const_assert_eq!(core::mem::offset_of!(Message, body), 16);
const_assert_eq!(core::mem::offset_of!(MessageBody, event_type), 32);
const_assert_eq!(core::mem::offset_of!(MessageBody, regs), 64);

impl Message {
    /// A message in the initial [`ThreadState::Done`] state: owned by the
    /// supervisor, stub not started yet.
    pub fn new() -> Self {
        Self {
            state: AtomicU32::new(ThreadState::Done.into()),
            interrupt: AtomicU32::new(0),
            fast_path: AtomicU32::new(0),
            _pad: 0,
            body: UnsafeCell::new(MessageBody::zeroed()),
        }
    }

    /// Initializes a message in place, e.g. inside freshly mapped shared memory.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for writes and suitably aligned, and nothing else
    /// may access the memory concurrently.
    pub unsafe fn init_at(ptr: *mut Message) {
        unsafe { ptr.write(Message::new()) }
    }

    pub fn state(&self) -> Result<ThreadState, InvalidThreadState> {
        let raw = self.state.load(Ordering::Acquire);
        ThreadState::try_from(raw).map_err(|_| InvalidThreadState(raw))
    }

    /// Publishes `state`, handing the message to the other side, and wakes
    /// any waiter.
    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state.into(), Ordering::Release);
        sync::futex_wake_all(&self.state).unwrap();
    }

    /// Blocks until the state word holds `target`.
    ///
    /// Busy-waits (yielding the CPU) for up to `spin` iterations before
    /// sleeping on the futex. There is no timeout; the only way out of a
    /// stuck wait is a signal delivered to the stub.
    pub fn wait_state(&self, target: ThreadState, spin: u32) -> Result<(), InvalidThreadState> {
        let mut spins = 0;
        loop {
            let raw = self.state.load(Ordering::Acquire);
            let state = ThreadState::try_from(raw).map_err(|_| InvalidThreadState(raw))?;
            if state == target {
                return Ok(());
            }
            if spins < spin {
                spins += 1;
                sync::sched_yield();
                continue;
            }
            match sync::futex_wait(&self.state, raw) {
                Ok(_) | Err(rustix::io::Errno::INTR) | Err(rustix::io::Errno::AGAIN) => (),
                Err(e) => panic!("Unexpected futex error {e:?}"),
            }
        }
    }

    /// Hint to the stub that the supervisor is actively waiting, so the stub
    /// should spin rather than sleep when it yields.
    pub fn enable_sentry_fast_path(&self) {
        self.fast_path.store(1, Ordering::Relaxed);
    }

    pub fn disable_sentry_fast_path(&self) {
        self.fast_path.store(0, Ordering::Relaxed);
    }

    pub fn sentry_fast_path_enabled(&self) -> bool {
        self.fast_path.load(Ordering::Relaxed) != 0
    }

    pub fn set_interrupt(&self) {
        self.interrupt.store(1, Ordering::Release);
    }

    pub fn clear_interrupt(&self) {
        self.interrupt.store(0, Ordering::Release);
    }

    pub fn interrupt_pending(&self) -> bool {
        self.interrupt.load(Ordering::Acquire) != 0
    }

    /// # Safety
    ///
    /// The caller must own the message, i.e. it observed the state that hands
    /// the message to its side and has not published a state since.
    pub unsafe fn body(&self) -> &MessageBody {
        unsafe { &*self.body.get() }
    }

    /// # Safety
    ///
    /// As for [`Message::body`], and no other reference returned by
    /// [`Message::body`] or [`Message::body_mut`] may be live.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn body_mut(&self) -> &mut MessageBody {
        unsafe { &mut *self.body.get() }
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn layout_helpers() {
        let base = 0x7000_0000_0000;
        assert_eq!(per_thread_mem_addr(base, 0), base);
        assert_eq!(per_thread_mem_addr(base, 3), base + 3 * PER_THREAD_MEM_SIZE);
        assert_eq!(
            stack_addr_to_msg(base),
            base + PER_THREAD_SHARED_STACK_SIZE - PAGE_SIZE
        );
        assert_eq!(
            stack_addr_to_syshandler_stack(base),
            base + PER_THREAD_MEM_SIZE
        );
    }

    #[test]
    fn new_message_is_owned_by_supervisor() {
        let msg = Message::new();
        assert_eq!(msg.state(), Ok(ThreadState::Done));
        assert!(!msg.interrupt_pending());
        assert!(!msg.sentry_fast_path_enabled());
        assert_eq!(unsafe { msg.body() }.event_type(), Err(0));
    }

    #[test]
    fn event_type_roundtrip_and_unknown() {
        let mut body = MessageBody::zeroed();
        body.set_event_type(EventType::SyscallCanBePatched);
        assert_eq!(body.event_type(), Ok(EventType::SyscallCanBePatched));
        body.event_type = 77;
        assert_eq!(body.event_type(), Err(77));
    }

    #[test]
    fn fpu_state_offset_bounds() {
        let mut body = MessageBody::zeroed();
        let len = 512;

        body.fpstate = -(len as i64);
        assert_eq!(body.fpu_state_offset(len), Ok(-(len as i64)));

        body.fpstate = -(MSG_OFFSET_FROM_SHARED_STACK as i64);
        assert!(body.fpu_state_offset(len).is_ok());

        // Overlaps the message.
        body.fpstate = -(len as i64) + 8;
        assert!(body.fpu_state_offset(len).is_err());

        // Below the shared stack.
        body.fpstate = -(MSG_OFFSET_FROM_SHARED_STACK as i64) - 8;
        assert!(body.fpu_state_offset(len).is_err());

        body.fpstate = i64::MAX;
        assert!(body.fpu_state_offset(len).is_err());
    }

    #[test]
    fn invalid_state_is_reported() {
        let msg = Message::new();
        msg.state.store(9, Ordering::Release);
        assert_eq!(msg.state(), Err(InvalidThreadState(9)));
        assert_eq!(
            msg.wait_state(ThreadState::Done, 0),
            Err(InvalidThreadState(9))
        );
    }

    #[test]
    fn round_trip_between_threads() {
        let msg = Arc::new(Message::new());

        let stub = {
            let msg = msg.clone();
            std::thread::spawn(move || {
                for i in 0..100 {
                    msg.wait_state(ThreadState::Dispatched, 0).unwrap();
                    let body = unsafe { msg.body_mut() };
                    assert_eq!(body.tls, i);
                    msg.set_state(ThreadState::None);
                    // "Run" the guest, then trap.
                    let body = unsafe { msg.body_mut() };
                    body.signo = libc::SIGSYS;
                    body.set_event_type(EventType::Syscall);
                    msg.set_state(ThreadState::Done);
                }
            })
        };

        for i in 0..100 {
            unsafe { msg.body_mut() }.tls = i;
            msg.set_state(ThreadState::Dispatched);
            msg.wait_state(ThreadState::Done, 16).unwrap();
            let body = unsafe { msg.body() };
            assert_eq!(body.event_type(), Ok(EventType::Syscall));
            assert_eq!(body.signo, libc::SIGSYS);
        }
        stub.join().unwrap();
    }
}
