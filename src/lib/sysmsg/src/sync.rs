//! Synchronization primitives that are modeled in loom
//!
//! The message state word is the only thing the supervisor and the stub
//! synchronize on, so this module only provides atomics, `sched_yield`, and a
//! futex. Under `cfg(loom)` the futex is emulated with loom primitives, since
//! loom can't see syscalls.

#[cfg(not(loom))]
pub use core::sync::atomic::{AtomicU32, Ordering};
#[cfg(loom)]
pub use loom::sync::atomic::{AtomicU32, Ordering};

#[cfg(not(loom))]
pub use native::*;
#[cfg(loom)]
pub use model::*;

/// `FUTEX_WAKE` count meaning "everyone"; futex(2) asks for `INT_MAX`.
#[cfg(not(loom))]
const WAKE_ALL: u32 = i32::MAX as u32;

#[cfg(not(loom))]
mod native {
    use rustix::thread::{FutexFlags, FutexOperation};

    use super::{AtomicU32, WAKE_ALL};

    pub fn sched_yield() {
        rustix::process::sched_yield();
    }

    // The word lives in memory that is also mapped into the stub process, so
    // the futex must not be process-private.
    fn futex(word: &AtomicU32, op: FutexOperation, val: u32) -> rustix::io::Result<usize> {
        // SAFETY: `word` is a valid futex word for the duration of the call,
        // and neither operation dereferences the remaining arguments.
        unsafe {
            rustix::thread::futex(
                word.as_ptr(),
                op,
                FutexFlags::empty(),
                val,
                core::ptr::null(),
                core::ptr::null_mut(),
                0,
            )
        }
    }

    /// Sleeps while `*word == val`. Spurious wakeups are possible.
    #[inline]
    pub fn futex_wait(word: &AtomicU32, val: u32) -> rustix::io::Result<usize> {
        futex(word, FutexOperation::Wait, val)
    }

    #[inline]
    pub fn futex_wake_all(word: &AtomicU32) -> rustix::io::Result<()> {
        futex(word, FutexOperation::Wake, WAKE_ALL).map(|_| ())
    }
}

#[cfg(loom)]
mod model {
    use std::collections::HashMap;

    use loom::sync::{Arc, Condvar, Mutex};

    use super::{AtomicU32, Ordering};

    // Waiters, keyed by the address of their futex word. Holding the lock
    // stands in for the atomicity of the kernel's compare-and-sleep.
    loom::lazy_static! {
        static ref WAITERS: Mutex<HashMap<usize, Arc<Condvar>>> = Mutex::new(HashMap::new());
    }

    fn key(word: &AtomicU32) -> usize {
        word as *const AtomicU32 as usize
    }

    pub fn sched_yield() {
        loom::thread::yield_now();
    }

    pub fn futex_wait(word: &AtomicU32, val: u32) -> rustix::io::Result<usize> {
        let mut waiters = WAITERS.lock().unwrap();
        if word.load(Ordering::Relaxed) != val {
            return Err(rustix::io::Errno::AGAIN);
        }
        let cond = waiters
            .entry(key(word))
            .or_insert_with(|| Arc::new(Condvar::new()))
            .clone();
        drop(cond.wait(waiters).unwrap());
        Ok(0)
    }

    pub fn futex_wake_all(word: &AtomicU32) -> rustix::io::Result<()> {
        if let Some(cond) = WAITERS.lock().unwrap().get(&key(word)) {
            cond.notify_all();
        }
        Ok(())
    }

    /// Forgets all waiters. Called between loom iterations.
    pub fn loom_reset() {
        WAITERS.lock().unwrap().clear();
    }
}
