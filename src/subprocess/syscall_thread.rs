//! The reserved stub thread that serves the control plane of a subprocess.
//!
//! Injected syscalls only need the thread while it's attached, so any OS
//! thread can run one after taking [`SyscallThread::lock`]. Growing the
//! stub is different: a thread created with `CLONE_PTRACE` is traced by
//! whichever OS thread was the tracer of its parent at the time, so those
//! requests are funneled through one dedicated worker whose identity never
//! changes.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, error, trace, warn};
use nix::sys::signal::Signal;

use super::thread::Thread;
use super::SubprocessId;
use crate::error::{Error, FatalError, Result};

/// A request to the control-plane worker. The worker answers on `reply`.
pub(crate) enum ControlRequest {
    /// Clone a new thread in this subprocess' stub.
    NewThread { reply: Sender<Result<Thread>> },
    /// Fork a new stub process from this subprocess' stub.
    NewStub { reply: Sender<Result<Thread>> },
}

pub struct SyscallThread {
    subprocess_id: SubprocessId,
    thread: Arc<Mutex<Thread>>,
    tgid: i32,
    requests: Option<Sender<ControlRequest>>,
    worker: Option<JoinHandle<()>>,
}

impl SyscallThread {
    /// Takes over `thread`, which must be detached, and starts the worker.
    pub fn spawn(thread: Thread, subprocess_id: SubprocessId, cpu: Option<u32>) -> Self {
        let tgid = thread.tgid();
        let thread = Arc::new(Mutex::new(thread));
        let (requests, receiver) = channel::unbounded();

        let worker = {
            let thread = thread.clone();
            std::thread::Builder::new()
                .name(format!("systrap-ctl-{subprocess_id}"))
                .spawn(move || worker_loop(thread, receiver, cpu))
                .unwrap()
        };

        Self {
            subprocess_id,
            thread,
            tgid,
            requests: Some(requests),
            worker: Some(worker),
        }
    }

    pub fn tgid(&self) -> i32 {
        self.tgid
    }

    /// Exclusive use of the thread. Only one control-plane operation or
    /// injected syscall runs at a time.
    pub fn lock(&self) -> MutexGuard<'_, Thread> {
        self.thread.lock().unwrap()
    }

    /// Injects `sysno(args)` into the stub, attaching around the call.
    pub fn syscall(&self, sysno: i64, args: &[u64]) -> Result<u64> {
        let mut thread = self.lock();
        with_attached(&mut thread, |t| t.syscall_ignore_interrupt(sysno, args))
    }

    /// Asks the worker for a new thread in the stub, detached and in
    /// group-stop. Blocks until the worker replies.
    pub fn request_thread(&self) -> Result<Thread> {
        self.request(|reply| ControlRequest::NewThread { reply })
    }

    /// Asks the worker to fork a new stub process. Blocks until the worker
    /// replies.
    pub fn request_stub(&self) -> Result<Thread> {
        self.request(|reply| ControlRequest::NewStub { reply })
    }

    fn request(
        &self,
        make: impl FnOnce(Sender<Result<Thread>>) -> ControlRequest,
    ) -> Result<Thread> {
        let gone = || Error::from(FatalError::ControlPlaneGone(self.subprocess_id));
        let (reply, reply_receiver) = channel::bounded(1);
        self.requests
            .as_ref()
            .ok_or_else(gone)?
            .send(make(reply))
            .map_err(|_| gone())?;
        reply_receiver.recv().map_err(|_| gone())?
    }

    /// Kills the whole stub process.
    pub fn kill_stub(&self) {
        // kill(2) treats non-positive pids as process groups.
        if self.tgid <= 0 {
            return;
        }
        debug!("Killing stub process {}", self.tgid);
        if let Err(e) =
            nix::sys::signal::kill(nix::unistd::Pid::from_raw(self.tgid), Signal::SIGKILL)
        {
            debug!("Stub process {} already gone: {e}", self.tgid);
        }
    }
}

impl Drop for SyscallThread {
    fn drop(&mut self) {
        // Closing the channel stops the worker.
        self.requests.take();
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != std::thread::current().id() && worker.join().is_err() {
                error!("Control-plane worker of subprocess {} panicked", self.subprocess_id);
            }
        }
    }
}

fn with_attached<T>(thread: &mut Thread, f: impl FnOnce(&mut Thread) -> Result<T>) -> Result<T> {
    thread.attach()?;
    let res = f(thread);
    // Stay attached on a fatal error so the tracee can't run on.
    if !matches!(res, Err(Error::Fatal(_))) {
        thread.detach()?;
    }
    res
}

fn pin_to_cpu(cpu: u32) -> nix::Result<()> {
    let mut cpus = nix::sched::CpuSet::new();
    cpus.set(cpu as usize)?;
    nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &cpus)
}

fn worker_loop(thread: Arc<Mutex<Thread>>, requests: Receiver<ControlRequest>, cpu: Option<u32>) {
    if let Some(cpu) = cpu {
        if let Err(e) = pin_to_cpu(cpu) {
            warn!("Couldn't pin control-plane worker to cpu {cpu}: {e}");
        }
    }

    // Requests are served strictly in arrival order, one at a time.
    for request in requests.iter() {
        let mut thread = thread.lock().unwrap();
        match request {
            ControlRequest::NewThread { reply } => {
                let res = with_attached(&mut thread, new_thread);
                reply.send(res).ok();
            }
            ControlRequest::NewStub { reply } => {
                let res = with_attached(&mut thread, |t| t.create_stub());
                reply.send(res).ok();
            }
        }
    }
    trace!("Control-plane worker exiting");
}

fn new_thread(parent: &mut Thread) -> Result<Thread> {
    let mut t = parent.clone_thread()?;

    // Since the new thread was created with clone(CLONE_PTRACE), it begins
    // execution with SIGSTOP pending and with this thread as its tracer.
    let sig = t.wait(super::thread::WaitOutcome::Stopped)?;
    if sig != libc::SIGSTOP {
        return Err(t.dump_and_fatal(format!(
            "error waiting for new clone: expected SIGSTOP, got {sig}"
        )));
    }

    // Queue another SIGSTOP so it stays stopped once detached, until its
    // requester attaches.
    t.tgkill(Signal::SIGSTOP)
        .map_err(|errno| FatalError::Host { op: "tgkill", errno })?;
    t.detach()?;
    t.set_init_regs(*parent.init_regs());
    t.debug(format_args!("new thread in stub {}", t.tgid()));
    Ok(t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requests_after_drop_fail() {
        let mut syscall_thread = SyscallThread::spawn(Thread::new(-1, -1), 7, None);
        // Close the channel the way drop does, without joining.
        syscall_thread.requests.take();
        let err = syscall_thread.request_thread().unwrap_err();
        assert!(matches!(err, Error::Fatal(FatalError::ControlPlaneGone(7))));
    }

    #[test]
    fn test_worker_name_and_shutdown() {
        let syscall_thread = SyscallThread::spawn(Thread::new(-1, -1), 3, None);
        let worker = syscall_thread.worker.as_ref().unwrap();
        assert_eq!(worker.thread().name(), Some("systrap-ctl-3"));
        assert_eq!(syscall_thread.tgid(), -1);
        // Joins the worker.
        drop(syscall_thread);
    }

    #[test]
    fn test_pin_to_cpu() {
        std::thread::spawn(|| {
            let allowed = nix::sched::sched_getaffinity(nix::unistd::Pid::from_raw(0)).unwrap();
            let cpu = (0..nix::sched::CpuSet::count())
                .find(|&c| allowed.is_set(c).unwrap())
                .unwrap();
            pin_to_cpu(cpu as u32).unwrap();
            let pinned = nix::sched::sched_getaffinity(nix::unistd::Pid::from_raw(0)).unwrap();
            for c in 0..nix::sched::CpuSet::count() {
                assert_eq!(pinned.is_set(c).unwrap(), c == cpu);
            }
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_kill_stub_ignores_fake_pids() {
        // Must not turn into kill(-1, SIGKILL).
        SyscallThread::spawn(Thread::new(-1, -1), 5, None).kill_stub();
    }
}
