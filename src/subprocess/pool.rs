//! Registry of subprocesses, split into active and available ones.
//!
//! Creating a stub process takes several injected syscalls and a filter
//! install, so a released subprocess is always reused before a new one is
//! created.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info};
use once_cell::sync::OnceCell;

use super::thread::Thread;
use super::{Subprocess, SubprocessId};
use crate::core::configuration::SystrapConfig;
use crate::error::{escalate, Error, Result};
use crate::platform::{MemoryFile, PatchTable, StubLayout};

/// Everything a new [`Subprocess`] is built from.
pub struct PoolParams {
    pub memory_file: Arc<dyn MemoryFile>,
    pub layout: StubLayout,
    pub config: SystrapConfig,
    /// Makes the patch table of a new subprocess.
    pub patch_table: Box<dyn Fn() -> Box<dyn PatchTable> + Send + Sync>,
}

impl PoolParams {
    /// Checks the options, and that the window of every stack slot lies
    /// inside the stub.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.config.validate()?;
        let layout = &self.layout;
        let slots = u64::from(self.config.max_guest_threads);
        let sysmsg_end = slots
            .checked_mul(sysmsg::PER_THREAD_MEM_SIZE)
            .and_then(|len| len.checked_add(layout.sysmsg_base));
        match sysmsg_end {
            Some(end) if layout.stub_start <= layout.sysmsg_base && end <= layout.stub_end => Ok(()),
            _ => anyhow::bail!(
                "{slots} stack slots from {:#x} don't fit in the stub at {:#x}..{:#x}",
                layout.sysmsg_base,
                layout.stub_start,
                layout.stub_end
            ),
        }
    }
}

#[derive(Default)]
struct PoolInner {
    active: HashMap<SubprocessId, Arc<Subprocess>>,
    available: Vec<Arc<Subprocess>>,
    /// The subprocess new stubs are forked from.
    source: Option<Arc<Subprocess>>,
    drained: bool,
}

pub struct SubprocessPool {
    params: PoolParams,
    next_id: AtomicU64,
    inner: Mutex<PoolInner>,
}

impl SubprocessPool {
    pub fn new(params: PoolParams) -> anyhow::Result<Arc<Self>> {
        params.validate()?;
        Ok(Arc::new(Self {
            params,
            next_id: AtomicU64::new(1),
            inner: Mutex::new(PoolInner::default()),
        }))
    }

    pub fn params(&self) -> &PoolParams {
        &self.params
    }

    /// An idle subprocess, now active, if there is one.
    pub fn fetch_available(&self) -> Option<Arc<Subprocess>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.drained {
            return None;
        }
        let sp = inner.available.pop()?;
        sp.mark_in_use();
        inner.active.insert(sp.id(), sp.clone());
        debug!("Reusing subprocess {}", sp.id());
        Some(sp)
    }

    /// Registers a new subprocess as active.
    pub fn add(&self, sp: Arc<Subprocess>) {
        let mut inner = self.inner.lock().unwrap();
        inner.active.insert(sp.id(), sp);
    }

    /// Marks `sp` released, and makes it available once no context is bound
    /// to it anymore. Releasing again is harmless.
    pub fn release(&self, sp: &Subprocess) {
        let mut inner = self.inner.lock().unwrap();
        if !sp.mark_released() {
            // The last context to leave calls back in.
            return;
        }
        if let Some(sp) = inner.active.remove(&sp.id()) {
            debug!("Subprocess {} is available", sp.id());
            inner.available.push(sp);
        }
    }

    pub fn is_available(&self, id: SubprocessId) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.available.iter().any(|sp| sp.id() == id)
    }

    pub fn is_drained(&self) -> bool {
        self.inner.lock().unwrap().drained
    }

    /// Wraps the stub process of `thread` in a new subprocess of this pool.
    pub(crate) fn subprocess_from_stub(self: &Arc<Self>, thread: Thread) -> Arc<Subprocess> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Subprocess::new(id, thread, Arc::downgrade(self), &self.params)
    }

    fn get_or_create(
        self: &Arc<Self>,
        create: impl FnOnce(&Arc<Self>) -> Result<Arc<Subprocess>>,
    ) -> Result<Arc<Subprocess>> {
        if self.is_drained() {
            return Err(Error::PoolDrained);
        }
        if let Some(sp) = self.fetch_available() {
            return Ok(sp);
        }
        let sp = create(self)?;
        self.add(sp.clone());
        Ok(sp)
    }

    /// A subprocess for a new address space. `create` is only called, to
    /// produce the first thread of a new stub process, if no subprocess is
    /// available for reuse.
    pub fn new_subprocess(
        self: &Arc<Self>,
        create: impl FnOnce() -> Result<Thread>,
    ) -> Result<Arc<Subprocess>> {
        escalate(self.get_or_create(|pool| {
            let sp = pool.subprocess_from_stub(create()?);
            sp.unmap_guest_memory()?;
            debug!("New subprocess {} with stub {}", sp.id(), sp.stub_pid());
            Ok(sp)
        }))
    }

    /// Sets the subprocess [`SubprocessPool::new_subprocess_from_source`]
    /// forks stubs from.
    pub fn set_source(&self, sp: Arc<Subprocess>) {
        self.inner.lock().unwrap().source = Some(sp);
    }

    /// Like [`SubprocessPool::new_subprocess`], forking new stubs from the
    /// source subprocess.
    pub fn new_subprocess_from_source(self: &Arc<Self>) -> Result<Arc<Subprocess>> {
        let source = self.inner.lock().unwrap().source.clone();
        let source = source.ok_or(Error::NoSourceSubprocess)?;
        self.new_subprocess(|| source.request_stub())
    }

    /// Forgets every subprocess and kills its stub. Nothing can be taken
    /// from the pool afterwards.
    pub fn drain(&self) {
        let subprocesses: Vec<_> = {
            let mut inner = self.inner.lock().unwrap();
            inner.drained = true;
            let active = std::mem::take(&mut inner.active);
            let available = std::mem::take(&mut inner.available);
            active
                .into_values()
                .chain(available)
                .chain(inner.source.take())
                .collect()
        };
        info!("Draining {} subprocesses", subprocesses.len());
        for sp in subprocesses {
            sp.kill_stub();
        }
    }
}

static POOL: OnceCell<Arc<SubprocessPool>> = OnceCell::new();

/// Sets up the process-wide pool. May only be called once.
pub fn init_global_pool(params: PoolParams) -> anyhow::Result<&'static Arc<SubprocessPool>> {
    POOL.try_insert(SubprocessPool::new(params)?)
        .map_err(|_| anyhow::anyhow!("The subprocess pool has already been initialized"))
}

pub fn global_pool() -> Option<&'static Arc<SubprocessPool>> {
    POOL.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::configuration::MAX_GUEST_THREADS_LIMIT;
    use crate::subprocess::context::Context;
    use crate::subprocess::test_util::{test_params, TestMemoryFile};

    fn test_pool() -> Arc<SubprocessPool> {
        SubprocessPool::new(test_params(Arc::new(TestMemoryFile::new()), 8)).unwrap()
    }

    /// Fake subprocesses have no stub whose memory could be unmapped.
    fn get_fake(pool: &Arc<SubprocessPool>, created: &mut u32) -> Arc<Subprocess> {
        pool.get_or_create(|pool| {
            *created += 1;
            Ok(pool.subprocess_from_stub(Thread::new(-1, -1)))
        })
        .unwrap()
    }

    fn new_context() -> Context {
        Context::new(unsafe { core::mem::zeroed() })
    }

    #[test]
    fn test_reuse_after_contexts_leave() {
        let pool = test_pool();
        let mut created = 0;
        let a = get_fake(&pool, &mut created);
        assert_eq!(created, 1);

        let mut c1 = new_context();
        let mut c2 = new_context();
        c1.bind(&a);
        c2.bind(&a);

        // Released while contexts are still bound: not available yet.
        pool.release(&a);
        assert!(a.is_released());
        assert!(!pool.is_available(a.id()));

        c1.unbind();
        assert!(!pool.is_available(a.id()));
        c2.unbind();
        assert!(pool.is_available(a.id()));

        let b = get_fake(&pool, &mut created);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(created, 1);
        assert!(!b.is_released());
        assert!(!pool.is_available(b.id()));
    }

    #[test]
    fn test_available_iff_released_and_idle() {
        let pool = test_pool();
        let mut created = 0;
        let sp = get_fake(&pool, &mut created);
        let check = || {
            assert_eq!(
                pool.is_available(sp.id()),
                sp.is_released() && sp.active_contexts() == 0
            )
        };

        check();
        let mut ctx = new_context();
        ctx.bind(&sp);
        check();
        pool.release(&sp);
        check();
        // Harmless to repeat.
        pool.release(&sp);
        check();
        drop(ctx);
        check();
        assert!(pool.is_available(sp.id()));
        pool.release(&sp);
        check();
        assert_eq!(pool.inner.lock().unwrap().available.len(), 1);
    }

    #[test]
    fn test_fetch_available_miss_has_no_effect() {
        let pool = test_pool();
        assert!(pool.fetch_available().is_none());
        let inner = pool.inner.lock().unwrap();
        assert!(inner.active.is_empty());
        assert!(inner.available.is_empty());
    }

    #[test]
    fn test_distinct_ids() {
        let pool = test_pool();
        let mut created = 0;
        let a = get_fake(&pool, &mut created);
        let b = get_fake(&pool, &mut created);
        assert_ne!(a.id(), b.id());
        assert_eq!(created, 2);
    }

    #[test]
    fn test_drain() {
        let pool = test_pool();
        let mut created = 0;
        let sp = get_fake(&pool, &mut created);
        pool.release(&sp);
        pool.set_source(get_fake(&pool, &mut created));

        pool.drain();
        assert!(pool.is_drained());
        assert!(pool.fetch_available().is_none());
        assert!(matches!(
            pool.new_subprocess(|| unreachable!()),
            Err(Error::PoolDrained)
        ));
        assert!(matches!(
            pool.new_subprocess_from_source(),
            Err(Error::NoSourceSubprocess)
        ));
    }

    #[test]
    fn test_stack_slots_must_fit_in_stub() {
        let params = |slots| test_params(Arc::new(TestMemoryFile::new()), slots);
        // The test layout has room for 0x7000_0000 / PER_THREAD_MEM_SIZE slots.
        assert!(SubprocessPool::new(params(22937)).is_ok());
        let Err(err) = SubprocessPool::new(params(22938)) else {
            panic!("22938 slots fit");
        };
        assert!(err.to_string().contains("don't fit"), "{err}");
        assert!(SubprocessPool::new(params(MAX_GUEST_THREADS_LIMIT)).is_err());

        let mut below = params(1);
        below.layout.sysmsg_base = below.layout.stub_start - 1;
        assert!(SubprocessPool::new(below).is_err());
        // Option errors come first.
        assert!(SubprocessPool::new(params(0)).is_err());
    }

    #[test]
    fn test_no_source() {
        let pool = test_pool();
        assert!(matches!(
            pool.new_subprocess_from_source(),
            Err(Error::NoSourceSubprocess)
        ));
    }
}
