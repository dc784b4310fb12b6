//! Utilities shared by the integration tests. Lives in a subdirectory so it
//! isn't picked up as an integration test itself.

// Items in here may not end up being used by every test.
#![allow(unused)]

#[cfg(loom)]
pub fn model<F>(f: F)
where
    F: Fn() + Sync + Send + 'static,
{
    loom::model(move || {
        f();
        sysmsg::sync::loom_reset();
    });
}
#[cfg(not(loom))]
pub fn model<F>(f: F)
where
    F: Fn() + Sync + Send + 'static,
{
    f()
}

#[cfg(not(loom))]
pub use std::sync::Arc;
#[cfg(not(loom))]
pub use std::thread;

#[cfg(loom)]
pub use loom::sync::Arc;
#[cfg(loom)]
pub use loom::thread;

#[cfg(loom)]
pub fn rand_sleep() {}
#[cfg(not(loom))]
pub fn rand_sleep() {
    std::thread::sleep(std::time::Duration::from_nanos(
        rand::random::<u64>() % 1_000_000,
    ));
}
