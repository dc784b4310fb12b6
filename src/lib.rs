//! Supervisor side of the systrap platform: guest address spaces are hosted
//! in traced stub processes, and guest threads run as stub threads under a
//! syscall filter. Every trap is handed to the supervisor through a message
//! in memory shared with the stub.
//!
//! The entry points are [`subprocess::pool::SubprocessPool`], which hands out
//! [`subprocess::Subprocess`]es, and [`subprocess::Subprocess::switch_to_app`],
//! which runs a [`subprocess::context::Context`] until its next trap.

// https://github.com/rust-lang/rfcs/blob/master/text/2585-unsafe-block-in-unsafe-fn.md
#![deny(unsafe_op_in_unsafe_fn)]

pub mod arch;
pub mod core;
pub mod error;
pub mod platform;
pub mod subprocess;
pub mod utility;

pub use error::{Error, FatalError, Result};
pub use subprocess::context::Context;
pub use subprocess::pool::{global_pool, init_global_pool, PoolParams, SubprocessPool};
pub use subprocess::{AppExit, Subprocess};
