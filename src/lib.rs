#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(unreachable_pub)]

//! Coordination core of a small microkernel.
//!
//! This library carries the part of a kernel where every blocking operation
//! ends up: a fixed-priority scheduler, wait/wake objects, timed waits that
//! race against wakeups, the thread lifecycle with deferred stack
//! reclamation, and synchronous LPC messaging between threads.
//!
//! # Features
//!
//! - `full-fpu`: Save/restore FPU state lazily at switch time (default)
//! - `std-shim`: Build the host backend outside of tests
//!
//! # Quick Start
//!
//! ```ignore
//! use lpc_kernel::{HostArch, Kernel, KernelConfig, ThreadBuilder, WaitFlags};
//!
//! let kernel = Kernel::new(HostArch::new(), KernelConfig::default())?;
//! let code = kernel.run(|k| {
//!     let tid = k.spawn(10, |_| 7).unwrap();
//!     log::info!("spawned {}", tid);
//!     0
//! })?;
//! ```
//!
//! # Architecture
//!
//! Hardware access goes through the [`Arch`] trait. Every piece of state is
//! owned by a [`Kernel`] value; nothing is global.

pub mod arch;
pub mod config;
pub mod errors;
pub mod kernel;
pub mod lpc;
pub mod mem;
pub mod proc;
pub mod sched;
pub mod sync;
pub mod syscall;
pub mod thread;
pub mod time;

#[cfg(test)]
mod tests;

#[cfg(any(test, feature = "std-shim"))]
extern crate std;

extern crate alloc;

#[cfg(all(not(test), not(feature = "std-shim")))]
use core::panic::PanicInfo;

#[cfg(all(not(test), not(feature = "std-shim")))]
#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    loop {
        core::hint::spin_loop();
    }
}

// ============================================================================
// Public API
// ============================================================================

pub use arch::{Arch, IntrFlags};
#[cfg(any(test, feature = "std-shim"))]
pub use arch::HostArch;

pub use config::KernelConfig;
pub use errors::{Errno, KernelResult};

pub use kernel::Kernel;
#[cfg(any(test, feature = "std-shim"))]
pub use kernel::HostKernel;

pub use sched::{PriorityScheduler, Scheduler};
pub use sync::{SyncObject, SyncReason, WakePolicy};

pub use thread::{
    EventId, Thread, ThreadBuilder, ThreadFlags, ThreadRef, ThreadState, Tid, WaitFlags,
};

pub use lpc::{Endpoint, MessageBody, MsgBuf, RawMessage, LPC_RECV_ANY};
pub use mem::{StackPool, StackSizeClass};
pub use proc::{AddressSpace, FlatSpace, Process};
pub use time::Timeout;
