//! Hardware abstraction seam consumed by the core.
//!
//! The kernel never touches registers, interrupt controllers or page tables
//! directly. Everything architecture specific goes through [`Arch`], which a
//! HAL implements once per platform. The host backend in [`host`] implements
//! it on top of parked host threads so the core can be exercised in tests.

use crate::errors::KernelResult;
use crate::mem::KernelStack;
use crate::proc::Process;

extern crate alloc;
use alloc::boxed::Box;

#[cfg(any(test, feature = "std-shim"))]
pub mod host;

#[cfg(any(test, feature = "std-shim"))]
pub use host::HostArch;

/// Code a new kernel thread starts executing on its own stack.
pub type ThreadEntry = Box<dyn FnOnce() + Send + 'static>;

/// Interrupt state saved by [`Arch::irq_save`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntrFlags(pub usize);

impl IntrFlags {
    /// Flags value meaning "interrupts were enabled".
    pub const ENABLED: Self = Self(1);
    /// Flags value meaning "interrupts were masked".
    pub const DISABLED: Self = Self(0);

    pub fn enabled(self) -> bool {
        self.0 != 0
    }
}

/// Architecture abstraction trait.
///
/// One value of the implementing type is owned by each
/// [`Kernel`](crate::Kernel), so per-CPU hardware state lives in `self`.
///
/// # Safety
///
/// Implementations manipulate the CPU directly. `context_switch` in
/// particular must save every register of the calling flow into `prev`
/// and resume `next` exactly where it last stopped.
pub trait Arch: Send + Sync + 'static {
    /// Saved register state of one kernel thread.
    type SavedContext: Send + Sync + 'static;

    /// Build the initial context of a kernel thread.
    ///
    /// # Arguments
    ///
    /// * `stack` - The kernel stack the thread will run on
    /// * `entry` - Code to run once the thread is first dispatched; it never returns
    ///
    /// # Returns
    ///
    /// The saved context, or `NoMemory` if the platform could not set it up.
    fn new_context(
        &self,
        stack: &KernelStack,
        entry: ThreadEntry,
    ) -> KernelResult<Self::SavedContext>;

    /// Adopt the currently executing boot flow as a context (idle thread).
    fn boot_context(&self) -> Self::SavedContext;

    /// Switch from one thread context to another.
    ///
    /// # Safety
    ///
    /// - Both pointers must refer to live contexts at the moment of the call
    /// - Must be called with interrupts disabled and dispatch enabled
    /// - `next` must not be the context currently executing
    /// - After `next` starts running, `prev` may be released by another thread;
    ///   implementations must not touch `*prev` after handing the CPU over
    unsafe fn context_switch(
        &self,
        prev: *const Self::SavedContext,
        next: *const Self::SavedContext,
    );

    /// Release the context of a dead thread. Called only by the reaper.
    fn release_context(&self, ctx: Self::SavedContext);

    /// Save floating point state of `ctx`.
    ///
    /// # Safety
    ///
    /// `ctx` must be the context that currently owns the FPU.
    #[cfg(feature = "full-fpu")]
    unsafe fn save_fpu(&self, ctx: *const Self::SavedContext);

    /// Restore floating point state of `ctx`.
    ///
    /// # Safety
    ///
    /// `ctx` must be about to run and its FPU state must have been saved before.
    #[cfg(feature = "full-fpu")]
    unsafe fn restore_fpu(&self, ctx: *const Self::SavedContext);

    /// Mask interrupts and return the previous state.
    fn irq_save(&self) -> IntrFlags;

    /// Restore an interrupt state obtained from [`Arch::irq_save`].
    fn irq_restore(&self, flags: IntrFlags);

    /// Check if interrupts are currently enabled.
    fn interrupts_enabled(&self) -> bool;

    /// Load the address space of `next`.
    fn switch_address_space(&self, next: &Process);

    /// Halt until the next interrupt.
    ///
    /// Returns `true` when a timer tick should be delivered.
    fn wait_for_interrupt(&self) -> bool;
}
