use super::{ThreadFlags, ThreadRef, Tid};
use crate::arch::Arch;
use crate::errors::KernelResult;
use crate::kernel::Kernel;
use crate::mem::StackSizeClass;
use crate::proc::Process;
use crate::sched::Scheduler;

extern crate alloc;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;

/// Priority used when none is given. Valid for both thread kinds.
pub const DEFAULT_PRIORITY: u8 = 8;

/// Allocate, create and start a thread in one go.
///
/// Without a process the thread is a kernel thread; with a user process it
/// is a user thread of that process.
pub struct ThreadBuilder {
    stack_size: Option<StackSizeClass>,
    priority: u8,
    name: Option<String>,
    joinable: bool,
    process: Option<Arc<Process>>,
    tid: Option<Tid>,
}

impl ThreadBuilder {
    pub fn new() -> Self {
        Self {
            stack_size: None,
            priority: DEFAULT_PRIORITY,
            name: None,
            joinable: false,
            process: None,
            tid: None,
        }
    }

    pub fn stack_size(mut self, size: StackSizeClass) -> Self {
        self.stack_size = Some(size);
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn name<T: Into<String>>(mut self, name: T) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Keep the exit code until the parent collects it with `thr_wait`.
    pub fn joinable(mut self, joinable: bool) -> Self {
        self.joinable = joinable;
        self
    }

    /// Make a user thread of `process`.
    pub fn process(mut self, process: Arc<Process>) -> Self {
        self.process = Some(process);
        self
    }

    /// Request a specific system id (kernel threads only).
    pub fn tid(mut self, tid: Tid) -> Self {
        self.tid = Some(tid);
        self
    }

    /// Create the thread and leave it DORMANT.
    pub fn create<A, S, F>(self, kernel: &Kernel<A, S>, f: F) -> KernelResult<ThreadRef>
    where
        A: Arch,
        S: Scheduler,
        F: FnOnce(&Kernel<A, S>) -> i32 + Send + 'static,
    {
        let thr = match self.stack_size {
            Some(class) => kernel.thread_alloc_sized(class)?,
            None => kernel.thread_alloc()?,
        };
        let flags = if self.joinable {
            ThreadFlags::JOINABLE
        } else {
            ThreadFlags::empty()
        };

        let created = match &self.process {
            Some(process) => {
                kernel.create_uthread(&thr, self.priority, flags, process, Box::new(f))
            }
            None => kernel.create_kthread(&thr, self.priority, flags, self.tid, Box::new(f)),
        };
        if let Err(e) = created {
            // Still FREE: hand the stack back.
            if let Err(destroy) = kernel.thr_destroy(&thr) {
                log::warn!("create failed ({:?}), stack not returned: {:?}", e, destroy);
            }
            return Err(e);
        }

        if let Some(name) = self.name {
            thr.set_name(name);
        }
        Ok(thr)
    }

    /// Create the thread and start it as a child of the current thread.
    pub fn spawn<A, S, F>(self, kernel: &Kernel<A, S>, f: F) -> KernelResult<Tid>
    where
        A: Arch,
        S: Scheduler,
        F: FnOnce(&Kernel<A, S>) -> i32 + Send + 'static,
    {
        let thr = self.create(kernel, f)?;
        let tid = thr.tid();
        kernel.thr_start(&thr, kernel.current_tid())?;
        Ok(tid)
    }
}

impl Default for ThreadBuilder {
    fn default() -> Self {
        Self::new()
    }
}
