//! Deferred reclamation of dead threads.
//!
//! An exiting thread still runs on its own kernel stack, so it cannot free
//! it. It queues itself here instead and switches away for good; the reaper
//! thread returns the stack, the id and the saved context afterwards.

use super::{ThreadRef, ThreadState, REAPER_TID};
use crate::arch::Arch;
use crate::errors::KernelResult;
use crate::kernel::Kernel;
use crate::mem::KernelStack;
use crate::sched::Scheduler;
use crate::sync::{DispatchControl, IrqLock, SyncObject, SyncReason, WakePolicy};
use crate::thread::ThreadFlags;
use portable_atomic::{AtomicU64, Ordering};

extern crate alloc;
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// A dead thread together with the stack it ran on.
pub(crate) struct Corpse {
    pub(crate) thread: ThreadRef,
    pub(crate) stack: Option<KernelStack>,
}

/// State of the reaper thread.
pub struct Reaper {
    pub(crate) queue: IrqLock<VecDeque<Corpse>>,
    pub(crate) wakeup: SyncObject,
    reaped: AtomicU64,
}

impl Reaper {
    pub const fn new() -> Self {
        Self {
            queue: IrqLock::new(VecDeque::new()),
            wakeup: SyncObject::new(WakePolicy::One),
            reaped: AtomicU64::new(0),
        }
    }

    /// Dead threads not reclaimed yet.
    pub fn pending(&self, cpu: &dyn DispatchControl) -> usize {
        self.queue.lock(cpu).len()
    }

    /// Threads reclaimed since boot.
    pub fn reaped(&self) -> u64 {
        self.reaped.load(Ordering::Acquire)
    }
}

impl Default for Reaper {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Arch, S: Scheduler> Kernel<A, S> {
    /// Hand a dead thread to the reaper.
    pub(crate) fn enter_dead(&self, corpse: Corpse) {
        self.reaper.queue.lock(self).push_back(corpse);
        self.sync_wake(&self.reaper.wakeup, SyncReason::Released);
    }

    pub(crate) fn reaper_pending(&self, thr: &ThreadRef) -> bool {
        self.reaper
            .queue
            .lock(self)
            .iter()
            .any(|c| Arc::ptr_eq(&c.thread, thr))
    }

    /// Create and start the reaper as system thread 1.
    pub(crate) fn spawn_reaper(&self) -> KernelResult<ThreadRef> {
        let thr = self.thread_alloc()?;
        self.create_kthread(
            &thr,
            self.config.reaper_prio(),
            ThreadFlags::empty(),
            Some(REAPER_TID),
            Box::new(|k: &Kernel<A, S>| k.reaper_main()),
        )?;
        thr.set_name("reaper");
        self.thr_start(&thr, self.current_tid())?;
        Ok(thr)
    }

    fn reaper_main(&self) -> i32 {
        loop {
            let mut queue = self.reaper.queue.lock(self);
            while queue.is_empty() {
                let (_, relocked) = self.sync_wait_locked(&self.reaper.wakeup, queue);
                queue = relocked;
            }
            let corpses: Vec<Corpse> = queue.drain(..).collect();
            drop(queue);

            for corpse in corpses {
                self.reap(corpse);
            }
        }
    }

    fn reap(&self, corpse: Corpse) {
        let Corpse { thread, stack } = corpse;
        assert_eq!(
            thread.state(),
            ThreadState::Exit,
            "reaper got live thread {}",
            thread.tid()
        );
        let tid = thread.tid();

        if let Some(stack) = stack {
            if !stack.check_canary() {
                log::warn!("thread {} overflowed its kernel stack", tid);
            }
            self.stack_pool.deallocate(stack);
        }
        if let Some(ctx) = thread.take_context::<A::SavedContext>() {
            self.arch.release_context(ctx);
        }
        self.registry.release_id(self, tid);
        thread.reset();

        self.reaper.reaped.fetch_add(1, Ordering::AcqRel);
        log::debug!("reaped thread {}", tid);
    }

    /// Threads reclaimed by the reaper since boot.
    pub fn reaped_count(&self) -> u64 {
        self.reaper.reaped()
    }

    /// Dead threads still waiting for the reaper.
    pub fn dead_pending(&self) -> usize {
        self.reaper.pending(self)
    }
}
