//! Dispatch: the only place a context switch happens.

use super::trait_def::Scheduler;
use crate::arch::Arch;
use crate::kernel::Kernel;
use crate::sync::DispatchControl;
use crate::thread::{ReadyRef, ThreadRef, ThreadState};

extern crate alloc;
use alloc::sync::Arc;

impl<A: Arch, S: Scheduler> Kernel<A, S> {
    /// Pick the next thread and switch to it.
    ///
    /// # Panics
    ///
    /// If dispatch is disabled: a critical section or interrupt handler must
    /// never switch away.
    pub fn schedule(&self) {
        let flags = self.arch.irq_save();
        assert!(
            !self.dispatch.is_disabled(),
            "schedule() with dispatch disabled (preempt={}, irq={})",
            self.dispatch.preempt_count(),
            self.dispatch.in_interrupt()
        );
        self.dispatch.clear_request();

        let prev = self.current();
        match prev.state() {
            ThreadState::Run => {
                let preempt = if prev.is_idle() {
                    self.scheduler.ready_count() > 0
                } else {
                    self.scheduler.has_ready_above(prev.priority())
                };
                if !preempt {
                    self.arch.irq_restore(flags);
                    return;
                }
                prev.set_state(ThreadState::Ready);
                if !prev.is_idle() {
                    self.scheduler.enqueue(ReadyRef::new(prev.clone()));
                }
            }
            ThreadState::Ready => {
                if !prev.is_idle() {
                    self.scheduler.enqueue(ReadyRef::new(prev.clone()));
                }
            }
            ThreadState::Free => panic!("freed thread {} was running", prev.tid()),
            _ => {}
        }

        let next = match self.scheduler.pick_next(0) {
            Some(ready) => ready.start_running(),
            None => {
                self.idle.set_state(ThreadState::Run);
                self.idle.clone()
            }
        };

        if !Arc::ptr_eq(&prev, &next) {
            *self.current.lock() = next.clone();
            self.switch_to(prev, next);
        }
        self.arch.irq_restore(flags);
    }

    /// Both references are dropped before the switch: a frame that never
    /// resumes must not pin a control block. `current` and the registry (or
    /// the reaper queue) keep the two threads alive.
    fn switch_to(&self, prev: ThreadRef, next: ThreadRef) {
        if let Some(space) = next.process() {
            if prev.process_id() != Some(space.id()) {
                self.arch.switch_address_space(&space);
            }
        }

        let prev_ctx = prev.context_ptr::<A::SavedContext>();
        let next_ctx = next.context_ptr::<A::SavedContext>();
        assert!(!next_ctx.is_null(), "thread {} has no context", next.tid());
        assert!(!prev_ctx.is_null(), "thread {} has no context", prev.tid());

        #[cfg(feature = "full-fpu")]
        {
            // SAFETY: both contexts are live; prev owns the FPU until here.
            if prev.fpu_used() {
                unsafe { self.arch.save_fpu(prev_ctx) };
            }
            if next.fpu_used() {
                unsafe { self.arch.restore_fpu(next_ctx) };
            }
        }

        log::trace!("switch {} -> {}", prev.tid(), next.tid());
        drop(prev);
        drop(next);
        // SAFETY: interrupts are masked, dispatch is enabled and `next` is not
        // the running context. A control block is only freed by the reaper,
        // which cannot run before this switch completes.
        unsafe { self.arch.context_switch(prev_ctx, next_ctx) };
    }

    /// Make `thr` runnable and request a dispatch.
    ///
    /// Never switches by itself. Waking the current thread before it got to
    /// switch away puts it straight back into RUN.
    pub fn sched_wakeup(&self, thr: &ThreadRef) {
        let flags = self.arch.irq_save();
        if matches!(thr.state(), ThreadState::Wait | ThreadState::Dormant) {
            if Arc::ptr_eq(thr, &self.current()) {
                thr.set_state(ThreadState::Run);
            } else {
                thr.set_state(ThreadState::Ready);
                self.scheduler.enqueue(ReadyRef::new(thr.clone()));
            }
            log::trace!("wakeup {}", thr.tid());
        }
        self.dispatch.request();
        self.arch.irq_restore(flags);
    }

    /// Give up the CPU to threads of the same or higher priority.
    pub fn thr_yield(&self) {
        let cur = self.current();
        cur.transition(ThreadState::Run, ThreadState::Ready);
        if self.dispatch.is_disabled() {
            self.dispatch.request();
        } else {
            self.schedule();
        }
    }

    /// Trap-exit hook: honour a pending dispatch request.
    pub fn dispatch_pending(&self) {
        while self.dispatch.is_requested() && !self.dispatch.is_disabled() {
            self.schedule();
        }
    }

    /// Run `f` with dispatch disabled. A wakeup inside takes effect after.
    pub fn no_dispatch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.disable_dispatch();
        let r = f();
        self.enable_dispatch();
        r
    }

    /// First FPU use by the current thread: from now on its FPU state is
    /// saved and restored across switches.
    pub fn fpu_trap(&self) {
        self.current().set_fpu_used(true);
    }

    pub fn dispatch_requested(&self) -> bool {
        self.dispatch.is_requested()
    }

    pub fn dispatch_disabled(&self) -> bool {
        self.dispatch.is_disabled()
    }
}
