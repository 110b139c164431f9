//! Thread lifecycle: allocation, creation, start, exit, join and destroy.
//!
//! Exit is a two-sided rendezvous for joinable threads. The child publishes
//! itself on its parent's exit-waiter list and sleeps on its own
//! `parent_wait` object until `thr_wait` collects it; only then does it turn
//! into EXIT and hand its stack to the reaper.

use super::reaper::Corpse;
use super::{IdRange, ThreadFlags, ThreadKind, ThreadRef, ThreadState, Tid, INVALID_TID};
use crate::arch::{Arch, IntrFlags};
use crate::errors::{Errno, KernelResult};
use crate::kernel::Kernel;
use crate::mem::StackSizeClass;
use crate::proc::Process;
use crate::sched::Scheduler;
use crate::sync::SyncReason;
use crate::thread::{EventSet, Thread};

extern crate alloc;
use alloc::boxed::Box;
use alloc::sync::Arc;

/// Body of a kernel-created thread. Its return value is the exit code.
pub type ThreadFn<A, S> = Box<dyn FnOnce(&Kernel<A, S>) -> i32 + Send + 'static>;

bitflags::bitflags! {
    /// Selects which exited child `thr_wait` collects.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WaitFlags: u32 {
        /// Children of the caller's process
        const PROC = 0x1;
        /// Children of the caller's process group (unsupported)
        const PGRP = 0x2;
        /// The child whose tid is given
        const ID = 0x4;
        /// Return instead of sleeping when nobody has exited yet
        const NONBLOCK = 0x10;
    }
}

impl WaitFlags {
    /// Any joinable child.
    pub const ANY: WaitFlags = WaitFlags::empty();
}

/// Whether `child` is selected by a `thr_wait` filter.
fn wait_matches(child: &Thread, target: Tid, flags: WaitFlags, proc_id: Option<u64>) -> bool {
    if flags.contains(WaitFlags::ID) {
        child.tid() == target
    } else if flags.contains(WaitFlags::PROC) {
        child.process_id() == proc_id
    } else {
        true
    }
}

impl<A: Arch, S: Scheduler> Kernel<A, S> {
    /// Allocate a FREE thread with a kernel stack of the configured class.
    pub fn thread_alloc(&self) -> KernelResult<ThreadRef> {
        self.thread_alloc_sized(self.config.kernel_stack)
    }

    /// Allocate a FREE thread with a kernel stack of class `class`.
    pub fn thread_alloc_sized(&self, class: StackSizeClass) -> KernelResult<ThreadRef> {
        let stack = self.stack_pool.allocate(class).ok_or(Errno::NoMemory)?;
        let thr = Thread::new_free(Some(stack));
        self.registry.push_free(self, thr.clone());
        Ok(thr)
    }

    /// Turn a FREE thread into a DORMANT kernel thread.
    ///
    /// `tid` requests a specific system id; `None` takes the lowest free one.
    pub fn create_kthread(
        &self,
        thr: &ThreadRef,
        prio: u8,
        flags: ThreadFlags,
        tid: Option<Tid>,
        entry: ThreadFn<A, S>,
    ) -> KernelResult<()> {
        if prio >= self.config.max_prio {
            return Err(Errno::Invalid);
        }
        self.create_common(
            thr,
            prio,
            flags,
            ThreadKind::Kernel,
            (IdRange::System, tid),
            self.kernel_proc.clone(),
            entry,
        )?;
        thr.events.mask_all();
        Ok(())
    }

    /// Turn a FREE thread into a DORMANT user thread of `process`.
    pub fn create_uthread(
        &self,
        thr: &ThreadRef,
        prio: u8,
        flags: ThreadFlags,
        process: &Arc<Process>,
        entry: ThreadFn<A, S>,
    ) -> KernelResult<()> {
        if prio >= self.config.max_user_prio || process.is_kernel() {
            return Err(Errno::Invalid);
        }
        if process.is_exiting() {
            return Err(Errno::NoEntry);
        }
        self.create_common(
            thr,
            prio,
            flags,
            ThreadKind::User,
            (IdRange::User, None),
            process.clone(),
            entry,
        )?;
        thr.events.set_mask(EventSet::empty());
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn create_common(
        &self,
        thr: &ThreadRef,
        prio: u8,
        flags: ThreadFlags,
        kind: ThreadKind,
        (range, want): (IdRange, Option<Tid>),
        process: Arc<Process>,
        entry: ThreadFn<A, S>,
    ) -> KernelResult<()> {
        if thr.state() != ThreadState::Free || !thr.has_stack() {
            return Err(Errno::Invalid);
        }
        let kernel = self.me.upgrade().ok_or(Errno::Invalid)?;

        let tid = self.registry.alloc_id(self, range, want)?;
        let ctx = thr
            .with_stack(|stack| {
                self.arch.new_context(
                    stack,
                    Box::new(move || {
                        kernel.thread_entry(entry);
                    }),
                )
            })
            .unwrap_or(Err(Errno::NoMemory));
        let ctx = match ctx {
            Ok(ctx) => ctx,
            Err(e) => {
                self.registry.release_id(self, tid);
                return Err(e);
            }
        };

        thr.set_tid(tid);
        thr.set_kind(kind);
        thr.set_priority(prio);
        thr.set_flags(flags);
        thr.set_parent(INVALID_TID);
        thr.slice.set_slice(self.config.default_slice);
        thr.set_context(ctx);
        thr.mque.reopen(self);
        thr.family.lock(self).exiting = false;
        process.attach(tid);
        thr.set_process(Some(process));

        self.registry.remove_free(self, thr);
        thr.set_state(ThreadState::Dormant);
        self.registry.insert(self, thr.clone())?;
        self.registry.push_dormant(self, thr.clone());
        log::debug!("created {:?} thread {} prio {}", kind, tid, prio);
        Ok(())
    }

    /// Start a DORMANT thread as a child of `parent`.
    ///
    /// A missing, kernel or exiting parent cannot collect the exit code, so
    /// the child loses its JOINABLE flag.
    pub fn thr_start(&self, thr: &ThreadRef, parent: Tid) -> KernelResult<()> {
        if thr.state() != ThreadState::Dormant {
            return Err(Errno::Invalid);
        }
        let linked = match self.find_thread(parent) {
            Some(p) if !p.is_kernel() => {
                let mut family = p.family.lock(self);
                if family.exiting {
                    false
                } else {
                    family.children.push(thr.clone());
                    thr.set_parent(parent);
                    thr.events.set_mask(p.events.mask());
                    true
                }
            }
            _ => false,
        };
        if !linked {
            thr.clear_joinable();
        }

        self.registry.remove_dormant(self, thr);
        log::debug!("start thread {} (parent {})", thr.tid(), parent);
        self.sched_wakeup(thr);
        if !self.dispatch.is_disabled() {
            self.schedule();
        }
        Ok(())
    }

    /// First code run by every created thread.
    pub(crate) fn thread_entry(&self, entry: ThreadFn<A, S>) -> ! {
        self.arch.irq_restore(IntrFlags::ENABLED);
        let code = entry(self);
        self.thr_exit(code)
    }

    /// Terminate the current thread with `code`.
    ///
    /// # Panics
    ///
    /// When called on the idle thread, or if the dead thread is ever
    /// dispatched again.
    pub fn thr_exit(&self, code: i32) -> ! {
        let cur = self.current();
        assert!(!cur.is_idle(), "idle thread cannot exit");
        let tid = cur.tid();
        cur.set_exit_code(code);

        // Orphan our own children. Those already waiting for us to collect
        // them are let go.
        let waiting = {
            let mut family = cur.family.lock(self);
            family.exiting = true;
            for child in family.children.drain(..) {
                child.set_parent(INVALID_TID);
                child.clear_joinable();
            }
            core::mem::take(&mut family.exit_waiters)
        };
        for child in waiting {
            child.clear_joinable();
            self.sync_wake(&child.parent_wait, SyncReason::Destroyed);
        }

        let parent = match cur.parent() {
            INVALID_TID => None,
            ptid => self.find_thread(ptid),
        };
        if let Some(parent) = parent {
            let mut family = parent.family.lock(self);
            let linked = match family.children.iter().position(|c| Arc::ptr_eq(c, &cur)) {
                Some(pos) => {
                    family.children.swap_remove(pos);
                    true
                }
                None => false,
            };
            if linked && cur.is_joinable() {
                family.exit_waiters.push_back(cur.clone());
                self.sync_wake(&parent.children_wait, SyncReason::Released);
                while family.exit_waiters.iter().any(|c| Arc::ptr_eq(c, &cur)) {
                    let (_, relocked) = self.sync_wait_locked(&cur.parent_wait, family);
                    family = relocked;
                }
            } else if linked {
                self.sync_wake(&parent.children_wait, SyncReason::Released);
            }
        }

        self.dispatch.disable();
        cur.set_state(ThreadState::Exit);
        self.registry.remove(self, tid);
        if let Some(process) = cur.process() {
            process.detach(tid);
        }
        cur.events.clear();
        self.destroy_msg_queue(&cur.mque);
        cur.set_process(Some(self.kernel_proc.clone()));
        let stack = cur.take_stack();
        self.enter_dead(Corpse {
            thread: cur.clone(),
            stack,
        });
        log::debug!("thread {} exited with {}", tid, code);
        drop(cur);
        // Plain decrement: the switch below is unconditional.
        self.dispatch.enable();

        self.schedule();
        panic!("exited thread {} was dispatched again", tid);
    }

    /// Collect an exited joinable child of the current thread.
    ///
    /// Returns the child's tid and exit code and folds its CPU time into
    /// the caller's children counters.
    pub fn thr_wait(&self, target: Tid, flags: WaitFlags) -> KernelResult<(Tid, i32)> {
        if flags.contains(WaitFlags::PGRP) {
            return Err(Errno::Invalid);
        }
        let cur = self.current();
        let proc_id = cur.process_id();
        let mut family = cur.family.lock(self);
        loop {
            let pos = family
                .exit_waiters
                .iter()
                .position(|c| wait_matches(c, target, flags, proc_id));
            if let Some(child) = pos.and_then(|pos| family.exit_waiters.remove(pos)) {
                child.clear_joinable();
                cur.resource.absorb_child(&child.resources());
                let collected = (child.tid(), child.exit_code());
                self.sync_wake(&child.parent_wait, SyncReason::Released);
                drop(family);
                log::debug!("thread {} collected child {}", cur.tid(), collected.0);
                return Ok(collected);
            }

            let candidates = family
                .children
                .iter()
                .any(|c| c.is_joinable() && wait_matches(c, target, flags, proc_id));
            if !candidates {
                return Err(Errno::NoEntry);
            }
            if flags.contains(WaitFlags::NONBLOCK) {
                return Err(Errno::Again);
            }

            let (reason, relocked) = self.sync_wait_locked(&cur.children_wait, family);
            family = relocked;
            if reason != SyncReason::Released {
                return Err(Errno::Again);
            }
        }
    }

    /// Give a thread that is not running back to the system.
    ///
    /// Exited threads are normally reaped; destroying one is only possible
    /// once it has left the registry and the reaper queue.
    pub fn thr_destroy(&self, thr: &ThreadRef) -> KernelResult<()> {
        match thr.state() {
            ThreadState::Free => {
                self.registry.remove_free(self, thr);
            }
            ThreadState::Dormant => {
                self.registry.remove_dormant(self, thr);
                self.registry.remove(self, thr.tid());
                if let Some(process) = thr.process() {
                    process.detach(thr.tid());
                }
            }
            ThreadState::Exit => {
                if self.registry.contains(self, thr) {
                    return Err(Errno::TooManyLinks);
                }
                if self.reaper_pending(thr) {
                    return Err(Errno::Busy);
                }
            }
            _ => return Err(Errno::Busy),
        }

        if thr.tid() != INVALID_TID {
            self.registry.release_id(self, thr.tid());
        }
        if let Some(stack) = thr.take_stack() {
            self.stack_pool.deallocate(stack);
        }
        if let Some(ctx) = thr.take_context::<A::SavedContext>() {
            self.arch.release_context(ctx);
        }
        log::debug!("destroyed thread {}", thr.tid());
        thr.reset();
        Ok(())
    }

    /// Look a created thread up by id. Idle is not registered.
    pub fn find_thread(&self, tid: Tid) -> Option<ThreadRef> {
        self.registry.find(self, tid)
    }

    pub fn current_tid(&self) -> Tid {
        self.current().tid()
    }

    /// Number of registered threads, reaper included.
    pub fn thread_count(&self) -> usize {
        self.registry.len(self)
    }
}
