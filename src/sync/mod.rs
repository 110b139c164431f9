//! Blocking and waking.
//!
//! A [`SyncObject`] is a wait queue of [`SyncBlock`]s. Every suspension
//! point in the kernel parks the current thread on one (or, for timed
//! waits, two) of them. The waker writes the block's reason before the
//! thread becomes runnable again, so a resumed waiter always observes the
//! reason that released it.

pub mod lock;

pub use lock::{DispatchControl, IrqLock, IrqLockGuard};

use crate::arch::Arch;
use crate::errors::{Errno, KernelResult};
use crate::kernel::Kernel;
use crate::sched::Scheduler;
use crate::thread::{ThreadRef, ThreadState};
use portable_atomic::{AtomicU8, Ordering};

extern crate alloc;
use alloc::collections::VecDeque;
use alloc::sync::Arc;

/// Why a waiter was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncReason {
    /// Not released yet
    Waiting = 0,
    /// The awaited condition holds
    Released = 1,
    /// The object was torn down
    Destroyed = 2,
    /// The timer of a timed wait expired
    Timeout = 3,
    /// An asynchronous event interrupted the wait
    Event = 4,
}

impl SyncReason {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SyncReason::Released,
            2 => SyncReason::Destroyed,
            3 => SyncReason::Timeout,
            4 => SyncReason::Event,
            _ => SyncReason::Waiting,
        }
    }
}

/// How many waiters a single wake releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakePolicy {
    All,
    One,
}

/// One waiter linked into one [`SyncObject`].
pub struct SyncBlock {
    thread: ThreadRef,
    reason: AtomicU8,
}

impl SyncBlock {
    pub(crate) fn new(thread: ThreadRef) -> Arc<Self> {
        Arc::new(Self {
            thread,
            reason: AtomicU8::new(SyncReason::Waiting as u8),
        })
    }

    pub fn thread(&self) -> &ThreadRef {
        &self.thread
    }

    pub fn reason(&self) -> SyncReason {
        SyncReason::from_u8(self.reason.load(Ordering::Acquire))
    }

    pub(crate) fn set_reason(&self, reason: SyncReason) {
        self.reason.store(reason as u8, Ordering::Release);
    }
}

/// A wait queue with a wake policy.
pub struct SyncObject {
    policy: WakePolicy,
    queue: IrqLock<VecDeque<Arc<SyncBlock>>>,
}

impl SyncObject {
    pub const fn new(policy: WakePolicy) -> Self {
        Self {
            policy,
            queue: IrqLock::new(VecDeque::new()),
        }
    }

    pub fn policy(&self) -> WakePolicy {
        self.policy
    }

    pub fn waiters(&self, cpu: &dyn DispatchControl) -> usize {
        self.queue.lock(cpu).len()
    }

    pub fn has_waiters(&self, cpu: &dyn DispatchControl) -> bool {
        !self.queue.lock(cpu).is_empty()
    }

    /// `Busy` while waiters are still queued.
    ///
    /// Owners call this before dropping an object; wake the queue with
    /// [`SyncReason::Destroyed`] first to empty it.
    pub fn destroy_check(&self, cpu: &dyn DispatchControl) -> KernelResult<()> {
        let queued = self.waiters(cpu);
        if queued > 0 {
            log::warn!("destroy refused: {} waiter(s) queued", queued);
            Err(Errno::Busy)
        } else {
            Ok(())
        }
    }

    pub(crate) fn link(&self, cpu: &dyn DispatchControl, blk: Arc<SyncBlock>) {
        self.queue.lock(cpu).push_back(blk);
    }

    /// Drop every queued block without waking anyone. Teardown only.
    pub(crate) fn discard(&self, cpu: &dyn DispatchControl) -> usize {
        let mut queue = self.queue.lock(cpu);
        let n = queue.len();
        queue.clear();
        n
    }

    /// Remove `blk` if it is still queued. Returns whether it was.
    pub(crate) fn unlink(&self, cpu: &dyn DispatchControl, blk: &Arc<SyncBlock>) -> bool {
        let mut queue = self.queue.lock(cpu);
        match queue.iter().position(|b| Arc::ptr_eq(b, blk)) {
            Some(pos) => {
                queue.remove(pos);
                true
            }
            None => false,
        }
    }
}

impl Drop for SyncObject {
    fn drop(&mut self) {
        let left = self.queue.get_mut().len();
        if left != 0 {
            log::warn!("sync object dropped with {} waiter(s) queued", left);
        }
    }
}

impl<A: Arch, S: Scheduler> Kernel<A, S> {
    /// Queue the current thread on `obj` and mark it waiting, without
    /// switching away.
    ///
    /// The caller must follow up with [`Kernel::finish_wait`] once it has
    /// scheduled (or decided not to).
    pub fn wait_no_schedule(&self, obj: &SyncObject) -> Arc<SyncBlock> {
        let cur = self.current();
        let blk = SyncBlock::new(cur.clone());
        let mut queue = obj.queue.lock(self);
        cur.set_state(ThreadState::Wait);
        queue.push_back(blk.clone());
        blk
    }

    /// Collect the outcome of a wait started with [`Kernel::wait_no_schedule`].
    ///
    /// A block that is still queued was never woken by the object: the wait
    /// was interrupted and the result is [`SyncReason::Event`].
    pub fn finish_wait(&self, obj: &SyncObject, blk: &Arc<SyncBlock>) -> SyncReason {
        let cur = self.current();
        if obj.unlink(self, blk) {
            cur.transition(ThreadState::Wait, ThreadState::Run);
            return SyncReason::Event;
        }
        blk.reason()
    }

    /// Block the current thread on `obj` until it is woken.
    pub fn sync_wait(&self, obj: &SyncObject) -> SyncReason {
        let blk = self.wait_no_schedule(obj);
        if self.current().in_wait() {
            self.schedule();
        }
        self.finish_wait(obj, &blk)
    }

    /// Block on `obj` while atomically giving up `guard`.
    ///
    /// The current thread is queued before the guard is released, so a wake
    /// issued by whoever takes the lock next cannot be lost. The lock is
    /// reacquired before returning.
    pub fn sync_wait_locked<'a, T>(
        &'a self,
        obj: &SyncObject,
        guard: IrqLockGuard<'a, T>,
    ) -> (SyncReason, IrqLockGuard<'a, T>) {
        let blk = self.wait_no_schedule(obj);
        let lock = guard.unlock();
        if self.current().in_wait() {
            self.schedule();
        }
        let reason = self.finish_wait(obj, &blk);
        (reason, lock.lock(self))
    }

    /// Wake the waiters of `obj` with `reason`.
    ///
    /// Each block's reason is written before its thread is made ready.
    /// Returns the number of threads released.
    pub fn sync_wake(&self, obj: &SyncObject, reason: SyncReason) -> usize {
        let mut woken = 0;
        {
            let mut queue = obj.queue.lock(self);
            while let Some(blk) = queue.pop_front() {
                blk.set_reason(reason);
                self.sched_wakeup(&blk.thread);
                woken += 1;
                if obj.policy == WakePolicy::One {
                    break;
                }
            }
        }
        if !self.dispatch.is_disabled() {
            self.schedule();
        }
        woken
    }

    /// Release every waiter of `obj` with [`SyncReason::Destroyed`].
    pub fn sync_destroy(&self, obj: &SyncObject) -> usize {
        let mut woken = 0;
        loop {
            let n = self.sync_wake(obj, SyncReason::Destroyed);
            if n == 0 {
                break;
            }
            woken += n;
        }
        woken
    }
}
