//! Timed waits and the tick handler.
//!
//! A timed wait parks the thread on two objects at once: the caller's
//! object and a private timer object woken by a callout. Both are linked
//! before the thread sleeps and both are drained before the wait returns,
//! so a late timeout never touches a finished wait and no callout outlives
//! the wait that registered it.

use super::{ms_to_ticks, CalloutAction, CalloutKey};
use crate::arch::Arch;
use crate::kernel::Kernel;
use crate::sched::Scheduler;
use crate::sync::{DispatchControl, SyncBlock, SyncObject, SyncReason, WakePolicy};
use crate::thread::ThreadState;

extern crate alloc;
use alloc::boxed::Box;
use alloc::sync::Arc;

/// Bookkeeping of one timed wait between its two halves.
pub struct TimedWait {
    blk: Arc<SyncBlock>,
    timer: Arc<SyncObject>,
    timer_blk: Arc<SyncBlock>,
    key: CalloutKey,
}

impl TimedWait {
    /// Tick at which the timer fires.
    pub fn expire(&self) -> u64 {
        self.key.expire
    }
}

impl<A: Arch, S: Scheduler> Kernel<A, S> {
    /// Ticks since boot.
    pub fn uptime(&self) -> u64 {
        self.timer.ticks()
    }

    fn deadline(&self, ms: u64) -> u64 {
        self.uptime() + ms_to_ticks(ms, self.config.ms_per_tick())
    }

    /// First half of a timed wait on `obj`.
    ///
    /// Registers the callout, then links the timer block and the object
    /// block, then marks the current thread waiting, all with dispatch
    /// disabled.
    pub fn timed_wait_no_schedule(&self, obj: &SyncObject, ms: u64) -> TimedWait {
        let cur = self.current();
        self.disable_dispatch();
        let flags = self.arch.irq_save();

        let timer = Arc::new(SyncObject::new(WakePolicy::All));
        let key = self
            .timer
            .callouts
            .insert(self, self.deadline(ms), CalloutAction::Timeout(timer.clone()));
        let timer_blk = SyncBlock::new(cur.clone());
        timer.link(self, timer_blk.clone());
        let blk = SyncBlock::new(cur.clone());
        obj.link(self, blk.clone());
        cur.set_state(ThreadState::Wait);

        self.arch.irq_restore(flags);
        self.enable_dispatch();
        TimedWait {
            blk,
            timer,
            timer_blk,
            key,
        }
    }

    /// Second half of a timed wait: decide who won and clean both queues.
    ///
    /// The object's reason wins over the timer's when both fired. When
    /// neither did the wait was interrupted and the result is
    /// [`SyncReason::Event`].
    pub fn finish_timed_wait(&self, obj: &SyncObject, tw: TimedWait) -> SyncReason {
        let cur = self.current();
        self.disable_dispatch();
        let flags = self.arch.irq_save();

        obj.unlink(self, &tw.blk);
        tw.timer.unlink(self, &tw.timer_blk);
        let obj_reason = tw.blk.reason();
        let timer_reason = tw.timer_blk.reason();
        if timer_reason == SyncReason::Waiting {
            self.timer.callouts.cancel(self, tw.key);
        }
        cur.transition(ThreadState::Wait, ThreadState::Run);
        debug_assert!(!tw.timer.has_waiters(self));

        self.arch.irq_restore(flags);
        self.enable_dispatch();

        if obj_reason != SyncReason::Waiting {
            obj_reason
        } else if timer_reason != SyncReason::Waiting {
            timer_reason
        } else {
            SyncReason::Event
        }
    }

    /// Block on `obj` for at most `ms` milliseconds.
    pub fn tim_wait_obj(&self, obj: &SyncObject, ms: u64) -> SyncReason {
        let tw = self.timed_wait_no_schedule(obj, ms);
        if self.current().in_wait() {
            self.schedule();
        }
        self.finish_timed_wait(obj, tw)
    }

    /// Sleep for `ms` milliseconds.
    ///
    /// Returns [`SyncReason::Timeout`] after a full sleep and
    /// [`SyncReason::Event`] when interrupted early.
    pub fn tim_wait(&self, ms: u64) -> SyncReason {
        let private = SyncObject::new(WakePolicy::One);
        self.tim_wait_obj(&private, ms)
    }

    /// Run `f` in interrupt context once `ms` milliseconds have passed.
    pub fn callout_register(&self, ms: u64, f: impl FnOnce() + Send + 'static) -> CalloutKey {
        self.timer
            .callouts
            .insert(self, self.deadline(ms), CalloutAction::Call(Box::new(f)))
    }

    /// `false` if the callout already fired.
    pub fn callout_cancel(&self, key: CalloutKey) -> bool {
        self.timer.callouts.cancel(self, key).is_some()
    }

    pub fn pending_callouts(&self) -> usize {
        self.timer.callouts.len(self)
    }

    /// Fire every callout due at or before `now`.
    pub(crate) fn invoke_callout(&self, now: u64) {
        for action in self.timer.callouts.take_expired(self, now) {
            match action {
                CalloutAction::Timeout(timer) => {
                    self.sync_wake(&timer, SyncReason::Timeout);
                }
                CalloutAction::Call(f) => f(),
            }
        }
    }

    /// Timer interrupt handler.
    ///
    /// Advances the clock, charges the running thread, expires its slice and
    /// fires due callouts. Dispatch happens on the way out.
    pub fn timer_interrupt(&self) {
        self.dispatch.irq_enter();
        let now = self.timer.uptime.increment();

        let cur = self.current();
        if !cur.is_idle() {
            if cur.is_kernel() {
                cur.resource.charge_sys();
            } else {
                cur.resource.charge_user();
            }
            if cur.state() == ThreadState::Run && self.scheduler.on_tick(&cur) {
                cur.set_state(ThreadState::Ready);
                self.dispatch.request();
            }
        }
        drop(cur);

        self.invoke_callout(now);

        if self.dispatch.irq_exit() {
            self.schedule();
        }
    }
}
