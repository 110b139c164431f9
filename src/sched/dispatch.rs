//! Per-CPU dispatch bookkeeping.
//!
//! "Dispatch disabled" is a nesting counter plus an interrupt depth, not a
//! lock. Wakeups performed while it is disabled only raise the delayed
//! dispatch flag; the next point where dispatch becomes enabled again runs
//! the scheduler.

use portable_atomic::{AtomicBool, AtomicU32, Ordering};

#[derive(Debug, Default)]
pub struct DispatchState {
    preempt: AtomicU32,
    irq_depth: AtomicU32,
    delayed: AtomicBool,
}

impl DispatchState {
    pub const fn new() -> Self {
        Self {
            preempt: AtomicU32::new(0),
            irq_depth: AtomicU32::new(0),
            delayed: AtomicBool::new(false),
        }
    }

    pub fn disable(&self) {
        self.preempt.fetch_add(1, Ordering::AcqRel);
    }

    /// Leave one nesting level.
    ///
    /// Returns `true` when the caller should now run the scheduler.
    pub fn enable(&self) -> bool {
        let prev = self.preempt.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "dispatch enabled more often than disabled");
        prev == 1 && self.irq_depth.load(Ordering::Acquire) == 0 && self.is_requested()
    }

    pub fn is_disabled(&self) -> bool {
        self.preempt.load(Ordering::Acquire) != 0 || self.irq_depth.load(Ordering::Acquire) != 0
    }

    pub fn preempt_count(&self) -> u32 {
        self.preempt.load(Ordering::Acquire)
    }

    pub fn in_interrupt(&self) -> bool {
        self.irq_depth.load(Ordering::Acquire) != 0
    }

    pub fn irq_enter(&self) {
        self.irq_depth.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns `true` when the interrupt exit path should run the scheduler.
    pub fn irq_exit(&self) -> bool {
        let prev = self.irq_depth.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "interrupt exit without matching entry");
        prev == 1 && self.preempt.load(Ordering::Acquire) == 0 && self.is_requested()
    }

    /// Ask for a reschedule at the next dispatch-enabled point.
    pub fn request(&self) {
        self.delayed.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.delayed.load(Ordering::Acquire)
    }

    pub fn clear_request(&self) {
        self.delayed.store(false, Ordering::Release);
    }
}
