//! Per-thread asynchronous events.
//!
//! Events are a pending bitmap plus a mask. Delivering an unmasked event to
//! a waiting thread makes it runnable; the interrupted wait then reports
//! [`SyncReason::Event`](crate::sync::SyncReason::Event). Decoding what an
//! event means is up to the receiver.

use super::{ThreadState, Tid};
use crate::arch::Arch;
use crate::errors::{Errno, KernelResult};
use crate::kernel::Kernel;
use crate::sched::Scheduler;
use portable_atomic::{AtomicU64, Ordering};

/// Event number, `0..64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EventId(u8);

impl EventId {
    /// Terminates the receiver; cannot be masked.
    pub const KILL: EventId = EventId(9);
    pub const MAX: u8 = 64;

    pub const fn new(id: u8) -> Option<Self> {
        if id < Self::MAX {
            Some(Self(id))
        } else {
            None
        }
    }

    pub const fn id(self) -> u8 {
        self.0
    }

    const fn bit(self) -> u64 {
        1u64 << self.0
    }
}

bitflags::bitflags! {
    /// A set of [`EventId`]s.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventSet: u64 {
        const KILL = 1 << 9;
    }
}

impl EventSet {
    pub fn of(id: EventId) -> Self {
        Self::from_bits_retain(id.bit())
    }
}

pub struct EventQueue {
    pending: AtomicU64,
    mask: AtomicU64,
}

impl EventQueue {
    pub const fn new() -> Self {
        Self {
            pending: AtomicU64::new(0),
            mask: AtomicU64::new(0),
        }
    }

    /// Mark `id` pending. Returns `true` if it is deliverable now.
    pub fn post(&self, id: EventId) -> bool {
        self.pending.fetch_or(id.bit(), Ordering::AcqRel);
        self.mask.load(Ordering::Acquire) & id.bit() == 0
    }

    /// Whether an unmasked event is pending.
    pub fn has_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire) & !self.mask.load(Ordering::Acquire) != 0
    }

    pub fn pending(&self) -> EventSet {
        EventSet::from_bits_retain(self.pending.load(Ordering::Acquire))
    }

    /// Dequeue the lowest numbered deliverable event.
    pub fn take_next(&self) -> Option<EventId> {
        loop {
            let pending = self.pending.load(Ordering::Acquire);
            let ready = pending & !self.mask.load(Ordering::Acquire);
            if ready == 0 {
                return None;
            }
            let id = ready.trailing_zeros() as u8;
            let bit = 1u64 << id;
            if self
                .pending
                .compare_exchange(pending, pending & !bit, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(EventId(id));
            }
        }
    }

    pub fn mask(&self) -> EventSet {
        EventSet::from_bits_retain(self.mask.load(Ordering::Acquire))
    }

    /// Replace the mask. KILL stays deliverable whatever is asked.
    pub fn set_mask(&self, mask: EventSet) {
        let mask = mask.difference(EventSet::KILL);
        self.mask.store(mask.bits(), Ordering::Release);
    }

    /// Mask everything except KILL.
    pub fn mask_all(&self) {
        self.set_mask(EventSet::from_bits_retain(u64::MAX));
    }

    /// Drop every pending event.
    pub fn clear(&self) {
        self.pending.store(0, Ordering::Release);
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Arch, S: Scheduler> Kernel<A, S> {
    /// Post event `id` to thread `tid`.
    ///
    /// An unmasked event interrupts a wait in progress.
    pub fn ev_send(&self, tid: Tid, id: EventId) -> KernelResult<()> {
        let thr = self.find_thread(tid).ok_or(Errno::NoEntry)?;
        if thr.state() == ThreadState::Exit {
            return Err(Errno::NoEntry);
        }
        log::trace!("event {} -> tid {}", id.id(), tid);
        if thr.events.post(id) && thr.in_wait() {
            self.sched_wakeup(&thr);
            if !self.dispatch.is_disabled() {
                self.schedule();
            }
        }
        Ok(())
    }
}
