//! Fixed-priority scheduler.
//!
//! One FIFO queue per priority level plus a bitmap of non-empty levels.
//! Larger numbers run first; there is no aging.

use super::trait_def::{CpuId, Scheduler};
use crate::thread::ReadyRef;
use portable_atomic::{AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

extern crate alloc;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

pub struct PriorityScheduler {
    levels: Vec<Mutex<VecDeque<ReadyRef>>>,
    /// Bit `p` set while level `p` is non-empty
    nonempty: AtomicU64,
    ready: AtomicUsize,
}

impl PriorityScheduler {
    /// Create a scheduler for priorities `0..max_prio` (at most 64 levels).
    pub fn new(max_prio: u8) -> Self {
        let levels = (0..max_prio.clamp(1, 64)).map(|_| Mutex::new(VecDeque::new())).collect();
        Self {
            levels,
            nonempty: AtomicU64::new(0),
            ready: AtomicUsize::new(0),
        }
    }

    pub fn levels(&self) -> usize {
        self.levels.len()
    }

    fn level_of(&self, prio: u8) -> usize {
        (prio as usize).min(self.levels.len() - 1)
    }

    /// Thread ids queued at `prio`, head first.
    pub fn queued_at(&self, prio: u8) -> Vec<u64> {
        self.levels[self.level_of(prio)]
            .lock()
            .iter()
            .map(|r| r.thread().tid())
            .collect()
    }
}

impl Scheduler for PriorityScheduler {
    fn enqueue(&self, thread: ReadyRef) {
        let level = self.level_of(thread.priority());
        let mut queue = self.levels[level].lock();
        queue.push_back(thread);
        self.nonempty.fetch_or(1 << level, Ordering::AcqRel);
        self.ready.fetch_add(1, Ordering::AcqRel);
    }

    fn pick_next(&self, _cpu_id: CpuId) -> Option<ReadyRef> {
        loop {
            let bits = self.nonempty.load(Ordering::Acquire);
            if bits == 0 {
                return None;
            }
            let level = 63 - bits.leading_zeros() as usize;
            let mut queue = self.levels[level].lock();
            let next = queue.pop_front();
            if queue.is_empty() {
                self.nonempty.fetch_and(!(1 << level), Ordering::AcqRel);
            }
            if let Some(thread) = next {
                self.ready.fetch_sub(1, Ordering::AcqRel);
                return Some(thread);
            }
        }
    }

    fn has_ready_above(&self, priority: u8) -> bool {
        let bits = self.nonempty.load(Ordering::Acquire);
        bits.checked_shr(priority as u32 + 1).unwrap_or(0) != 0
    }

    fn ready_count(&self) -> usize {
        self.ready.load(Ordering::Acquire)
    }
}
