//! Tick counting and time slice management.

use portable_atomic::{AtomicU32, AtomicU64, Ordering};

/// Monotonic tick counter driven by the timer interrupt.
pub struct TickCounter {
    /// Number of ticks since boot
    ticks: AtomicU64,
    /// Tick frequency in Hz
    frequency: u32,
    /// Nanoseconds per tick
    ns_per_tick: u64,
}

impl TickCounter {
    /// Create a new tick counter with the given frequency.
    ///
    /// # Arguments
    ///
    /// * `frequency` - Timer frequency in Hz, non-zero
    pub const fn new(frequency: u32) -> Self {
        Self {
            ticks: AtomicU64::new(0),
            frequency,
            ns_per_tick: 1_000_000_000 / frequency as u64,
        }
    }

    /// Advance by one tick and return the new count.
    ///
    /// Only the timer interrupt path calls this.
    pub fn increment(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Get the current tick count.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Get the tick frequency in Hz.
    pub fn frequency(&self) -> u32 {
        self.frequency
    }

    pub fn ticks_to_nanos(&self, ticks: u64) -> u64 {
        ticks.saturating_mul(self.ns_per_tick)
    }

    pub fn ticks_to_millis(&self, ticks: u64) -> u64 {
        self.ticks_to_nanos(ticks) / 1_000_000
    }
}

/// Remaining time slice of one thread, in ticks.
///
/// The slice is reloaded each time the thread is dispatched; the timer
/// interrupt counts it down while the thread runs.
pub struct SliceCounter {
    /// Slice length reloaded on dispatch
    slice: AtomicU32,
    remaining: AtomicU32,
}

impl SliceCounter {
    pub const fn new(slice: u32) -> Self {
        Self {
            slice: AtomicU32::new(slice),
            remaining: AtomicU32::new(slice),
        }
    }

    /// Set the slice length used by the next reload.
    pub fn set_slice(&self, slice: u32) {
        self.slice.store(slice, Ordering::Release);
    }

    pub fn slice(&self) -> u32 {
        self.slice.load(Ordering::Acquire)
    }

    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn reload(&self) {
        self.remaining.store(self.slice(), Ordering::Release);
    }

    /// Charge one tick.
    ///
    /// Returns `true` when the slice has run out; the counter is reloaded so
    /// the next slice starts full.
    pub fn tick(&self) -> bool {
        let left = self.remaining.load(Ordering::Acquire).saturating_sub(1);
        if left == 0 {
            self.reload();
            true
        } else {
            self.remaining.store(left, Ordering::Release);
            false
        }
    }
}
