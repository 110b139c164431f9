//! Boot-time kernel parameters.

use crate::errors::{Errno, KernelResult};
use crate::mem::StackSizeClass;

/// Tunables fixed when a [`Kernel`](crate::Kernel) is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Timer interrupts per second
    pub hz: u32,
    /// Number of priority levels (`0..max_prio`, larger runs first)
    pub max_prio: u8,
    /// User threads must use a priority below this bound
    pub max_user_prio: u8,
    /// Time slice reloaded when a thread is dispatched, in ticks
    pub default_slice: u32,
    pub min_slice: u32,
    pub max_slice: u32,
    /// System thread ids are `1..reserved_ids`
    pub reserved_ids: u64,
    /// Size of the thread id space
    pub nr_ids: u64,
    /// Kernel stack size class handed to every thread
    pub kernel_stack: StackSizeClass,
    /// Priority of the boot thread running `main`
    pub init_prio: u8,
}

impl KernelConfig {
    pub const fn new() -> Self {
        const MAX_PRIO: u8 = 32;
        Self {
            hz: 100,
            max_prio: MAX_PRIO,
            max_user_prio: 16,
            default_slice: 21,
            min_slice: 1,
            max_slice: 40,
            reserved_ids: 255,
            nr_ids: 4096,
            kernel_stack: StackSizeClass::Medium,
            init_prio: Self::init_prio_for(MAX_PRIO),
        }
    }

    pub const fn with_hz(mut self, hz: u32) -> Self {
        self.hz = hz;
        self
    }

    /// Also moves init to just below the reaper. Call
    /// [`with_init_prio`](Self::with_init_prio) afterwards to override.
    pub const fn with_max_prio(mut self, max_prio: u8) -> Self {
        self.max_prio = max_prio;
        self.init_prio = Self::init_prio_for(max_prio);
        self
    }

    pub const fn with_slice(mut self, slice: u32) -> Self {
        self.default_slice = slice;
        self
    }

    pub const fn with_ids(mut self, reserved: u64, total: u64) -> Self {
        self.reserved_ids = reserved;
        self.nr_ids = total;
        self
    }

    pub const fn with_init_prio(mut self, prio: u8) -> Self {
        self.init_prio = prio;
        self
    }

    /// Default init priority for `max_prio` levels: one below the reaper.
    pub const fn init_prio_for(max_prio: u8) -> u8 {
        max_prio.saturating_sub(2)
    }

    /// Priority of the reaper thread.
    pub const fn reaper_prio(&self) -> u8 {
        self.max_prio - 1
    }

    /// Milliseconds covered by one tick (never zero).
    pub const fn ms_per_tick(&self) -> u64 {
        if self.hz == 0 {
            return 1;
        }
        let ms = 1000 / self.hz as u64;
        if ms == 0 {
            1
        } else {
            ms
        }
    }

    /// Check the parameters for internal consistency.
    pub fn validate(&self) -> KernelResult<()> {
        if self.hz == 0 || self.hz > 1000 {
            return Err(Errno::Invalid);
        }
        // The ready bitmap is one 64-bit word.
        if self.max_prio < 2 || self.max_prio > 64 {
            return Err(Errno::Invalid);
        }
        if self.max_user_prio == 0 || self.max_user_prio > self.max_prio {
            return Err(Errno::Invalid);
        }
        if self.min_slice == 0
            || self.min_slice > self.max_slice
            || self.default_slice < self.min_slice
            || self.default_slice > self.max_slice
        {
            return Err(Errno::Invalid);
        }
        // ids 0 and 1 belong to idle and the reaper
        if self.reserved_ids < 2 || self.reserved_ids >= self.nr_ids {
            return Err(Errno::Invalid);
        }
        if self.init_prio >= self.reaper_prio() {
            return Err(Errno::Invalid);
        }
        Ok(())
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}
