//! Ticks, time slices, callouts and timed waits.

pub mod callout;
pub mod tick;
pub mod wait;

pub use callout::{CalloutAction, CalloutKey, CalloutQueue};
pub use tick::{SliceCounter, TickCounter};
pub use wait::TimedWait;

/// How long a blocking operation may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Do not block at all
    Poll,
    /// Block until released
    Forever,
    /// Block for at most this many milliseconds
    Millis(u64),
}

impl Timeout {
    /// Decode the raw syscall convention: `0` polls, negative waits forever.
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            0 => Timeout::Poll,
            r if r < 0 => Timeout::Forever,
            ms => Timeout::Millis(ms as u64),
        }
    }

    pub fn is_poll(self) -> bool {
        self == Timeout::Poll
    }
}

/// Convert a duration to callout ticks.
///
/// The extra tick guarantees at least the requested time passes even when
/// the wait starts just before a tick boundary.
pub const fn ms_to_ticks(ms: u64, ms_per_tick: u64) -> u64 {
    ms / ms_per_tick + 1
}

/// Timer state owned by a kernel instance.
pub struct Timer {
    pub(crate) uptime: TickCounter,
    pub(crate) callouts: CalloutQueue,
}

impl Timer {
    pub const fn new(hz: u32) -> Self {
        Self {
            uptime: TickCounter::new(hz),
            callouts: CalloutQueue::new(),
        }
    }

    pub fn ticks(&self) -> u64 {
        self.uptime.ticks()
    }
}
