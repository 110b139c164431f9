//! Thread scheduling.
//!
//! [`Scheduler`] orders ready threads; [`DispatchState`] tracks when the
//! kernel may switch; `switch` holds `schedule()` itself.

pub mod dispatch;
pub mod priority;
pub mod switch;
pub mod trait_def;

pub use dispatch::DispatchState;
pub use priority::PriorityScheduler;
pub use trait_def::{CpuId, Scheduler};

/// Default scheduler type.
pub type DefaultScheduler = PriorityScheduler;
