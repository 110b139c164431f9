//! Scheduler trait definition.

use crate::thread::{ReadyRef, Thread};

/// CPU identifier type.
pub type CpuId = usize;

/// Ready-queue policy used by [`Kernel::schedule`](crate::Kernel::schedule).
///
/// The kernel owns thread state transitions; a scheduler only orders the
/// threads it is handed. The idle thread is never enqueued.
pub trait Scheduler: Send + Sync + 'static {
    /// Enqueue a thread that is ready to run.
    ///
    /// Called when a thread is started, woken, or put back by a yield or
    /// slice expiry. Threads of equal priority leave in insertion order.
    ///
    /// # Arguments
    ///
    /// * `thread` - Ready thread to enqueue
    fn enqueue(&self, thread: ReadyRef);

    /// Pick the next thread to run on the given CPU.
    ///
    /// # Returns
    ///
    /// The highest priority ready thread, or `None` if only idle is left.
    fn pick_next(&self, cpu_id: CpuId) -> Option<ReadyRef>;

    /// Whether some ready thread has a priority strictly above `priority`.
    fn has_ready_above(&self, priority: u8) -> bool;

    /// Charge one tick to the running thread.
    ///
    /// # Returns
    ///
    /// `true` if its time slice expired and it should go back to the tail
    /// of its ready queue.
    fn on_tick(&self, current: &Thread) -> bool {
        current.slice.tick()
    }

    /// Number of queued threads.
    fn ready_count(&self) -> usize;
}
