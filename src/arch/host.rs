//! Host backend for the HAL seam.
//!
//! Every kernel thread is backed by a parked host thread. A context is a
//! baton: `context_switch` parks the previous baton, hands the CPU to the
//! next one and sleeps until its own baton comes back, so exactly one kernel
//! thread executes at any time. Interrupts are simulated: the idle thread
//! receives one timer tick per `wait_for_interrupt` call.
//!
//! Ticks are only delivered while the idle thread runs. A busy thread is
//! never preempted by the clock on this backend: code that needs slice
//! expiry or a callout to fire while it keeps the CPU calls
//! [`Kernel::timer_interrupt`](crate::Kernel::timer_interrupt) itself.
//! Once the idle budget (see [`HostArch::with_idle_budget`]) is used up,
//! `wait_for_interrupt` panics: every thread is blocked and nothing will
//! ever wake them.

extern crate std;

use super::{Arch, IntrFlags, ThreadEntry};
use crate::errors::{Errno, KernelResult};
use crate::mem::KernelStack;
use crate::proc::Process;
use portable_atomic::{AtomicBool, AtomicU64, Ordering};
use std::any::Any;
use std::boxed::Box;
use std::panic::{self, AssertUnwindSafe};
use std::string::String;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Default number of idle ticks before the host declares a deadlock.
pub const DEFAULT_IDLE_BUDGET: u64 = 1_000_000;

/// Host stack reserved for each kernel thread.
pub const DEFAULT_HOST_STACK: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Turn {
    Parked,
    Running,
    Retired,
}

/// Unwind payload used to tear down the host thread of a released context.
struct Retired;

struct Baton {
    turn: Mutex<Turn>,
    cv: Condvar,
}

impl Baton {
    fn new(turn: Turn) -> Self {
        Self {
            turn: Mutex::new(turn),
            cv: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Turn> {
        self.turn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn park(&self) {
        let mut turn = self.lock();
        if *turn == Turn::Running {
            *turn = Turn::Parked;
        }
    }

    fn resume(&self) {
        let mut turn = self.lock();
        if *turn != Turn::Retired {
            *turn = Turn::Running;
        }
        self.cv.notify_all();
    }

    fn retire(&self) {
        *self.lock() = Turn::Retired;
        self.cv.notify_all();
    }

    /// Block until this baton runs again. `false` once retired.
    fn wait_turn(&self) -> bool {
        let mut turn = self.lock();
        loop {
            match *turn {
                Turn::Running => return true,
                Turn::Retired => return false,
                Turn::Parked => {
                    turn = self.cv.wait(turn).unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }
}

/// Saved context of one kernel thread on the host.
pub struct HostContext(Arc<Baton>);

struct Shared {
    /// Baton of the boot flow, resumed when a kernel thread panics
    boot: Mutex<Option<Arc<Baton>>>,
    failure: Mutex<Option<Box<dyn Any + Send>>>,
}

impl Shared {
    fn take_failure(&self) -> Option<Box<dyn Any + Send>> {
        self.failure.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn fail(&self, payload: Box<dyn Any + Send>) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(payload);
        if let Some(boot) = self.boot.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            boot.resume();
        }
    }
}

/// Counters exposed for tests.
#[derive(Debug, Default)]
pub struct HostStats {
    pub context_switches: AtomicU64,
    pub address_space_switches: AtomicU64,
    pub fpu_saves: AtomicU64,
    pub fpu_restores: AtomicU64,
    pub contexts_released: AtomicU64,
}

/// [`Arch`] implementation backed by host threads.
pub struct HostArch {
    irq_enabled: AtomicBool,
    idle_budget: AtomicU64,
    current_space: AtomicU64,
    host_stack: usize,
    shared: Arc<Shared>,
    stats: HostStats,
}

impl HostArch {
    pub fn new() -> Self {
        Self::with_idle_budget(DEFAULT_IDLE_BUDGET)
    }

    /// Create a backend that reports a deadlock after `ticks` idle ticks.
    pub fn with_idle_budget(ticks: u64) -> Self {
        Self {
            irq_enabled: AtomicBool::new(false),
            idle_budget: AtomicU64::new(ticks),
            current_space: AtomicU64::new(0),
            host_stack: DEFAULT_HOST_STACK,
            shared: Arc::new(Shared {
                boot: Mutex::new(None),
                failure: Mutex::new(None),
            }),
            stats: HostStats::default(),
        }
    }

    pub fn stats(&self) -> &HostStats {
        &self.stats
    }

    /// Id of the process whose address space is loaded.
    pub fn current_space(&self) -> u64 {
        self.current_space.load(Ordering::Acquire)
    }

    fn resume_failure(&self) {
        if let Some(payload) = self.shared.take_failure() {
            panic::resume_unwind(payload);
        }
    }
}

impl Default for HostArch {
    fn default() -> Self {
        Self::new()
    }
}

impl Arch for HostArch {
    type SavedContext = HostContext;

    fn new_context(&self, _stack: &KernelStack, entry: ThreadEntry) -> KernelResult<HostContext> {
        let baton = Arc::new(Baton::new(Turn::Parked));
        let own = baton.clone();
        let shared = self.shared.clone();

        std::thread::Builder::new()
            .name(String::from("kthread"))
            .stack_size(self.host_stack)
            .spawn(move || {
                if !own.wait_turn() {
                    return;
                }
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry)) {
                    if !payload.is::<Retired>() {
                        shared.fail(payload);
                    }
                }
            })
            .map_err(|_| Errno::NoMemory)?;

        Ok(HostContext(baton))
    }

    fn boot_context(&self) -> HostContext {
        let baton = Arc::new(Baton::new(Turn::Running));
        *self.shared.boot.lock().unwrap_or_else(PoisonError::into_inner) = Some(baton.clone());
        HostContext(baton)
    }

    unsafe fn context_switch(&self, prev: *const HostContext, next: *const HostContext) {
        // Own both batons before the CPU changes hands; `*prev` may be
        // released by the next thread.
        let (prev, next) = unsafe { ((*prev).0.clone(), (*next).0.clone()) };
        self.stats.context_switches.fetch_add(1, Ordering::Relaxed);

        prev.park();
        next.resume();
        let running = prev.wait_turn();
        drop(next);

        if !running {
            drop(prev);
            panic::resume_unwind(Box::new(Retired));
        }
        self.resume_failure();
    }

    fn release_context(&self, ctx: HostContext) {
        self.stats.contexts_released.fetch_add(1, Ordering::Relaxed);
        ctx.0.retire();
    }

    #[cfg(feature = "full-fpu")]
    unsafe fn save_fpu(&self, _ctx: *const HostContext) {
        self.stats.fpu_saves.fetch_add(1, Ordering::Relaxed);
    }

    #[cfg(feature = "full-fpu")]
    unsafe fn restore_fpu(&self, _ctx: *const HostContext) {
        self.stats.fpu_restores.fetch_add(1, Ordering::Relaxed);
    }

    fn irq_save(&self) -> IntrFlags {
        if self.irq_enabled.swap(false, Ordering::AcqRel) {
            IntrFlags::ENABLED
        } else {
            IntrFlags::DISABLED
        }
    }

    fn irq_restore(&self, flags: IntrFlags) {
        self.irq_enabled.store(flags.enabled(), Ordering::Release);
    }

    fn interrupts_enabled(&self) -> bool {
        self.irq_enabled.load(Ordering::Acquire)
    }

    fn switch_address_space(&self, next: &Process) {
        self.stats.address_space_switches.fetch_add(1, Ordering::Relaxed);
        self.current_space.store(next.id(), Ordering::Release);
    }

    fn wait_for_interrupt(&self) -> bool {
        let left = self.idle_budget.fetch_sub(1, Ordering::AcqRel);
        assert!(left > 0, "host idle budget exhausted: every kernel thread is blocked");
        true
    }
}
