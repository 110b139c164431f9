//! The kernel instance.
//!
//! [`Kernel`] owns everything the core coordinates: the HAL backend, the
//! scheduler, the thread registry, the timer and the reaper. Instances are
//! independent of each other, so tests boot as many as they like.

use crate::arch::{Arch, IntrFlags};
use crate::config::KernelConfig;
use crate::errors::{Errno, KernelResult};
use crate::mem::StackPool;
use crate::proc::Process;
use crate::sched::{DispatchState, PriorityScheduler, Scheduler};
use crate::sync::DispatchControl;
use crate::thread::reaper::{Corpse, Reaper};
use crate::thread::{
    Thread, ThreadBuilder, ThreadFlags, ThreadKind, ThreadRef, ThreadRegistry, ThreadState, Tid,
    IDLE_TID,
};
use crate::time::{CalloutAction, Timer};
use portable_atomic::{AtomicBool, AtomicI32, Ordering};

extern crate alloc;
use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

/// Main kernel handle.
///
/// # Type Parameters
///
/// * `A` - Architecture implementation
/// * `S` - Scheduler implementation
pub struct Kernel<A: Arch, S: Scheduler = PriorityScheduler> {
    pub(crate) arch: A,
    pub(crate) config: KernelConfig,
    pub(crate) scheduler: S,
    pub(crate) dispatch: DispatchState,
    /// Thread owning the CPU
    pub(crate) current: spin::Mutex<ThreadRef>,
    pub(crate) idle: ThreadRef,
    pub(crate) registry: ThreadRegistry,
    pub(crate) timer: Timer,
    pub(crate) stack_pool: StackPool,
    pub(crate) reaper: Reaper,
    pub(crate) kernel_proc: Arc<Process>,
    booted: AtomicBool,
    shutdown: AtomicBool,
    exit_code: AtomicI32,
    /// Handed to every thread entry closure
    pub(crate) me: Weak<Self>,
}

impl<A: Arch> Kernel<A> {
    /// Create a kernel with the default priority scheduler.
    pub fn new(arch: A, config: KernelConfig) -> KernelResult<Arc<Self>> {
        Self::with_scheduler(arch, config, PriorityScheduler::new(config.max_prio))
    }
}

impl<A: Arch, S: Scheduler> Kernel<A, S> {
    /// Create a kernel around an explicit scheduler.
    ///
    /// The calling flow becomes the idle thread (tid 0) once [`Kernel::run`]
    /// is entered.
    pub fn with_scheduler(
        arch: A,
        config: KernelConfig,
        scheduler: S,
    ) -> KernelResult<Arc<Self>> {
        config.validate()?;

        let kernel_proc = Process::kernel();
        let idle = Thread::new_free(None);
        idle.set_tid(IDLE_TID);
        idle.set_kind(ThreadKind::Kernel);
        idle.set_priority(0);
        idle.set_process(Some(kernel_proc.clone()));
        idle.set_name("idle");
        idle.events.mask_all();
        idle.set_state(ThreadState::Run);

        Ok(Arc::new_cyclic(|me| Self {
            arch,
            config,
            scheduler,
            dispatch: DispatchState::new(),
            current: spin::Mutex::new(idle.clone()),
            idle,
            registry: ThreadRegistry::new(config.reserved_ids, config.nr_ids),
            timer: Timer::new(config.hz),
            stack_pool: StackPool::new(),
            reaper: Reaper::new(),
            kernel_proc,
            booted: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            exit_code: AtomicI32::new(0),
            me: me.clone(),
        }))
    }

    /// The running thread.
    pub fn current(&self) -> ThreadRef {
        self.current.lock().clone()
    }

    pub fn idle_thread(&self) -> &ThreadRef {
        &self.idle
    }

    pub fn arch(&self) -> &A {
        &self.arch
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn stack_pool(&self) -> &StackPool {
        &self.stack_pool
    }

    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    /// Process every kernel thread belongs to.
    pub fn kernel_process(&self) -> &Arc<Process> {
        &self.kernel_proc
    }

    pub fn is_booted(&self) -> bool {
        self.booted.load(Ordering::Acquire)
    }

    /// Spawn a kernel thread at `priority` as a child of the current thread.
    ///
    /// # Returns
    ///
    /// The tid of the new thread.
    pub fn spawn<F>(&self, priority: u8, f: F) -> KernelResult<Tid>
    where
        F: FnOnce(&Kernel<A, S>) -> i32 + Send + 'static,
    {
        ThreadBuilder::new().priority(priority).spawn(self, f)
    }

    /// Boot the kernel and run `main` as the init thread.
    ///
    /// The calling flow turns into the idle thread until `main` returns.
    /// Every thread still alive at that point is torn down.
    ///
    /// # Returns
    ///
    /// The value returned by `main`, or `Busy` if the kernel already ran.
    pub fn run<F>(&self, main: F) -> KernelResult<i32>
    where
        F: FnOnce(&Kernel<A, S>) -> i32 + Send + 'static,
    {
        if self.booted.swap(true, Ordering::AcqRel) {
            return Err(Errno::Busy);
        }
        self.idle.set_context(self.arch.boot_context());
        self.arch.irq_restore(IntrFlags::ENABLED);
        log::info!(
            "boot: hz={} prio_levels={} ids={}",
            self.config.hz,
            self.config.max_prio,
            self.config.nr_ids
        );

        self.spawn_reaper()?;
        let init = self.thread_alloc()?;
        self.create_kthread(
            &init,
            self.config.init_prio,
            ThreadFlags::empty(),
            None,
            Box::new(move |k: &Kernel<A, S>| {
                let code = main(k);
                k.exit_code.store(code, Ordering::Release);
                k.shutdown.store(true, Ordering::Release);
                code
            }),
        )?;
        init.set_name("init");
        self.thr_start(&init, IDLE_TID)?;

        self.idle_loop();
        self.retire_all();

        let code = self.exit_code.load(Ordering::Acquire);
        log::info!("shutdown: init returned {}", code);
        Ok(code)
    }

    fn idle_loop(&self) {
        while !self.shutdown.load(Ordering::Acquire) {
            self.thr_yield();
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            if !self.dispatch.is_requested() && self.arch.wait_for_interrupt() {
                let flags = self.arch.irq_save();
                self.timer_interrupt();
                self.arch.irq_restore(flags);
            }
        }
    }

    /// Release every context left after `main` returned.
    ///
    /// Waiter lists are emptied without waking anyone: waking would hand
    /// the CPU to threads that are being torn down.
    fn retire_all(&self) {
        while self.scheduler.pick_next(0).is_some() {}

        for action in self.timer.callouts.drain(self) {
            if let CalloutAction::Timeout(timer) = action {
                timer.discard(self);
            }
        }

        let dormant = self.registry.drain_dormant(self);
        if !dormant.is_empty() {
            log::warn!("shutdown: {} thread(s) never started", dormant.len());
        }
        let live = self.registry.snapshot(self);
        let corpses: Vec<Corpse> = self.reaper.queue.lock(self).drain(..).collect();

        for thr in &live {
            self.discard_waiters(thr);
        }
        for thr in &live {
            if let Some(ctx) = thr.take_context::<A::SavedContext>() {
                self.arch.release_context(ctx);
            }
        }
        for corpse in corpses {
            if let Some(stack) = corpse.stack {
                self.stack_pool.deallocate(stack);
            }
            if let Some(ctx) = corpse.thread.take_context::<A::SavedContext>() {
                self.arch.release_context(ctx);
            }
        }
        self.discard_waiters(&self.idle);
        self.reaper.wakeup.discard(self);
        if !live.is_empty() {
            log::debug!("retired {} live thread(s)", live.len());
        }
    }

    fn discard_waiters(&self, thr: &Thread) {
        thr.children_wait.discard(self);
        thr.parent_wait.discard(self);
        thr.mque.wait_sender.discard(self);
        thr.mque.wait_receiver.discard(self);
        let msgs: Vec<_> = thr.mque.pending.lock(self).msgs.drain(..).collect();
        for msg in msgs {
            msg.completion.discard(self);
        }
        let mut family = thr.family.lock(self);
        family.children.clear();
        family.exit_waiters.clear();
    }
}

impl<A: Arch, S: Scheduler> DispatchControl for Kernel<A, S> {
    fn irq_save(&self) -> IntrFlags {
        self.arch.irq_save()
    }

    fn irq_restore(&self, flags: IntrFlags) {
        self.arch.irq_restore(flags);
    }

    fn disable_dispatch(&self) {
        self.dispatch.disable();
    }

    fn enable_dispatch(&self) {
        if self.dispatch.enable() {
            self.schedule();
        }
    }
}

/// Kernel running on the host backend.
#[cfg(any(test, feature = "std-shim"))]
pub type HostKernel = Kernel<crate::arch::HostArch>;
