//! Thread control blocks and their lifecycle.
//!
//! A thread moves through FREE → DORMANT → READY ⇄ RUN → WAIT → READY …
//! → EXIT and is finally reaped back to FREE by the reaper thread. At any
//! time it sits in at most one of: the free list, the dormant list, one
//! ready queue, one wait queue, or its parent's exit-waiter list.

pub mod builder;
pub mod event;
pub mod idmap;
pub mod lifecycle;
pub mod reaper;
pub mod registry;

pub use builder::ThreadBuilder;
pub use event::{EventId, EventQueue, EventSet};
pub use idmap::{IdBitmap, IdRange};
pub use lifecycle::{ThreadFn, WaitFlags};
pub use registry::ThreadRegistry;

use crate::lpc::MessageQueue;
use crate::mem::KernelStack;
use crate::proc::{ProcId, Process};
use crate::sync::{IrqLock, SyncObject, WakePolicy};
use crate::time::SliceCounter;
use portable_atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering};

extern crate alloc;
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;
use core::fmt;

/// Thread identifier. Doubles as the LPC endpoint of the thread.
pub type Tid = u64;

/// Id of the per-CPU idle thread.
pub const IDLE_TID: Tid = 0;
/// Id of the reaper thread.
pub const REAPER_TID: Tid = 1;
/// Id carried by threads that have not been created yet.
pub const INVALID_TID: Tid = u64::MAX;

/// Shared reference to a thread control block.
pub type ThreadRef = Arc<Thread>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    Free = 0,
    Dormant = 1,
    Ready = 2,
    Run = 3,
    Wait = 4,
    Exit = 5,
}

impl ThreadState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ThreadState::Dormant,
            2 => ThreadState::Ready,
            3 => ThreadState::Run,
            4 => ThreadState::Wait,
            5 => ThreadState::Exit,
            _ => ThreadState::Free,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadKind {
    /// Not created yet
    None = 0,
    Kernel = 1,
    User = 2,
}

bitflags::bitflags! {
    /// Creation flags of a thread.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        /// The parent must collect the exit code with `thr_wait`
        const JOINABLE = 0x1;
    }
}

/// CPU time charged to a thread, in ticks.
#[derive(Debug, Default)]
pub struct ThreadResource {
    sys_time: AtomicU64,
    user_time: AtomicU64,
    children_sys_time: AtomicU64,
    children_user_time: AtomicU64,
}

/// Snapshot of a [`ThreadResource`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    pub sys_time: u64,
    pub user_time: u64,
    pub children_sys_time: u64,
    pub children_user_time: u64,
}

impl ThreadResource {
    pub fn charge_sys(&self) {
        self.sys_time.fetch_add(1, Ordering::Relaxed);
    }

    pub fn charge_user(&self) {
        self.user_time.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold the total time of a collected child into the children counters.
    pub fn absorb_child(&self, child: &ResourceUsage) {
        self.children_sys_time
            .fetch_add(child.sys_time + child.children_sys_time, Ordering::Relaxed);
        self.children_user_time
            .fetch_add(child.user_time + child.children_user_time, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ResourceUsage {
        ResourceUsage {
            sys_time: self.sys_time.load(Ordering::Relaxed),
            user_time: self.user_time.load(Ordering::Relaxed),
            children_sys_time: self.children_sys_time.load(Ordering::Relaxed),
            children_user_time: self.children_user_time.load(Ordering::Relaxed),
        }
    }

    fn clear(&self) {
        self.sys_time.store(0, Ordering::Relaxed);
        self.user_time.store(0, Ordering::Relaxed);
        self.children_sys_time.store(0, Ordering::Relaxed);
        self.children_user_time.store(0, Ordering::Relaxed);
    }
}

/// Parent/child links, guarded by the parent's family lock.
#[derive(Default)]
pub(crate) struct Family {
    /// Live children started by this thread
    pub(crate) children: Vec<ThreadRef>,
    /// Joinable children that exited and wait to be collected
    pub(crate) exit_waiters: VecDeque<ThreadRef>,
    /// Set once the owner started exiting; no new child may link
    pub(crate) exiting: bool,
}

/// Thread control block.
pub struct Thread {
    tid: AtomicU64,
    state: AtomicU8,
    kind: AtomicU8,
    priority: AtomicU8,
    flags: AtomicU32,
    parent: AtomicU64,
    exit_code: AtomicI32,
    fpu_used: AtomicBool,
    pub(crate) slice: SliceCounter,
    pub(crate) resource: ThreadResource,
    process: spin::Mutex<Option<Arc<Process>>>,
    name: spin::Mutex<Option<String>>,
    pub(crate) family: IrqLock<Family>,
    /// Parent side of `thr_wait`: woken whenever a child exits
    pub(crate) children_wait: SyncObject,
    /// Child side of `thr_wait`: woken when the parent collected us
    pub(crate) parent_wait: SyncObject,
    pub(crate) mque: MessageQueue,
    pub(crate) events: EventQueue,
    stack: spin::Mutex<Option<KernelStack>>,
    context: spin::Mutex<Option<Box<dyn Any + Send + Sync>>>,
}

impl Thread {
    /// A FREE control block owning `stack`.
    pub(crate) fn new_free(stack: Option<KernelStack>) -> ThreadRef {
        Arc::new(Self {
            tid: AtomicU64::new(INVALID_TID),
            state: AtomicU8::new(ThreadState::Free as u8),
            kind: AtomicU8::new(ThreadKind::None as u8),
            priority: AtomicU8::new(0),
            flags: AtomicU32::new(0),
            parent: AtomicU64::new(INVALID_TID),
            exit_code: AtomicI32::new(0),
            fpu_used: AtomicBool::new(false),
            slice: SliceCounter::new(1),
            resource: ThreadResource::default(),
            process: spin::Mutex::new(None),
            name: spin::Mutex::new(None),
            family: IrqLock::new(Family::default()),
            children_wait: SyncObject::new(WakePolicy::All),
            parent_wait: SyncObject::new(WakePolicy::All),
            mque: MessageQueue::new(),
            events: EventQueue::new(),
            stack: spin::Mutex::new(stack),
            context: spin::Mutex::new(None),
        })
    }

    pub fn tid(&self) -> Tid {
        self.tid.load(Ordering::Acquire)
    }

    pub(crate) fn set_tid(&self, tid: Tid) {
        self.tid.store(tid, Ordering::Release);
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Move from `from` to `to`; `false` if the thread was not in `from`.
    pub(crate) fn transition(&self, from: ThreadState, to: ThreadState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn in_wait(&self) -> bool {
        self.state() == ThreadState::Wait
    }

    pub fn is_idle(&self) -> bool {
        self.tid() == IDLE_TID
    }

    pub fn kind(&self) -> ThreadKind {
        match self.kind.load(Ordering::Acquire) {
            1 => ThreadKind::Kernel,
            2 => ThreadKind::User,
            _ => ThreadKind::None,
        }
    }

    pub(crate) fn set_kind(&self, kind: ThreadKind) {
        self.kind.store(kind as u8, Ordering::Release);
    }

    pub fn is_kernel(&self) -> bool {
        self.kind() == ThreadKind::Kernel
    }

    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::Acquire)
    }

    pub(crate) fn set_priority(&self, prio: u8) {
        self.priority.store(prio, Ordering::Release);
    }

    pub fn flags(&self) -> ThreadFlags {
        ThreadFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn set_flags(&self, flags: ThreadFlags) {
        self.flags.store(flags.bits(), Ordering::Release);
    }

    pub fn is_joinable(&self) -> bool {
        self.flags().contains(ThreadFlags::JOINABLE)
    }

    pub(crate) fn clear_joinable(&self) {
        self.flags.fetch_and(!ThreadFlags::JOINABLE.bits(), Ordering::AcqRel);
    }

    /// Tid of the parent, [`INVALID_TID`] for orphans.
    pub fn parent(&self) -> Tid {
        self.parent.load(Ordering::Acquire)
    }

    pub(crate) fn set_parent(&self, tid: Tid) {
        self.parent.store(tid, Ordering::Release);
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::Acquire)
    }

    pub(crate) fn set_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::Release);
    }

    pub fn fpu_used(&self) -> bool {
        self.fpu_used.load(Ordering::Acquire)
    }

    pub(crate) fn set_fpu_used(&self, used: bool) {
        self.fpu_used.store(used, Ordering::Release);
    }

    pub fn process(&self) -> Option<Arc<Process>> {
        self.process.lock().clone()
    }

    pub fn process_id(&self) -> Option<ProcId> {
        self.process.lock().as_ref().map(|p| p.id())
    }

    pub(crate) fn set_process(&self, process: Option<Arc<Process>>) {
        *self.process.lock() = process;
    }

    pub fn name(&self) -> Option<String> {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock() = Some(name.into());
    }

    pub fn resources(&self) -> ResourceUsage {
        self.resource.snapshot()
    }

    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    pub fn message_queue(&self) -> &MessageQueue {
        &self.mque
    }

    /// Whether the stack canary below the stack is intact.
    pub fn check_stack_integrity(&self) -> bool {
        self.stack.lock().as_ref().map_or(false, |s| s.check_canary())
    }

    pub fn has_stack(&self) -> bool {
        self.stack.lock().is_some()
    }

    pub(crate) fn with_stack<R>(&self, f: impl FnOnce(&KernelStack) -> R) -> Option<R> {
        self.stack.lock().as_ref().map(f)
    }

    pub(crate) fn take_stack(&self) -> Option<KernelStack> {
        self.stack.lock().take()
    }

    pub(crate) fn set_context<C: Any + Send + Sync>(&self, ctx: C) {
        *self.context.lock() = Some(Box::new(ctx));
    }

    /// Address of the saved context, null if there is none.
    ///
    /// The context box does not move while the thread is alive, so the
    /// pointer stays valid after the lock is dropped.
    pub(crate) fn context_ptr<C: Any>(&self) -> *const C {
        let guard = self.context.lock();
        guard
            .as_ref()
            .and_then(|ctx| ctx.downcast_ref::<C>())
            .map_or(core::ptr::null(), |ctx| ctx as *const C)
    }

    pub(crate) fn take_context<C: Any>(&self) -> Option<C> {
        let ctx = self.context.lock().take()?;
        ctx.downcast::<C>().ok().map(|ctx| *ctx)
    }

    pub fn has_context(&self) -> bool {
        self.context.lock().is_some()
    }

    /// Return the control block to its FREE shape for reuse.
    pub(crate) fn reset(&self) {
        self.set_tid(INVALID_TID);
        self.set_kind(ThreadKind::None);
        self.set_flags(ThreadFlags::empty());
        self.set_parent(INVALID_TID);
        self.set_exit_code(0);
        self.set_fpu_used(false);
        self.resource.clear();
        self.events.clear();
        self.set_process(None);
        *self.name.lock() = None;
        self.set_state(ThreadState::Free);
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid())
            .field("state", &self.state())
            .field("prio", &self.priority())
            .field("kind", &self.kind())
            .finish()
    }
}

/// A thread handed to the scheduler in READY state.
///
/// Only ready threads can be enqueued; [`ReadyRef::start_running`] is the
/// single place a thread becomes RUN after dispatch.
pub struct ReadyRef(ThreadRef);

impl ReadyRef {
    pub(crate) fn new(thread: ThreadRef) -> Self {
        debug_assert_eq!(thread.state(), ThreadState::Ready);
        Self(thread)
    }

    pub fn priority(&self) -> u8 {
        self.0.priority()
    }

    pub fn thread(&self) -> &ThreadRef {
        &self.0
    }

    /// Mark the thread running with a fresh slice.
    pub(crate) fn start_running(self) -> ThreadRef {
        self.0.set_state(ThreadState::Run);
        self.0.slice.reload();
        self.0
    }
}
