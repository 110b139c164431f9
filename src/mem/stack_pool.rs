//! Kernel stack pool.
//!
//! Every thread owns exactly one [`KernelStack`] from the moment it is
//! allocated until the reaper hands the stack back here. Stacks are recycled
//! through per-size-class free lists.

use core::ptr::NonNull;
use portable_atomic::{AtomicUsize, Ordering};
use spin::Mutex;

extern crate alloc;
use alloc::alloc::{alloc, dealloc, Layout};
use alloc::vec::Vec;

/// Pattern written at the lowest usable word of every kernel stack.
pub const STACK_CANARY: u64 = 0x5354_4B43_414E_4152;

const STACK_ALIGN: usize = 4096;

/// Stack size classes for the pool allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackSizeClass {
    /// Small stack: 4 KiB
    Small = 4096,
    /// Medium stack: 16 KiB
    Medium = 16384,
    /// Large stack: 64 KiB
    Large = 65536,
}

impl StackSizeClass {
    /// Get the size in bytes for this stack class.
    pub fn size(self) -> usize {
        self as usize
    }

    /// Choose the smallest size class that can hold `requested_size` bytes.
    pub fn for_size(requested_size: usize) -> Option<Self> {
        match requested_size {
            0..=4096 => Some(Self::Small),
            4097..=16384 => Some(Self::Medium),
            16385..=65536 => Some(Self::Large),
            _ => None,
        }
    }

    fn index(self) -> usize {
        match self {
            StackSizeClass::Small => 0,
            StackSizeClass::Medium => 1,
            StackSizeClass::Large => 2,
        }
    }
}

/// An exclusively owned kernel stack.
///
/// Not `Clone`: ownership moves from the pool to a thread and, at exit,
/// through the reaper queue back to the pool.
pub struct KernelStack {
    /// Lowest address of the stack memory
    memory: NonNull<u8>,
    size_class: StackSizeClass,
}

impl KernelStack {
    fn layout(size_class: StackSizeClass) -> Option<Layout> {
        Layout::from_size_align(size_class.size(), STACK_ALIGN).ok()
    }

    fn allocate(size_class: StackSizeClass) -> Option<Self> {
        let layout = Self::layout(size_class)?;
        // SAFETY: the layout has a non-zero size.
        let memory = NonNull::new(unsafe { alloc(layout) })?;
        Some(Self { memory, size_class })
    }

    /// Usable stack size in bytes.
    pub fn size(&self) -> usize {
        self.size_class.size()
    }

    pub fn size_class(&self) -> StackSizeClass {
        self.size_class
    }

    /// Highest address of the stack, 16-byte aligned (the initial stack pointer).
    pub fn top(&self) -> *mut u8 {
        let end = self.memory.as_ptr() as usize + self.size();
        (end & !0xF) as *mut u8
    }

    /// Lowest address of the stack.
    pub fn base(&self) -> *const u8 {
        self.memory.as_ptr()
    }

    /// Write the canary at the limit of the stack.
    pub fn install_canary(&self) {
        // SAFETY: the base is 4 KiB aligned and inside the allocation.
        unsafe { (self.memory.as_ptr() as *mut u64).write(STACK_CANARY) }
    }

    /// `false` once the thread has overflowed its stack.
    pub fn check_canary(&self) -> bool {
        // SAFETY: see `install_canary`.
        unsafe { (self.memory.as_ptr() as *const u64).read() == STACK_CANARY }
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        if let Some(layout) = Self::layout(self.size_class) {
            // SAFETY: allocated in `allocate` with the same layout.
            unsafe { dealloc(self.memory.as_ptr(), layout) }
        }
    }
}

// SAFETY: a stack is plain memory owned by exactly one holder at a time.
unsafe impl Send for KernelStack {}
unsafe impl Sync for KernelStack {}

/// Pool-based allocator for kernel stacks.
pub struct StackPool {
    free_stacks: [Mutex<Vec<KernelStack>>; 3],
    stats: StackPoolStats,
}

#[derive(Debug, Default)]
struct StackPoolStats {
    /// Stacks obtained from the heap
    allocated: AtomicUsize,
    /// Stacks returned to the pool
    recycled: AtomicUsize,
    /// Stacks currently owned by a thread
    in_use: AtomicUsize,
}

impl Default for StackPool {
    fn default() -> Self {
        Self::new()
    }
}

impl StackPool {
    pub const fn new() -> Self {
        Self {
            free_stacks: [Mutex::new(Vec::new()), Mutex::new(Vec::new()), Mutex::new(Vec::new())],
            stats: StackPoolStats {
                allocated: AtomicUsize::new(0),
                recycled: AtomicUsize::new(0),
                in_use: AtomicUsize::new(0),
            },
        }
    }

    /// Take a stack of the given class, reusing a free one when possible.
    ///
    /// The canary of the returned stack is freshly installed.
    pub fn allocate(&self, size_class: StackSizeClass) -> Option<KernelStack> {
        let reused = self.free_stacks[size_class.index()].lock().pop();
        let stack = match reused {
            Some(stack) => stack,
            None => {
                let stack = KernelStack::allocate(size_class)?;
                self.stats.allocated.fetch_add(1, Ordering::AcqRel);
                stack
            }
        };
        stack.install_canary();
        self.stats.in_use.fetch_add(1, Ordering::AcqRel);
        Some(stack)
    }

    /// Return a stack to the pool for reuse.
    pub fn deallocate(&self, stack: KernelStack) {
        self.free_stacks[stack.size_class.index()].lock().push(stack);
        self.stats.in_use.fetch_sub(1, Ordering::AcqRel);
        self.stats.recycled.fetch_add(1, Ordering::AcqRel);
    }

    /// `(allocated, recycled, in_use)`.
    pub fn stats(&self) -> (usize, usize, usize) {
        (
            self.stats.allocated.load(Ordering::Acquire),
            self.stats.recycled.load(Ordering::Acquire),
            self.stats.in_use.load(Ordering::Acquire),
        )
    }

    /// Number of stacks owned by threads right now.
    pub fn in_use(&self) -> usize {
        self.stats.in_use.load(Ordering::Acquire)
    }
}
