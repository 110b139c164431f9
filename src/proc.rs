//! Processes and their address spaces.
//!
//! The core only needs three things from a process: an identity to decide
//! whether a context switch must reload the address space, the list of its
//! threads, and safe copies between kernel buffers and user memory.

use crate::errors::{Errno, KernelResult};
use crate::thread::Tid;
use portable_atomic::{AtomicBool, Ordering};

extern crate alloc;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::ops::Range;

pub type ProcId = u64;

/// Id of the kernel process every kernel thread belongs to.
pub const KERNEL_PID: ProcId = 0;

/// An address in some process' address space.
pub type VirtAddr = u64;

/// Copies across the user boundary. Unmapped or out-of-range addresses
/// report `Fault`, never panic.
pub trait AddressSpace: Send + Sync {
    fn copy_in(&self, src: VirtAddr, dst: &mut [u8]) -> KernelResult<()>;
    fn copy_out(&self, dst: VirtAddr, src: &[u8]) -> KernelResult<()>;
}

/// The kernel's own space: no user mappings at all.
pub struct KernelSpace;

impl AddressSpace for KernelSpace {
    fn copy_in(&self, _src: VirtAddr, _dst: &mut [u8]) -> KernelResult<()> {
        Err(Errno::Fault)
    }

    fn copy_out(&self, _dst: VirtAddr, _src: &[u8]) -> KernelResult<()> {
        Err(Errno::Fault)
    }
}

/// One contiguous mapping `[base, base + len)` backed by kernel memory.
pub struct FlatSpace {
    base: VirtAddr,
    mem: spin::Mutex<Vec<u8>>,
}

impl FlatSpace {
    pub fn new(base: VirtAddr, len: usize) -> Self {
        Self {
            base,
            mem: spin::Mutex::new(vec![0; len]),
        }
    }

    pub fn base(&self) -> VirtAddr {
        self.base
    }

    fn range(&self, addr: VirtAddr, len: usize, size: usize) -> Option<Range<usize>> {
        let start = usize::try_from(addr.checked_sub(self.base)?).ok()?;
        let end = start.checked_add(len)?;
        (end <= size).then_some(start..end)
    }

    /// Read mapped bytes directly, as the owning process would.
    pub fn read(&self, addr: VirtAddr, len: usize) -> KernelResult<Vec<u8>> {
        let mut buf = vec![0; len];
        self.copy_in(addr, &mut buf)?;
        Ok(buf)
    }

    pub fn write(&self, addr: VirtAddr, bytes: &[u8]) -> KernelResult<()> {
        self.copy_out(addr, bytes)
    }
}

impl AddressSpace for FlatSpace {
    fn copy_in(&self, src: VirtAddr, dst: &mut [u8]) -> KernelResult<()> {
        let mem = self.mem.lock();
        let range = self.range(src, dst.len(), mem.len()).ok_or(Errno::Fault)?;
        dst.copy_from_slice(&mem[range]);
        Ok(())
    }

    fn copy_out(&self, dst: VirtAddr, src: &[u8]) -> KernelResult<()> {
        let mut mem = self.mem.lock();
        let len = mem.len();
        let range = self.range(dst, src.len(), len).ok_or(Errno::Fault)?;
        mem[range].copy_from_slice(src);
        Ok(())
    }
}

impl<T: AddressSpace + ?Sized> AddressSpace for Arc<T> {
    fn copy_in(&self, src: VirtAddr, dst: &mut [u8]) -> KernelResult<()> {
        (**self).copy_in(src, dst)
    }

    fn copy_out(&self, dst: VirtAddr, src: &[u8]) -> KernelResult<()> {
        (**self).copy_out(dst, src)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcKind {
    Kernel,
    User,
}

pub struct Process {
    id: ProcId,
    kind: ProcKind,
    exiting: AtomicBool,
    threads: spin::Mutex<Vec<Tid>>,
    space: Box<dyn AddressSpace>,
}

impl Process {
    pub fn kernel() -> Arc<Self> {
        Arc::new(Self {
            id: KERNEL_PID,
            kind: ProcKind::Kernel,
            exiting: AtomicBool::new(false),
            threads: spin::Mutex::new(Vec::new()),
            space: Box::new(KernelSpace),
        })
    }

    pub fn user(id: ProcId, space: impl AddressSpace + 'static) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind: ProcKind::User,
            exiting: AtomicBool::new(false),
            threads: spin::Mutex::new(Vec::new()),
            space: Box::new(space),
        })
    }

    pub fn id(&self) -> ProcId {
        self.id
    }

    pub fn kind(&self) -> ProcKind {
        self.kind
    }

    pub fn is_kernel(&self) -> bool {
        self.kind == ProcKind::Kernel
    }

    pub fn space(&self) -> &dyn AddressSpace {
        &*self.space
    }

    /// Refuse new threads from now on.
    pub fn mark_exiting(&self) {
        self.exiting.store(true, Ordering::Release);
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    pub(crate) fn attach(&self, tid: Tid) {
        self.threads.lock().push(tid);
    }

    pub(crate) fn detach(&self, tid: Tid) {
        self.threads.lock().retain(|&t| t != tid);
    }

    pub fn threads(&self) -> Vec<Tid> {
        self.threads.lock().clone()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }
}
