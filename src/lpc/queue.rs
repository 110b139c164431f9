//! Per-thread message queue.
//!
//! Receivers park on `wait_sender` ("a sender is expected"), senders park on
//! `wait_receiver` ("a receiver must be listening"). A message stays queued
//! until a receiver has copied it out.

use super::{Endpoint, RawMessage, LPC_RECV_ANY};
use crate::arch::Arch;
use crate::kernel::Kernel;
use crate::sched::Scheduler;
use crate::sync::{DispatchControl, IrqLock, SyncObject, SyncReason, WakePolicy};

extern crate alloc;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// A message in flight. Owned by its sender; the queue only borrows it.
pub struct Message {
    pub(crate) src: Endpoint,
    pub(crate) body: RawMessage,
    /// The sender waits here until the body was copied out
    pub(crate) completion: SyncObject,
}

impl Message {
    pub(crate) fn new(src: Endpoint, body: RawMessage) -> Arc<Self> {
        Arc::new(Self {
            src,
            body,
            completion: SyncObject::new(WakePolicy::All),
        })
    }

    pub fn src(&self) -> Endpoint {
        self.src
    }
}

pub(crate) struct Pending {
    pub(crate) msgs: VecDeque<Arc<Message>>,
    /// Set once the owner exited; no message is accepted afterwards
    pub(crate) destroyed: bool,
}

impl Pending {
    /// Take the first message from `src`, or any message for [`LPC_RECV_ANY`].
    pub(crate) fn dequeue(&mut self, src: Endpoint) -> Option<Arc<Message>> {
        let pos = self
            .msgs
            .iter()
            .position(|m| src == LPC_RECV_ANY || m.src == src)?;
        self.msgs.remove(pos)
    }
}

pub struct MessageQueue {
    pub(crate) pending: IrqLock<Pending>,
    pub(crate) wait_sender: SyncObject,
    pub(crate) wait_receiver: SyncObject,
}

impl MessageQueue {
    pub const fn new() -> Self {
        Self {
            pending: IrqLock::new(Pending {
                msgs: VecDeque::new(),
                destroyed: false,
            }),
            wait_sender: SyncObject::new(WakePolicy::All),
            wait_receiver: SyncObject::new(WakePolicy::All),
        }
    }

    pub fn len(&self, cpu: &dyn DispatchControl) -> usize {
        self.pending.lock(cpu).msgs.len()
    }

    pub fn is_destroyed(&self, cpu: &dyn DispatchControl) -> bool {
        self.pending.lock(cpu).destroyed
    }

    /// Accept messages again after the owning control block was recycled.
    pub(crate) fn reopen(&self, cpu: &dyn DispatchControl) {
        let mut pending = self.pending.lock(cpu);
        debug_assert!(pending.msgs.is_empty());
        pending.destroyed = false;
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Arch, S: Scheduler> Kernel<A, S> {
    /// Tear down a message queue.
    ///
    /// Queued senders are released with `Destroyed`, as is everyone waiting
    /// for this queue to become ready.
    pub(crate) fn destroy_msg_queue(&self, que: &MessageQueue) {
        let mut pending = que.pending.lock(self);
        pending.destroyed = true;
        let orphans: Vec<Arc<Message>> = pending.msgs.drain(..).collect();
        for msg in &orphans {
            self.sync_wake(&msg.completion, SyncReason::Destroyed);
        }
        self.sync_wake(&que.wait_receiver, SyncReason::Destroyed);
        self.sync_wake(&que.wait_sender, SyncReason::Destroyed);
        if !orphans.is_empty() {
            log::debug!("message queue destroyed with {} pending message(s)", orphans.len());
        }
    }
}
