//! Rendezvous send and receive.
//!
//! A sender publishes its message only once a receiver is known to be
//! parked on the destination queue, then sleeps on the message's completion
//! object until the receiver has copied the body out. Every wait is followed
//! by a fresh lookup of the destination, since it may have exited meanwhile.

use super::queue::{Message, MessageQueue};
use super::{Endpoint, MessageBody, RawMessage};
use crate::arch::Arch;
use crate::errors::{Errno, KernelResult};
use crate::kernel::Kernel;
use crate::proc::VirtAddr;
use crate::sched::Scheduler;
use crate::sync::{IrqLock, IrqLockGuard, SyncObject, SyncReason};
use crate::time::Timeout;

extern crate alloc;
use alloc::sync::Arc;

/// Where a message body is read from or written to.
pub enum MsgBuf<'a> {
    /// A kernel buffer
    Kernel(&'a mut RawMessage),
    /// A buffer in the current process' address space
    User(VirtAddr),
}

impl<A: Arch, S: Scheduler> Kernel<A, S> {
    fn copy_msg_in(&self, buf: &MsgBuf<'_>) -> KernelResult<RawMessage> {
        match buf {
            MsgBuf::Kernel(raw) => Ok(**raw),
            MsgBuf::User(addr) => {
                let mut raw = RawMessage::zeroed();
                let proc = self.current().process().ok_or(Errno::Fault)?;
                proc.space().copy_in(*addr, &mut raw.0)?;
                Ok(raw)
            }
        }
    }

    fn copy_msg_out(&self, buf: &mut MsgBuf<'_>, body: &RawMessage) -> KernelResult<()> {
        match buf {
            MsgBuf::Kernel(raw) => {
                **raw = *body;
                Ok(())
            }
            MsgBuf::User(addr) => {
                let proc = self.current().process().ok_or(Errno::Fault)?;
                proc.space().copy_out(*addr, &body.0)
            }
        }
    }

    /// Park on `obj` after releasing `guard`, honouring `timeout`.
    ///
    /// Returns the wake reason and the (now unlocked) lock. A poll never
    /// blocks and reports `Timeout`.
    fn block_on<'a, T>(
        &'a self,
        obj: &SyncObject,
        timeout: Timeout,
        guard: IrqLockGuard<'a, T>,
    ) -> (SyncReason, &'a IrqLock<T>) {
        match timeout {
            Timeout::Poll => (SyncReason::Timeout, guard.unlock()),
            Timeout::Forever => {
                let blk = self.wait_no_schedule(obj);
                let lock = guard.unlock();
                if self.current().in_wait() {
                    self.schedule();
                }
                (self.finish_wait(obj, &blk), lock)
            }
            Timeout::Millis(ms) => {
                let tw = self.timed_wait_no_schedule(obj, ms);
                let lock = guard.unlock();
                if self.current().in_wait() {
                    self.schedule();
                }
                (self.finish_timed_wait(obj, tw), lock)
            }
        }
    }

    /// Send the body in `buf` to `dest` and wait until it was received.
    ///
    /// # Errors
    ///
    /// - `NoEntry` if `dest` does not exist or exited before receiving
    /// - `Again` if no receiver showed up within `timeout`, or the wait was
    ///   interrupted by an event
    /// - `Fault` if the body could not be copied in
    pub fn lpc_send(
        &self,
        dest: Endpoint,
        timeout: Timeout,
        buf: &MsgBuf<'_>,
    ) -> KernelResult<()> {
        let me = self.current_tid();
        let mut thr = self.find_thread(dest).ok_or(Errno::NoEntry)?;

        loop {
            let que: &MessageQueue = &thr.mque;
            let pending = que.pending.lock(self);
            if pending.destroyed {
                return Err(Errno::NoEntry);
            }

            if que.wait_sender.has_waiters(self) {
                let body = self.copy_msg_in(buf)?;
                let msg = Message::new(me, body);
                let mut pending = pending;
                pending.msgs.push_back(msg.clone());
                let blk = self.wait_no_schedule(&msg.completion);
                self.sync_wake(&que.wait_sender, SyncReason::Released);
                drop(pending);

                if self.current().in_wait() {
                    self.schedule();
                }
                return match self.finish_wait(&msg.completion, &blk) {
                    SyncReason::Released => {
                        log::debug!("lpc: {} -> {} delivered", me, dest);
                        Ok(())
                    }
                    SyncReason::Destroyed => Err(Errno::NoEntry),
                    _ => {
                        // Interrupted before the receiver took it: withdraw.
                        let withdrawn = {
                            let mut pending = que.pending.lock(self);
                            let pos = pending.msgs.iter().position(|m| Arc::ptr_eq(m, &msg));
                            pos.and_then(|pos| pending.msgs.remove(pos)).is_some()
                        };
                        if withdrawn {
                            Err(Errno::Again)
                        } else {
                            Ok(())
                        }
                    }
                };
            }

            if timeout.is_poll() {
                return Err(Errno::Again);
            }
            let (reason, _) = self.block_on(&que.wait_receiver, timeout, pending);
            match reason {
                SyncReason::Destroyed => return Err(Errno::NoEntry),
                SyncReason::Timeout | SyncReason::Event => return Err(Errno::Again),
                _ => {}
            }
            thr = self.find_thread(dest).ok_or(Errno::NoEntry)?;
        }
    }

    /// Receive a message from `src` into `buf`.
    /// [`LPC_RECV_ANY`](super::LPC_RECV_ANY) takes the first sender.
    ///
    /// Returns the sender's endpoint. A copy-out fault still releases the
    /// sender.
    pub fn lpc_recv(
        &self,
        src: Endpoint,
        timeout: Timeout,
        buf: &mut MsgBuf<'_>,
    ) -> KernelResult<Endpoint> {
        let cur = self.current();
        let que = &cur.mque;
        let mut pending = que.pending.lock(self);

        let msg = loop {
            self.sync_wake(&que.wait_receiver, SyncReason::Released);
            if let Some(msg) = pending.dequeue(src) {
                break msg;
            }
            if timeout.is_poll() {
                return Err(Errno::Again);
            }
            let (reason, lock) = self.block_on(&que.wait_sender, timeout, pending);
            match reason {
                SyncReason::Timeout | SyncReason::Event => return Err(Errno::Again),
                SyncReason::Destroyed => return Err(Errno::NoEntry),
                _ => {}
            }
            pending = lock.lock(self);
        };

        let rc = self.copy_msg_out(buf, &msg.body);
        self.sync_wake(&msg.completion, SyncReason::Released);
        drop(pending);
        rc.map(|()| msg.src)
    }

    /// Send to `dest` and wait for its reply in the same buffer.
    pub fn lpc_send_and_reply(&self, dest: Endpoint, buf: &mut MsgBuf<'_>) -> KernelResult<()> {
        self.lpc_send(dest, Timeout::Forever, buf)?;
        self.lpc_recv(dest, Timeout::Forever, buf)?;
        Ok(())
    }

    /// [`Kernel::lpc_send`] for a typed body from kernel code.
    pub fn lpc_send_body(
        &self,
        dest: Endpoint,
        timeout: Timeout,
        body: &MessageBody,
    ) -> KernelResult<()> {
        let mut raw = body.encode();
        self.lpc_send(dest, timeout, &MsgBuf::Kernel(&mut raw))
    }

    /// [`Kernel::lpc_recv`] decoding the body. `Invalid` for an unknown tag.
    pub fn lpc_recv_body(
        &self,
        src: Endpoint,
        timeout: Timeout,
    ) -> KernelResult<(Endpoint, MessageBody)> {
        let mut raw = RawMessage::zeroed();
        let from = self.lpc_recv(src, timeout, &mut MsgBuf::Kernel(&mut raw))?;
        Ok((from, MessageBody::decode(&raw)?))
    }

    /// Typed request/reply round trip with `dest`.
    pub fn lpc_call(&self, dest: Endpoint, request: &MessageBody) -> KernelResult<MessageBody> {
        let mut raw = request.encode();
        self.lpc_send_and_reply(dest, &mut MsgBuf::Kernel(&mut raw))?;
        MessageBody::decode(&raw)
    }
}
