//! System call entry.
//!
//! Arguments arrive as raw registers. Every call returns a non-negative
//! value on success or a negated [`Errno`] code, and ends on the trap-exit
//! path, which services a pending dispatch request.

use crate::arch::Arch;
use crate::errors::{Errno, KernelResult};
use crate::kernel::Kernel;
use crate::lpc::MsgBuf;
use crate::proc::VirtAddr;
use crate::sched::Scheduler;
use crate::thread::WaitFlags;
use crate::time::Timeout;

/// System call numbers handled by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Sysno {
    ThrYield = 3,
    ThrExit = 4,
    ThrGetId = 5,
    ThrWait = 6,
    LpcSend = 7,
    LpcRecv = 8,
    LpcSendAndReply = 9,
}

impl Sysno {
    pub fn from_raw(no: u64) -> Option<Self> {
        Some(match no {
            3 => Sysno::ThrYield,
            4 => Sysno::ThrExit,
            5 => Sysno::ThrGetId,
            6 => Sysno::ThrWait,
            7 => Sysno::LpcSend,
            8 => Sysno::LpcRecv,
            9 => Sysno::LpcSendAndReply,
            _ => return None,
        })
    }
}

impl<A: Arch, S: Scheduler> Kernel<A, S> {
    /// Execute system call `no` for the current thread.
    ///
    /// | no | call | arguments |
    /// |----|------|-----------|
    /// | 3 | yield | |
    /// | 4 | exit | code |
    /// | 5 | get id | |
    /// | 6 | wait | target, flags, out tid, out code |
    /// | 7 | lpc send | dest, timeout, msg |
    /// | 8 | lpc recv | src, timeout, msg, out sender |
    /// | 9 | lpc send and reply | dest, msg |
    pub fn syscall(&self, no: u64, args: [u64; 4]) -> i64 {
        let rc = match Sysno::from_raw(no) {
            Some(sysno) => self.dispatch_syscall(sysno, args),
            None => Err(Errno::NoSys),
        };
        self.dispatch_pending();
        match rc {
            Ok(value) => value,
            Err(e) => {
                log::trace!("syscall {} failed: {}", no, e);
                e.as_neg()
            }
        }
    }

    fn dispatch_syscall(&self, sysno: Sysno, args: [u64; 4]) -> KernelResult<i64> {
        match sysno {
            Sysno::ThrYield => {
                self.thr_yield();
                Ok(0)
            }
            Sysno::ThrExit => self.thr_exit(args[0] as i32),
            Sysno::ThrGetId => Ok(self.current_tid() as i64),
            Sysno::ThrWait => self.sys_thr_wait(args),
            Sysno::LpcSend => {
                let timeout = Timeout::from_raw(args[1] as i64);
                self.lpc_send(args[0], timeout, &MsgBuf::User(args[2]))?;
                Ok(0)
            }
            Sysno::LpcRecv => {
                let timeout = Timeout::from_raw(args[1] as i64);
                let sender = self.lpc_recv(args[0], timeout, &mut MsgBuf::User(args[2]))?;
                if args[3] != 0 {
                    self.copy_to_user(args[3], &sender.to_le_bytes())?;
                }
                Ok(0)
            }
            Sysno::LpcSendAndReply => {
                self.lpc_send_and_reply(args[0], &mut MsgBuf::User(args[1]))?;
                Ok(0)
            }
        }
    }

    fn sys_thr_wait(&self, args: [u64; 4]) -> KernelResult<i64> {
        let target = args[0];
        let flags = WaitFlags::from_bits_truncate(args[1] as u32);
        if flags.contains(WaitFlags::ID) {
            // An exited child is no longer registered; thr_wait finds it.
            if let Some(thr) = self.find_thread(target) {
                if thr.is_kernel() {
                    return Err(Errno::Permission);
                }
            }
        }

        let (tid, code) = self.thr_wait(target, flags)?;
        if args[2] != 0 {
            self.copy_to_user(args[2], &tid.to_le_bytes())?;
        }
        if args[3] != 0 {
            self.copy_to_user(args[3], &code.to_le_bytes())?;
        }
        Ok(0)
    }

    fn copy_to_user(&self, dst: VirtAddr, bytes: &[u8]) -> KernelResult<()> {
        let process = self.current().process().ok_or(Errno::Fault)?;
        process.space().copy_out(dst, bytes)
    }
}
