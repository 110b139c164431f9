//! Test helper utilities and common functionality.

use crate::arch::HostArch;
use crate::config::KernelConfig;
use crate::kernel::{HostKernel, Kernel};
use crate::lpc::{MessageBody, LPC_RECV_ANY};
use crate::proc::{FlatSpace, Process};
use crate::sched::Scheduler;
use crate::thread::{ThreadBuilder, ThreadRef, ThreadState, Tid};
use crate::time::Timeout;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// Base address of the user arena handed to test processes.
pub(crate) const USER_BASE: u64 = 0x1000;
pub(crate) const USER_LEN: usize = 4096;

/// Priority of the user thread started by [`run_user`].
pub(crate) const USER_MAIN_PRIO: u8 = 10;

pub(crate) fn new_kernel() -> Arc<HostKernel> {
    Kernel::new(HostArch::new(), KernelConfig::default()).expect("default config is valid")
}

/// Boot a fresh kernel and run `main` as init.
pub(crate) fn boot<F>(main: F) -> i32
where
    F: FnOnce(&HostKernel) -> i32 + Send + 'static,
{
    new_kernel().run(main).expect("kernel boots once")
}

/// Like [`boot`], but panic once the idle thread has seen `ticks` ticks.
///
/// A test that would otherwise hang on a lost wakeup fails instead.
pub(crate) fn boot_with_idle_budget<F>(ticks: u64, main: F) -> i32
where
    F: FnOnce(&HostKernel) -> i32 + Send + 'static,
{
    Kernel::new(HostArch::with_idle_budget(ticks), KernelConfig::default())
        .expect("default config is valid")
        .run(main)
        .expect("kernel boots once")
}

/// A user process backed by a flat arena at [`USER_BASE`].
pub(crate) fn user_process(id: u64) -> (Arc<Process>, Arc<FlatSpace>) {
    let space = Arc::new(FlatSpace::new(USER_BASE, USER_LEN));
    (Process::user(id, space.clone()), space)
}

/// What a user-mode test body gets to work with.
#[derive(Clone)]
pub(crate) struct UserEnv {
    pub(crate) process: Arc<Process>,
    pub(crate) space: Arc<FlatSpace>,
    /// Tid of init, which waits for the report
    pub(crate) init: Tid,
}

/// Run `f` as a user thread of process 1 and return its result.
///
/// Init cannot collect a user thread (it is a kernel thread), so the
/// result travels back as an LPC message.
pub(crate) fn run_user<F>(f: F) -> i32
where
    F: FnOnce(&HostKernel, &UserEnv) -> i32 + Send + 'static,
{
    boot(move |k| {
        let (process, space) = user_process(1);
        let env = UserEnv {
            process: process.clone(),
            space,
            init: k.current_tid(),
        };
        ThreadBuilder::new()
            .name("user-main")
            .priority(USER_MAIN_PRIO)
            .process(process)
            .spawn(k, move |k| {
                let code = f(k, &env);
                report(k, env.init, code);
                code
            })
            .expect("spawn user main");
        collect_report(k)
    })
}

/// Send `code` to `to` as a thread-service message.
pub(crate) fn report(k: &HostKernel, to: Tid, code: i32) {
    let body = MessageBody::Thread {
        req: 0,
        rc: code,
        args: [0; 4],
    };
    k.lpc_send_body(to, Timeout::Forever, &body)
        .expect("report delivered");
}

/// Wait for one [`report`] and return its code.
pub(crate) fn collect_report(k: &HostKernel) -> i32 {
    match k.lpc_recv_body(LPC_RECV_ANY, Timeout::Forever) {
        Ok((_, MessageBody::Thread { rc, .. })) => rc,
        other => panic!("unexpected report: {:?}", other),
    }
}

/// Check that every live thread sits in exactly one place: on the CPU, in
/// a ready queue, on a wait queue, on the dormant list or with the reaper.
///
/// Must run on a kernel thread: nothing else moves while it looks.
pub(crate) fn assert_single_container(k: &HostKernel) {
    let current = k.current();
    let mut ready: BTreeMap<Tid, usize> = BTreeMap::new();
    for prio in 0..k.scheduler().levels() {
        for tid in k.scheduler().queued_at(prio as u8) {
            *ready.entry(tid).or_default() += 1;
        }
    }
    assert_eq!(ready.values().sum::<usize>(), k.scheduler().ready_count());
    let dead: Vec<ThreadRef> = k
        .reaper
        .queue
        .lock(k)
        .iter()
        .map(|corpse| corpse.thread.clone())
        .collect();

    for thr in k.registry().snapshot(k).iter().chain(dead.iter()) {
        let state = thr.state();
        let on_cpu = Arc::ptr_eq(thr, &current);
        let queued = ready.remove(&thr.tid()).unwrap_or(0);
        let reaped = dead.iter().filter(|d| Arc::ptr_eq(d, thr)).count();
        let dormant = k.registry().is_dormant(k, thr);
        let waiting = state == ThreadState::Wait;

        let places = usize::from(on_cpu)
            + queued
            + reaped
            + usize::from(dormant)
            + usize::from(waiting);
        assert_eq!(
            places,
            1,
            "thread {} ({:?}) found in {} places",
            thr.tid(),
            state,
            places
        );
        let consistent = match state {
            ThreadState::Run => on_cpu,
            ThreadState::Ready => queued == 1,
            ThreadState::Wait => true,
            ThreadState::Dormant => dormant,
            ThreadState::Exit => reaped == 1,
            ThreadState::Free => false,
        };
        assert!(consistent, "thread {} is {:?} in the wrong place", thr.tid(), state);
    }
    assert!(ready.is_empty(), "unknown threads queued: {:?}", ready.keys());
}
