//! Integration tests for scheduling, waits, lifecycle and LPC on a booted
//! kernel.

#[cfg(test)]
mod boot_tests {
    use crate::errors::Errno;
    use crate::sync::{SyncObject, WakePolicy};
    use crate::tests::helpers::{boot, boot_with_idle_budget, new_kernel};

    #[test]
    fn test_run_returns_main_code() {
        assert_eq!(boot(|_| 42), 42);
    }

    #[test]
    fn test_second_run_is_busy() {
        let kernel = new_kernel();
        assert_eq!(kernel.run(|_| 1), Ok(1));
        assert_eq!(kernel.run(|_| 2), Err(Errno::Busy));
    }

    #[test]
    fn test_system_threads_after_boot() {
        let code = boot(|k| {
            assert_eq!(k.current_tid(), 2);
            let reaper = k.find_thread(crate::thread::REAPER_TID).expect("reaper registered");
            assert_eq!(reaper.priority(), k.config().reaper_prio());
            assert!(reaper.is_kernel());
            assert!(k.find_thread(crate::thread::IDLE_TID).is_none());
            assert_eq!(k.thread_count(), 2);
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn test_idle_ticks_drive_the_clock() {
        let code = boot(|k| {
            let before = k.uptime();
            k.tim_wait(50);
            // Only idle ticks advance time while init sleeps.
            assert!(k.uptime() >= before + 5);
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    #[should_panic(expected = "idle budget exhausted")]
    fn test_everyone_blocked_exhausts_idle_budget() {
        boot_with_idle_budget(50, |k| {
            let never = SyncObject::new(WakePolicy::All);
            k.sync_wait(&never);
            0
        });
    }
}

#[cfg(test)]
mod scheduling_tests {
    use crate::kernel::HostKernel;
    use crate::sync::SyncReason;
    use crate::tests::helpers::{boot, collect_report, new_kernel, report};
    use crate::thread::ThreadBuilder;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use portable_atomic::{AtomicBool, Ordering};

    const PING_PONG_ROUNDS: usize = 8;

    /// Two threads of one level that keep yielding to each other.
    fn ping_pong(k: &HostKernel, fpu: bool) {
        let init = k.current_tid();
        for _ in 0..2 {
            k.spawn(20, move |k| {
                if fpu {
                    k.fpu_trap();
                }
                for _ in 0..PING_PONG_ROUNDS {
                    k.thr_yield();
                }
                report(k, init, 0);
                0
            })
            .expect("spawn");
        }
        for _ in 0..2 {
            assert_eq!(collect_report(k), 0);
        }
    }

    #[test]
    fn test_higher_priority_runs_first() {
        let order = Arc::new(spin::Mutex::new(Vec::new()));
        let code = boot({
            let order = order.clone();
            move |k| {
                for prio in [3u8, 5] {
                    let order = order.clone();
                    k.spawn(prio, move |_| {
                        order.lock().push(prio);
                        0
                    })
                    .expect("spawn");
                }
                // Neither preempts init; both run once it sleeps.
                assert!(order.lock().is_empty());
                assert_eq!(k.tim_wait(10), SyncReason::Timeout);
                0
            }
        });
        assert_eq!(code, 0);
        assert_eq!(*order.lock(), [5, 3]);
    }

    #[test]
    fn test_start_preempts_lower_priority_caller() {
        let code = boot(|k| {
            let ran = Arc::new(AtomicBool::new(false));
            let flag = ran.clone();
            ThreadBuilder::new()
                .priority(k.config().init_prio + 1)
                .spawn(k, move |_| {
                    flag.store(true, Ordering::SeqCst);
                    0
                })
                .expect("spawn");
            // The child outranks init and ran inside thr_start.
            assert!(ran.load(Ordering::SeqCst));
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn test_slice_expiry_rotates_equal_priority() {
        let code = boot(|k| {
            let ran = Arc::new(AtomicBool::new(false));
            let flag = ran.clone();
            k.spawn(k.config().init_prio, move |_| {
                flag.store(true, Ordering::SeqCst);
                0
            })
            .expect("spawn");

            let slice = k.config().default_slice;
            for _ in 0..slice - 1 {
                k.timer_interrupt();
            }
            assert!(!ran.load(Ordering::SeqCst));
            k.timer_interrupt();
            assert!(ran.load(Ordering::SeqCst));
            assert!(k.current().resources().sys_time >= u64::from(slice));
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn test_yield_with_dispatch_disabled_is_deferred() {
        let code = boot(|k| {
            let ran = Arc::new(AtomicBool::new(false));
            let flag = ran.clone();
            k.spawn(k.config().init_prio, move |_| {
                flag.store(true, Ordering::SeqCst);
                0
            })
            .expect("spawn");

            k.no_dispatch(|| {
                k.thr_yield();
                assert!(k.dispatch_requested());
                assert!(!ran.load(Ordering::SeqCst));
            });
            // Leaving the critical section dispatched the peer.
            assert!(ran.load(Ordering::SeqCst));
            0
        });
        assert_eq!(code, 0);
    }

    #[cfg(feature = "full-fpu")]
    #[test]
    fn test_fpu_state_follows_fpu_threads() {
        let code = boot(|k| {
            let stats = k.arch().stats();
            let saves = stats.fpu_saves.load(Ordering::Relaxed);
            let restores = stats.fpu_restores.load(Ordering::Relaxed);
            let switches = stats.context_switches.load(Ordering::Relaxed);

            ping_pong(k, true);

            let saved = stats.fpu_saves.load(Ordering::Relaxed) - saves;
            let restored = stats.fpu_restores.load(Ordering::Relaxed) - restores;
            let switched = stats.context_switches.load(Ordering::Relaxed) - switches;
            // Every hand-over between the two saves one and restores the other.
            assert!(saved >= PING_PONG_ROUNDS as u64, "saved {}", saved);
            assert!(restored >= PING_PONG_ROUNDS as u64, "restored {}", restored);
            assert!(saved <= switched && restored <= switched);
            // Init never touched the FPU.
            assert!(!k.current().fpu_used());
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn test_no_fpu_traffic_without_fpu_threads() {
        let k = new_kernel();
        let code = k
            .run(|k| {
                ping_pong(k, false);
                0
            })
            .expect("boot");
        assert_eq!(code, 0);

        let stats = k.arch().stats();
        assert!(stats.context_switches.load(Ordering::Relaxed) >= 2 * PING_PONG_ROUNDS as u64);
        assert_eq!(stats.fpu_saves.load(Ordering::Relaxed), 0);
        assert_eq!(stats.fpu_restores.load(Ordering::Relaxed), 0);
    }
}

#[cfg(test)]
mod wait_tests {
    use crate::sync::{SyncObject, SyncReason, WakePolicy};
    use crate::tests::helpers::{boot, collect_report, report};
    use crate::thread::EventId;
    use alloc::sync::Arc;

    #[test]
    fn test_wake_releases_waiter() {
        let code = boot(|k| {
            let obj = Arc::new(SyncObject::new(WakePolicy::All));
            let init = k.current_tid();
            let theirs = obj.clone();
            k.spawn(20, move |k| {
                let reason = k.sync_wait(&theirs);
                report(k, init, reason as i32);
                0
            })
            .expect("spawn");

            k.tim_wait(10);
            assert_eq!(obj.waiters(k), 1);
            assert_eq!(k.sync_wake(&obj, SyncReason::Released), 1);
            assert_eq!(collect_report(k), SyncReason::Released as i32);
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn test_event_interrupts_wait() {
        let code = boot(|k| {
            let obj = Arc::new(SyncObject::new(WakePolicy::One));
            let init = k.current_tid();
            let theirs = obj.clone();
            let tid = k
                .spawn(20, move |k| {
                    let reason = k.sync_wait(&theirs);
                    report(k, init, reason as i32);
                    0
                })
                .expect("spawn");

            k.tim_wait(10);
            let kill = EventId::KILL;
            assert_eq!(k.ev_send(tid, kill), Ok(()));
            assert_eq!(collect_report(k), SyncReason::Event as i32);
            // The interrupted waiter unlinked itself.
            assert_eq!(obj.waiters(k), 0);
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn test_destroy_releases_waiters() {
        let code = boot(|k| {
            let obj = Arc::new(SyncObject::new(WakePolicy::One));
            let init = k.current_tid();
            for _ in 0..3 {
                let theirs = obj.clone();
                k.spawn(20, move |k| {
                    let reason = k.sync_wait(&theirs);
                    report(k, init, reason as i32);
                    0
                })
                .expect("spawn");
            }

            k.tim_wait(10);
            assert_eq!(obj.destroy_check(k), Err(crate::errors::Errno::Busy));
            assert_eq!(k.sync_destroy(&obj), 3);
            for _ in 0..3 {
                assert_eq!(collect_report(k), SyncReason::Destroyed as i32);
            }
            assert_eq!(obj.destroy_check(k), Ok(()));
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn test_timed_wait_times_out() {
        let code = boot(|k| {
            let obj = SyncObject::new(WakePolicy::All);
            let before = k.uptime();
            assert_eq!(k.tim_wait_obj(&obj, 30), SyncReason::Timeout);
            assert!(k.uptime() - before >= 4);
            assert_eq!(obj.waiters(k), 0);
            assert_eq!(k.pending_callouts(), 0);
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn test_timed_wait_released_before_timeout() {
        let code = boot(|k| {
            let obj = Arc::new(SyncObject::new(WakePolicy::All));
            let init = k.current_tid();
            let theirs = obj.clone();
            k.spawn(20, move |k| {
                let reason = k.tim_wait_obj(&theirs, 10_000);
                report(k, init, reason as i32);
                0
            })
            .expect("spawn");

            k.tim_wait(10);
            assert_eq!(k.pending_callouts(), 1);
            k.sync_wake(&obj, SyncReason::Released);
            assert_eq!(collect_report(k), SyncReason::Released as i32);
            // The losing timer was cancelled.
            assert_eq!(k.pending_callouts(), 0);
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn test_callout_runs_and_cancels() {
        let code = boot(|k| {
            let fired = Arc::new(portable_atomic::AtomicU32::new(0));
            let a = fired.clone();
            let b = fired.clone();
            k.callout_register(10, move || {
                a.fetch_add(1, portable_atomic::Ordering::SeqCst);
            });
            let key = k.callout_register(10, move || {
                b.fetch_add(10, portable_atomic::Ordering::SeqCst);
            });
            assert!(k.callout_cancel(key));
            k.tim_wait(50);
            assert_eq!(fired.load(portable_atomic::Ordering::SeqCst), 1);
            assert!(!k.callout_cancel(key));
            0
        });
        assert_eq!(code, 0);
    }
}

#[cfg(test)]
mod lifecycle_tests {
    use crate::errors::Errno;
    use crate::proc::Process;
    use crate::tests::helpers::{boot, run_user, user_process};
    use crate::thread::{ThreadBuilder, ThreadFlags, ThreadState, WaitFlags, INVALID_TID};
    use alloc::boxed::Box;
    use alloc::vec::Vec;
    use portable_atomic::{AtomicU64, Ordering};

    #[test]
    fn test_join_collects_exit_code() {
        let code = run_user(|k, env| {
            let child = ThreadBuilder::new()
                .priority(5)
                .joinable(true)
                .process(env.process.clone())
                .spawn(k, |_| 17)
                .expect("spawn");
            let (tid, code) = k.thr_wait(0, WaitFlags::ANY).expect("child collected");
            assert_eq!(tid, child);
            code
        });
        assert_eq!(code, 17);
    }

    #[test]
    fn test_join_by_id_and_nonblock() {
        let code = run_user(|k, env| {
            let spawn = |code: i32| {
                ThreadBuilder::new()
                    .priority(5)
                    .joinable(true)
                    .process(env.process.clone())
                    .spawn(k, move |_| code)
                    .expect("spawn")
            };
            let a = spawn(1);
            let b = spawn(2);

            // Nobody has run yet.
            assert_eq!(k.thr_wait(0, WaitFlags::NONBLOCK), Err(Errno::Again));
            assert_eq!(k.thr_wait(b, WaitFlags::ID), Ok((b, 2)));
            assert_eq!(k.thr_wait(a, WaitFlags::ID), Ok((a, 1)));

            // Nothing left to wait for.
            assert_eq!(k.thr_wait(0, WaitFlags::ANY), Err(Errno::NoEntry));
            assert_eq!(k.thr_wait(999, WaitFlags::ID), Err(Errno::NoEntry));
            assert_eq!(k.thr_wait(0, WaitFlags::PGRP), Err(Errno::Invalid));
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn test_non_joinable_child_not_waitable() {
        let code = run_user(|k, env| {
            let child = ThreadBuilder::new()
                .priority(5)
                .process(env.process.clone())
                .spawn(k, |_| 3)
                .expect("spawn");
            assert_eq!(k.thr_wait(child, WaitFlags::ID), Err(Errno::NoEntry));
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn test_wait_filters_by_process() {
        let code = run_user(|k, env| {
            let (other, _space) = user_process(2);
            let foreign = ThreadBuilder::new()
                .priority(5)
                .joinable(true)
                .process(other)
                .spawn(k, |_| 8)
                .expect("spawn");
            let local = ThreadBuilder::new()
                .priority(5)
                .joinable(true)
                .process(env.process.clone())
                .spawn(k, |_| 9)
                .expect("spawn");

            assert_eq!(k.thr_wait(0, WaitFlags::PROC), Ok((local, 9)));
            assert_eq!(k.thr_wait(0, WaitFlags::ANY), Ok((foreign, 8)));
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn test_child_time_accumulates_in_parent() {
        let code = run_user(|k, env| {
            ThreadBuilder::new()
                .priority(12)
                .joinable(true)
                .process(env.process.clone())
                .spawn(k, |k| {
                    for _ in 0..3 {
                        k.timer_interrupt();
                    }
                    0
                })
                .expect("spawn");
            k.thr_wait(0, WaitFlags::ANY).expect("collected");
            let usage = k.current().resources();
            assert_eq!(usage.children_user_time, 3);
            assert_eq!(usage.children_sys_time, 0);
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn test_orphans_released_when_parent_exits() {
        let code = run_user(|k, env| {
            let child_tid = alloc::sync::Arc::new(AtomicU64::new(0));
            let seen = child_tid.clone();
            let process = env.process.clone();
            ThreadBuilder::new()
                .priority(8)
                .process(env.process.clone())
                .spawn(k, move |k| {
                    // Outranks us: exits at once and waits to be collected.
                    let tid = ThreadBuilder::new()
                        .priority(9)
                        .joinable(true)
                        .process(process)
                        .spawn(k, |_| 5)
                        .expect("spawn");
                    seen.store(tid, Ordering::SeqCst);
                    0
                })
                .expect("spawn");

            let reaped = k.reaped_count();
            k.tim_wait(30);
            let tid = child_tid.load(Ordering::SeqCst);
            assert_ne!(tid, 0);
            assert!(k.find_thread(tid).is_none());
            assert_eq!(k.reaped_count(), reaped + 2);
            assert_eq!(k.dead_pending(), 0);
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn test_reaper_returns_ids_and_stacks() {
        let code = boot(|k| {
            for i in 0..10 {
                k.spawn(20, move |_| i).expect("spawn");
            }
            k.tim_wait(10);
            assert_eq!(k.reaped_count(), 10);
            assert_eq!(k.dead_pending(), 0);
            // reaper and init
            assert_eq!(k.thread_count(), 2);
            assert_eq!(k.registry().ids_in_use(k), 2);
            assert_eq!(k.stack_pool().in_use(), 2);

            // The lowest system id is handed out again.
            let tid = k.spawn(20, |_| 0).expect("spawn");
            assert_eq!(tid, 3);
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn test_create_validation() {
        let code = boot(|k| {
            let thr = k.thread_alloc().expect("alloc");
            let max = k.config().max_prio;
            assert_eq!(
                k.create_kthread(&thr, max, ThreadFlags::empty(), None, Box::new(|_| 0)),
                Err(Errno::Invalid)
            );
            assert_eq!(
                k.create_kthread(&thr, 1, ThreadFlags::empty(), Some(1), Box::new(|_| 0)),
                Err(Errno::Busy)
            );

            let (process, _space) = user_process(7);
            let user_max = k.config().max_user_prio;
            assert_eq!(
                k.create_uthread(&thr, user_max, ThreadFlags::empty(), &process, Box::new(|_| 0)),
                Err(Errno::Invalid)
            );
            let kernel_proc = k.kernel_process().clone();
            assert_eq!(
                k.create_uthread(&thr, 1, ThreadFlags::empty(), &kernel_proc, Box::new(|_| 0)),
                Err(Errno::Invalid)
            );
            let exiting: alloc::sync::Arc<Process> = user_process(8).0;
            exiting.mark_exiting();
            assert_eq!(
                k.create_uthread(&thr, 1, ThreadFlags::empty(), &exiting, Box::new(|_| 0)),
                Err(Errno::NoEntry)
            );

            // Still FREE after every failure.
            assert_eq!(thr.state(), ThreadState::Free);
            assert_eq!(k.thr_start(&thr, k.current_tid()), Err(Errno::Invalid));
            assert_eq!(
                k.create_uthread(&thr, 1, ThreadFlags::empty(), &process, Box::new(|_| 0)),
                Ok(())
            );
            assert!(thr.tid() >= k.config().reserved_ids);
            assert_eq!(process.threads(), [thr.tid()]);
            assert_eq!(
                k.create_kthread(&thr, 1, ThreadFlags::empty(), None, Box::new(|_| 0)),
                Err(Errno::Invalid)
            );
            assert_eq!(k.thr_destroy(&thr), Ok(()));
            assert_eq!(process.thread_count(), 0);
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn test_destroy_by_state() {
        let code = boot(|k| {
            let in_use = k.stack_pool().in_use();

            let free = k.thread_alloc().expect("alloc");
            assert_eq!(k.thr_destroy(&free), Ok(()));

            let dormant = ThreadBuilder::new()
                .name("dormant")
                .create(k, |_| 0)
                .expect("create");
            let tid = dormant.tid();
            assert_eq!(dormant.state(), ThreadState::Dormant);
            assert!(k.find_thread(tid).is_some());
            assert_eq!(k.thr_destroy(&dormant), Ok(()));
            assert_eq!(dormant.state(), ThreadState::Free);
            assert!(k.find_thread(tid).is_none());

            assert_eq!(k.thr_destroy(&k.current()), Err(Errno::Busy));
            assert_eq!(k.stack_pool().in_use(), in_use);
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn test_many_children_collected_once() {
        let code = run_user(|k, env| {
            let mut expected: Vec<i32> = (100..120).collect();
            for code in expected.iter().copied() {
                ThreadBuilder::new()
                    .priority(5)
                    .joinable(true)
                    .process(env.process.clone())
                    .spawn(k, move |_| code)
                    .expect("spawn");
            }
            let mut seen: Vec<i32> = (0..expected.len())
                .map(|_| k.thr_wait(0, WaitFlags::ANY).expect("collected").1)
                .collect();
            seen.sort_unstable();
            expected.sort_unstable();
            assert_eq!(seen, expected);
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn test_child_of_exiting_parent_is_not_linked() {
        let code = run_user(|k, env| {
            let me = k.current();
            // Parent already orphaned its children and is on its way out.
            me.family.lock(k).exiting = true;
            let tid = ThreadBuilder::new()
                .priority(5)
                .joinable(true)
                .process(env.process.clone())
                .spawn(k, |_| 3)
                .expect("spawn");
            me.family.lock(k).exiting = false;

            let child = k.find_thread(tid).expect("child registered");
            assert!(!child.is_joinable());
            assert_eq!(child.parent(), INVALID_TID);
            assert!(me.family.lock(k).children.is_empty());
            assert_eq!(k.thr_wait(tid, WaitFlags::ANY), Err(Errno::NoEntry));

            // Unlinked, so it exits without waiting to be collected.
            k.tim_wait(20);
            assert!(k.find_thread(tid).is_none());
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn test_failed_create_returns_stack() {
        let code = boot(|k| {
            let in_use = k.stack_pool().in_use();
            let free = k.registry().free_count(k);
            let too_high = k.config().max_prio;
            assert_eq!(
                ThreadBuilder::new().priority(too_high).create(k, |_| 0).err(),
                Some(Errno::Invalid)
            );
            assert_eq!(k.stack_pool().in_use(), in_use);
            assert_eq!(k.registry().free_count(k), free);
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn test_shutdown_with_dormant_thread() {
        let k = crate::tests::helpers::new_kernel();
        let code = k
            .run(|k| {
                let thr = ThreadBuilder::new().create(k, |_| 1).expect("create");
                assert_eq!(thr.state(), ThreadState::Dormant);
                7
            })
            .expect("boot");
        assert_eq!(code, 7);
        assert!(k.arch().stats().contexts_released.load(Ordering::Relaxed) > 0);
    }
}

#[cfg(test)]
mod lpc_tests {
    use crate::errors::Errno;
    use crate::lpc::{MessageBody, MsgBuf, RawMessage, LPC_RECV_ANY};
    use crate::tests::helpers::{boot, collect_report, report, run_user, USER_BASE};
    use crate::thread::{ThreadBuilder, Tid};
    use crate::time::Timeout;
    use crate::HostKernel;

    fn echo_server(k: &HostKernel) -> i32 {
        loop {
            let (from, body) = match k.lpc_recv_body(LPC_RECV_ANY, Timeout::Forever) {
                Ok(msg) => msg,
                Err(_) => return -1,
            };
            let reply = match body {
                MessageBody::Thread { req, rc, mut args } => {
                    args[0] += 1;
                    MessageBody::Thread { req, rc, args }
                }
                other => other,
            };
            if k.lpc_send_body(from, Timeout::Forever, &reply).is_err() {
                return -1;
            }
        }
    }

    #[test]
    fn test_poll_without_receiver_is_again() {
        let code = boot(|k| {
            let idle_peer = ThreadBuilder::new().priority(3).create(k, |_| 0).expect("create");
            let body = MessageBody::Opaque([7; crate::lpc::MSG_PAYLOAD]);
            assert_eq!(k.lpc_send_body(idle_peer.tid(), Timeout::Poll, &body), Err(Errno::Again));
            assert_eq!(k.lpc_send_body(4000, Timeout::Poll, &body), Err(Errno::NoEntry));
            assert_eq!(k.thr_destroy(&idle_peer), Ok(()));
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn test_recv_timeout() {
        let code = boot(|k| {
            let mut raw = RawMessage::zeroed();
            assert_eq!(
                k.lpc_recv(LPC_RECV_ANY, Timeout::Poll, &mut MsgBuf::Kernel(&mut raw)),
                Err(Errno::Again)
            );
            let before = k.uptime();
            assert_eq!(
                k.lpc_recv(LPC_RECV_ANY, Timeout::Millis(30), &mut MsgBuf::Kernel(&mut raw)),
                Err(Errno::Again)
            );
            assert!(k.uptime() - before >= 4);
            assert_eq!(k.pending_callouts(), 0);
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn test_call_roundtrip() {
        let code = boot(|k| {
            let server = k.spawn(20, echo_server).expect("spawn server");
            let request = MessageBody::Thread {
                req: 1,
                rc: 0,
                args: [41, 0, 0, 0],
            };
            match k.lpc_call(server, &request) {
                Ok(MessageBody::Thread { args, .. }) => args[0] as i32,
                other => panic!("unexpected reply {:?}", other),
            }
        });
        assert_eq!(code, 42);
    }

    #[test]
    fn test_sender_sees_noentry_when_receiver_exits() {
        let code = boot(|k| {
            let init = k.current_tid();
            // Listens only for a sender that never comes, then gives up.
            let dest = k
                .spawn(5, |k| {
                    let mut raw = RawMessage::zeroed();
                    let _ = k.lpc_recv(77_777, Timeout::Millis(50), &mut MsgBuf::Kernel(&mut raw));
                    0
                })
                .expect("spawn");
            k.spawn(20, move |k| {
                let body = MessageBody::Opaque([1; crate::lpc::MSG_PAYLOAD]);
                let rc = match k.lpc_send_body(dest, Timeout::Forever, &body) {
                    Ok(()) => 0,
                    Err(e) => e.as_neg() as i32,
                };
                report(k, init, rc);
                0
            })
            .expect("spawn");
            collect_report(k)
        });
        assert_eq!(code as i64, Errno::NoEntry.as_neg());
    }

    #[test]
    fn test_user_send_fault() {
        let code = run_user(|k, env| {
            // init is parked in recv, so the body copy is attempted.
            let rc = k.syscall(7, [env.init, (-1i64) as u64, 0xdead_0000, 0]);
            rc as i32
        });
        assert_eq!(code as i64, Errno::Fault.as_neg());
    }

    #[test]
    fn test_user_send_and_reply_through_address_space() {
        let code = run_user(|k, env| {
            let server: Tid = ThreadBuilder::new()
                .priority(20)
                .spawn(k, echo_server)
                .expect("spawn server");
            let request = MessageBody::Thread {
                req: 3,
                rc: 0,
                args: [99, 1, 2, 3],
            };
            env.space
                .write(USER_BASE, request.encode().as_bytes())
                .expect("arena write");
            assert_eq!(k.syscall(9, [server, USER_BASE, 0, 0]), 0);

            let bytes = env.space.read(USER_BASE, crate::lpc::MSG_SIZE).expect("arena read");
            let mut raw = RawMessage::zeroed();
            raw.0.copy_from_slice(&bytes);
            match MessageBody::decode(&raw) {
                Ok(MessageBody::Thread { args, .. }) => args[0] as i32,
                other => panic!("unexpected reply {:?}", other),
            }
        });
        assert_eq!(code, 100);
    }

    #[test]
    fn test_user_recv_copies_sender_out() {
        let code = run_user(|k, env| {
            let me = k.current_tid();
            let peer = ThreadBuilder::new()
                .priority(5)
                .process(env.process.clone())
                .spawn(k, move |k| {
                    let body = MessageBody::Opaque([9; crate::lpc::MSG_PAYLOAD]);
                    k.lpc_send_body(me, Timeout::Forever, &body).map_or(1, |()| 0)
                })
                .expect("spawn");

            let out = USER_BASE + crate::lpc::MSG_SIZE as u64;
            assert_eq!(k.syscall(8, [LPC_RECV_ANY, (-1i64) as u64, USER_BASE, out]), 0);
            let sender = env.space.read(out, 8).expect("arena read");
            assert_eq!(u64::from_le_bytes(sender.try_into().expect("8 bytes")), peer);
            let body = env.space.read(USER_BASE + 4, 1).expect("arena read");
            i32::from(body[0])
        });
        assert_eq!(code, 9);
    }
}

#[cfg(test)]
mod syscall_tests {
    use crate::errors::Errno;
    use crate::tests::helpers::{run_user, USER_BASE};
    use crate::thread::{ThreadBuilder, WaitFlags, REAPER_TID};

    #[test]
    fn test_getid_yield_and_nosys() {
        let code = run_user(|k, _env| {
            assert_eq!(k.syscall(5, [0; 4]), k.current_tid() as i64);
            assert_eq!(k.syscall(3, [0; 4]), 0);
            assert_eq!(k.syscall(42, [0; 4]), Errno::NoSys.as_neg());
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn test_wait_copies_result_out() {
        let code = run_user(|k, env| {
            let child = ThreadBuilder::new()
                .priority(5)
                .joinable(true)
                .process(env.process.clone())
                .spawn(k, |_| -9)
                .expect("spawn");

            let id = u64::from(WaitFlags::ID.bits());
            assert_eq!(k.syscall(6, [child, id, USER_BASE, USER_BASE + 8]), 0);
            let tid = env.space.read(USER_BASE, 8).expect("arena read");
            let code = env.space.read(USER_BASE + 8, 4).expect("arena read");
            assert_eq!(u64::from_le_bytes(tid.try_into().expect("8 bytes")), child);
            i32::from_le_bytes(code.try_into().expect("4 bytes"))
        });
        assert_eq!(code, -9);
    }

    #[test]
    fn test_wait_argument_errors() {
        let code = run_user(|k, _env| {
            let id = u64::from(WaitFlags::ID.bits());
            let pgrp = u64::from(WaitFlags::PGRP.bits());
            assert_eq!(k.syscall(6, [REAPER_TID, id, 0, 0]), Errno::Permission.as_neg());
            assert_eq!(k.syscall(6, [0, pgrp, 0, 0]), Errno::Invalid.as_neg());
            assert_eq!(k.syscall(6, [1234, id, 0, 0]), Errno::NoEntry.as_neg());
            0
        });
        assert_eq!(code, 0);
    }
}

#[cfg(test)]
mod address_space_tests {
    use crate::tests::helpers::{run_user, USER_MAIN_PRIO};
    use crate::thread::ThreadBuilder;
    use alloc::sync::Arc;
    use portable_atomic::{AtomicU64, Ordering};

    #[test]
    fn test_same_process_switch_keeps_space() {
        let code = run_user(|k, env| {
            let observed = Arc::new(AtomicU64::new(u64::MAX));
            let theirs = observed.clone();
            ThreadBuilder::new()
                .priority(USER_MAIN_PRIO)
                .process(env.process.clone())
                .spawn(k, move |k| {
                    let switches = k.arch().stats().address_space_switches.load(Ordering::SeqCst);
                    theirs.store(switches, Ordering::SeqCst);
                    0
                })
                .expect("spawn");

            assert_eq!(k.arch().current_space(), env.process.id());
            let before = k.arch().stats().address_space_switches.load(Ordering::SeqCst);
            k.thr_yield();
            assert_eq!(observed.load(Ordering::SeqCst), before);
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn test_kernel_thread_switches_space() {
        let code = run_user(|k, env| {
            let before = k.arch().stats().address_space_switches.load(Ordering::SeqCst);
            let seen = Arc::new(AtomicU64::new(u64::MAX));
            let theirs = seen.clone();
            ThreadBuilder::new()
                .priority(20)
                .spawn(k, move |k| {
                    theirs.store(k.arch().current_space(), Ordering::SeqCst);
                    0
                })
                .expect("spawn");
            assert_eq!(seen.load(Ordering::SeqCst), 0);
            assert_eq!(k.arch().current_space(), env.process.id());
            assert!(k.arch().stats().address_space_switches.load(Ordering::SeqCst) >= before + 2);
            0
        });
        assert_eq!(code, 0);
    }
}
