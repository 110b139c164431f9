//! Stress tests for thread churn, LPC fan-in and timer races.

#[cfg(test)]
mod stress_tests {
    use crate::lpc::{MessageBody, MsgBuf, RawMessage, LPC_RECV_ANY};
    use crate::sync::{IrqLock, SyncObject, SyncReason, WakePolicy};
    use crate::tests::helpers::{
        assert_single_container, boot, boot_with_idle_budget, collect_report, report, run_user,
    };
    use crate::tests::TEST_CONFIG;
    use crate::thread::{ThreadBuilder, WaitFlags};
    use crate::time::Timeout;
    use alloc::collections::BTreeSet;
    use alloc::sync::Arc;

    /// Idle ticks after which a hung test is declared deadlocked.
    const DEADLOCK_TICKS: u64 = 10_000;

    #[test]
    fn test_thread_churn() {
        let (count, batch) = {
            let config = TEST_CONFIG.lock();
            (config.stress_thread_count, config.stress_batch)
        };

        let code = run_user(move |k, env| {
            let mut codes = BTreeSet::new();
            let mut next = 0;
            while next < count {
                let end = (next + batch).min(count);
                let mut batch_tids = BTreeSet::new();
                for code in next..end {
                    let tid = ThreadBuilder::new()
                        .priority(5)
                        .joinable(true)
                        .process(env.process.clone())
                        .spawn(k, move |_| code as i32)
                        .expect("spawn");
                    assert!(batch_tids.insert(tid), "tid {} handed out twice", tid);
                }
                assert_single_container(k);
                for _ in next..end {
                    let (tid, code) = k.thr_wait(0, WaitFlags::ANY).expect("child collected");
                    assert!(batch_tids.remove(&tid));
                    assert!(codes.insert(code), "code {} collected twice", code);
                }
                assert!(batch_tids.is_empty());
                assert_single_container(k);
                next = end;
            }

            assert_eq!(codes.len(), count);
            assert_eq!(k.thr_wait(0, WaitFlags::ANY), Err(crate::errors::Errno::NoEntry));
            // Every child went through the reaper.
            k.tim_wait(10);
            assert_eq!(k.dead_pending(), 0);
            assert_eq!(k.reaped_count(), count as u64);
            assert_single_container(k);
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn test_lpc_fan_in() {
        let (clients, rounds) = {
            let config = TEST_CONFIG.lock();
            (config.lpc_clients, config.lpc_rounds)
        };

        let code = boot(move |k| {
            let init = k.current_tid();
            let server = k
                .spawn(25, |k| {
                    let mut served = 0u64;
                    loop {
                        let (from, body) = match k.lpc_recv_body(LPC_RECV_ANY, Timeout::Forever) {
                            Ok(msg) => msg,
                            Err(_) => return -1,
                        };
                        served += 1;
                        let reply = match body {
                            MessageBody::Thread { req, args, .. } => MessageBody::Thread {
                                req,
                                rc: 0,
                                args: [args[0] * 2, served, 0, 0],
                            },
                            other => other,
                        };
                        if k.lpc_send_body(from, Timeout::Forever, &reply).is_err() {
                            return -1;
                        }
                    }
                })
                .expect("spawn server");

            for client in 0..clients {
                k.spawn(20, move |k| {
                    for round in 0..rounds {
                        let value = (client * 1000 + round) as u64;
                        let request = MessageBody::Thread {
                            req: 1,
                            rc: 0,
                            args: [value, 0, 0, 0],
                        };
                        match k.lpc_call(server, &request) {
                            Ok(MessageBody::Thread { args, .. }) if args[0] == value * 2 => {}
                            other => panic!("client {} round {}: {:?}", client, round, other),
                        }
                    }
                    report(k, init, client as i32);
                    0
                })
                .expect("spawn client");
            }

            let mut seen = BTreeSet::new();
            for _ in 0..clients {
                assert!(seen.insert(collect_report(k)));
            }
            assert_eq!(seen.len(), clients);
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn test_timed_wait_races_wakeup() {
        let rounds = TEST_CONFIG.lock().race_rounds;

        let code = boot(move |k| {
            let init = k.current_tid();
            for round in 0..rounds {
                let obj = Arc::new(SyncObject::new(WakePolicy::All));
                let theirs = obj.clone();
                k.spawn(20, move |k| {
                    let reason = k.tim_wait_obj(&theirs, 20);
                    report(k, init, reason as i32);
                    0
                })
                .expect("spawn");

                // Alternate between waking just before and just after the
                // waiter's deadline.
                k.tim_wait(if round % 2 == 0 { 10 } else { 20 });
                k.sync_wake(&obj, SyncReason::Released);

                let reason = collect_report(k);
                assert!(
                    reason == SyncReason::Released as i32 || reason == SyncReason::Timeout as i32,
                    "round {}: reason {}",
                    round,
                    reason
                );
                assert_eq!(obj.waiters(k), 0);
                assert_eq!(k.pending_callouts(), 0);
            }
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn test_every_thread_has_one_home() {
        let code = run_user(|k, env| {
            let obj = Arc::new(SyncObject::new(WakePolicy::All));
            // Outrank main, so each blocks on `obj` right away.
            for _ in 0..3 {
                let theirs = obj.clone();
                ThreadBuilder::new()
                    .priority(12)
                    .process(env.process.clone())
                    .spawn(k, move |k| {
                        k.sync_wait(&theirs);
                        0
                    })
                    .expect("spawn waiter");
            }
            for _ in 0..3 {
                ThreadBuilder::new()
                    .priority(5)
                    .process(env.process.clone())
                    .spawn(k, |_| 0)
                    .expect("spawn ready");
            }
            let dormant = ThreadBuilder::new()
                .priority(5)
                .process(env.process.clone())
                .create(k, |_| 0)
                .expect("create");

            assert_eq!(obj.waiters(k), 3);
            assert_single_container(k);

            assert_eq!(k.sync_wake(&obj, SyncReason::Released), 3);
            k.thr_start(&dormant, k.current_tid()).expect("start");
            assert_single_container(k);

            k.tim_wait(20);
            assert_eq!(k.dead_pending(), 0);
            assert_single_container(k);
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn test_zero_timeout_races_wakeup() {
        let rounds = TEST_CONFIG.lock().race_rounds;

        let code = boot(move |k| {
            let init = k.current_tid();
            for round in 0..rounds {
                let before = k.pending_callouts();
                let obj = Arc::new(SyncObject::new(WakePolicy::All));
                let theirs = obj.clone();
                k.spawn(20, move |k| {
                    let reason = k.tim_wait_obj(&theirs, 0);
                    report(k, init, reason as i32);
                    0
                })
                .expect("spawn");

                if round % 2 == 0 {
                    // Init's timer and the waiter's expire on the same tick.
                    k.tim_wait(0);
                    k.sync_wake(&obj, SyncReason::Released);
                } else {
                    // Queued behind the waiter: wakes it before any tick.
                    let waker = obj.clone();
                    k.spawn(20, move |k| {
                        k.sync_wake(&waker, SyncReason::Released);
                        0
                    })
                    .expect("spawn waker");
                }

                let reason = collect_report(k);
                assert!(
                    reason == SyncReason::Released as i32 || reason == SyncReason::Timeout as i32,
                    "round {}: reason {}",
                    round,
                    reason
                );
                assert_eq!(obj.waiters(k), 0);
                assert_eq!(k.pending_callouts(), before, "round {}", round);
            }
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn test_wake_between_queue_and_switch_is_kept() {
        let rounds = TEST_CONFIG.lock().race_rounds;

        let code = boot_with_idle_budget(DEADLOCK_TICKS, move |k| {
            let me = k.me.upgrade().expect("kernel alive");
            for _ in 0..rounds {
                let obj = Arc::new(SyncObject::new(WakePolicy::All));
                let theirs = obj.clone();
                let kernel = me.clone();
                k.callout_register(0, move || {
                    kernel.sync_wake(&theirs, SyncReason::Released);
                });

                // The interrupt lands after queueing, before the switch.
                let blk = k.wait_no_schedule(&obj);
                k.timer_interrupt();
                if k.current().in_wait() {
                    k.schedule();
                }
                assert_eq!(k.finish_wait(&obj, &blk), SyncReason::Released);
                assert_eq!(obj.waiters(k), 0);
            }
            assert_eq!(k.pending_callouts(), 0);
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn test_wake_all_then_wait_never_hangs() {
        let rounds = TEST_CONFIG.lock().race_rounds;

        let code = boot_with_idle_budget(DEADLOCK_TICKS, move |k| {
            let init = k.current_tid();
            for round in 0..rounds {
                let done = Arc::new(IrqLock::new(false));
                let obj = Arc::new(SyncObject::new(WakePolicy::All));
                // Waker above, below and level with the sleeper.
                let (waker_prio, sleeper_prio) = match round % 3 {
                    0 => (22, 20),
                    1 => (20, 22),
                    _ => (20, 20),
                };

                let (flag, theirs) = (done.clone(), obj.clone());
                k.spawn(waker_prio, move |k| {
                    let mut set = flag.lock(k);
                    *set = true;
                    k.sync_wake(&theirs, SyncReason::Released);
                    drop(set);
                    report(k, init, 1);
                    0
                })
                .expect("spawn waker");

                let (flag, theirs) = (done.clone(), obj.clone());
                k.spawn(sleeper_prio, move |k| {
                    let mut set = flag.lock(k);
                    while !*set {
                        let (_, relocked) = k.sync_wait_locked(&theirs, set);
                        set = relocked;
                    }
                    drop(set);
                    report(k, init, 2);
                    0
                })
                .expect("spawn sleeper");

                let mut codes = [collect_report(k), collect_report(k)];
                codes.sort_unstable();
                assert_eq!(codes, [1, 2], "round {}", round);
                assert_eq!(obj.waiters(k), 0);
            }
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn test_woken_receiver_always_finds_a_message() {
        const SENDERS: usize = 6;
        const PER_SENDER: usize = 20;

        let code = boot_with_idle_budget(DEADLOCK_TICKS, |k| {
            let init = k.current_tid();
            let receiver = k
                .spawn(15, move |k| {
                    let mut seen = BTreeSet::new();
                    for _ in 0..SENDERS * PER_SENDER {
                        let mut raw = RawMessage::zeroed();
                        let from = k
                            .lpc_recv(LPC_RECV_ANY, Timeout::Forever, &mut MsgBuf::Kernel(&mut raw))
                            .expect("woken receiver finds a message");
                        match MessageBody::decode(&raw) {
                            Ok(MessageBody::Thread { args, .. }) => {
                                assert!(seen.insert((from, args[0])), "duplicate from {}", from);
                            }
                            other => panic!("unexpected body {:?}", other),
                        }
                    }
                    assert!(!k.current().mque.wait_sender.has_waiters(k));
                    report(k, init, seen.len() as i32);
                    0
                })
                .expect("spawn receiver");

            for sender in 0..SENDERS {
                // Alternate above and below the receiver.
                let prio = if sender % 2 == 0 { 20 } else { 10 };
                k.spawn(prio, move |k| {
                    for seq in 0..PER_SENDER {
                        let body = MessageBody::Thread {
                            req: 2,
                            rc: 0,
                            args: [seq as u64, 0, 0, 0],
                        };
                        k.lpc_send_body(receiver, Timeout::Forever, &body)
                            .expect("delivered");
                        if seq % 3 == 0 {
                            k.thr_yield();
                        }
                    }
                    0
                })
                .expect("spawn sender");
            }

            assert_eq!(collect_report(k), (SENDERS * PER_SENDER) as i32);
            0
        });
        assert_eq!(code, 0);
    }
}
