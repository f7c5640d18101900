use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use dslab_actors::{
    platform::{
        config::{DiskConfig, EnergyConfig, PlatformConfig, StateEvent},
        topology::make_star_platform,
    },
    ActivitySet, ActivityState, ActorContext, DeploymentConfig, EngineConfig, FunctionRegistry, SimError,
    Simulation,
};

/// Latency of a route between two hosts of a star: two links of 1e-4 seconds each.
const STAR_LATENCY: f64 = 2e-4;

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-6,
        "expected {}, got {}",
        expected,
        actual
    );
}

/// Hosts compute 1 flop per second, links transfer 100 bytes per second.
fn star(hosts: usize) -> Simulation {
    Simulation::new(&make_star_platform(hosts, 1., 100.), EngineConfig::default()).unwrap()
}

#[test]
fn suspended_actor_freezes_its_execution() {
    let sim = star(1);
    let host = sim.host("host_0").unwrap();
    let finish = Rc::new(Cell::new(0.));

    let f = finish.clone();
    let worker = sim
        .spawn("worker", &host, move |ctx: ActorContext| async move {
            ctx.execute(3.).await.unwrap();
            f.set(ctx.time());
        })
        .unwrap();
    sim.spawn("controller", &host, move |ctx: ActorContext| async move {
        ctx.sleep_for(1.).await;
        worker.suspend();
        assert!(worker.is_suspended());
        ctx.sleep_for(10.).await;
        worker.resume();
    })
    .unwrap();

    sim.run();
    assert_close(finish.get(), 13.);
}

#[test]
fn executions_share_host_fairly() {
    for count in [2usize, 3] {
        let sim = star(1);
        let host = sim.host("host_0").unwrap();
        let finish = Rc::new(RefCell::new(Vec::new()));

        let f = finish.clone();
        sim.spawn("worker", &host, move |ctx: ActorContext| async move {
            let execs = (0..count).map(|_| ctx.exec_async(1.)).collect::<Vec<_>>();
            for exec in execs.iter() {
                exec.wait().await.unwrap();
                f.borrow_mut().push(exec.finish_time().unwrap());
            }
        })
        .unwrap();

        sim.run();
        assert_eq!(finish.borrow().len(), count);
        for &time in finish.borrow().iter() {
            assert_close(time, count as f64);
        }
    }
}

#[test]
fn priority_gives_larger_share() {
    let sim = star(1);
    let host = sim.host("host_0").unwrap();
    let times = Rc::new(RefCell::new(Vec::new()));

    let t = times.clone();
    sim.spawn("worker", &host, move |ctx: ActorContext| async move {
        let high = ctx.exec_init(3.);
        high.set_priority(2.).unwrap();
        high.start().unwrap();
        let low = ctx.exec_async(3.);
        high.wait().await.unwrap();
        t.borrow_mut().push(ctx.time());
        low.wait().await.unwrap();
        t.borrow_mut().push(ctx.time());
        assert!(matches!(low.set_priority(0.), Err(SimError::InvalidState(_))));
    })
    .unwrap();

    sim.run();
    let times = times.borrow();
    assert_close(times[0], 4.5);
    assert_close(times[1], 6.);
}

#[test]
fn host_throughput_depends_on_concurrency() {
    let sim = star(1);
    let host = sim.host("host_0").unwrap();
    host.set_throughput_function(Some(Box::new(|n| if n > 1 { 0.5 } else { 1. })));

    sim.spawn("worker", &host, |ctx: ActorContext| async move {
        let first = ctx.exec_async(1.);
        let second = ctx.exec_async(1.);
        first.wait().await.unwrap();
        second.wait().await.unwrap();
    })
    .unwrap();

    sim.run();
    assert_close(sim.time(), 4.);
}

#[test]
fn communications_share_link_fairly() {
    let sim = star(2);
    let src = sim.host("host_0").unwrap();
    let dst = sim.host("host_1").unwrap();
    let finish = Rc::new(RefCell::new(Vec::new()));

    for i in 0..2 {
        let mailbox = format!("box_{}", i);
        let name = mailbox.clone();
        sim.spawn(&format!("sender_{}", i), &src, move |ctx: ActorContext| async move {
            ctx.mailbox(&name).put(i, 100.).await.unwrap();
        })
        .unwrap();
        let f = finish.clone();
        sim.spawn(&format!("receiver_{}", i), &dst, move |ctx: ActorContext| async move {
            let value: i32 = ctx.mailbox(&mailbox).get().await.unwrap();
            assert_eq!(value, i);
            f.borrow_mut().push(ctx.time());
        })
        .unwrap();
    }

    sim.run();
    assert_eq!(finish.borrow().len(), 2);
    for &time in finish.borrow().iter() {
        assert_close(time, 2. + STAR_LATENCY);
    }
    assert_close(sim.stats().network_traffic_between_hosts, 200.);
}

#[test]
fn get_posted_before_put() {
    let sim = star(2);
    let received = Rc::new(Cell::new((0u32, 0.)));

    sim.spawn("sender", &sim.host("host_0").unwrap(), |ctx: ActorContext| async move {
        ctx.sleep_for(5.).await;
        ctx.mailbox("box").put(42u32, 100.).await.unwrap();
        assert_close(ctx.time(), 6. + STAR_LATENCY);
    })
    .unwrap();
    let r = received.clone();
    sim.spawn("receiver", &sim.host("host_1").unwrap(), move |ctx: ActorContext| async move {
        let mailbox = ctx.mailbox("box");
        let comm = mailbox.get_async();
        assert!(!mailbox.listen());
        assert!(!mailbox.empty());
        comm.wait().await.unwrap();
        assert_eq!(comm.sender().unwrap().name(), "sender");
        assert!(matches!(comm.get_payload::<String>(), Err(SimError::PayloadType)));
        r.set((comm.get_payload::<u32>().unwrap(), ctx.time()));
    })
    .unwrap();

    sim.run();
    let (value, time) = received.get();
    assert_eq!(value, 42);
    assert_close(time, 6. + STAR_LATENCY);
    assert!(sim.mailbox("box").empty());
}

#[test]
fn failed_link_fails_transfer_on_both_sides() {
    let sim = star(2);
    let link = sim.link("host_0-switch").unwrap();
    let results = Rc::new(RefCell::new(Vec::new()));

    let r = results.clone();
    sim.spawn("sender", &sim.host("host_0").unwrap(), move |ctx: ActorContext| async move {
        let result = ctx.mailbox("box").put("data", 1000.).await;
        r.borrow_mut().push(result);
    })
    .unwrap();
    let r = results.clone();
    sim.spawn("receiver", &sim.host("host_1").unwrap(), move |ctx: ActorContext| async move {
        let result = ctx.mailbox("box").get::<&str>().await.map(|_| ());
        r.borrow_mut().push(result);
    })
    .unwrap();
    sim.spawn("breaker", &sim.host("host_1").unwrap(), move |ctx: ActorContext| async move {
        ctx.sleep_for(1.).await;
        link.turn_off();
    })
    .unwrap();

    sim.run();
    assert_close(sim.time(), 1.);
    let results = results.borrow();
    assert_eq!(results.len(), 2);
    assert!(results
        .iter()
        .all(|result| matches!(result, Err(SimError::TransferFailure))));
}

#[test]
fn permanent_receiver_gets_data_in_advance() {
    let sim = star(2);
    let received = Rc::new(Cell::new(0.));

    let r = received.clone();
    let receiver = sim
        .spawn("receiver", &sim.host("host_1").unwrap(), move |ctx: ActorContext| async move {
            ctx.sleep_for(10.).await;
            let mailbox = ctx.mailbox("box");
            assert!(mailbox.ready());
            let value: u64 = mailbox.get().await.unwrap();
            assert_eq!(value, 7);
            r.set(ctx.time());
        })
        .unwrap();
    sim.mailbox("box").set_receiver(Some(&receiver));
    sim.spawn("sender", &sim.host("host_0").unwrap(), |ctx: ActorContext| async move {
        ctx.mailbox("box").put(7u64, 100.).await.unwrap();
        assert_close(ctx.time(), 1. + STAR_LATENCY);
    })
    .unwrap();

    sim.run();
    assert_close(received.get(), 10.);
    assert_eq!(sim.mailbox("box").receiver().unwrap().name(), "receiver");
}

#[test]
fn detached_put_survives_sender() {
    let sim = star(2);
    let received = Rc::new(Cell::new(0.));

    sim.spawn("sender", &sim.host("host_0").unwrap(), |ctx: ActorContext| async move {
        ctx.mailbox("box").put_detached(5u8, 100.);
    })
    .unwrap();
    let r = received.clone();
    sim.spawn("receiver", &sim.host("host_1").unwrap(), move |ctx: ActorContext| async move {
        ctx.sleep_for(2.).await;
        let value: u8 = ctx.mailbox("box").get().await.unwrap();
        assert_eq!(value, 5);
        r.set(ctx.time());
    })
    .unwrap();

    sim.run();
    assert_close(received.get(), 3. + STAR_LATENCY);
}

#[test]
fn message_queue_blocks_sender_until_delivery() {
    let sim = star(2);
    let put_time = Rc::new(Cell::new(0.));

    let p = put_time.clone();
    sim.spawn("producer", &sim.host("host_0").unwrap(), move |ctx: ActorContext| async move {
        ctx.message_queue("queue").put(String::from("hello")).await.unwrap();
        p.set(ctx.time());
    })
    .unwrap();
    sim.spawn("consumer", &sim.host("host_1").unwrap(), |ctx: ActorContext| async move {
        ctx.sleep_for(3.).await;
        let queue = ctx.message_queue("queue");
        assert_eq!(queue.size(), 1);
        let message: String = queue.get().await.unwrap();
        assert_eq!(message, "hello");
        assert!(matches!(queue.get_for::<String>(1.).await, Err(SimError::Timeout)));
        assert!(queue.empty());
    })
    .unwrap();

    sim.run();
    assert_close(put_time.get(), 3.);
    assert_close(sim.time(), 4.);
}

#[test]
fn barrier_releases_all_with_single_leader() {
    let sim = star(1);
    let host = sim.host("host_0").unwrap();
    let barrier = sim.create_barrier(3);
    let results = Rc::new(RefCell::new(Vec::new()));

    for delay in [1., 3., 2.] {
        let barrier = barrier.clone();
        let r = results.clone();
        sim.spawn(&format!("party_{}", delay), &host, move |ctx: ActorContext| async move {
            ctx.sleep_for(delay).await;
            let leader = barrier.wait().await;
            r.borrow_mut().push((leader, delay, ctx.time()));
        })
        .unwrap();
    }

    sim.run();
    let results = results.borrow();
    assert_eq!(results.len(), 3);
    let leaders = results.iter().filter(|(leader, _, _)| *leader).collect::<Vec<_>>();
    assert_eq!(leaders.len(), 1);
    assert_close(leaders[0].1, 3.);
    for (_, _, time) in results.iter() {
        assert_close(*time, 3.);
    }
}

#[test]
fn mutex_is_granted_in_fifo_order() {
    let sim = star(1);
    let host = sim.host("host_0").unwrap();
    let mutex = sim.create_mutex();
    let order = Rc::new(RefCell::new(Vec::new()));

    for i in 0..3 {
        let mutex = mutex.clone();
        let o = order.clone();
        sim.spawn(&format!("actor_{}", i), &host, move |ctx: ActorContext| async move {
            ctx.sleep_for(i as f64 * 0.1).await;
            mutex.lock().await.unwrap();
            o.borrow_mut().push((i, ctx.time()));
            assert!(matches!(mutex.lock().await, Err(SimError::InvalidState(_))));
            ctx.sleep_for(1.).await;
            mutex.unlock().unwrap();
            assert!(mutex.unlock().is_err());
        })
        .unwrap();
    }

    sim.run();
    let order = order.borrow();
    assert_eq!(order.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 1, 2]);
    assert_close(order[0].1, 0.);
    assert_close(order[1].1, 1.);
    assert_close(order[2].1, 2.);
    assert!(!mutex.is_locked());
}

#[test]
fn mutex_of_killed_owner_is_released() {
    let sim = star(1);
    let host = sim.host("host_0").unwrap();
    let mutex = sim.create_mutex();
    let acquired = Rc::new(Cell::new(0.));

    let m = mutex.clone();
    sim.actor("owner", &host)
        .kill_time(2.)
        .spawn(move |ctx: ActorContext| async move {
            m.lock().await.unwrap();
            ctx.sleep_for(100.).await;
        })
        .unwrap();
    let a = acquired.clone();
    sim.spawn("waiter", &host, move |ctx: ActorContext| async move {
        ctx.yield_now().await;
        mutex.lock().await.unwrap();
        a.set(ctx.time());
        assert_eq!(mutex.owner().unwrap().name(), "waiter");
        mutex.unlock().unwrap();
    })
    .unwrap();

    sim.run();
    assert_close(acquired.get(), 2.);
}

#[test]
fn killed_waiter_leaves_semaphore_unchanged() {
    let sim = star(1);
    let host = sim.host("host_0").unwrap();
    let semaphore = sim.create_semaphore(1);
    let acquired = Rc::new(RefCell::new(Vec::new()));

    let s = semaphore.clone();
    sim.spawn("holder", &host, move |ctx: ActorContext| async move {
        s.acquire().await;
        ctx.sleep_for(10.).await;
        s.release();
    })
    .unwrap();
    for name in ["victim", "survivor"] {
        let s = semaphore.clone();
        let a = acquired.clone();
        let handle = sim
            .spawn(name, &host, move |ctx: ActorContext| async move {
                ctx.yield_now().await;
                s.acquire().await;
                a.borrow_mut().push((ctx.name().to_string(), ctx.time()));
                s.release();
            })
            .unwrap();
        if name == "victim" {
            handle.set_kill_time(Some(1.));
        }
    }
    let s = semaphore.clone();
    sim.spawn("observer", &host, move |ctx: ActorContext| async move {
        ctx.sleep_for(5.).await;
        assert_eq!(s.capacity(), 0);
        assert_eq!(s.waiting(), 1);
        assert!(s.would_block());
        assert!(!s.try_acquire());
    })
    .unwrap();

    sim.run();
    assert_eq!(*acquired.borrow(), vec![("survivor".to_string(), 10.)]);
    assert_eq!(semaphore.capacity(), 1);
}

#[test]
fn semaphore_acquire_times_out() {
    let sim = star(1);
    let host = sim.host("host_0").unwrap();
    let semaphore = sim.create_semaphore(0);

    sim.spawn("waiter", &host, move |ctx: ActorContext| async move {
        assert!(matches!(semaphore.acquire_for(2.).await, Err(SimError::Timeout)));
        assert_close(ctx.time(), 2.);
        assert_eq!(semaphore.waiting(), 0);
        semaphore.release();
        semaphore.acquire_for(1.).await.unwrap();
        assert_close(ctx.time(), 2.);
    })
    .unwrap();

    sim.run();
}

#[test]
fn condition_variable_wait_and_timeout() {
    let sim = star(1);
    let host = sim.host("host_0").unwrap();
    let mutex = sim.create_mutex();
    let condvar = sim.create_condvar();
    let times = Rc::new(RefCell::new(Vec::new()));

    let (m, cv, t) = (mutex.clone(), condvar.clone(), times.clone());
    sim.spawn("waiter", &host, move |ctx: ActorContext| async move {
        m.lock().await.unwrap();
        cv.wait(&m).await.unwrap();
        t.borrow_mut().push(ctx.time());
        assert!(matches!(cv.wait_for(&m, 2.).await, Err(SimError::Timeout)));
        t.borrow_mut().push(ctx.time());
        assert_eq!(m.owner().unwrap().id(), ctx.id());
        m.unlock().unwrap();
        assert!(matches!(cv.wait(&m).await, Err(SimError::InvalidState(_))));
    })
    .unwrap();
    sim.spawn("notifier", &host, move |ctx: ActorContext| async move {
        ctx.sleep_for(1.).await;
        mutex.lock().await.unwrap();
        condvar.notify_one();
        ctx.sleep_for(1.).await;
        mutex.unlock().unwrap();
    })
    .unwrap();

    sim.run();
    let times = times.borrow();
    assert_close(times[0], 2.);
    assert_close(times[1], 4.);
}

#[test]
fn yield_lets_other_actors_run() {
    let sim = star(1);
    let host = sim.host("host_0").unwrap();
    let log = Rc::new(RefCell::new(Vec::new()));

    for name in ["a", "b"] {
        let l = log.clone();
        sim.spawn(name, &host, move |ctx: ActorContext| async move {
            l.borrow_mut().push(format!("{}1", name));
            ctx.yield_now().await;
            l.borrow_mut().push(format!("{}2", name));
        })
        .unwrap();
    }

    sim.run();
    assert_eq!(*log.borrow(), vec!["a1", "b1", "a2", "b2"]);
    assert_close(sim.time(), 0.);
}

#[test]
fn sleep_in_the_past_returns_immediately() {
    let sim = star(1);
    sim.spawn("sleeper", &sim.host("host_0").unwrap(), |ctx: ActorContext| async move {
        ctx.sleep_for(0.).await;
        ctx.sleep_for(-1.).await;
        assert_close(ctx.time(), 0.);
        ctx.sleep_until(2.5).await;
        ctx.sleep_until(1.).await;
        assert_close(ctx.time(), 2.5);
    })
    .unwrap();
    sim.run();
    assert_close(sim.time(), 2.5);
}

#[test]
fn successor_starts_after_predecessor() {
    let sim = star(1);
    let host = sim.host("host_0").unwrap();

    sim.spawn("worker", &host, |ctx: ActorContext| async move {
        let first = ctx.exec_init(2.);
        let second = ctx.exec_init(1.);
        first.add_successor(&second).unwrap();
        second.start().unwrap();
        assert_eq!(second.state(), ActivityState::Starting);
        first.start().unwrap();
        second.wait().await.unwrap();
        assert_close(second.start_time().unwrap(), 2.);
        assert_close(ctx.time(), 3.);
        assert_eq!(first.state(), ActivityState::Finished);
        assert!(first.add_successor(&first).is_err());
    })
    .unwrap();

    sim.run();
}

#[test]
fn cancel_cascades_to_successors() {
    let sim = star(1);
    let host = sim.host("host_0").unwrap();

    sim.spawn("worker", &host, |ctx: ActorContext| async move {
        let first = ctx.exec_async(5.);
        let second = ctx.exec_init(1.);
        let third = ctx.exec_init(1.);
        first.add_successor(&second).unwrap();
        second.add_successor(&third).unwrap();
        second.start().unwrap();
        third.start().unwrap();
        ctx.sleep_for(1.).await;
        first.cancel();
        assert_eq!(first.state(), ActivityState::Canceled);
        assert!(first.remaining() > 3.9);
        assert!(matches!(second.wait().await, Err(SimError::Cancelled)));
        assert_eq!(third.state(), ActivityState::Canceled);
    })
    .unwrap();

    sim.run();
    assert_eq!(sim.stats().canceled_activities, 3);
    assert_close(sim.time(), 1.);
}

#[test]
fn wait_any_returns_first_completed() {
    let sim = star(1);
    let host = sim.host("host_0").unwrap();

    sim.spawn("worker", &host, |ctx: ActorContext| async move {
        let short = ctx.exec_async(1.);
        let long = ctx.exec_async(2.);
        let doomed = ctx.exec_async(10.);
        let mut set = ActivitySet::new();
        set.push(long.clone());
        set.push(short.clone());
        set.push(doomed.clone());

        let done = set.wait_any().await.unwrap();
        assert_eq!(done.id(), short.id());
        assert_close(ctx.time(), 3.);
        assert_eq!(set.size(), 2);

        doomed.cancel();
        assert!(matches!(set.wait_any().await, Err(SimError::Cancelled)));
        assert!(set.has_failed());
        assert_eq!(set.take_failed().unwrap().id(), doomed.id());

        assert!(matches!(set.wait_any_for(0.5).await, Err(SimError::Timeout)));
        set.wait_all().await.unwrap();
        assert!(set.is_empty());
        assert_close(ctx.time(), 4.);
    })
    .unwrap();

    sim.run();
}

#[test]
fn wait_for_keeps_activity_running() {
    let sim = star(1);
    let host = sim.host("host_0").unwrap();

    sim.spawn("worker", &host, |ctx: ActorContext| async move {
        let exec = ctx.exec_init(4.);
        assert!(matches!(exec.wait_for(1.).await, Err(SimError::Timeout)));
        assert_eq!(exec.state(), ActivityState::Running);
        assert_close(exec.remaining_ratio(), 0.75);
        exec.wait().await.unwrap();
        assert_close(ctx.time(), 4.);
    })
    .unwrap();

    sim.run();
}

#[test]
fn bound_limits_execution_speed() {
    let sim = star(1);
    let host = sim.host("host_0").unwrap();

    sim.spawn("worker", &host, |ctx: ActorContext| async move {
        let exec = ctx.exec_init(1.);
        exec.set_bound(Some(0.25));
        exec.wait().await.unwrap();
        assert_close(ctx.time(), 4.);
    })
    .unwrap();

    sim.run();
}

#[test]
fn turned_off_host_fails_execution_and_kills_actors() {
    let mut platform = make_star_platform(2, 1., 100.);
    platform.hosts[1].state_profile = vec![StateEvent { time: 2., on: false }];
    let sim = Simulation::new(&platform, EngineConfig::default()).unwrap();
    let remote = sim.host("host_1").unwrap();
    let killed = Rc::new(Cell::new(false));

    let r = remote.clone();
    sim.spawn("master", &sim.host("host_0").unwrap(), move |ctx: ActorContext| async move {
        let exec = ctx.exec_unassigned(10.);
        exec.set_host(&r).unwrap();
        let result = exec.wait().await;
        assert!(matches!(result, Err(SimError::HostFailure(ref name)) if name == "host_1"));
        assert_close(ctx.time(), 2.);
        assert!(!r.is_on());
        assert!(matches!(ctx.spawn("late", &r, |_| async {}), Err(SimError::HostFailure(_))));
    })
    .unwrap();
    let victim = sim
        .spawn("victim", &remote, |ctx: ActorContext| async move {
            ctx.sleep_for(100.).await;
        })
        .unwrap();
    let k = killed.clone();
    victim.on_exit(move |was_killed| k.set(was_killed));

    sim.run();
    assert!(killed.get());
    assert!(!victim.is_alive());
    assert_eq!(sim.stats().failed_activities, 1);
    assert_close(sim.time(), 2.);
}

#[test]
fn auto_restart_actor_starts_again() {
    let mut platform = make_star_platform(2, 1., 100.);
    platform.hosts[0].state_profile = vec![StateEvent { time: 1., on: false }, StateEvent { time: 3., on: true }];
    let sim = Simulation::new(&platform, EngineConfig::default()).unwrap();
    let starts = Rc::new(RefCell::new(Vec::new()));

    let s = starts.clone();
    sim.actor("service", &sim.host("host_0").unwrap())
        .auto_restart(true)
        .spawn_restartable(move |ctx: ActorContext| {
            let s = s.clone();
            async move {
                s.borrow_mut().push(ctx.time());
                ctx.sleep_for(5.).await;
            }
        })
        .unwrap();
    // keeps the simulation running while the service host is off
    sim.spawn("keeper", &sim.host("host_1").unwrap(), |ctx: ActorContext| async move {
        ctx.sleep_for(9.).await;
    })
    .unwrap();

    sim.run();
    assert_eq!(*starts.borrow(), vec![0., 3.]);
    assert_close(sim.time(), 9.);
    assert_eq!(sim.stats().actors_created, 3);
    assert_eq!(sim.stats().actors_killed, 1);
}

#[test]
fn daemons_are_killed_with_last_regular_actor() {
    let sim = star(1);
    let host = sim.host("host_0").unwrap();
    let daemon_killed = Rc::new(Cell::new(false));

    let daemon = sim
        .actor("daemon", &host)
        .daemon(true)
        .spawn(|ctx: ActorContext| async move {
            loop {
                ctx.sleep_for(1.).await;
            }
        })
        .unwrap();
    let k = daemon_killed.clone();
    daemon.on_exit(move |killed| k.set(killed));
    sim.spawn("regular", &host, |ctx: ActorContext| async move {
        ctx.sleep_for(3.5).await;
    })
    .unwrap();

    sim.run();
    assert!(daemon_killed.get());
    assert!(daemon.is_daemon());
    assert!(!daemon.is_alive());
    assert_close(sim.time(), 3.5);
}

#[test]
fn join_waits_for_termination() {
    let sim = star(1);
    let host = sim.host("host_0").unwrap();

    let worker = sim
        .spawn("worker", &host, |ctx: ActorContext| async move {
            ctx.sleep_for(5.).await;
        })
        .unwrap();
    sim.spawn("joiner", &host, move |ctx: ActorContext| async move {
        assert!(matches!(worker.join_for(1.).await, Err(SimError::Timeout)));
        assert_close(ctx.time(), 1.);
        worker.join().await.unwrap();
        assert_close(ctx.time(), 5.);
        worker.join().await.unwrap();
        assert!(ctx.handle().join().await.is_err());
    })
    .unwrap();

    sim.run();
}

#[test]
fn kill_time_and_exit() {
    let sim = star(1);
    let host = sim.host("host_0").unwrap();
    let exits = Rc::new(RefCell::new(Vec::new()));

    let e = exits.clone();
    sim.actor("doomed", &host)
        .kill_time(2.)
        .spawn(move |ctx: ActorContext| async move {
            ctx.on_exit(move |killed| e.borrow_mut().push(("doomed", killed)));
            ctx.sleep_for(100.).await;
        })
        .unwrap();
    let e = exits.clone();
    sim.spawn("quitter", &host, move |ctx: ActorContext| async move {
        ctx.on_exit(move |killed| e.borrow_mut().push(("quitter", killed)));
        ctx.sleep_for(1.).await;
        ctx.exit().await;
        unreachable!("exit never returns");
    })
    .unwrap();

    sim.run();
    assert_eq!(*exits.borrow(), vec![("quitter", true), ("doomed", true)]);
    assert_close(sim.time(), 2.);
    assert_eq!(sim.stats().actors_killed, 2);
}

#[test]
fn delayed_start_and_run_until() {
    let sim = star(1);
    let host = sim.host("host_0").unwrap();
    let started = Rc::new(Cell::new(-1.));

    let s = started.clone();
    let actor = sim
        .actor("late", &host)
        .start_time(3.)
        .spawn(move |ctx: ActorContext| async move {
            s.set(ctx.time());
            ctx.sleep_for(7.).await;
        })
        .unwrap();

    sim.run_until(1.);
    assert_close(sim.time(), 1.);
    assert!(actor.is_alive());
    assert_close(started.get(), -1.);

    sim.run_for(3.);
    assert_close(sim.time(), 4.);
    assert_close(started.get(), 3.);

    sim.run();
    assert_close(sim.time(), 10.);
    assert!(!actor.is_alive());
}

#[test]
fn deadlock_is_reported() {
    let sim = star(1);
    sim.spawn("lonely", &sim.host("host_0").unwrap(), |ctx: ActorContext| async move {
        let _ = ctx.mailbox("nobody").get::<u32>().await;
    })
    .unwrap();

    sim.run();
    let stats = sim.stats();
    assert_eq!(stats.deadlocked_actors.len(), 1);
    assert!(stats.deadlocked_actors[0].starts_with("lonely"));
}

#[test]
fn disk_operations_use_disk_bandwidth() {
    let mut platform = make_star_platform(1, 1., 100.);
    platform.hosts[0].disks.push(DiskConfig {
        name: "ssd".to_string(),
        read_bandwidth: 100.,
        write_bandwidth: 50.,
    });
    let sim = Simulation::new(&platform, EngineConfig::default()).unwrap();

    sim.spawn("writer", &sim.host("host_0").unwrap(), |ctx: ActorContext| async move {
        let disk = ctx.disk("ssd").unwrap();
        disk.write(100.).await.unwrap();
        assert_close(ctx.time(), 2.);
        disk.read(100.).await.unwrap();
        assert_close(ctx.time(), 3.);
        assert_close(disk.bytes_written(), 100.);
        assert!(ctx.disk("hdd").is_err());
    })
    .unwrap();

    sim.run();
    assert_close(sim.stats().total_io, 200.);
}

#[test]
fn pstate_changes_speed() {
    let mut platform = make_star_platform(1, 1., 100.);
    platform.hosts[0].speeds = vec![2., 1.];
    let sim = Simulation::new(&platform, EngineConfig::default()).unwrap();

    sim.spawn("worker", &sim.host("host_0").unwrap(), |ctx: ActorContext| async move {
        let host = ctx.host();
        ctx.execute(2.).await.unwrap();
        assert_close(ctx.time(), 1.);
        host.set_pstate(1).unwrap();
        assert_close(host.speed(), 1.);
        ctx.execute(2.).await.unwrap();
        assert_close(ctx.time(), 3.);
        assert!(host.set_pstate(2).is_err());
    })
    .unwrap();

    sim.run();
}

#[test]
fn energy_is_accounted() {
    let mut platform = make_star_platform(1, 1., 100.);
    platform.hosts[0].energy = Some(EnergyConfig {
        idle_watts: vec![100.],
        busy_watts: vec![200.],
        off_watts: 0.,
    });
    let sim = Simulation::new(&platform, EngineConfig::default()).unwrap();

    sim.spawn("worker", &sim.host("host_0").unwrap(), |ctx: ActorContext| async move {
        ctx.execute(1.).await.unwrap();
        ctx.sleep_for(1.).await;
    })
    .unwrap();

    sim.run();
    let stats = sim.stats();
    assert_close(stats.total_energy, 300.);
    assert_close(stats.host_energy["host_0"], 300.);
    assert_close(sim.host("host_0").unwrap().energy(), 300.);
}

fn random_workload(platform: &PlatformConfig) -> Vec<(String, f64)> {
    let config = EngineConfig {
        seed: 7,
        record_trace: true,
        ..EngineConfig::default()
    };
    let sim = Simulation::new(platform, config).unwrap();
    for i in 0..3 {
        let host = sim.host(&format!("host_{}", i + 1)).unwrap();
        sim.spawn(&format!("worker_{}", i), &host, |ctx: ActorContext| async move {
            let flops: f64 = ctx.gen_range(1.0..5.0);
            ctx.execute(flops).await.unwrap();
            let size: f64 = ctx.gen_range(10.0..100.0);
            ctx.mailbox("results").put(flops, size).await.unwrap();
        })
        .unwrap();
    }
    sim.spawn("collector", &sim.host("host_0").unwrap(), |ctx: ActorContext| async move {
        for _ in 0..3 {
            ctx.mailbox("results").get::<f64>().await.unwrap();
        }
    })
    .unwrap();
    sim.run();
    sim.trace().unwrap().completion_times()
}

#[test]
fn same_seed_gives_same_trace() {
    let platform = make_star_platform(4, 1., 100.);
    let copy = PlatformConfig::from_yaml_str(&platform.to_yaml().unwrap()).unwrap();
    let first = random_workload(&platform);
    // one execution and one transfer per worker
    assert_eq!(first.len(), 6);
    assert_eq!(first, random_workload(&copy));
}

#[test]
fn deployment_uses_registered_functions() {
    let sim = star(2);
    let received = Rc::new(RefCell::new(Vec::new()));

    let mut registry = FunctionRegistry::new();
    registry.register("sender", |ctx: ActorContext, args: Vec<String>| async move {
        let value: u32 = args[0].parse().unwrap();
        ctx.mailbox("box").put(value, 10.).await.unwrap();
    });
    let r = received.clone();
    registry.register("receiver", move |ctx: ActorContext, _args: Vec<String>| {
        let r = r.clone();
        async move {
            let value: u32 = ctx.mailbox("box").get().await.unwrap();
            r.borrow_mut().push((value, ctx.handle().property("role")));
        }
    });

    let deployment = DeploymentConfig::from_yaml_str(
        r#"
actors:
  - function: sender
    host: host_0
    args: ["17"]
    start_time: 1.0
  - name: sink
    function: receiver
    host: host_1
    properties:
      role: collector
"#,
    )
    .unwrap();
    let handles = sim.deploy(&deployment, &registry).unwrap();
    assert_eq!(handles.len(), 2);
    assert_eq!(handles[1].name(), "sink");

    sim.run();
    assert_eq!(*received.borrow(), vec![(17, Some("collector".to_string()))]);
    assert_close(sim.time(), 1.1 + STAR_LATENCY);

    let missing = DeploymentConfig::from_yaml_str("actors: [{function: missing, host: host_0}]").unwrap();
    assert!(matches!(sim.deploy(&missing, &registry), Err(SimError::UnknownFunction(name)) if name == "missing"));
}

#[test]
fn permit_of_killed_grantee_goes_to_next_waiter() {
    let sim = star(1);
    let host = sim.host("host_0").unwrap();
    let semaphore = sim.create_semaphore(0);
    let acquired = Rc::new(RefCell::new(Vec::new()));

    let (s, a) = (semaphore.clone(), acquired.clone());
    let victim = sim
        .spawn("victim", &host, move |ctx: ActorContext| async move {
            s.acquire().await;
            a.borrow_mut().push((ctx.name().to_string(), ctx.time()));
        })
        .unwrap();
    let (s, a) = (semaphore.clone(), acquired.clone());
    sim.spawn("waiter", &host, move |ctx: ActorContext| async move {
        ctx.sleep_for(0.5).await;
        s.acquire().await;
        a.borrow_mut().push((ctx.name().to_string(), ctx.time()));
        ctx.sleep_for(1.).await;
        s.release();
    })
    .unwrap();
    let s = semaphore.clone();
    sim.spawn("releaser", &host, move |ctx: ActorContext| async move {
        ctx.sleep_for(1.).await;
        // the victim is woken with the permit but dies before it can resume
        s.release();
        victim.kill();
    })
    .unwrap();
    let (s, a) = (semaphore.clone(), acquired.clone());
    sim.spawn("later", &host, move |ctx: ActorContext| async move {
        ctx.sleep_for(3.).await;
        s.acquire().await;
        a.borrow_mut().push((ctx.name().to_string(), ctx.time()));
        s.release();
    })
    .unwrap();

    sim.run();
    assert_eq!(
        *acquired.borrow(),
        vec![("waiter".to_string(), 1.), ("later".to_string(), 3.)]
    );
    assert_eq!(semaphore.capacity(), 1);
    assert_eq!(semaphore.waiting(), 0);
    assert!(sim.stats().deadlocked_actors.is_empty());
}

#[test]
fn yielding_daemons_stop_with_last_regular_actor() {
    let sim = star(1);
    let host = sim.host("host_0").unwrap();
    let steps = Rc::new(Cell::new(0usize));

    let s = steps.clone();
    let daemon = sim
        .actor("daemon", &host)
        .daemon(true)
        .spawn(move |ctx: ActorContext| async move {
            loop {
                s.set(s.get() + 1);
                ctx.yield_now().await;
            }
        })
        .unwrap();
    let converted = sim
        .spawn("converted", &host, |ctx: ActorContext| async move {
            ctx.daemonize();
            loop {
                ctx.yield_now().await;
            }
        })
        .unwrap();
    sim.spawn("regular", &host, |ctx: ActorContext| async move {
        ctx.yield_now().await;
    })
    .unwrap();

    sim.run();
    assert!(steps.get() <= 3, "daemon made {} steps", steps.get());
    assert!(!daemon.is_alive());
    assert!(!converted.is_alive());
    assert!(converted.is_daemon());
    assert_close(sim.time(), 0.);
}

#[test]
fn completed_activities_leave_owner_list() {
    let sim = star(1);
    let host = sim.host("host_0").unwrap();
    let pending = Rc::new(Cell::new(usize::MAX));

    let p = pending.clone();
    sim.spawn("worker", &host, move |ctx: ActorContext| async move {
        for _ in 0..5 {
            ctx.execute(1.).await.unwrap();
        }
        assert!(ctx.handle().activities().is_empty());
        let exec = ctx.exec_async(1.);
        p.set(ctx.handle().activities().len());
        exec.wait().await.unwrap();
        assert!(ctx.handle().activities().is_empty());
    })
    .unwrap();

    sim.run();
    assert_eq!(pending.get(), 1);
    assert_close(sim.time(), 6.);
}

#[test]
fn suspended_execution_resumes_where_it_stopped() {
    let sim = star(1);
    let host = sim.host("host_0").unwrap();

    sim.spawn("worker", &host, |ctx: ActorContext| async move {
        let exec = ctx.exec_async(4.);
        ctx.sleep_for(1.).await;
        exec.suspend();
        assert_eq!(exec.state(), ActivityState::Suspended);
        ctx.sleep_for(2.).await;
        assert_close(exec.remaining(), 3.);
        exec.resume();
        assert_eq!(exec.state(), ActivityState::Running);
        exec.wait().await.unwrap();
        assert_close(ctx.time(), 6.);

        // a complete activity ignores suspension
        exec.suspend();
        assert_eq!(exec.state(), ActivityState::Finished);
        exec.resume();
        assert_eq!(exec.state(), ActivityState::Finished);
        assert_close(exec.finish_time().unwrap(), 6.);
        assert!(exec.result().is_ok());
    })
    .unwrap();

    sim.run();
    assert_close(sim.time(), 6.);
}

#[test]
fn completion_callbacks_receive_terminal_state() {
    let sim = star(1);
    let host = sim.host("host_0").unwrap();
    let states = Rc::new(RefCell::new(Vec::new()));

    let s = states.clone();
    sim.spawn("worker", &host, move |ctx: ActorContext| async move {
        let done = ctx.exec_init(1.);
        let st = s.clone();
        done.on_completion(move |state| st.borrow_mut().push(state));
        done.wait().await.unwrap();

        let canceled = ctx.exec_init(5.);
        let st = s.clone();
        canceled.on_completion(move |state| st.borrow_mut().push(state));
        canceled.cancel();

        // registered after completion
        let st = s.clone();
        done.on_completion(move |state| st.borrow_mut().push(state));
    })
    .unwrap();

    sim.run();
    assert_eq!(
        *states.borrow(),
        vec![ActivityState::Finished, ActivityState::Canceled, ActivityState::Finished]
    );
}

#[test]
fn comm_rate_caps_transfer() {
    let sim = star(2);
    let finish = Rc::new(Cell::new(0.));

    sim.spawn("sender", &sim.host("host_0").unwrap(), |ctx: ActorContext| async move {
        let comm = ctx.mailbox("box").put_async(1u8, 100.);
        comm.set_rate(Some(50.));
        comm.wait().await.unwrap();
    })
    .unwrap();
    let f = finish.clone();
    sim.spawn("receiver", &sim.host("host_1").unwrap(), move |ctx: ActorContext| async move {
        let value: u8 = ctx.mailbox("box").get().await.unwrap();
        assert_eq!(value, 1);
        f.set(ctx.time());
    })
    .unwrap();

    sim.run();
    assert_close(finish.get(), 2. + STAR_LATENCY);
}

#[test]
fn many_senders_and_receivers_pair_up_once() {
    const PAIRS: u32 = 4;
    let sim = star(2);
    let received = Rc::new(RefCell::new(Vec::new()));

    for i in 0..PAIRS {
        sim.spawn(&format!("sender_{}", i), &sim.host("host_0").unwrap(), move |ctx: ActorContext| async move {
            ctx.sleep_for(i as f64 * 0.1).await;
            let mailbox = ctx.mailbox("box");
            if i % 2 == 0 {
                mailbox.put_async(i, 100.).wait().await.unwrap();
            } else {
                mailbox.put(i, 100.).await.unwrap();
            }
        })
        .unwrap();
        let r = received.clone();
        sim.spawn(&format!("receiver_{}", i), &sim.host("host_1").unwrap(), move |ctx: ActorContext| async move {
            ctx.sleep_for(0.35 - i as f64 * 0.1).await;
            let mailbox = ctx.mailbox("box");
            let value: u32 = if i % 2 == 1 {
                let comm = mailbox.get_async();
                comm.wait().await.unwrap();
                comm.get_payload().unwrap()
            } else {
                mailbox.get().await.unwrap()
            };
            r.borrow_mut().push(value);
        })
        .unwrap();
    }

    sim.run();
    let mut values = received.borrow().clone();
    values.sort_unstable();
    assert_eq!(values, (0..PAIRS).collect::<Vec<_>>());
    let stats = sim.stats();
    assert_eq!(stats.finished_activities, PAIRS as usize);
    assert_close(stats.network_traffic_between_hosts, 100. * PAIRS as f64);
    assert!(sim.mailbox("box").empty());
    assert!(stats.deadlocked_actors.is_empty());
}

#[test]
fn parallel_execution_spans_hosts() {
    let sim = star(2);
    let hosts = [sim.host("host_0").unwrap(), sim.host("host_1").unwrap()];
    let finish = Rc::new(Cell::new(0.));

    let f = finish.clone();
    let h = hosts.clone();
    sim.spawn("master", &hosts[0], move |ctx: ActorContext| async move {
        // host_1 computes 4 flops at 1 flop per second, so the task runs at a quarter per second
        ctx.parallel_execute(&h, &[2., 4.], &[0., 100., 0., 0.]).await.unwrap();
        f.set(ctx.time());

        assert!(ctx.parallel_exec_init(&h, &[1.], &[]).is_err());
        assert!(ctx.parallel_exec_init(&h, &[1., 1.], &[1.]).is_err());
        let exec = ctx.parallel_exec_async(&h, &[1., 1.], &[]).unwrap();
        assert!(exec.host().is_none());
        ctx.sleep_for(0.5).await;
        assert_close(exec.remaining(), 0.5);
        exec.wait().await.unwrap();
    })
    .unwrap();

    sim.run();
    assert_close(finish.get(), 4. + STAR_LATENCY);
    assert_close(sim.time(), 5. + STAR_LATENCY);
    let stats = sim.stats();
    assert_close(stats.total_flops, 8.);
    assert_eq!(stats.finished_activities, 2);
}

#[test]
fn parallel_execution_fails_with_any_host() {
    let sim = star(2);
    let hosts = [sim.host("host_0").unwrap(), sim.host("host_1").unwrap()];
    let result = Rc::new(RefCell::new(None));

    let r = result.clone();
    let h = hosts.clone();
    sim.spawn("master", &hosts[0], move |ctx: ActorContext| async move {
        let outcome = ctx.parallel_execute(&h, &[10., 10.], &[]).await;
        *r.borrow_mut() = Some((outcome, ctx.time()));
    })
    .unwrap();
    let remote = hosts[1].clone();
    sim.spawn("breaker", &hosts[0], move |ctx: ActorContext| async move {
        ctx.sleep_for(1.).await;
        remote.turn_off();
    })
    .unwrap();

    sim.run();
    let (outcome, time) = result.borrow_mut().take().unwrap();
    assert!(matches!(outcome, Err(SimError::HostFailure(name)) if name == "host_1"));
    assert_close(time, 1.);
}
