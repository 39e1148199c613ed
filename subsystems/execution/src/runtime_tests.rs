//! # Strand Execution - Runtime Test Suite
//!
//! End-to-end tests that run real fibers. Each test binds its own runtime
//! to a fresh OS thread, so tests stay independent under the parallel
//! test harness.

use crate::runtime::with_scheduler;
use crate::thread::FiberFlags;
use crate::*;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

fn on_fresh_thread<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    std::thread::spawn(f).join().unwrap();
}

fn cooperative() {
    thread_init_with(RuntimeConfig::cooperative()).unwrap();
}

fn state_of(id: FiberId) -> FiberState {
    thread_state()[id.index()].state
}

fn consistent() -> bool {
    with_scheduler(|scheduler| scheduler.is_consistent()).unwrap()
}

fn noop() {}

// =========================================================================
// Lifecycle Tests
// =========================================================================

#[test]
fn test_init_and_shutdown() {
    on_fresh_thread(|| {
        assert_eq!(create_semaphore(0), Err(ExecError::NotInitialized));
        assert_eq!(run_threads(), Err(ExecError::NotInitialized));
        assert!(thread_state().is_empty());
        assert_eq!(current_fiber(), None);

        cooperative();
        assert_eq!(thread_init(), Err(ExecError::AlreadyInitialized));
        assert_eq!(current_fiber(), None);

        thread_shutdown().unwrap();
        assert_eq!(thread_shutdown(), Err(ExecError::NotInitialized));

        // A new runtime can be bound after shutdown.
        cooperative();
        thread_shutdown().unwrap();
    });
}

#[test]
fn test_invalid_config_is_rejected() {
    on_fresh_thread(|| {
        let config = RuntimeConfig::cooperative().with_max_threads(0);
        assert_eq!(thread_init_with(config), Err(ExecError::InvalidArgument));
        assert_eq!(current_fiber(), None);
        assert_eq!(thread_shutdown(), Err(ExecError::NotInitialized));
    });
}

#[test]
fn test_run_with_no_fibers_returns() {
    on_fresh_thread(|| {
        cooperative();
        let summary = run_threads().unwrap();
        assert_eq!(summary.exited, 0);
        assert!(!summary.stopped);
        assert!(!summary.is_deadlocked());
        thread_shutdown().unwrap();
    });
}

#[test]
fn test_create_beyond_capacity() {
    on_fresh_thread(|| {
        cooperative();
        let max = RuntimeConfig::DEFAULT_MAX_THREADS;

        let mut seen = std::collections::HashSet::new();
        for i in 0..max {
            let id = thread_create("filler", noop, 0).unwrap();
            assert_eq!(id.index(), i);
            assert!(seen.insert(id));
        }
        assert_eq!(thread_create("overflow", noop, 0), Err(ExecError::ThreadCapacity));
        assert_eq!(thread_state().len(), max);

        let summary = run_threads().unwrap();
        assert_eq!(summary.exited, max);
        assert_eq!(summary.metrics.exits, max as u64);
        assert!(consistent());
        thread_shutdown().unwrap();
    });
}

#[test]
fn test_host_only_operations_from_a_fiber() {
    on_fresh_thread(|| {
        cooperative();
        let results = Rc::new(RefCell::new(Vec::new()));

        let r = results.clone();
        thread_spawn(
            "nested",
            move || {
                let mut r = r.borrow_mut();
                r.push(run_threads().map(|_| ()));
                r.push(thread_shutdown());
                r.push(thread_init());
            },
            0,
        )
        .unwrap();

        run_threads().unwrap();
        assert_eq!(
            *results.borrow(),
            vec![
                Err(ExecError::NotHost),
                Err(ExecError::NotHost),
                Err(ExecError::AlreadyInitialized)
            ]
        );
        thread_shutdown().unwrap();
    });
}

#[test]
fn test_thread_exit_from_host_panics() {
    on_fresh_thread(|| {
        cooperative();
        let result = std::panic::catch_unwind(|| -> () { thread_exit() });
        assert!(result.is_err());
        // The runtime is still usable.
        thread_create("after", noop, 0).unwrap();
        assert_eq!(run_threads().unwrap().exited, 1);
        thread_shutdown().unwrap();
    });
}

// =========================================================================
// Scheduling Tests
// =========================================================================

#[test]
fn test_round_robin_order() {
    on_fresh_thread(|| {
        cooperative();
        let order = Rc::new(RefCell::new(Vec::new()));

        for worker in 0..3 {
            let order = order.clone();
            thread_spawn(
                &format!("worker-{}", worker),
                move || {
                    for _ in 0..3 {
                        order.borrow_mut().push(worker);
                        thread_yield();
                    }
                },
                0,
            )
            .unwrap();
        }

        let summary = run_threads().unwrap();
        assert_eq!(*order.borrow(), vec![0, 1, 2, 0, 1, 2, 0, 1, 2]);
        assert_eq!(summary.exited, 3);
        assert!(summary.metrics.voluntary_yields >= 6);

        let turns: Vec<u64> = thread_state().iter().map(|f| f.turns).collect();
        assert!(turns.iter().all(|&t| t == turns[0]));
        thread_shutdown().unwrap();
    });
}

#[test]
fn test_yield_on_host_is_a_noop() {
    on_fresh_thread(|| {
        cooperative();
        thread_yield();
        thread_create("pending", noop, 0).unwrap();
        thread_yield();
        assert_eq!(thread_state()[0].state, FiberState::Runnable);
        thread_shutdown().unwrap();
    });
}

#[test]
fn test_explicit_exit_skips_rest_of_body() {
    on_fresh_thread(|| {
        cooperative();
        let reached = Rc::new(Cell::new(0));

        let r = reached.clone();
        let id = thread_spawn(
            "quitter",
            move || {
                r.set(1);
                thread_exit();
            },
            0,
        )
        .unwrap();

        run_threads().unwrap();
        assert_eq!(reached.get(), 1);
        assert_eq!(state_of(id), FiberState::Exit);
        thread_shutdown().unwrap();
    });
}

#[test]
fn test_current_fiber_inside_and_outside() {
    on_fresh_thread(|| {
        cooperative();
        let seen = Rc::new(Cell::new(None));

        let s = seen.clone();
        let id = thread_spawn("self", move || s.set(current_fiber()), 0).unwrap();

        run_threads().unwrap();
        assert_eq!(seen.get(), Some(id));
        assert_eq!(current_fiber(), None);
        thread_shutdown().unwrap();
    });
}

#[test]
fn test_panic_is_contained() {
    on_fresh_thread(|| {
        cooperative();
        let survivor_ran = Rc::new(Cell::new(false));

        let bad = thread_spawn("bad", || panic!("fiber failure"), 0).unwrap();
        let r = survivor_ran.clone();
        let good = thread_spawn("good", move || r.set(true), 0).unwrap();

        let summary = run_threads().unwrap();
        assert_eq!(summary.exited, 2);
        assert!(survivor_ran.get());

        let state = thread_state();
        assert_eq!(state[bad.index()].state, FiberState::Exit);
        assert!(state[bad.index()].flags.contains(FiberFlags::PANICKED));
        assert!(!state[good.index()].flags.contains(FiberFlags::PANICKED));
        thread_shutdown().unwrap();
    });
}

#[test]
fn test_stacks_are_released_after_exit() {
    on_fresh_thread(|| {
        cooperative();
        let id = thread_create("short-lived", noop, 256 * 1024).unwrap();
        assert!(!thread_state()[id.index()].flags.contains(FiberFlags::STACK_RELEASED));

        run_threads().unwrap();
        let flags = thread_state()[id.index()].flags;
        assert!(flags.contains(FiberFlags::STARTED));
        assert!(flags.contains(FiberFlags::STACK_RELEASED));
        thread_shutdown().unwrap();
    });
}

#[test]
fn test_stop_threads_and_resume() {
    on_fresh_thread(|| {
        cooperative();
        let done = Rc::new(Cell::new(false));

        let d = done.clone();
        let spinner = thread_spawn(
            "spinner",
            move || {
                while !d.get() {
                    thread_yield();
                }
            },
            0,
        )
        .unwrap();
        let stopper = thread_spawn(
            "stopper",
            || {
                stop_threads();
                thread_yield();
            },
            0,
        )
        .unwrap();

        let summary = run_threads().unwrap();
        assert!(summary.stopped);
        assert_eq!(summary.runnable, 2);
        assert_eq!(state_of(spinner), FiberState::Runnable);
        assert_eq!(state_of(stopper), FiberState::Runnable);
        assert!(consistent());

        done.set(true);
        let summary = run_threads().unwrap();
        assert!(!summary.stopped);
        assert_eq!(summary.exited, 2);
        thread_shutdown().unwrap();
    });
}

#[test]
fn test_set_quantum_size() {
    on_fresh_thread(|| {
        cooperative();
        thread_spawn("tuner", || set_quantum_size(Duration::from_millis(2)), 0).unwrap();
        run_threads().unwrap();
        assert_eq!(
            with_scheduler(|s| s.quantum()).unwrap(),
            Duration::from_millis(2)
        );

        set_quantum_size(Duration::ZERO);
        assert_eq!(with_scheduler(|s| s.quantum()).unwrap(), RuntimeConfig::MIN_QUANTUM);
        thread_shutdown().unwrap();
    });
}

// =========================================================================
// Semaphore Tests
// =========================================================================

#[test]
fn test_semaphore_scenario() {
    on_fresh_thread(|| {
        cooperative();
        let sem = create_semaphore(1).unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));

        let l = log.clone();
        let a = thread_spawn(
            "A",
            move || {
                semaphore_wait(sem);
                l.borrow_mut().push(("A", semaphore_value(sem)));
            },
            0,
        )
        .unwrap();
        let l = log.clone();
        let b = thread_spawn(
            "B",
            move || {
                semaphore_wait(sem);
                l.borrow_mut().push(("B", semaphore_value(sem)));
            },
            0,
        )
        .unwrap();

        // A takes the unit and exits; B blocks and nobody is left to signal.
        let summary = run_threads().unwrap();
        assert!(summary.is_deadlocked());
        assert_eq!(*log.borrow(), vec![("A", Some(0))]);
        assert_eq!(semaphore_value(sem), Some(-1));
        assert_eq!(semaphore_waiters(sem), Some(1));
        assert_eq!(state_of(a), FiberState::Exit);
        assert_eq!(state_of(b), FiberState::Blocked);
        assert!(consistent());

        // Main signals: B is released and queued.
        semaphore_signal(sem);
        assert_eq!(semaphore_value(sem), Some(0));
        assert_eq!(semaphore_waiters(sem), Some(0));
        assert_eq!(state_of(b), FiberState::Runnable);
        assert!(consistent());

        let summary = run_threads().unwrap();
        assert_eq!(summary.exited, 2);
        assert_eq!(*log.borrow(), vec![("A", Some(0)), ("B", Some(0))]);

        // Value 0 against an initial 1 only warns.
        assert_eq!(destroy_semaphore(sem), Ok(()));
        thread_shutdown().unwrap();
    });
}

#[test]
fn test_destroy_busy_semaphore() {
    on_fresh_thread(|| {
        cooperative();
        let sem = create_semaphore(0).unwrap();
        thread_spawn("waiter", move || semaphore_wait(sem), 0).unwrap();

        run_threads().unwrap();
        assert_eq!(destroy_semaphore(sem), Err(ExecError::SemaphoreBusy));
        assert_eq!(semaphore_value(sem), Some(-1));
        assert_eq!(semaphore_waiters(sem), Some(1));

        semaphore_signal(sem);
        assert_eq!(run_threads().unwrap().exited, 1);
        assert_eq!(destroy_semaphore(sem), Ok(()));

        // The handle is dead from now on.
        assert_eq!(semaphore_value(sem), None);
        semaphore_wait(sem);
        semaphore_signal(sem);
        assert_eq!(destroy_semaphore(sem), Ok(()));
        thread_shutdown().unwrap();
    });
}

#[test]
fn test_negative_initial_value_is_rejected() {
    on_fresh_thread(|| {
        cooperative();
        assert_eq!(create_semaphore(-1), Err(ExecError::InvalidArgument));
        assert_eq!(create_semaphore(i32::MIN), Err(ExecError::InvalidArgument));

        // Nothing was created, so the first real handle is index 0.
        let sem = create_semaphore(0).unwrap();
        assert_eq!(sem.index(), 0);
        assert_eq!(semaphore_value(sem), Some(0));

        thread_create("bystander", noop, 0).unwrap();
        assert_eq!(run_threads().unwrap().exited, 1);
        assert!(consistent());
        thread_shutdown().unwrap();
    });
}

#[test]
fn test_semaphore_capacity() {
    on_fresh_thread(|| {
        thread_init_with(RuntimeConfig::cooperative().with_max_semaphores(2)).unwrap();
        create_semaphore(0).unwrap();
        create_semaphore(0).unwrap();
        assert_eq!(create_semaphore(0), Err(ExecError::SemaphoreCapacity));
        thread_shutdown().unwrap();
    });
}

#[test]
fn test_host_wait_never_blocks() {
    on_fresh_thread(|| {
        cooperative();
        let sem = create_semaphore(1).unwrap();
        semaphore_wait(sem);
        assert_eq!(semaphore_value(sem), Some(0));
        semaphore_wait(sem);
        assert_eq!(semaphore_value(sem), Some(0));
        assert_eq!(semaphore_waiters(sem), Some(0));
        thread_shutdown().unwrap();
    });
}

#[test]
fn test_waiters_released_in_fifo_order() {
    on_fresh_thread(|| {
        cooperative();
        let sem = create_semaphore(0).unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        for waiter in 0..4 {
            let order = order.clone();
            thread_spawn(
                "waiter",
                move || {
                    semaphore_wait(sem);
                    order.borrow_mut().push(waiter);
                },
                0,
            )
            .unwrap();
        }
        let summary = run_threads().unwrap();
        assert_eq!(summary.blocked, 4);
        assert_eq!(semaphore_value(sem), Some(-4));

        for _ in 0..4 {
            semaphore_signal(sem);
        }
        run_threads().unwrap();
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3]);
        assert_eq!(semaphore_value(sem), Some(0));
        thread_shutdown().unwrap();
    });
}

#[test]
fn test_bounded_buffer() {
    on_fresh_thread(|| {
        cooperative();
        const SLOTS: i32 = 2;
        const ITEMS: usize = 10;

        let empty = create_semaphore(SLOTS).unwrap();
        let full = create_semaphore(0).unwrap();
        let buffer = Rc::new(RefCell::new(VecDeque::new()));
        let received = Rc::new(RefCell::new(Vec::new()));

        let b = buffer.clone();
        thread_spawn(
            "producer",
            move || {
                for item in 0..ITEMS {
                    semaphore_wait(empty);
                    b.borrow_mut().push_back(item);
                    assert!(b.borrow().len() <= SLOTS as usize);
                    semaphore_signal(full);
                }
            },
            0,
        )
        .unwrap();

        let (b, r) = (buffer.clone(), received.clone());
        thread_spawn(
            "consumer",
            move || {
                for _ in 0..ITEMS {
                    semaphore_wait(full);
                    let item = b.borrow_mut().pop_front();
                    r.borrow_mut().extend(item);
                    semaphore_signal(empty);
                    thread_yield();
                }
            },
            0,
        )
        .unwrap();

        let summary = run_threads().unwrap();
        assert_eq!(summary.exited, 2);
        assert!(summary.metrics.blocks > 0);
        assert_eq!(*received.borrow(), (0..ITEMS).collect::<Vec<_>>());
        assert_eq!(semaphore_value(empty), Some(SLOTS));
        assert_eq!(semaphore_value(full), Some(0));
        assert!(consistent());

        destroy_semaphore(empty).unwrap();
        destroy_semaphore(full).unwrap();
        thread_shutdown().unwrap();
    });
}

// =========================================================================
// Reporting Tests
// =========================================================================

#[test]
fn test_state_table_after_run() {
    on_fresh_thread(|| {
        cooperative();
        thread_create("alpha", noop, 0).unwrap();
        thread_create("a-name-that-is-far-too-long-to-be-kept", noop, 0).unwrap();
        run_threads().unwrap();

        let state = thread_state();
        assert_eq!(state[1].name.len(), crate::thread::MAX_NAME_LEN);

        let table = StateTable(&state).to_string();
        let mut lines = table.lines();
        assert_eq!(lines.next(), Some("Thread Name\tState\tRunning Time"));
        assert!(lines.next().unwrap().starts_with("alpha\tEXIT\t"));
        assert_eq!(lines.count(), 1);

        let totals = metrics();
        assert_eq!(totals.exits, 2);
        assert_eq!(totals.context_switches, 3);
        thread_shutdown().unwrap();
        assert_eq!(metrics(), MetricsSnapshot::default());
    });
}

// =========================================================================
// Preemption Tests
// =========================================================================

/// Fiber body for the preemption test: spins without allocating or locking
/// until enough preemptions happened.
#[cfg(target_os = "linux")]
fn spin_until(preemptions: u64, deadline: Instant) {
    while metrics().preemptions < preemptions && Instant::now() < deadline {
        std::hint::spin_loop();
    }
}

#[cfg(target_os = "linux")]
#[test]
fn test_preemption_alternates_spinning_fibers() {
    on_fresh_thread(|| {
        const TARGET: u64 = 20;
        let config = RuntimeConfig::new().with_quantum(Duration::from_millis(1));
        thread_init_with(config).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let a = thread_spawn("spin-a", move || spin_until(TARGET, deadline), 0).unwrap();
        let b = thread_spawn("spin-b", move || spin_until(TARGET, deadline), 0).unwrap();

        let summary = run_threads().unwrap();
        let preemptions = summary.metrics.preemptions;
        assert!(preemptions >= TARGET, "only {} preemptions", preemptions);
        assert_eq!(summary.exited, 2);

        let state = thread_state();
        for id in [a, b] {
            let turns = state[id.index()].turns;
            assert!(turns >= preemptions / 2, "{} got {} turns", id, turns);
            assert!(state[id.index()].accounted_time > Duration::ZERO);
        }
        assert!(consistent());
        thread_shutdown().unwrap();
    });
}

/// Spin until `ticks` more timer ticks arrived or the deadline passed
#[cfg(target_os = "linux")]
fn spin_for_ticks(ticks: u64, deadline: Instant) -> u64 {
    let start = metrics().ticks;
    while metrics().ticks < start + ticks && Instant::now() < deadline {
        std::hint::spin_loop();
    }
    metrics().ticks - start
}

#[cfg(target_os = "linux")]
#[test]
fn test_quantum_change_while_timer_runs() {
    on_fresh_thread(|| {
        const TICKS: u64 = 5;
        let config = RuntimeConfig::new().with_quantum(Duration::from_millis(1));
        thread_init_with(config).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let done = Rc::new(Cell::new(false));
        let before_change = Rc::new(Cell::new(0));
        let after_change = Rc::new(Cell::new(0));
        let preempted_at_change = Rc::new(Cell::new(0));

        let (d, before, after, preempted) = (
            done.clone(),
            before_change.clone(),
            after_change.clone(),
            preempted_at_change.clone(),
        );
        thread_spawn(
            "tuner",
            move || {
                before.set(spin_for_ticks(TICKS, deadline));
                set_quantum_size(Duration::from_millis(2));
                preempted.set(metrics().preemptions);
                after.set(spin_for_ticks(TICKS, deadline));
                d.set(true);
            },
            0,
        )
        .unwrap();
        let d = done.clone();
        thread_spawn(
            "spinner",
            move || {
                while !d.get() && Instant::now() < deadline {
                    std::hint::spin_loop();
                }
            },
            0,
        )
        .unwrap();

        let summary = run_threads().unwrap();
        assert_eq!(summary.exited, 2);
        assert!(done.get());
        assert!(before_change.get() >= TICKS);
        assert!(after_change.get() >= TICKS, "{} ticks after re-arm", after_change.get());
        assert!(metrics().preemptions > preempted_at_change.get());
        assert_eq!(
            with_scheduler(|s| s.quantum()).unwrap(),
            Duration::from_millis(2)
        );
        assert!(consistent());
        thread_shutdown().unwrap();
    });
}
