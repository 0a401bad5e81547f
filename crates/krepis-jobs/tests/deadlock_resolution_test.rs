//! Integration Test: Deadlock Resolution by Lock Suspension
//!
//! Real threads close lock cycles; every scenario must run to completion
//! with reentrancy depths restored.

use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use krepis_jobs::{
    LockError, LockManager, OrderedLock, RecordingSink, ThreadHandle, VictimPolicy,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn manager_with(policy: VictimPolicy) -> (LockManager, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::new());
    let manager = LockManager::builder()
        .victim_policy(policy)
        .report_deadlocks(true)
        .diagnostic_sink(sink.clone())
        .build();
    (manager, sink)
}

/// Spin until `thread` is registered as blocked on `lock`
fn wait_until_blocked(manager: &LockManager, thread: ThreadHandle, lock: &OrderedLock) {
    while manager.waiting_for(thread) != Some(lock.rule()) {
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_abba_requester_is_suspended() {
    init_tracing();
    let (manager, sink) = manager_with(VictimPolicy::Requester);
    let a = manager.new_lock();
    let b = manager.new_lock();
    let events = Arc::new(Mutex::new(Vec::new()));
    let barrier = Arc::new(Barrier::new(2));
    let (handle_tx, handle_rx) = mpsc::channel();

    let t1 = thread::spawn({
        let (a, b, events, barrier) = (a.clone(), b.clone(), events.clone(), barrier.clone());
        move || {
            handle_tx.send(ThreadHandle::current()).unwrap();
            assert!(a.acquire(Duration::MAX).unwrap());
            barrier.wait();

            assert!(b.acquire(Duration::MAX).unwrap());
            events.lock().push("t1");
            b.release().unwrap();
            a.release().unwrap();
        }
    });

    let t2 = thread::spawn({
        let (manager, a, b, events, barrier) =
            (manager.clone(), a.clone(), b.clone(), events.clone(), barrier.clone());
        move || {
            let t1 = handle_rx.recv().unwrap();
            for _ in 0..3 {
                assert!(b.acquire(Duration::MAX).unwrap());
            }
            barrier.wait();
            wait_until_blocked(&manager, t1, &b);

            // Closes the cycle; this thread's hold on B is suspended
            assert!(a.acquire(Duration::MAX).unwrap());
            events.lock().push("t2");

            let me = ThreadHandle::current();
            assert_eq!(b.owner(), Some(me));
            assert_eq!(b.depth(), 3);
            assert_eq!(manager.suspended_batches(me), 0);

            a.release().unwrap();
            for _ in 0..3 {
                b.release().unwrap();
            }
            me
        }
    });

    t1.join().unwrap();
    let victim = t2.join().unwrap();

    assert_eq!(*events.lock(), vec!["t1", "t2"]);
    assert!(manager.is_empty());

    let deadlocks = sink.deadlocks();
    assert_eq!(deadlocks.len(), 1);
    assert_eq!(deadlocks[0].requester, victim);
    assert_eq!(deadlocks[0].candidate, victim);
    assert_eq!(deadlocks[0].links.len(), 2);

    let json = serde_json::to_value(&deadlocks[0]).unwrap();
    assert_eq!(json["rule"], serde_json::json!(a.rule().as_usize()));
}

#[test]
fn test_abba_other_thread_is_suspended_by_default() {
    init_tracing();
    let (manager, sink) = manager_with(VictimPolicy::default());
    let a = manager.new_lock();
    let b = manager.new_lock();
    let events = Arc::new(Mutex::new(Vec::new()));
    let barrier = Arc::new(Barrier::new(2));
    let (handle_tx, handle_rx) = mpsc::channel();

    let t1 = thread::spawn({
        let (manager, a, b, events, barrier) =
            (manager.clone(), a.clone(), b.clone(), events.clone(), barrier.clone());
        move || {
            handle_tx.send(ThreadHandle::current()).unwrap();
            assert!(a.acquire(Duration::MAX).unwrap());
            assert!(a.acquire(Duration::MAX).unwrap());
            barrier.wait();

            // Parks; A is taken away while parked and handed back afterwards
            assert!(b.acquire(Duration::MAX).unwrap());
            events.lock().push("t1");

            assert_eq!(a.owner(), Some(ThreadHandle::current()));
            assert_eq!(a.depth(), 2);
            assert_eq!(manager.suspended_batches(ThreadHandle::current()), 0);

            b.release().unwrap();
            a.release().unwrap();
            a.release().unwrap();
        }
    });

    let t2 = thread::spawn({
        let (manager, a, b, events, barrier) =
            (manager.clone(), a.clone(), b.clone(), events.clone(), barrier.clone());
        move || {
            let t1 = handle_rx.recv().unwrap();
            assert!(b.acquire(Duration::MAX).unwrap());
            barrier.wait();
            wait_until_blocked(&manager, t1, &b);

            assert!(a.acquire(Duration::MAX).unwrap());
            events.lock().push("t2");
            a.release().unwrap();
            b.release().unwrap();
            t1
        }
    });

    t1.join().unwrap();
    let victim = t2.join().unwrap();

    assert_eq!(*events.lock(), vec!["t2", "t1"]);
    assert!(manager.is_empty());
    assert_eq!(sink.deadlocks()[0].candidate, victim);
}

#[test]
fn test_ring_of_three_completes() {
    init_tracing();
    let (manager, sink) = manager_with(VictimPolicy::default());
    let locks: Vec<OrderedLock> = (0..3).map(|_| manager.new_lock()).collect();
    let barrier = Arc::new(Barrier::new(3));

    let workers: Vec<_> = (0..3)
        .map(|i| {
            let own = locks[i].clone();
            let next = locks[(i + 1) % 3].clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                assert!(own.acquire(Duration::MAX).unwrap());
                barrier.wait();
                assert!(next.acquire(Duration::MAX).unwrap());

                assert_eq!(own.owner(), Some(ThreadHandle::current()));
                next.release().unwrap();
                own.release().unwrap();
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    assert!(manager.is_empty());
    assert!(!sink.deadlocks().is_empty());
    for lock in &locks {
        assert_eq!(lock.owner(), None);
    }
}

#[test]
fn test_repeated_abba_rounds() {
    init_tracing();
    let (manager, _sink) = manager_with(VictimPolicy::default());
    let a = manager.new_lock();
    let b = manager.new_lock();

    let workers: Vec<_> = [(a.clone(), b.clone()), (b.clone(), a.clone())]
        .into_iter()
        .map(|(first, second)| {
            thread::spawn(move || {
                for _ in 0..200 {
                    assert!(first.acquire(Duration::MAX).unwrap());
                    assert!(second.acquire(Duration::MAX).unwrap());
                    assert_eq!(first.depth(), 1);
                    second.release().unwrap();
                    first.release().unwrap();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    assert!(manager.is_empty());
}

#[test]
fn test_fail_fast_returns_error() {
    init_tracing();
    let sink = Arc::new(RecordingSink::new());
    let manager = LockManager::builder()
        .fail_on_deadlock(true)
        .diagnostic_sink(sink.clone())
        .build();
    let a = manager.new_lock();
    let b = manager.new_lock();
    let barrier = Arc::new(Barrier::new(2));
    let (handle_tx, handle_rx) = mpsc::channel();

    let t1 = thread::spawn({
        let (a, b, barrier) = (a.clone(), b.clone(), barrier.clone());
        move || {
            handle_tx.send(ThreadHandle::current()).unwrap();
            assert!(a.acquire(Duration::MAX).unwrap());
            barrier.wait();
            assert!(b.acquire(Duration::MAX).unwrap());
            b.release().unwrap();
            a.release().unwrap();
        }
    });

    let t2 = thread::spawn({
        let (manager, a, b, barrier) = (manager.clone(), a.clone(), b.clone(), barrier.clone());
        move || {
            let t1 = handle_rx.recv().unwrap();
            assert!(b.acquire(Duration::MAX).unwrap());
            barrier.wait();
            wait_until_blocked(&manager, t1, &b);

            let err = a.acquire(Duration::MAX).unwrap_err();
            b.release().unwrap();
            (t1, ThreadHandle::current(), err)
        }
    });

    t1.join().unwrap();
    let (t1, t2, err) = t2.join().unwrap();

    assert!(!err.is_recoverable());
    match err {
        LockError::DeadlockDetected { report } => {
            assert_eq!(report.requester, t2);
            let mut threads: Vec<_> = report.threads().collect();
            threads.sort();
            let mut expected = vec![t1, t2];
            expected.sort();
            assert_eq!(threads, expected);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(sink.deadlocks().len(), 1);
    assert!(manager.is_empty());
}

#[test]
fn test_interrupt_during_resume_is_retried() {
    init_tracing();
    let (manager, _sink) = manager_with(VictimPolicy::default());
    let a = manager.new_lock();
    let b = manager.new_lock();
    let (handle_tx, handle_rx) = mpsc::channel();

    assert!(b.acquire(Duration::MAX).unwrap());

    let victim = thread::spawn({
        let (a, b) = (a.clone(), b.clone());
        move || {
            assert!(a.acquire(Duration::MAX).unwrap());
            assert!(a.acquire(Duration::MAX).unwrap());
            handle_tx.send(ThreadHandle::current()).unwrap();

            let acquired = b.acquire(Duration::MAX);
            let owns_a = a.owner() == Some(ThreadHandle::current());
            let depth = a.depth();
            b.release().unwrap();
            a.release().unwrap();
            a.release().unwrap();
            (acquired, owns_a, depth)
        }
    });

    let t1 = handle_rx.recv().unwrap();
    wait_until_blocked(&manager, t1, &b);

    // Closes the cycle; t1 loses A and this thread takes it
    assert!(a.acquire(Duration::MAX).unwrap());
    assert_eq!(manager.suspended_batches(t1), 1);

    // t1 wins B, then blocks winning A back
    b.release().unwrap();
    wait_until_blocked(&manager, t1, &a);

    assert!(manager.interrupt(t1));
    while manager.is_interrupted(t1) {
        thread::sleep(Duration::from_millis(1));
    }
    wait_until_blocked(&manager, t1, &a);
    a.release().unwrap();

    let (acquired, owns_a, depth) = victim.join().unwrap();
    assert!(matches!(acquired, Ok(true)));
    assert!(owns_a);
    assert_eq!(depth, 2);
    assert!(manager.is_empty());
}

#[test]
fn test_victim_suspended_again_while_resuming() {
    init_tracing();
    let (manager, sink) = manager_with(VictimPolicy::default());
    let a = manager.new_lock();
    let b = manager.new_lock();
    let (handle_tx, handle_rx) = mpsc::channel();

    assert!(a.acquire(Duration::MAX).unwrap());

    let victim = thread::spawn({
        let (manager, a, b) = (manager.clone(), a.clone(), b.clone());
        move || {
            for _ in 0..3 {
                assert!(b.acquire(Duration::MAX).unwrap());
            }
            handle_tx.send(ThreadHandle::current()).unwrap();

            let acquired = a.acquire(Duration::MAX).unwrap();
            let me = ThreadHandle::current();
            let state = (
                acquired,
                a.owner() == Some(me),
                a.depth(),
                b.owner() == Some(me),
                b.depth(),
                manager.suspended_batches(me),
            );
            a.release().unwrap();
            for _ in 0..3 {
                b.release().unwrap();
            }
            state
        }
    });

    let t2 = handle_rx.recv().unwrap();
    wait_until_blocked(&manager, t2, &a);

    // First cycle: t2 loses B (depth 3)
    assert!(b.acquire(Duration::MAX).unwrap());
    assert_eq!(manager.suspended_batches(t2), 1);

    // t2 takes A, then blocks winning B back
    a.release().unwrap();
    wait_until_blocked(&manager, t2, &b);
    assert_eq!(manager.suspended_batches(t2), 0);

    // Second cycle while t2 is still resuming: t2 loses A
    assert!(a.acquire(Duration::MAX).unwrap());
    assert_eq!(manager.suspended_batches(t2), 1);
    assert_eq!(a.owner(), Some(ThreadHandle::current()));

    a.release().unwrap();
    b.release().unwrap();

    let (acquired, owns_a, a_depth, owns_b, b_depth, batches) = victim.join().unwrap();
    assert!(acquired);
    assert!(owns_a);
    assert_eq!(a_depth, 1);
    assert!(owns_b);
    assert_eq!(b_depth, 3);
    assert_eq!(batches, 0);

    assert!(manager.is_empty());
    assert_eq!(sink.deadlocks().len(), 2);
    assert!(sink.deadlocks().iter().all(|report| report.candidate == t2));
}
