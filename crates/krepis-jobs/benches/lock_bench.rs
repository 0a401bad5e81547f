//! Lock Manager Benchmark Suite
//!
//! # Scenarios
//!
//! 1. **Uncontended**: acquire/release on a free lock
//! 2. **Reentrant**: nested acquires of one lock
//! 3. **Cycle Check**: `lock_wait_start` at the end of a long wait chain
//! 4. **Resolution**: close an AB-BA cycle through the graph API and resume

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use krepis_jobs::domain::locks::{DeadlockDetector, ResourceRule, ThreadHandle};
use krepis_jobs::LockManager;

fn bench_uncontended(c: &mut Criterion) {
    let manager = LockManager::builder().report_deadlocks(false).build();
    let lock = manager.new_lock();

    c.bench_function("uncontended_acquire_release", |b| {
        b.iter(|| {
            black_box(lock.acquire(Duration::MAX).unwrap());
            lock.release().unwrap();
        })
    });
}

fn bench_reentrant(c: &mut Criterion) {
    let manager = LockManager::builder().report_deadlocks(false).build();
    let lock = manager.new_lock();

    let mut group = c.benchmark_group("reentrant");
    for depth in [1u32, 8, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.iter(|| {
                for _ in 0..depth {
                    lock.acquire(Duration::MAX).unwrap();
                }
                for _ in 0..depth {
                    lock.release().unwrap();
                }
            })
        });
    }
    group.finish();
}

/// t0 owns r0, t1 waits r0 and owns r1, ... tN waits r(N-1)
fn wait_chain(len: usize) -> DeadlockDetector {
    let mut detector = DeadlockDetector::new();
    for i in 0..len {
        detector.lock_acquired(ThreadHandle::new(i), ResourceRule::new(i));
        if i > 0 {
            detector.lock_wait_start(ThreadHandle::new(i), ResourceRule::new(i - 1), None);
        }
    }
    detector
}

fn bench_cycle_check(c: &mut Criterion) {
    let mut group = c.benchmark_group("cycle_check");
    for len in [4usize, 32, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, &len| {
            let mut detector = wait_chain(len);
            let head = ThreadHandle::new(0);
            let tail = ResourceRule::new(len - 1);
            b.iter(|| {
                detector.lock_wait_start(head, tail, None);
                black_box(detector.is_deadlocked());
                detector.deadlock_solved();
                detector.lock_wait_stop(head, tail);
            })
        });
    }
    group.finish();
}

fn bench_resolution(c: &mut Criterion) {
    let manager = LockManager::builder().report_deadlocks(false).build();
    let (a, b) = (manager.new_rule(), manager.new_rule());
    let (t1, t2) = (ThreadHandle::new(1), ThreadHandle::new(2));

    c.bench_function("abba_resolution", |bench| {
        bench.iter(|| {
            manager.add_lock_thread(t1, a);
            manager.add_lock_thread(t2, b);
            manager.add_lock_wait_thread(t1, b).unwrap();
            manager.add_lock_wait_thread(t2, a).unwrap();

            manager.remove_lock_wait_thread(t2, a);
            manager.remove_lock_completely(t2, b);
            manager.resume_suspended_locks(t1).unwrap();
            manager.remove_lock_completely(t1, a);
        })
    });
}

criterion_group!(
    benches,
    bench_uncontended,
    bench_reentrant,
    bench_cycle_check,
    bench_resolution
);
criterion_main!(benches);
