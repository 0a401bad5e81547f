//! Core Types for Lock Tracking

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

use super::detector::DeadlockReport;

/// Next handle handed out by [`ThreadHandle::current`]
static NEXT_THREAD_HANDLE: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static CURRENT_HANDLE: ThreadHandle =
        ThreadHandle(NEXT_THREAD_HANDLE.fetch_add(1, Ordering::Relaxed));

    static IS_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// Identity of a participant in the wait-for graph (a worker or the UI thread)
///
/// Handles are totally ordered so victim selection can break ties
/// deterministically. [`ThreadHandle::current`] assigns every OS thread a
/// process-unique handle on first use and never recycles it.
///
/// `ThreadHandle::new` exists for driving the detector directly (tests,
/// external schedulers). Do not mix explicit handles with `current()` handles
/// inside one manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ThreadHandle(pub usize);

impl ThreadHandle {
    /// Create a handle with an explicit id
    #[inline(always)]
    pub const fn new(id: usize) -> Self {
        Self(id)
    }

    /// Handle of the calling OS thread
    pub fn current() -> Self {
        CURRENT_HANDLE.with(|handle| *handle)
    }

    /// Get the underlying usize value
    #[inline(always)]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Register the calling thread as a job worker
    ///
    /// Workers are always treated as potential lock owners by
    /// [`LockManager::is_lock_owner`](super::LockManager::is_lock_owner),
    /// since the UI thread may join a job running on them.
    pub fn mark_current_as_worker() {
        IS_WORKER.with(|flag| flag.set(true));
    }

    /// Whether the calling thread was registered as a job worker
    pub fn current_is_worker() -> bool {
        IS_WORKER.with(Cell::get)
    }
}

impl fmt::Display for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Identity of the resource a lock protects
///
/// The manager allocates one per lock and never looks past equality; whether
/// two rules conflict is the caller's business.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ResourceRule(pub usize);

impl ResourceRule {
    /// Create a new rule identifier
    #[inline(always)]
    pub const fn new(id: usize) -> Self {
        Self(id)
    }

    /// Get the underlying usize value
    #[inline(always)]
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for ResourceRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Lock operation errors
///
/// Deadlocks never show up here in normal operation: they are resolved by
/// suspension. `DeadlockDetected` is only produced in fail-fast mode.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LockError {
    /// The waiting thread was interrupted via `LockManager::interrupt`
    #[error("Thread {thread} was interrupted while waiting for a lock")]
    Interrupted {
        /// The interrupted thread
        thread: ThreadHandle,
    },

    /// A wait closed a cycle and the manager runs in fail-fast mode
    #[error("Deadlock detected, caused by thread {}", .report.requester)]
    DeadlockDetected {
        /// Trace of the cycle
        report: Box<DeadlockReport>,
    },

    /// Thread tried to release a lock it doesn't own
    #[error("Thread {thread} does not own {rule} (owner: {owner:?})")]
    NotOwner {
        /// The thread that attempted to release
        thread: ThreadHandle,
        /// The lock being released
        rule: ResourceRule,
        /// The actual owner, if any
        owner: Option<ThreadHandle>,
    },

    /// Rule was not allocated by this manager
    #[error("Unknown lock: {0}")]
    UnknownLock(ResourceRule),
}

impl LockError {
    /// Check if the operation may simply be retried
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_current_handle_is_stable_per_thread() {
        let here = ThreadHandle::current();
        assert_eq!(here, ThreadHandle::current());

        let there = thread::spawn(ThreadHandle::current).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn test_worker_flag_is_thread_local() {
        let marked = thread::spawn(|| {
            ThreadHandle::mark_current_as_worker();
            ThreadHandle::current_is_worker()
        })
        .join()
        .unwrap();

        assert!(marked);
        assert!(!thread::spawn(ThreadHandle::current_is_worker).join().unwrap());
    }

    #[test]
    fn test_display() {
        assert_eq!(ThreadHandle::new(3).to_string(), "t3");
        assert_eq!(ResourceRule::new(7).to_string(), "r7");

        let err = LockError::NotOwner {
            thread: ThreadHandle::new(1),
            rule: ResourceRule::new(2),
            owner: None,
        };
        assert!(err.to_string().contains("does not own r2"));
    }

    #[test]
    fn test_recoverability() {
        assert!(LockError::Interrupted { thread: ThreadHandle::new(1) }.is_recoverable());
        assert!(!LockError::UnknownLock(ResourceRule::new(0)).is_recoverable());
    }
}
