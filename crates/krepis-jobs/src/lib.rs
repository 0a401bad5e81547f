//! Krepis Jobs - Ordered Locks with Deadlock Resolution
//!
//! # Overview
//!
//! `krepis-jobs` provides reentrant locks for a job system whose workers and
//! UI thread contend for shared resources. Every lock is created by a
//! [`LockManager`], which keeps a wait-for graph of who owns and who waits
//! for what.
//!
//! A wait that would close a cycle is detected before the thread parks. The
//! manager then picks a victim on the cycle, forcibly releases the locks it
//! holds that others are blocked on, and lets the victim win them back (at
//! their old reentrancy depth) once it gets the lock it is waiting for.
//! Nobody ever blocks forever on a lock cycle.
//!
//! # Trinity Architecture
//!
//! - **Domain**: wait-for graph, detector, manager and locks
//! - **Infrastructure**: diagnostic sinks (`tracing`, in-memory)
//!
//! # Usage
//!
//! ```rust
//! use std::time::Duration;
//! use krepis_jobs::LockManager;
//!
//! let manager = LockManager::new();
//! let jobs = manager.new_lock();
//! let workspace = manager.new_lock();
//!
//! assert!(jobs.acquire(Duration::MAX).unwrap());
//! assert!(workspace.acquire(Duration::from_millis(100)).unwrap());
//!
//! workspace.release().unwrap();
//! jobs.release().unwrap();
//! assert!(manager.is_empty());
//! ```

pub mod domain;
pub mod infrastructure;

pub use domain::locks::{
    DeadlockReport, Diagnostic, DiagnosticSink, LockError, LockListener, LockManager,
    LockManagerBuilder, LockManagerConfig, OrderedLock, ResourceRule, ThreadHandle,
    VictimPolicy,
};
pub use infrastructure::{RecordingSink, TracingSink};
