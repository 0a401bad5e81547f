//! Ordered Locks & Deadlock Resolution
//!
//! # Architecture
//!
//! ```text
//! LockManager ──creates──> OrderedLock
//!     │
//!     ├─ DeadlockDetector ── WaitForGraph   (owns / waits / reclaims)
//!     ├─ SuspendedLocks                     (per-thread batch stacks)
//!     ├─ LockListener                       (about_to_wait / about_to_release)
//!     └─ DiagnosticSink                     (listener faults, cycle traces)
//! ```
//!
//! Every wait is checked for a cycle the moment it is registered. A cycle is
//! broken by forcibly releasing the contested locks of one thread on it (the
//! victim) and remembering their depths; the victim wins them back once it
//! gets the lock it was waiting for.
//!
//! ## Graph Events
//!
//! ```text
//! acquire ok          -> lock_acquired
//! acquire must block  -> lock_wait_start  (+ resolution on a cycle)
//! acquire gives up    -> lock_wait_stop
//! release             -> lock_released
//! forced release      -> lock_released_completely
//! ```

pub mod config;
pub mod detector;
pub mod diagnostics;
pub mod graph;
pub mod listener;
pub mod manager;
pub mod ordered_lock;
pub mod suspended;
pub mod types;

// Re-exports
pub use config::{LockManagerBuilder, LockManagerConfig, VictimPolicy, DEFAULT_WAIT_POLL_INTERVAL};
pub use detector::{DeadlockDetector, DeadlockReport, ReportLink};
pub use diagnostics::{Diagnostic, DiagnosticSink, ListenerCallback};
pub use graph::{CycleLink, WaitEdge, WaitForGraph};
pub use listener::LockListener;
pub use manager::LockManager;
pub use ordered_lock::OrderedLock;
pub use suspended::{SuspendedBatch, SuspendedLockState, SuspendedLocks};
pub use types::{LockError, ResourceRule, ThreadHandle};
