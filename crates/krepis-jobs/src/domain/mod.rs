//! Domain Layer - Lock Ordering Logic
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                 Domain Layer                  │
//! ├───────────────────────────────────────────────┤
//! │  Locks Module                                 │
//! │  ├─ LockManager / LockManagerBuilder          │
//! │  ├─ OrderedLock                               │
//! │  ├─ DeadlockDetector ── WaitForGraph          │
//! │  ├─ SuspendedLocks                            │
//! │  └─ LockListener / DiagnosticSink (ports)     │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! Nothing here decides where diagnostics end up; the sinks live in
//! [`crate::infrastructure`].

pub mod locks;

pub use locks::{
    LockError, LockManager, LockManagerBuilder, LockManagerConfig, OrderedLock, ResourceRule,
    ThreadHandle, VictimPolicy,
};
