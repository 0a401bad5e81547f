//! LockManager - Façade over the Detector, Lock Slots and Suspension
//!
//! # Architecture
//!
//! ```text
//! LockManager (Arc, cheap to clone)
//!   ├─ region: Mutex<GraphRegion>          the single critical region
//!   │    ├─ detector: DeadlockDetector     wait-for graph
//!   │    ├─ slots: rule -> LockSlot        owner/depth of every OrderedLock
//!   │    ├─ suspended: SuspendedLocks      per-thread batch stacks
//!   │    └─ interrupted: {thread}
//!   ├─ listener: RwLock<Option<Arc<dyn LockListener>>>
//!   ├─ sink: Arc<dyn DiagnosticSink>
//!   └─ config: LockManagerConfig
//! ```
//!
//! Everything that can change ownership happens with `region` held, so two
//! waits can never both see an acyclic graph and step into a cycle. The
//! region is never held while parked (waiters sleep on the lock's condvar),
//! nor while calling the listener or the sink.

use std::collections::{HashMap, HashSet};
use std::panic::Location;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

use super::config::{LockManagerBuilder, LockManagerConfig};
use super::detector::{DeadlockDetector, DeadlockReport};
use super::diagnostics::{Diagnostic, DiagnosticSink, ListenerCallback};
use super::listener::{guarded, LockListener};
use super::ordered_lock::OrderedLock;
use super::suspended::{SuspendedBatch, SuspendedLockState, SuspendedLocks};
use super::types::{LockError, ResourceRule, ThreadHandle};

/// Ownership state of one [`OrderedLock`]
#[derive(Debug)]
pub(crate) struct LockSlot {
    pub(crate) owner: Option<ThreadHandle>,
    pub(crate) depth: u32,

    /// Signalled whenever the lock becomes free or a waiter is interrupted
    pub(crate) released: Arc<Condvar>,
}

impl LockSlot {
    fn new() -> Self {
        Self {
            owner: None,
            depth: 0,
            released: Arc::new(Condvar::new()),
        }
    }
}

/// State guarded by the graph region
#[derive(Debug, Default)]
pub(crate) struct GraphRegion {
    pub(crate) detector: DeadlockDetector,
    pub(crate) suspended: SuspendedLocks,
    slots: HashMap<ResourceRule, LockSlot>,
    interrupted: HashSet<ThreadHandle>,
    next_rule: usize,
}

impl GraphRegion {
    fn allocate_rule(&mut self) -> ResourceRule {
        let rule = ResourceRule::new(self.next_rule);
        self.next_rule += 1;
        rule
    }

    pub(crate) fn slot(&self, rule: ResourceRule) -> Result<&LockSlot, LockError> {
        self.slots.get(&rule).ok_or(LockError::UnknownLock(rule))
    }

    fn slot_mut(&mut self, rule: ResourceRule) -> Result<&mut LockSlot, LockError> {
        self.slots.get_mut(&rule).ok_or(LockError::UnknownLock(rule))
    }

    /// Take `rule` for `thread` if it is free or already `thread`'s
    pub(crate) fn attempt(&mut self, rule: ResourceRule, thread: ThreadHandle) -> Result<bool, LockError> {
        let slot = self.slot_mut(rule)?;
        match slot.owner {
            Some(owner) if owner != thread => return Ok(false),
            _ => {}
        }
        slot.owner = Some(thread);
        slot.depth += 1;
        self.detector.lock_acquired(thread, rule);
        Ok(true)
    }

    /// One release by the owner; wakes waiters when the depth reaches zero
    pub(crate) fn release_once(&mut self, rule: ResourceRule, thread: ThreadHandle) -> Result<(), LockError> {
        let slot = self.slot_mut(rule)?;
        if slot.owner != Some(thread) {
            return Err(LockError::NotOwner {
                thread,
                rule,
                owner: slot.owner,
            });
        }

        slot.depth -= 1;
        if slot.depth == 0 {
            slot.owner = None;
            slot.released.notify_all();
        }
        self.detector.lock_released(thread, rule);
        Ok(())
    }

    /// Clear ownership of `rule` whoever holds it; returns the old depth
    pub(crate) fn force_release(&mut self, rule: ResourceRule) -> Result<u32, LockError> {
        let slot = self.slot_mut(rule)?;
        let depth = slot.depth;
        let Some(owner) = slot.owner.take() else {
            return Ok(0);
        };
        slot.depth = 0;
        slot.released.notify_all();
        self.detector.lock_released_completely(owner, rule);
        Ok(depth)
    }

    /// Suspend `victim`'s hold on `rule`
    ///
    /// Rules without a slot are tracked for an external scheduler: only the
    /// graph edges are dropped and the recorded count is saved.
    fn suspend(&mut self, victim: ThreadHandle, rule: ResourceRule) -> SuspendedLockState {
        self.detector.set_to_wait(victim, rule);
        let owns_slot = self
            .slots
            .get(&rule)
            .is_some_and(|slot| slot.owner == Some(victim));

        let depth = if owns_slot {
            self.force_release(rule).unwrap_or(0)
        } else {
            let depth = self.detector.graph().owned_count(victim, rule);
            self.detector.lock_released_completely(victim, rule);
            depth
        };
        SuspendedLockState { rule, depth }
    }

    /// Restore `thread`'s depth on a lock it owns again
    pub(crate) fn set_depth(&mut self, rule: ResourceRule, thread: ThreadHandle, depth: u32) -> Result<(), LockError> {
        let slot = self.slot_mut(rule)?;
        if slot.owner != Some(thread) {
            return Err(LockError::NotOwner {
                thread,
                rule,
                owner: slot.owner,
            });
        }
        if depth == 0 {
            self.force_release(rule)?;
            return Ok(());
        }

        let current = slot.depth;
        slot.depth = depth;
        for _ in current..depth {
            self.detector.lock_acquired(thread, rule);
        }
        for _ in depth..current {
            self.detector.lock_released(thread, rule);
        }
        Ok(())
    }

    /// Register a blocking wait and resolve the deadlock it closes, if any
    ///
    /// Returns the cycle trace when one was resolved and reporting is on.
    /// In fail-fast mode the wait is withdrawn and the cycle returned as an
    /// error instead.
    pub(crate) fn begin_wait(
        &mut self,
        thread: ThreadHandle,
        rule: ResourceRule,
        site: Option<&'static Location<'static>>,
        config: &LockManagerConfig,
    ) -> Result<Option<DeadlockReport>, LockError> {
        self.detector.lock_wait_start(thread, rule, site);
        if !self.detector.is_deadlocked() {
            return Ok(None);
        }

        let candidate = self.detector.resolution_candidate(thread, rule, config.victim_policy);
        if config.fail_on_deadlock {
            let report = self.detector.report_deadlock(thread, rule, candidate);
            self.detector.lock_wait_stop(thread, rule);
            self.detector.deadlock_solved();
            return Err(LockError::DeadlockDetected {
                report: Box::new(report),
            });
        }
        let report = config
            .report_deadlocks
            .then(|| self.detector.report_deadlock(thread, rule, candidate));

        let batch: SuspendedBatch = self
            .detector
            .contested_locks_for_thread(candidate)
            .into_iter()
            .map(|contested| self.suspend(candidate, contested))
            .collect();

        tracing::warn!(
            requester = %thread,
            %rule,
            victim = %candidate,
            suspended = batch.len(),
            "deadlock resolved by suspending locks"
        );
        self.suspended.push(candidate, batch);
        self.detector.deadlock_solved();
        Ok(report)
    }

    pub(crate) fn take_interrupt(&mut self, thread: ThreadHandle) -> bool {
        self.interrupted.remove(&thread)
    }
}

struct ManagerShared {
    region: Mutex<GraphRegion>,
    listener: RwLock<Option<Arc<dyn LockListener>>>,
    sink: Arc<dyn DiagnosticSink>,
    config: LockManagerConfig,
}

/// Creates ordered locks and keeps them deadlock-free
///
/// Cloning yields another handle to the same manager.
///
/// ```rust
/// use std::time::Duration;
/// use krepis_jobs::domain::locks::LockManager;
///
/// let manager = LockManager::new();
/// let lock = manager.new_lock();
///
/// assert!(lock.acquire(Duration::from_millis(10)).unwrap());
/// assert!(lock.acquire(Duration::ZERO).unwrap()); // reentrant
/// assert_eq!(lock.depth(), 2);
///
/// lock.release().unwrap();
/// lock.release().unwrap();
/// assert!(manager.is_empty());
/// ```
#[derive(Clone)]
pub struct LockManager {
    shared: Arc<ManagerShared>,
}

impl LockManager {
    /// Manager with default configuration, reporting through `tracing`
    pub fn new() -> Self {
        LockManagerBuilder::new().build()
    }

    /// Manager with the given configuration
    pub fn with_config(config: LockManagerConfig) -> Self {
        LockManagerBuilder::new().config(config).build()
    }

    /// Start building a manager
    pub fn builder() -> LockManagerBuilder {
        LockManagerBuilder::new()
    }

    pub(crate) fn from_parts(
        config: LockManagerConfig,
        sink: Arc<dyn DiagnosticSink>,
        listener: Option<Arc<dyn LockListener>>,
    ) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                region: Mutex::new(GraphRegion::default()),
                listener: RwLock::new(listener),
                sink,
                config,
            }),
        }
    }

    /// Active configuration
    pub fn config(&self) -> &LockManagerConfig {
        &self.shared.config
    }

    pub(crate) fn region(&self) -> MutexGuard<'_, GraphRegion> {
        self.shared.region.lock()
    }

    /// Create a new lock bound to this manager
    pub fn new_lock(&self) -> OrderedLock {
        let rule = {
            let mut region = self.region();
            let rule = region.allocate_rule();
            region.slots.insert(rule, LockSlot::new());
            rule
        };
        tracing::trace!(%rule, "lock created");
        OrderedLock::new(rule, self.clone())
    }

    /// Allocate a rule whose exclusivity is enforced by an external scheduler
    ///
    /// The manager only mirrors the events reported for it through
    /// `add_lock_thread` and friends. When such a rule is suspended, resuming
    /// it restores the saved count without blocking, so the scheduler must
    /// keep the rule free until the victim has resumed. A rule found owned by
    /// another thread at resume time is left to that thread and the saved
    /// count is dropped.
    pub fn new_rule(&self) -> ResourceRule {
        self.region().allocate_rule()
    }

    /// `thread` has just acquired `rule`
    pub fn add_lock_thread(&self, thread: ThreadHandle, rule: ResourceRule) {
        self.region().detector.lock_acquired(thread, rule);
    }

    /// `thread` is about to block on `rule`; resolves the deadlock this closes
    ///
    /// Only fails in fail-fast mode.
    pub fn add_lock_wait_thread(&self, thread: ThreadHandle, rule: ResourceRule) -> Result<(), LockError> {
        let outcome = self
            .region()
            .begin_wait(thread, rule, None, &self.shared.config);
        self.report_wait_outcome(outcome)
    }

    /// Send the trace of a resolved or fatal cycle to the sink
    pub(crate) fn report_wait_outcome(
        &self,
        outcome: Result<Option<DeadlockReport>, LockError>,
    ) -> Result<(), LockError> {
        match outcome {
            Ok(None) => Ok(()),
            Ok(Some(report)) => {
                self.report(Diagnostic::Deadlock { report, resolved: true });
                Ok(())
            }
            Err(err) => {
                if let LockError::DeadlockDetected { report } = &err {
                    self.report(Diagnostic::Deadlock {
                        report: (**report).clone(),
                        resolved: false,
                    });
                }
                Err(err)
            }
        }
    }

    /// `thread` has released `rule` once
    pub fn remove_lock_thread(&self, thread: ThreadHandle, rule: ResourceRule) {
        self.region().detector.lock_released(thread, rule);
    }

    /// `thread` gave up waiting for `rule`
    pub fn remove_lock_wait_thread(&self, thread: ThreadHandle, rule: ResourceRule) {
        self.region().detector.lock_wait_stop(thread, rule);
    }

    /// `thread` released every acquire of `rule` at once
    pub fn remove_lock_completely(&self, thread: ThreadHandle, rule: ResourceRule) {
        self.region().detector.lock_released_completely(thread, rule);
    }

    /// Win back the most recently suspended batch of `owner`
    ///
    /// Blocks until every lock of the batch is owned by `owner` again at its
    /// saved depth. Interruptions are swallowed and the acquire retried.
    pub fn resume_suspended_locks(&self, owner: ThreadHandle) -> Result<(), LockError> {
        let Some(batch) = self.region().suspended.pop(owner) else {
            return Ok(());
        };
        tracing::debug!(%owner, locks = batch.len(), "resuming suspended locks");

        for state in batch {
            self.resume(owner, state)?;
        }
        Ok(())
    }

    /// Resume batches of `owner` until only `floor` are left
    pub(crate) fn resume_down_to(&self, owner: ThreadHandle, floor: usize) -> Result<(), LockError> {
        while self.suspended_batches(owner) > floor {
            self.resume_suspended_locks(owner)?;
        }
        Ok(())
    }

    fn resume(&self, owner: ThreadHandle, state: SuspendedLockState) -> Result<(), LockError> {
        {
            let mut region = self.region();
            if region.slot(state.rule).is_err() {
                let current = region.detector.graph().owner_of(state.rule);
                match current {
                    Some(other) if other != owner => {
                        tracing::warn!(
                            %owner,
                            rule = %state.rule,
                            %other,
                            depth = state.depth,
                            "externally tracked rule taken before resume, dropping saved count"
                        );
                        region.detector.reclaim_abandoned(owner, state.rule);
                    }
                    _ => {
                        for _ in 0..state.depth {
                            region.detector.lock_acquired(owner, state.rule);
                        }
                    }
                }
                return Ok(());
            }
        }

        let lock = OrderedLock::new(state.rule, self.clone());
        loop {
            match lock.acquire_for(owner, Duration::MAX, Some(Location::caller())) {
                Ok(true) => break,
                Ok(false) => {}
                Err(err) if err.is_recoverable() => {
                    tracing::debug!(%owner, rule = %state.rule, %err, "retrying resume");
                }
                Err(err) => return Err(err),
            }
            thread::yield_now();
        }

        self.region().set_depth(state.rule, owner, state.depth)
    }

    /// Number of suspended batches `thread` still has to resume
    pub fn suspended_batches(&self, thread: ThreadHandle) -> usize {
        self.region().suspended.depth(thread)
    }

    /// Whether the calling thread may own locks
    ///
    /// Job workers always count, since the UI thread may join them.
    pub fn is_lock_owner(&self) -> bool {
        if ThreadHandle::current_is_worker() {
            return true;
        }
        self.region().detector.contains(ThreadHandle::current())
    }

    /// Lock `thread` is currently registered as blocked on
    pub fn waiting_for(&self, thread: ThreadHandle) -> Option<ResourceRule> {
        self.region()
            .detector
            .graph()
            .waiting_for(thread)
            .map(|edge| edge.rule)
    }

    /// Whether no thread owns, waits for or must reclaim any lock
    pub fn is_empty(&self) -> bool {
        self.region().detector.is_empty()
    }

    /// Wake `thread` out of a blocking acquire with [`LockError::Interrupted`]
    ///
    /// Only threads that own, wait for or must reclaim a lock can be
    /// interrupted; returns whether the flag was set. If the thread is not
    /// waiting the flag stays set and its next blocking acquire fails at once.
    /// Flags of threads that have since left the graph are dropped here.
    pub fn interrupt(&self, thread: ThreadHandle) -> bool {
        let mut region = self.region();
        let GraphRegion { detector, interrupted, slots, .. } = &mut *region;
        interrupted.retain(|flagged| detector.contains(*flagged));
        if !detector.contains(thread) {
            tracing::debug!(%thread, "interrupt of a thread outside the graph ignored");
            return false;
        }

        interrupted.insert(thread);
        if let Some(edge) = detector.graph().waiting_for(thread) {
            if let Some(slot) = slots.get(&edge.rule) {
                slot.released.notify_all();
            }
        }
        true
    }

    /// Whether `thread` has an interrupt that no acquire has consumed yet
    pub fn is_interrupted(&self, thread: ThreadHandle) -> bool {
        self.region().interrupted.contains(&thread)
    }

    /// Replace the listener; `None` removes it
    pub fn set_lock_listener(&self, listener: Option<Arc<dyn LockListener>>) {
        *self.shared.listener.write() = listener;
    }

    fn listener(&self) -> Option<Arc<dyn LockListener>> {
        self.shared.listener.read().clone()
    }

    /// Tell the listener a lock is about to be released
    pub fn about_to_release(&self) {
        let Some(listener) = self.listener() else {
            return;
        };
        if let Err(diagnostic) = guarded(ListenerCallback::AboutToRelease, || listener.about_to_release()) {
            self.report(diagnostic);
        }
    }

    /// Tell the listener the calling thread is about to park behind `owner`
    ///
    /// Returns `true` if the listener ran pending work.
    pub fn about_to_wait(&self, owner: ThreadHandle) -> bool {
        let Some(listener) = self.listener() else {
            return false;
        };
        match guarded(ListenerCallback::AboutToWait, || listener.about_to_wait(owner)) {
            Ok(pumped) => pumped,
            Err(diagnostic) => {
                self.report(diagnostic);
                false
            }
        }
    }

    fn report(&self, diagnostic: Diagnostic) {
        self.shared.sink.report(&diagnostic);
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}
