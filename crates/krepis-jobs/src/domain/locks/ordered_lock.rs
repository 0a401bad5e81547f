//! OrderedLock - Reentrant Lock Bound to a LockManager
//!
//! Acquisition, in order, until something sticks:
//!
//! 1. take the lock if it is free or already ours
//! 2. give up if the deadline has passed or the thread was interrupted
//! 3. on the first miss, register the wait (this is where cycles are found
//!    and resolved) and try again
//! 4. tell the listener, try once more, then park on the lock's condvar
//!
//! Anything suspended from this thread while it waited is won back before
//! `acquire` returns.

use std::fmt;
use std::panic::Location;
use std::time::{Duration, Instant};

use parking_lot::MutexGuard;

use super::manager::LockManager;
use super::types::{LockError, ResourceRule, ThreadHandle};

/// A reentrant mutual-exclusion lock whose waits are deadlock-checked
///
/// Handles are cheap to clone; clones refer to the same lock.
#[derive(Clone)]
pub struct OrderedLock {
    rule: ResourceRule,
    manager: LockManager,
}

impl OrderedLock {
    pub(crate) fn new(rule: ResourceRule, manager: LockManager) -> Self {
        Self { rule, manager }
    }

    /// Resource rule identifying this lock in the wait-for graph
    pub fn rule(&self) -> ResourceRule {
        self.rule
    }

    /// Current owner
    pub fn owner(&self) -> Option<ThreadHandle> {
        self.manager
            .region()
            .slot(self.rule)
            .ok()
            .and_then(|slot| slot.owner)
    }

    /// Reentrancy depth of the current owner (0 when free)
    pub fn depth(&self) -> u32 {
        self.manager
            .region()
            .slot(self.rule)
            .map_or(0, |slot| slot.depth)
    }

    /// Acquire the lock, waiting at most `timeout`
    ///
    /// Returns `Ok(false)` on timeout. `Duration::ZERO` never blocks and
    /// `Duration::MAX` waits forever. Reentrant: every successful acquire
    /// needs its own [`release`](Self::release).
    ///
    /// # Errors
    ///
    /// [`LockError::Interrupted`] if [`LockManager::interrupt`] targeted the
    /// calling thread. [`LockError::DeadlockDetected`] if the wait closed a
    /// cycle and the manager runs in fail-fast mode.
    #[track_caller]
    pub fn acquire(&self, timeout: Duration) -> Result<bool, LockError> {
        self.acquire_for(ThreadHandle::current(), timeout, Some(Location::caller()))
    }

    pub(crate) fn acquire_for(
        &self,
        me: ThreadHandle,
        timeout: Duration,
        site: Option<&'static Location<'static>>,
    ) -> Result<bool, LockError> {
        let deadline = Instant::now().checked_add(timeout);
        let config = self.manager.config();
        let mut region = self.manager.region();

        // Suspension depth of this thread when its wait was registered
        let mut floor: Option<usize> = None;

        let acquired = loop {
            if region.attempt(self.rule, me)? {
                break true;
            }

            if region.take_interrupt(me) {
                if floor.is_some() {
                    region.detector.lock_wait_stop(me, self.rule);
                }
                drop(region);
                if let Some(floor) = floor {
                    self.manager.resume_down_to(me, floor)?;
                }
                tracing::debug!(thread = %me, rule = %self.rule, "acquire interrupted");
                return Err(LockError::Interrupted { thread: me });
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                break false;
            }

            if floor.is_none() {
                floor = Some(region.suspended.depth(me));
                let outcome = region.begin_wait(me, self.rule, site, config);
                // A fail-fast error has already withdrawn the wait
                MutexGuard::unlocked(&mut region, || self.manager.report_wait_outcome(outcome))?;
                continue;
            }

            let owner = region.slot(self.rule)?.owner;
            let pumped = match owner {
                Some(owner) => MutexGuard::unlocked(&mut region, || self.manager.about_to_wait(owner)),
                None => false,
            };
            if region.attempt(self.rule, me)? {
                break true;
            }

            let released = region.slot(self.rule)?.released.clone();
            let until = if pumped {
                let slice = Instant::now().checked_add(config.wait_poll_interval);
                match (slice, deadline) {
                    (Some(slice), Some(deadline)) => Some(slice.min(deadline)),
                    (slice, deadline) => slice.or(deadline),
                }
            } else {
                deadline
            };
            match until {
                Some(until) => {
                    released.wait_until(&mut region, until);
                }
                None => released.wait(&mut region),
            }
        };

        if !acquired && floor.is_some() {
            region.detector.lock_wait_stop(me, self.rule);
        }
        drop(region);

        if let Some(floor) = floor {
            self.manager.resume_down_to(me, floor)?;
        }
        Ok(acquired)
    }

    /// Release one acquire
    ///
    /// The listener's `about_to_release` runs before the final release.
    ///
    /// # Errors
    ///
    /// [`LockError::NotOwner`] if the calling thread does not own the lock.
    pub fn release(&self) -> Result<(), LockError> {
        let me = ThreadHandle::current();
        {
            let mut region = self.manager.region();
            let slot = region.slot(self.rule)?;
            if slot.owner != Some(me) {
                return Err(LockError::NotOwner {
                    thread: me,
                    rule: self.rule,
                    owner: slot.owner,
                });
            }
            if slot.depth > 1 {
                return region.release_once(self.rule, me);
            }
        }

        self.manager.about_to_release();
        self.manager.region().release_once(self.rule, me)
    }

    /// Drop ownership whoever holds the lock; returns the depth it had
    ///
    /// Waiters are woken. Used by deadlock resolution; callers outside the
    /// manager normally have no reason to.
    pub fn force_release(&self) -> Result<u32, LockError> {
        self.manager.region().force_release(self.rule)
    }

    /// Set the calling thread's reentrancy depth on a lock it owns
    ///
    /// A depth of zero releases the lock.
    pub fn set_depth(&self, depth: u32) -> Result<(), LockError> {
        self.manager
            .region()
            .set_depth(self.rule, ThreadHandle::current(), depth)
    }
}

impl fmt::Debug for OrderedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedLock")
            .field("rule", &self.rule)
            .field("owner", &self.owner())
            .field("depth", &self.depth())
            .finish()
    }
}

impl fmt::Display for OrderedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.owner() {
            Some(owner) => write!(f, "OrderedLock({}, owner: {})", self.rule, owner),
            None => write!(f, "OrderedLock({})", self.rule),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn test_reentrant_acquire_and_release() {
        let manager = LockManager::new();
        let lock = manager.new_lock();

        assert!(lock.acquire(Duration::ZERO).unwrap());
        assert!(lock.acquire(Duration::ZERO).unwrap());
        assert_eq!(lock.owner(), Some(ThreadHandle::current()));
        assert_eq!(lock.depth(), 2);

        lock.release().unwrap();
        assert_eq!(lock.depth(), 1);
        lock.release().unwrap();
        assert_eq!(lock.owner(), None);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_release_by_non_owner_fails() {
        let manager = LockManager::new();
        let lock = manager.new_lock();

        assert!(matches!(lock.release(), Err(LockError::NotOwner { owner: None, .. })));

        let held = lock.clone();
        let (tx, rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let holder = thread::spawn(move || {
            held.acquire(Duration::MAX).unwrap();
            tx.send(ThreadHandle::current()).unwrap();
            done_rx.recv().unwrap();
            held.release().unwrap();
        });

        let owner = rx.recv().unwrap();
        match lock.release() {
            Err(LockError::NotOwner { owner: actual, .. }) => assert_eq!(actual, Some(owner)),
            other => panic!("unexpected {:?}", other),
        }
        done_tx.send(()).unwrap();
        holder.join().unwrap();
    }

    #[test]
    fn test_zero_timeout_does_not_register_wait() {
        let manager = LockManager::new();
        let lock = manager.new_lock();
        let held = lock.clone();
        let (tx, rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();

        let holder = thread::spawn(move || {
            held.acquire(Duration::MAX).unwrap();
            tx.send(()).unwrap();
            done_rx.recv().unwrap();
            held.release().unwrap();
        });
        rx.recv().unwrap();

        assert!(!lock.acquire(Duration::ZERO).unwrap());
        assert!(manager
            .region()
            .detector
            .graph()
            .waiting_for(ThreadHandle::current())
            .is_none());

        done_tx.send(()).unwrap();
        holder.join().unwrap();
        assert!(manager.is_empty());
    }

    #[test]
    fn test_set_depth_and_force_release() {
        let manager = LockManager::new();
        let lock = manager.new_lock();

        lock.acquire(Duration::ZERO).unwrap();
        lock.set_depth(3).unwrap();
        assert_eq!(lock.depth(), 3);
        assert_eq!(
            manager.region().detector.graph().owned_count(ThreadHandle::current(), lock.rule()),
            3
        );

        assert_eq!(lock.force_release().unwrap(), 3);
        assert_eq!(lock.owner(), None);
        assert!(manager.is_empty());
        assert_eq!(lock.force_release().unwrap(), 0);
    }

    #[test]
    fn test_display() {
        let manager = LockManager::new();
        let lock = manager.new_lock();
        assert_eq!(lock.to_string(), format!("OrderedLock({})", lock.rule()));

        lock.acquire(Duration::ZERO).unwrap();
        assert!(lock.to_string().contains("owner: t"));
        lock.release().unwrap();
    }
}
