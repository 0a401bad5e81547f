//! Suspended Lock Bookkeeping
//!
//! A victim may be suspended again while it is still winning back locks from
//! an earlier resolution, so every thread gets a LIFO stack of batches.

use std::collections::HashMap;

use super::types::{ResourceRule, ThreadHandle};

/// A lock taken away by deadlock resolution, with the depth to restore
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuspendedLockState {
    /// The suspended lock
    pub rule: ResourceRule,
    /// Reentrancy depth at the time of the forced release
    pub depth: u32,
}

/// Everything suspended for one victim in one resolution event
pub type SuspendedBatch = Vec<SuspendedLockState>;

/// Per-thread stacks of suspended batches
#[derive(Debug, Default)]
pub struct SuspendedLocks {
    stacks: HashMap<ThreadHandle, Vec<SuspendedBatch>>,
}

impl SuspendedLocks {
    /// No thread has anything suspended
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a batch for `thread`; empty batches are dropped
    pub fn push(&mut self, thread: ThreadHandle, batch: SuspendedBatch) {
        if batch.is_empty() {
            return;
        }
        self.stacks.entry(thread).or_default().push(batch);
    }

    /// Pop the most recent batch of `thread`
    ///
    /// The stack entry disappears once it runs empty.
    pub fn pop(&mut self, thread: ThreadHandle) -> Option<SuspendedBatch> {
        let stack = self.stacks.get_mut(&thread)?;
        let batch = stack.pop();
        if stack.is_empty() {
            self.stacks.remove(&thread);
        }
        batch
    }

    /// Number of batches waiting to be resumed by `thread`
    pub fn depth(&self, thread: ThreadHandle) -> usize {
        self.stacks.get(&thread).map_or(0, Vec::len)
    }

    /// Whether nothing is suspended for anyone
    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(rule: usize, depth: u32) -> SuspendedLockState {
        SuspendedLockState {
            rule: ResourceRule::new(rule),
            depth,
        }
    }

    #[test]
    fn test_batches_pop_in_reverse_order() {
        let mut suspended = SuspendedLocks::new();
        let victim = ThreadHandle::new(1);

        suspended.push(victim, vec![state(0, 2)]);
        suspended.push(victim, vec![state(1, 1), state(2, 3)]);
        assert_eq!(suspended.depth(victim), 2);

        assert_eq!(suspended.pop(victim), Some(vec![state(1, 1), state(2, 3)]));
        assert_eq!(suspended.pop(victim), Some(vec![state(0, 2)]));
        assert_eq!(suspended.pop(victim), None);
        assert!(suspended.is_empty());
    }

    #[test]
    fn test_empty_batch_is_ignored() {
        let mut suspended = SuspendedLocks::new();
        suspended.push(ThreadHandle::new(1), Vec::new());

        assert!(suspended.is_empty());
    }

    #[test]
    fn test_threads_are_independent() {
        let mut suspended = SuspendedLocks::new();
        suspended.push(ThreadHandle::new(1), vec![state(0, 1)]);

        assert_eq!(suspended.pop(ThreadHandle::new(2)), None);
        assert_eq!(suspended.depth(ThreadHandle::new(1)), 1);
    }
}
