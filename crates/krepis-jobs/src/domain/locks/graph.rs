//! WaitForGraph - Ownership and Wait Edges Between Threads and Locks
//!
//! # Structure
//!
//! ```text
//! owns:     rule   -> (thread, count)      single owner, counted per reentrant acquire
//! held:     thread -> {rule}               reverse index of `owns`
//! waits:    thread -> rule                 at most one blocking wait per thread
//! reclaims: thread -> {rule}               locks lost to deadlock resolution
//! ```
//!
//! The graph is bipartite (threads and locks), so the cycle walk alternates
//! `waits` and `owns` edges. Each thread has at most one outgoing `waits`
//! edge and each lock at most one `owns` edge, which makes the walk a simple
//! chain: no branching, no recursion.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::panic::Location;

use super::types::{ResourceRule, ThreadHandle};

/// Ownership entry for one lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ownership {
    thread: ThreadHandle,
    count: u32,
}

/// A blocking wait, with the call site that issued it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitEdge {
    /// Lock being waited for
    pub rule: ResourceRule,
    /// Where the blocking acquire was issued, when known
    pub site: Option<&'static Location<'static>>,
}

/// One hop of a deadlock cycle: `thread` waits for `waits_for`, held by `owner`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleLink {
    /// The blocked thread
    pub thread: ThreadHandle,
    /// The lock it is blocked on
    pub waits_for: ResourceRule,
    /// The current owner of that lock
    pub owner: ThreadHandle,
}

/// Wait-for graph over threads and locks
#[derive(Debug, Default)]
pub struct WaitForGraph {
    owns: HashMap<ResourceRule, Ownership>,
    held: HashMap<ThreadHandle, BTreeSet<ResourceRule>>,
    waits: HashMap<ThreadHandle, WaitEdge>,
    reclaims: HashMap<ThreadHandle, BTreeSet<ResourceRule>>,
}

impl WaitForGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one more acquire of `rule` by `thread`
    ///
    /// Returns the previous owner if a different thread was recorded as
    /// owning the lock; that ownership is replaced.
    pub fn add_ownership(&mut self, thread: ThreadHandle, rule: ResourceRule) -> Option<ThreadHandle> {
        let mut displaced = None;
        match self.owns.get_mut(&rule) {
            Some(entry) if entry.thread == thread => entry.count += 1,
            Some(entry) => {
                displaced = Some(entry.thread);
                *entry = Ownership { thread, count: 1 };
            }
            None => {
                self.owns.insert(rule, Ownership { thread, count: 1 });
            }
        }

        if let Some(previous) = displaced {
            self.unindex(previous, rule);
        }
        self.held.entry(thread).or_default().insert(rule);
        displaced
    }

    /// Drop one acquire of `rule` by `thread`; returns `false` if not owned
    pub fn release_ownership(&mut self, thread: ThreadHandle, rule: ResourceRule) -> bool {
        let Some(entry) = self.owns.get_mut(&rule) else {
            return false;
        };
        if entry.thread != thread {
            return false;
        }

        entry.count = entry.count.saturating_sub(1);
        if entry.count == 0 {
            self.owns.remove(&rule);
            self.unindex(thread, rule);
        }
        true
    }

    /// Drop every acquire of `rule` by `thread`; returns `false` if not owned
    pub fn remove_ownership(&mut self, thread: ThreadHandle, rule: ResourceRule) -> bool {
        match self.owns.get(&rule) {
            Some(entry) if entry.thread == thread => {
                self.owns.remove(&rule);
                self.unindex(thread, rule);
                true
            }
            _ => false,
        }
    }

    fn unindex(&mut self, thread: ThreadHandle, rule: ResourceRule) {
        if let Some(rules) = self.held.get_mut(&thread) {
            rules.remove(&rule);
            if rules.is_empty() {
                self.held.remove(&thread);
            }
        }
    }

    /// Current owner of `rule`
    pub fn owner_of(&self, rule: ResourceRule) -> Option<ThreadHandle> {
        self.owns.get(&rule).map(|entry| entry.thread)
    }

    /// How many times `thread` has acquired `rule` (0 if not the owner)
    pub fn owned_count(&self, thread: ThreadHandle, rule: ResourceRule) -> u32 {
        match self.owns.get(&rule) {
            Some(entry) if entry.thread == thread => entry.count,
            _ => 0,
        }
    }

    /// Locks owned by `thread`, ascending
    pub fn held_by(&self, thread: ThreadHandle) -> impl Iterator<Item = ResourceRule> + '_ {
        self.held.get(&thread).into_iter().flatten().copied()
    }

    /// Record that `thread` is blocked on `edge.rule`, replacing any prior wait
    pub fn set_waiting(&mut self, thread: ThreadHandle, edge: WaitEdge) -> Option<WaitEdge> {
        self.waits.insert(thread, edge)
    }

    /// Remove the blocking wait of `thread`
    pub fn clear_waiting(&mut self, thread: ThreadHandle) -> Option<WaitEdge> {
        self.waits.remove(&thread)
    }

    /// Blocking wait of `thread`, if any
    pub fn waiting_for(&self, thread: ThreadHandle) -> Option<WaitEdge> {
        self.waits.get(&thread).copied()
    }

    /// Whether any thread other than `except` is blocked on `rule`
    pub fn has_other_waiters(&self, rule: ResourceRule, except: ThreadHandle) -> bool {
        self.waits
            .iter()
            .any(|(thread, edge)| *thread != except && edge.rule == rule)
    }

    /// Remember that `thread` must win `rule` back after a forced release
    pub fn add_reclaim(&mut self, thread: ThreadHandle, rule: ResourceRule) {
        self.reclaims.entry(thread).or_default().insert(rule);
    }

    /// Forget the reclaim edge, once the lock is owned again
    pub fn remove_reclaim(&mut self, thread: ThreadHandle, rule: ResourceRule) -> bool {
        let Some(rules) = self.reclaims.get_mut(&thread) else {
            return false;
        };
        let removed = rules.remove(&rule);
        if rules.is_empty() {
            self.reclaims.remove(&thread);
        }
        removed
    }

    /// Locks `thread` still has to win back, ascending
    pub fn reclaims_of(&self, thread: ThreadHandle) -> impl Iterator<Item = ResourceRule> + '_ {
        self.reclaims.get(&thread).into_iter().flatten().copied()
    }

    /// Whether `thread` owns, waits for, or must reclaim any lock
    pub fn contains(&self, thread: ThreadHandle) -> bool {
        self.held.contains_key(&thread)
            || self.waits.contains_key(&thread)
            || self.reclaims.contains_key(&thread)
    }

    /// Whether the graph has no edges at all
    pub fn is_empty(&self) -> bool {
        self.owns.is_empty() && self.waits.is_empty() && self.reclaims.is_empty()
    }

    /// Walk from the blocking wait of `start` looking for a path back to it
    ///
    /// Follows `waits` to a lock, `owns` to its owner, that owner's `waits`,
    /// and so on. Stops at a free lock or a thread that is not blocked. A
    /// loop that does not pass through `start` was already there before this
    /// wait and is not reported.
    pub fn find_cycle(&self, start: ThreadHandle) -> Option<Vec<CycleLink>> {
        let mut path = Vec::new();
        let mut visited = HashSet::new();
        let mut current = start;

        loop {
            let edge = self.waits.get(&current)?;
            let owner = self.owner_of(edge.rule)?;
            path.push(CycleLink {
                thread: current,
                waits_for: edge.rule,
                owner,
            });

            if owner == start {
                return Some(path);
            }
            if !visited.insert(owner) {
                return None;
            }
            current = owner;
        }
    }
}
