//! DeadlockDetector - Eager Cycle Detection over the Wait-For Graph
//!
//! Every acquire, wait and release is mirrored here. The check runs inside
//! [`DeadlockDetector::lock_wait_start`], on the same call that adds the wait
//! edge, so a cycle is known the moment it forms.
//!
//! The detector does no locking of its own: the manager calls it while
//! holding the graph region.

use std::fmt;
use std::panic::Location;

use serde::Serialize;

use super::config::VictimPolicy;
use super::graph::{CycleLink, WaitEdge, WaitForGraph};
use super::types::{ResourceRule, ThreadHandle};

/// Deadlock detector owning one wait-for graph
#[derive(Debug, Default)]
pub struct DeadlockDetector {
    graph: WaitForGraph,

    /// Cycle closed by the last `lock_wait_start`, until `deadlock_solved`
    cycle: Option<Vec<CycleLink>>,
}

impl DeadlockDetector {
    /// Create a detector with an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Read-only view of the graph
    pub fn graph(&self) -> &WaitForGraph {
        &self.graph
    }

    /// `thread` has acquired `rule` (once more, if reentrant)
    pub fn lock_acquired(&mut self, thread: ThreadHandle, rule: ResourceRule) {
        if let Some(previous) = self.graph.add_ownership(thread, rule) {
            tracing::warn!(%thread, %rule, %previous, "lock acquired while recorded as owned by another thread");
        }
        self.graph.clear_waiting(thread);
        self.graph.remove_reclaim(thread, rule);
    }

    /// `thread` is about to block on `rule`; checks for a cycle immediately
    pub fn lock_wait_start(
        &mut self,
        thread: ThreadHandle,
        rule: ResourceRule,
        site: Option<&'static Location<'static>>,
    ) {
        if let Some(previous) = self.graph.set_waiting(thread, WaitEdge { rule, site }) {
            if previous.rule != rule {
                tracing::warn!(%thread, %rule, previous = %previous.rule, "thread started a second wait");
            }
        }
        self.cycle = self.graph.find_cycle(thread);
    }

    /// Whether the last `lock_wait_start` closed a cycle
    pub fn is_deadlocked(&self) -> bool {
        self.cycle.is_some()
    }

    /// The unresolved cycle, requester first
    pub fn cycle(&self) -> Option<&[CycleLink]> {
        self.cycle.as_deref()
    }

    /// Pick the thread whose locks get suspended
    ///
    /// Deterministic: with [`VictimPolicy::OtherThanRequester`] the smallest
    /// handle on the cycle other than `thread`, with
    /// [`VictimPolicy::Requester`] `thread` itself. Without a current cycle
    /// starting at `(thread, rule)` the requester is returned.
    pub fn resolution_candidate(
        &self,
        thread: ThreadHandle,
        rule: ResourceRule,
        policy: VictimPolicy,
    ) -> ThreadHandle {
        let Some(cycle) = self.cycle.as_deref() else {
            return thread;
        };
        match cycle.first() {
            Some(link) if link.thread == thread && link.waits_for == rule => {}
            _ => return thread,
        }

        match policy {
            VictimPolicy::Requester => thread,
            VictimPolicy::OtherThanRequester => cycle
                .iter()
                .map(|link| link.thread)
                .filter(|candidate| *candidate != thread)
                .min()
                .unwrap_or(thread),
        }
    }

    /// Locks owned by `victim` that some other thread is blocked on
    pub fn contested_locks_for_thread(&self, victim: ThreadHandle) -> Vec<ResourceRule> {
        self.graph
            .held_by(victim)
            .filter(|rule| self.graph.has_other_waiters(*rule, victim))
            .collect()
    }

    /// Record that `victim` will have to win `rule` back
    ///
    /// The victim is not the thread running this call, so it cannot record
    /// the edge itself.
    pub fn set_to_wait(&mut self, victim: ThreadHandle, rule: ResourceRule) {
        self.graph.add_reclaim(victim, rule);
    }

    /// `thread` will not win `rule` back after all
    pub fn reclaim_abandoned(&mut self, thread: ThreadHandle, rule: ResourceRule) {
        self.graph.remove_reclaim(thread, rule);
    }

    /// The cycle has been broken by suspension
    pub fn deadlock_solved(&mut self) {
        self.cycle = None;
    }

    /// `thread` released `rule` once
    pub fn lock_released(&mut self, thread: ThreadHandle, rule: ResourceRule) {
        if !self.graph.release_ownership(thread, rule) {
            tracing::warn!(%thread, %rule, "release of a lock not recorded as owned");
        }
    }

    /// `thread` gave up every acquire of `rule` at once
    pub fn lock_released_completely(&mut self, thread: ThreadHandle, rule: ResourceRule) {
        if !self.graph.remove_ownership(thread, rule) {
            tracing::debug!(%thread, %rule, "complete release of a lock not recorded as owned");
        }
    }

    /// `thread` stopped waiting for `rule` without getting it
    pub fn lock_wait_stop(&mut self, thread: ThreadHandle, rule: ResourceRule) {
        match self.graph.waiting_for(thread) {
            Some(edge) if edge.rule == rule => {
                self.graph.clear_waiting(thread);
            }
            _ => tracing::debug!(%thread, %rule, "wait stop without matching wait"),
        }
    }

    /// Whether `thread` owns, waits for, or must reclaim any lock
    pub fn contains(&self, thread: ThreadHandle) -> bool {
        self.graph.contains(thread)
    }

    /// Whether no thread is tracked at all
    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    /// Human-readable trace of the current cycle
    pub fn report_deadlock(
        &self,
        thread: ThreadHandle,
        rule: ResourceRule,
        candidate: ThreadHandle,
    ) -> DeadlockReport {
        let links = self
            .cycle
            .iter()
            .flatten()
            .map(|link| ReportLink {
                thread: link.thread,
                waits_for: link.waits_for,
                owner: link.owner,
                held: self.graph.held_by(link.thread).collect(),
                site: self
                    .graph
                    .waiting_for(link.thread)
                    .and_then(|edge| edge.site)
                    .map(ToString::to_string),
            })
            .collect();

        DeadlockReport {
            requester: thread,
            rule,
            candidate,
            links,
        }
    }
}

/// One blocked thread in a [`DeadlockReport`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportLink {
    /// Blocked thread
    pub thread: ThreadHandle,
    /// Lock it waits for
    pub waits_for: ResourceRule,
    /// Owner of that lock
    pub owner: ThreadHandle,
    /// Locks the blocked thread owns
    pub held: Vec<ResourceRule>,
    /// Call site of the blocking acquire
    pub site: Option<String>,
}

/// Snapshot of a detected cycle, for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadlockReport {
    /// Thread whose wait closed the cycle
    pub requester: ThreadHandle,
    /// Lock it started waiting for
    pub rule: ResourceRule,
    /// Thread selected for suspension
    pub candidate: ThreadHandle,
    /// The cycle, starting at the requester
    pub links: Vec<ReportLink>,
}

impl DeadlockReport {
    /// Threads on the cycle, in walk order
    pub fn threads(&self) -> impl Iterator<Item = ThreadHandle> + '_ {
        self.links.iter().map(|link| link.thread)
    }
}

impl fmt::Display for DeadlockReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Deadlock detected: {} waiting for {}, suspending {}",
            self.requester, self.rule, self.candidate
        )?;
        for link in &self.links {
            write!(
                f,
                "  {} waits for {} (owned by {}), holds [",
                link.thread, link.waits_for, link.owner
            )?;
            for (i, rule) in link.held.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", rule)?;
            }
            write!(f, "]")?;
            if let Some(site) = &link.site {
                write!(f, " at {}", site)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
