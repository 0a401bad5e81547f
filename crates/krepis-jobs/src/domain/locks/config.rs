//! Lock Manager Configuration

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::diagnostics::DiagnosticSink;
use super::listener::LockListener;
use super::manager::LockManager;
use crate::infrastructure::TracingSink;

/// Default slice length while a listener keeps asking to pump events
pub const DEFAULT_WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Which thread on a cycle gets its locks suspended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VictimPolicy {
    /// Smallest handle on the cycle other than the thread that just blocked
    #[default]
    OtherThanRequester,

    /// The thread that just blocked
    Requester,
}

/// Lock manager settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockManagerConfig {
    /// Victim selection
    pub victim_policy: VictimPolicy,

    /// Send a trace of every resolved cycle to the diagnostic sink
    pub report_deadlocks: bool,

    /// Fail the blocking acquire instead of resolving (debugging aid)
    pub fail_on_deadlock: bool,

    /// How long a waiter parks between listener notifications when the
    /// listener asked to pump
    pub wait_poll_interval: Duration,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            victim_policy: VictimPolicy::default(),
            report_deadlocks: cfg!(debug_assertions),
            fail_on_deadlock: false,
            wait_poll_interval: DEFAULT_WAIT_POLL_INTERVAL,
        }
    }
}

/// Builder for [`LockManager`]
///
/// ```rust
/// use krepis_jobs::domain::locks::{LockManager, VictimPolicy};
///
/// let manager = LockManager::builder()
///     .victim_policy(VictimPolicy::Requester)
///     .report_deadlocks(true)
///     .build();
///
/// let lock = manager.new_lock();
/// assert!(lock.owner().is_none());
/// ```
pub struct LockManagerBuilder {
    config: LockManagerConfig,
    sink: Arc<dyn DiagnosticSink>,
    listener: Option<Arc<dyn LockListener>>,
}

impl LockManagerBuilder {
    /// Builder with default configuration and the tracing sink
    pub fn new() -> Self {
        Self {
            config: LockManagerConfig::default(),
            sink: Arc::new(TracingSink),
            listener: None,
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: LockManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set victim selection
    pub fn victim_policy(mut self, policy: VictimPolicy) -> Self {
        self.config.victim_policy = policy;
        self
    }

    /// Report every resolved cycle to the sink
    pub fn report_deadlocks(mut self, report: bool) -> Self {
        self.config.report_deadlocks = report;
        self
    }

    /// Fail instead of resolving
    pub fn fail_on_deadlock(mut self, fail: bool) -> Self {
        self.config.fail_on_deadlock = fail;
        self
    }

    /// Set the pump slice length
    pub fn wait_poll_interval(mut self, interval: Duration) -> Self {
        self.config.wait_poll_interval = interval;
        self
    }

    /// Route diagnostics somewhere other than `tracing`
    pub fn diagnostic_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Install a listener up front
    pub fn listener(mut self, listener: Arc<dyn LockListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Build the manager
    pub fn build(self) -> LockManager {
        LockManager::from_parts(self.config, self.sink, self.listener)
    }
}

impl Default for LockManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
