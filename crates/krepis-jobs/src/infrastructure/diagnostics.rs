//! Diagnostic Sinks

use parking_lot::Mutex;

use crate::domain::locks::{DeadlockReport, Diagnostic, DiagnosticSink};

/// Writes diagnostics to the `tracing` subscriber
///
/// Listener faults are logged at ERROR, cycle traces at WARN.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn report(&self, diagnostic: &Diagnostic) {
        match diagnostic {
            Diagnostic::ListenerFault { callback, message, panicked } => {
                tracing::error!(%callback, panicked, "Internal error in lock listener: {}", message);
            }
            Diagnostic::Deadlock { report, resolved } => {
                tracing::warn!(
                    requester = %report.requester,
                    rule = %report.rule,
                    candidate = %report.candidate,
                    resolved,
                    "{}",
                    report
                );
            }
        }
    }
}

/// Keeps every diagnostic in memory
///
/// Meant for tests and for embedding applications that show diagnostics
/// themselves.
#[derive(Debug, Default)]
pub struct RecordingSink {
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl RecordingSink {
    /// Sink with nothing recorded
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything reported so far
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().clone()
    }

    /// Cycle traces reported so far
    pub fn deadlocks(&self) -> Vec<DeadlockReport> {
        self.diagnostics
            .lock()
            .iter()
            .filter_map(|diagnostic| match diagnostic {
                Diagnostic::Deadlock { report, .. } => Some(report.clone()),
                Diagnostic::ListenerFault { .. } => None,
            })
            .collect()
    }

    /// Number of listener faults reported so far
    pub fn listener_faults(&self) -> usize {
        self.diagnostics
            .lock()
            .iter()
            .filter(|diagnostic| matches!(diagnostic, Diagnostic::ListenerFault { .. }))
            .count()
    }

    /// Forget everything recorded so far
    pub fn clear(&self) {
        self.diagnostics.lock().clear();
    }
}

impl DiagnosticSink for RecordingSink {
    fn report(&self, diagnostic: &Diagnostic) {
        self.diagnostics.lock().push(diagnostic.clone());
    }
}
