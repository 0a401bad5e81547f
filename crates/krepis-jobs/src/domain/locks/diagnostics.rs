//! Diagnostic Events
//!
//! Failures that must not reach the caller (listener faults) and cycle
//! traces are turned into [`Diagnostic`] values and handed to a
//! [`DiagnosticSink`]. The sink is always called outside the graph region.

use std::fmt;

use super::detector::DeadlockReport;

/// Which listener callback failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerCallback {
    /// `about_to_release`
    AboutToRelease,
    /// `about_to_wait`
    AboutToWait,
}

impl fmt::Display for ListenerCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AboutToRelease => write!(f, "about_to_release"),
            Self::AboutToWait => write!(f, "about_to_wait"),
        }
    }
}

/// A structured diagnostic report
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// A listener callback returned an error or panicked
    ListenerFault {
        /// The failing callback
        callback: ListenerCallback,
        /// Error chain or panic payload
        message: String,
        /// Whether the callback panicked rather than returning `Err`
        panicked: bool,
    },

    /// A wait closed a cycle
    Deadlock {
        /// The cycle trace
        report: DeadlockReport,
        /// Whether the cycle was resolved (false in fail-fast mode)
        resolved: bool,
    },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ListenerFault { callback, message, panicked } => {
                let how = if *panicked { "panicked" } else { "failed" };
                write!(f, "Internal error in lock listener: {} {}: {}", callback, how, message)
            }
            Self::Deadlock { report, resolved } => {
                if *resolved {
                    write!(f, "{}", report)
                } else {
                    write!(f, "[unresolved] {}", report)
                }
            }
        }
    }
}

/// Receiver of diagnostic reports
pub trait DiagnosticSink: Send + Sync {
    /// Handle one report; must not call back into the lock manager
    fn report(&self, diagnostic: &Diagnostic);
}
