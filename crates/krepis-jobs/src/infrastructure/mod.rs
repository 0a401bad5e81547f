//! Infrastructure Layer - External Technology Stack
//!
//! Concrete [`DiagnosticSink`](crate::domain::locks::DiagnosticSink)
//! implementations.

pub mod diagnostics;

// Re-exports
pub use diagnostics::{RecordingSink, TracingSink};
