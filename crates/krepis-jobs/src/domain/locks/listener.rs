//! Lock Listener Hook
//!
//! A listener hears about a thread that is about to park on a lock and about
//! every release. The UI thread uses `about_to_wait` to run pending work
//! instead of sleeping.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use super::diagnostics::{Diagnostic, ListenerCallback};
use super::types::ThreadHandle;

/// Blocking notifications
///
/// Errors and panics are caught by the manager and reported as
/// [`Diagnostic::ListenerFault`]; they never affect lock state.
pub trait LockListener: Send + Sync {
    /// A lock is about to be released
    fn about_to_release(&self) -> anyhow::Result<()>;

    /// The calling thread is about to park on a lock owned by `owner`
    ///
    /// Returning `true` means pending work was run: the caller then parks
    /// only for a short slice and notifies the listener again.
    fn about_to_wait(&self, owner: ThreadHandle) -> anyhow::Result<bool>;
}

/// Run a listener callback, turning `Err` and panics into a diagnostic
pub(crate) fn guarded<T>(
    callback: ListenerCallback,
    call: impl FnOnce() -> anyhow::Result<T>,
) -> Result<T, Diagnostic> {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(Diagnostic::ListenerFault {
            callback,
            message: format!("{:#}", err),
            panicked: false,
        }),
        Err(payload) => Err(Diagnostic::ListenerFault {
            callback,
            message: panic_message(payload.as_ref()),
            panicked: true,
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
