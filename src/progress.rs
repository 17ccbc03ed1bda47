//! Progress reporting and cooperative cancellation.
//!
//! Transfers report through a caller-supplied callback. Returning
//! [`ControlFlow::Break`] from the callback is the only way to cancel a
//! transfer in flight; it surfaces as [`TransferError::Cancelled`].

use std::ops::ControlFlow;

use crate::error::TransferError;

/// Snapshot handed to progress callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    /// Byte offset confirmed so far (absolute within the object).
    pub transferred: u64,
    /// Total object size in bytes.
    pub total: u64,
}

/// Progress callback type accepted by every transfer entry point.
pub type ProgressFn<'a> = dyn FnMut(TransferProgress) -> ControlFlow<()> + Send + 'a;

/// Returns a callback that never cancels.
#[must_use]
pub fn ignore_progress() -> impl FnMut(TransferProgress) -> ControlFlow<()> + Send {
    |_| ControlFlow::Continue(())
}

pub(crate) fn report(
    progress: &mut ProgressFn<'_>,
    transferred: u64,
    total: u64,
) -> Result<(), TransferError> {
    match progress(TransferProgress { transferred, total }) {
        ControlFlow::Continue(()) => Ok(()),
        ControlFlow::Break(()) => Err(TransferError::Cancelled { transferred }),
    }
}
