//! Handing host failures to the guest.
//!
//! Fallible imports never let a failure unwind into the guest. A recoverable
//! error is stored as an `Error` value, its handle parked in the single
//! [`PendingError`] slot, and the import returns its failure sentinel. The
//! guest then asks `error_pending` and collects the handle with `take_error`.

use crate::error::{BridgeError, BridgeResult};
use crate::heap::{Handle, ObjectTable};
use crate::value::HostValue;

/// The one-deep slot for a captured failure.
#[derive(Debug, Default)]
pub struct PendingError {
    slot: Option<Handle>,
}

impl PendingError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending(&self) -> bool {
        self.slot.is_some()
    }

    pub fn store(&mut self, handle: Handle) -> BridgeResult<()> {
        if let Some(stale) = self.slot {
            return Err(BridgeError::protocol(format!(
                "error {stale} was never collected before another failure"
            )));
        }
        self.slot = Some(handle);
        Ok(())
    }

    pub fn take(&mut self) -> BridgeResult<Handle> {
        self.slot
            .take()
            .ok_or_else(|| BridgeError::protocol("take_error called with no pending error"))
    }

    /// Fail if a previous error is still waiting when `op` starts.
    pub fn ensure_clear(&self, op: &str) -> BridgeResult<()> {
        match self.slot {
            Some(stale) => Err(BridgeError::protocol(format!(
                "{op} entered while error {stale} is still pending"
            ))),
            None => Ok(()),
        }
    }
}

/// The value a fallible import returns when it failed.
pub trait FailureSentinel {
    fn sentinel() -> Self;
}

impl FailureSentinel for i32 {
    fn sentinel() -> Self {
        hostbind_abi::NONE
    }
}

impl FailureSentinel for i64 {
    fn sentinel() -> Self {
        0
    }
}

impl FailureSentinel for f64 {
    fn sentinel() -> Self {
        0.0
    }
}

impl FailureSentinel for () {
    fn sentinel() -> Self {}
}

/// Route the outcome of a fallible import.
///
/// Fatal errors are returned unchanged for the caller to trap on; anything
/// else becomes a pending error and the sentinel.
pub fn capture<R: FailureSentinel>(
    table: &mut ObjectTable<HostValue>,
    pending: &mut PendingError,
    op: &str,
    result: BridgeResult<R>,
) -> BridgeResult<R> {
    match result {
        Ok(value) => Ok(value),
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            let host_error = err.to_host_error();
            tracing::debug!(op, error = %host_error, "captured host failure");
            let handle = table.allocate(HostValue::Error(host_error));
            pending.store(handle)?;
            Ok(R::sentinel())
        }
    }
}
